//! 优雅关闭
//!
//! 收到 Ctrl+C / SIGTERM / quit 后按注册顺序执行清理：先做中断存档，再删除崩溃标记。
//! 存档失败时保留标记，下次启动会走崩溃恢复。

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::core::autosave::AutoSaveManager;
use crate::core::crash::CrashRecoveryManager;

/// 关闭信号管理器
#[derive(Clone)]
pub struct ShutdownManager {
    shutdown_token: CancellationToken,
    reason_tx: broadcast::Sender<ShutdownReason>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ShutdownReason {
    /// Ctrl+C 或 quit 命令
    UserInitiated,
    /// SIGTERM
    Signal,
    FatalError(String),
}

impl ShutdownManager {
    pub fn new() -> Self {
        let (reason_tx, _) = broadcast::channel(1);
        Self {
            shutdown_token: CancellationToken::new(),
            reason_tx,
        }
    }

    /// 用于取消正在执行的 Agent
    pub fn token(&self) -> CancellationToken {
        self.shutdown_token.clone()
    }

    pub fn shutdown(&self, reason: ShutdownReason) {
        let _ = self.reason_tx.send(reason);
        self.shutdown_token.cancel();
    }

    pub fn is_shutdown(&self) -> bool {
        self.shutdown_token.is_cancelled()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ShutdownReason> {
        self.reason_tx.subscribe()
    }

    pub async fn wait_for_shutdown(&self) {
        self.shutdown_token.cancelled().await;
    }

    /// 安装 Ctrl+C 与 SIGTERM 处理
    pub fn install_signal_handlers(self: &Arc<Self>) {
        let manager = Arc::clone(self);
        tokio::spawn(async move {
            if let Ok(()) = tokio::signal::ctrl_c().await {
                info!("Received Ctrl+C, saving the session before exit");
                manager.shutdown(ShutdownReason::UserInitiated);
            }
        });

        #[cfg(unix)]
        {
            let manager = Arc::clone(self);
            tokio::spawn(async move {
                use tokio::signal::unix::{signal, SignalKind};
                if let Ok(mut sigterm) = signal(SignalKind::terminate()) {
                    sigterm.recv().await;
                    info!("Received SIGTERM, saving the session before exit");
                    manager.shutdown(ShutdownReason::Signal);
                }
            });
        }
    }
}

impl Default for ShutdownManager {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait::async_trait]
pub trait ShutdownCleanup: Send + Sync {
    async fn cleanup(&self) -> anyhow::Result<()>;

    fn name(&self) -> &'static str;

    /// 之前有清理失败时是否跳过自己
    fn skip_after_failure(&self) -> bool {
        false
    }
}

/// 按注册顺序执行清理，每个任务单独超时
pub struct ShutdownCoordinator {
    manager: Arc<ShutdownManager>,
    cleanup_tasks: Vec<Arc<dyn ShutdownCleanup>>,
    timeout: Duration,
}

/// 单个清理任务的结果
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CleanupOutcome {
    Completed,
    Failed(String),
    TimedOut,
    Skipped,
}

impl ShutdownCoordinator {
    pub fn new(manager: Arc<ShutdownManager>) -> Self {
        Self {
            manager,
            cleanup_tasks: Vec::new(),
            timeout: Duration::from_secs(5),
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn register<T: ShutdownCleanup + 'static>(&mut self, task: T) {
        self.cleanup_tasks.push(Arc::new(task));
    }

    pub async fn run_cleanup(&self) -> Vec<(&'static str, CleanupOutcome)> {
        info!("Running {} cleanup tasks", self.cleanup_tasks.len());
        let mut outcomes = Vec::with_capacity(self.cleanup_tasks.len());
        let mut any_failed = false;

        for task in &self.cleanup_tasks {
            let name = task.name();
            if any_failed && task.skip_after_failure() {
                warn!("Skipping cleanup task '{}' after an earlier failure", name);
                outcomes.push((name, CleanupOutcome::Skipped));
                continue;
            }
            let outcome = match tokio::time::timeout(self.timeout, task.cleanup()).await {
                Ok(Ok(())) => {
                    info!("Cleanup task '{}' completed", name);
                    CleanupOutcome::Completed
                }
                Ok(Err(e)) => {
                    warn!("Cleanup task '{}' failed: {:#}", name, e);
                    CleanupOutcome::Failed(e.to_string())
                }
                Err(_) => {
                    warn!("Cleanup task '{}' timed out after {:?}", name, self.timeout);
                    CleanupOutcome::TimedOut
                }
            };
            any_failed |= outcome != CleanupOutcome::Completed;
            outcomes.push((name, outcome));
        }
        outcomes
    }

    pub fn manager(&self) -> &Arc<ShutdownManager> {
        &self.manager
    }
}

/// 关闭前的中断存档
pub struct AutoSaveCleanup {
    autosave: Arc<AutoSaveManager>,
}

impl AutoSaveCleanup {
    pub fn new(autosave: Arc<AutoSaveManager>) -> Self {
        Self { autosave }
    }
}

#[async_trait::async_trait]
impl ShutdownCleanup for AutoSaveCleanup {
    async fn cleanup(&self) -> anyhow::Result<()> {
        self.autosave.save_on_interrupt()?;
        Ok(())
    }

    fn name(&self) -> &'static str {
        "InterruptSave"
    }
}

/// 正常关闭时删除崩溃标记
pub struct CrashMarkerCleanup {
    crash: Arc<CrashRecoveryManager>,
}

impl CrashMarkerCleanup {
    pub fn new(crash: Arc<CrashRecoveryManager>) -> Self {
        Self { crash }
    }
}

#[async_trait::async_trait]
impl ShutdownCleanup for CrashMarkerCleanup {
    async fn cleanup(&self) -> anyhow::Result<()> {
        self.crash.clean_recovery_marker();
        Ok(())
    }

    fn name(&self) -> &'static str {
        "CrashMarker"
    }

    fn skip_after_failure(&self) -> bool {
        true
    }
}

/// 运行 app 直到其结束或收到关闭信号，然后执行清理
pub async fn run_with_graceful_shutdown<F, Fut>(
    shutdown_manager: Arc<ShutdownManager>,
    app: F,
    cleanup: impl FnOnce() -> Fut,
) where
    F: Future<Output = ()>,
    Fut: Future<Output = ()>,
{
    shutdown_manager.install_signal_handlers();

    tokio::select! {
        _ = app => {
            info!("Session ended normally");
        }
        _ = shutdown_manager.wait_for_shutdown() => {
            info!("Shutdown signal received");
        }
    }

    cleanup().await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AutoSaveSection;
    use crate::core::session::{GameSession, InMemorySessionSerializer};
    use parking_lot::Mutex;

    #[test]
    fn test_shutdown_manager_token() {
        let manager = ShutdownManager::new();
        let token = manager.token();
        assert!(!manager.is_shutdown());
        manager.shutdown(ShutdownReason::UserInitiated);
        assert!(token.is_cancelled());
    }

    fn setup() -> (
        tempfile::TempDir,
        Arc<InMemorySessionSerializer>,
        Arc<CrashRecoveryManager>,
        ShutdownCoordinator,
    ) {
        let dir = tempfile::tempdir().unwrap();
        let serializer = Arc::new(InMemorySessionSerializer::new());
        let session = Arc::new(Mutex::new(GameSession::new("c").with_session_id("s-1")));
        let autosave = Arc::new(AutoSaveManager::new(
            session,
            serializer.clone(),
            &AutoSaveSection::default(),
        ));
        let crash = Arc::new(CrashRecoveryManager::new(dir.path(), serializer.clone()));
        crash.write_recovery_marker("s-1");

        let mut coordinator = ShutdownCoordinator::new(Arc::new(ShutdownManager::new()));
        coordinator.register(AutoSaveCleanup::new(autosave));
        coordinator.register(CrashMarkerCleanup::new(crash.clone()));
        (dir, serializer, crash, coordinator)
    }

    #[tokio::test]
    async fn test_clean_shutdown_saves_then_removes_marker() {
        let (_dir, serializer, crash, coordinator) = setup();
        let outcomes = coordinator.run_cleanup().await;
        assert!(outcomes.iter().all(|(_, o)| *o == CleanupOutcome::Completed));
        assert_eq!(serializer.save_count(), 1);
        assert_eq!(crash.check_for_crash(), None);
    }

    #[tokio::test]
    async fn test_failed_save_keeps_marker() {
        let (_dir, serializer, crash, coordinator) = setup();
        serializer.set_failing(true);
        let outcomes = coordinator.run_cleanup().await;
        assert!(matches!(outcomes[0].1, CleanupOutcome::Failed(_)));
        assert_eq!(outcomes[1], ("CrashMarker", CleanupOutcome::Skipped));
        assert_eq!(crash.check_for_crash().as_deref(), Some("s-1"));
    }
}
