//! 崩溃检测与会话恢复
//!
//! 会话开始时在战役目录写标记文件，正常关闭时删除；启动时标记仍在即说明上次异常退出。
//! 标记文件读写失败只记日志，损坏的标记直接删除并视为无崩溃。

use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::core::recovery::{RecoveryResult, RecoveryStrategy};
use crate::core::session::{GameSession, SessionSerializer, SessionSnapshot};
use crate::core::{DmError, DmResult};

pub const MARKER_FILE: &str = ".claudmaster_recovery";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecoveryMarker {
    pub session_id: String,
    pub timestamp: DateTime<Utc>,
    pub pid: u32,
}

/// recover_session 的结果；成功时带回已恢复的会话
#[derive(Debug)]
pub struct SessionRecovery {
    pub result: RecoveryResult,
    pub session: Option<GameSession>,
}

pub struct CrashRecoveryManager {
    marker_path: PathBuf,
    serializer: Arc<dyn SessionSerializer>,
}

impl CrashRecoveryManager {
    pub fn new(campaign_dir: impl AsRef<Path>, serializer: Arc<dyn SessionSerializer>) -> Self {
        Self {
            marker_path: campaign_dir.as_ref().join(MARKER_FILE),
            serializer,
        }
    }

    pub fn marker_path(&self) -> &Path {
        &self.marker_path
    }

    pub fn write_recovery_marker(&self, session_id: &str) {
        let marker = RecoveryMarker {
            session_id: session_id.to_string(),
            timestamp: Utc::now(),
            pid: std::process::id(),
        };
        let result = self
            .marker_path
            .parent()
            .map(std::fs::create_dir_all)
            .unwrap_or(Ok(()))
            .and_then(|_| {
                let body = serde_json::to_string(&marker)?;
                std::fs::write(&self.marker_path, body)
            });
        if let Err(e) = result {
            warn!(path = %self.marker_path.display(), error = %e, "failed to write recovery marker");
        }
    }

    /// 返回上次崩溃的会话 id；无标记或标记损坏时返回 None
    pub fn check_for_crash(&self) -> Option<String> {
        if !self.marker_path.exists() {
            return None;
        }
        let parsed = std::fs::read_to_string(&self.marker_path)
            .map_err(|e| e.to_string())
            .and_then(|s| serde_json::from_str::<RecoveryMarker>(&s).map_err(|e| e.to_string()));
        match parsed {
            Ok(marker) => {
                info!(session_id = %marker.session_id, pid = marker.pid, "found crash marker");
                Some(marker.session_id)
            }
            Err(e) => {
                warn!(error = %e, "corrupt recovery marker, removing");
                self.clean_recovery_marker();
                None
            }
        }
    }

    pub fn clean_recovery_marker(&self) {
        match std::fs::remove_file(&self.marker_path) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => warn!(path = %self.marker_path.display(), error = %e, "failed to remove recovery marker"),
        }
    }

    /// 通过序列化器读回会话；读不到时返回 RecoveryError
    pub fn load_crashed_session(&self, session_id: &str) -> DmResult<GameSession> {
        let data = self
            .serializer
            .load_session(session_id)
            .map_err(|e| DmError::recovery(format!("could not read saved session: {:#}", e), Some(session_id)))?
            .ok_or_else(|| DmError::recovery("no saved state for session", Some(session_id)))?;
        let snapshot: SessionSnapshot = serde_json::from_value(data)
            .map_err(|e| DmError::recovery(format!("saved session is malformed: {}", e), Some(session_id)))?;
        Ok(GameSession::from_snapshot(snapshot))
    }

    /// 恢复会话；失败不向上抛，而是返回失败的 RecoveryResult
    pub fn recover_session(&self, session_id: &str) -> SessionRecovery {
        match self.load_crashed_session(session_id) {
            Ok(session) => {
                self.clean_recovery_marker();
                info!(session_id, turn = session.turn_count, "resumed crashed session");
                SessionRecovery {
                    result: RecoveryResult {
                        success: true,
                        strategy_used: RecoveryStrategy::CrashRecovery,
                        message: format!("Resumed session {} at turn {}", session_id, session.turn_count),
                        response: None,
                    },
                    session: Some(session),
                }
            }
            Err(e) => {
                warn!(session_id, error = %e, "crash recovery failed");
                SessionRecovery {
                    result: RecoveryResult::failed(RecoveryStrategy::CrashRecovery, e.to_string()),
                    session: None,
                }
            }
        }
    }
}
