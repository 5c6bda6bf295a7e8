//! Agent 失败恢复：重试 -> 回退 Agent -> 降级，不可恢复的错误直接交给用户
//!
//! 失败计数按 Agent 名记账，任何一次成功恢复后清零。策略严格按顺序尝试，不并发。

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde::Serialize;
use tracing::{info, warn};

use crate::agents::{Agent, AgentRegistry, AgentRequest, AgentResponse};
use crate::config::RecoverySection;
use crate::core::DmError;

/// 类别名中出现这些关键字即视为瞬时故障
const TRANSIENT_KEYWORDS: [&str; 5] = ["timeout", "connection", "network", "api", "rate"];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RecoveryStrategy {
    Retry,
    Fallback,
    Degradation,
    UserIntervention,
    CrashRecovery,
}

impl RecoveryStrategy {
    pub fn as_str(&self) -> &'static str {
        match self {
            RecoveryStrategy::Retry => "retry",
            RecoveryStrategy::Fallback => "fallback",
            RecoveryStrategy::Degradation => "degradation",
            RecoveryStrategy::UserIntervention => "user_intervention",
            RecoveryStrategy::CrashRecovery => "crash_recovery",
        }
    }
}

impl fmt::Display for RecoveryStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone)]
pub struct RecoveryResult {
    pub success: bool,
    pub strategy_used: RecoveryStrategy,
    pub message: String,
    /// 重试或回退成功时的响应
    pub response: Option<AgentResponse>,
}

impl RecoveryResult {
    fn succeeded(strategy: RecoveryStrategy, message: String, response: AgentResponse) -> Self {
        Self {
            success: true,
            strategy_used: strategy,
            message,
            response: Some(response),
        }
    }

    pub(crate) fn failed(strategy: RecoveryStrategy, message: impl Into<String>) -> Self {
        Self {
            success: false,
            strategy_used: strategy,
            message: message.into(),
            response: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    Transient,
    Unrecoverable,
    Unknown,
}

/// 显式不可恢复 > 关键字识别为瞬时 > 未知
pub fn classify(error: &DmError) -> ErrorClass {
    if !error.is_recoverable() {
        return ErrorClass::Unrecoverable;
    }
    let kind = error.kind_name().to_lowercase();
    if TRANSIENT_KEYWORDS.iter().any(|k| kind.contains(k)) {
        ErrorClass::Transient
    } else {
        ErrorClass::Unknown
    }
}

pub struct AgentRecoveryManager {
    registry: Arc<AgentRegistry>,
    max_retries: u32,
    delays: Vec<Duration>,
    strict_classification: bool,
    /// 单次重试 / 回退的超时；None 表示不限
    attempt_timeout: Option<Duration>,
    failure_counts: Mutex<HashMap<String, u32>>,
}

impl AgentRecoveryManager {
    pub fn new(registry: Arc<AgentRegistry>, config: &RecoverySection) -> Self {
        let mut delays = config.backoff_delays();
        if delays.is_empty() {
            delays.push(Duration::ZERO);
        }
        Self {
            registry,
            max_retries: config.max_retries,
            delays,
            strict_classification: config.strict_classification,
            attempt_timeout: None,
            failure_counts: Mutex::new(HashMap::new()),
        }
    }

    pub fn with_attempt_timeout(mut self, timeout: Duration) -> Self {
        self.attempt_timeout = Some(timeout);
        self
    }

    /// 第 attempt 次重试（1 起）前的等待；超出表长后停在最后一项
    pub fn backoff_delay(&self, attempt: u32) -> Duration {
        let idx = (attempt.saturating_sub(1) as usize).min(self.delays.len() - 1);
        self.delays[idx]
    }

    pub fn failure_count(&self, agent_name: &str) -> u32 {
        self.failure_counts.lock().get(agent_name).copied().unwrap_or(0)
    }

    pub fn reset_failure_count(&self, agent_name: &str) {
        self.failure_counts.lock().remove(agent_name);
    }

    fn increment(&self, agent_name: &str) -> u32 {
        let mut counts = self.failure_counts.lock();
        let count = counts.entry(agent_name.to_string()).or_insert(0);
        *count += 1;
        *count
    }

    async fn attempt(&self, agent: &dyn Agent, request: &AgentRequest) -> Result<AgentResponse, DmError> {
        match self.attempt_timeout {
            Some(limit) => tokio::time::timeout(limit, agent.run(request))
                .await
                .map_err(|_| DmError::timeout(format!("agent.{}", agent.name()), limit))?,
            None => agent.run(request).await,
        }
    }

    pub async fn handle_agent_failure(
        &self,
        agent: &Arc<dyn Agent>,
        error: &DmError,
        request: &AgentRequest,
    ) -> RecoveryResult {
        let name = agent.name().to_string();
        let mut count = self.increment(&name);
        let class = classify(error);
        warn!(
            agent = %name,
            error = %error,
            kind = error.kind_name(),
            failures = count,
            ?class,
            "agent failure, attempting recovery"
        );

        if class == ErrorClass::Unrecoverable
            || (class == ErrorClass::Unknown && self.strict_classification)
        {
            info!(agent = %name, "error needs a human decision, skipping automatic recovery");
            return RecoveryResult::failed(
                RecoveryStrategy::UserIntervention,
                format!("{} could not continue: {}", name, error),
            );
        }

        // 1. 重试
        while count <= self.max_retries {
            let delay = self.backoff_delay(count);
            info!(agent = %name, attempt = count, ?delay, "retrying agent");
            tokio::time::sleep(delay).await;
            match self.attempt(agent.as_ref(), request).await {
                Ok(response) => {
                    self.reset_failure_count(&name);
                    return RecoveryResult::succeeded(
                        RecoveryStrategy::Retry,
                        format!("{} recovered after retry {}", name, count),
                        response,
                    );
                }
                Err(e) if !e.is_recoverable() => {
                    warn!(agent = %name, error = %e, "retry hit an unrecoverable error");
                    return RecoveryResult::failed(
                        RecoveryStrategy::UserIntervention,
                        format!("{} could not continue: {}", name, e),
                    );
                }
                Err(e) => {
                    warn!(agent = %name, error = %e, attempt = count, "retry failed");
                    count = self.increment(&name);
                }
            }
        }

        // 2. 回退
        if let Some(fallback) = self.registry.find_fallback(&name, agent.role()) {
            info!(agent = %name, fallback = fallback.name(), "trying fallback agent");
            match self.attempt(fallback.as_ref(), request).await {
                Ok(response) => {
                    self.reset_failure_count(&name);
                    return RecoveryResult::succeeded(
                        RecoveryStrategy::Fallback,
                        format!("{} stood in for {}", fallback.name(), name),
                        response,
                    );
                }
                Err(e) => {
                    warn!(agent = %name, fallback = fallback.name(), error = %e, "fallback agent failed");
                }
            }
        }

        // 3. 降级，由调用方执行
        RecoveryResult::failed(
            RecoveryStrategy::Degradation,
            format!("{} unavailable after {} failure(s): {}", name, count, error),
        )
    }
}
