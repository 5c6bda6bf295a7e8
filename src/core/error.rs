//! 错误分类体系
//!
//! DmError 是根类型：Display 即消息，details() 给出结构化字段。
//! 恢复层依赖 is_recoverable() 与 kind_name() 决定重试 / 回退 / 降级 / 交给用户。

use std::time::Duration;

use serde_json::{json, Map, Value};
use thiserror::Error;

use crate::llm::LlmError;

pub type DmResult<T> = Result<T, DmError>;

/// 编排层所有失败的统一类型
#[derive(Error, Debug, Clone)]
pub enum DmError {
    /// Agent 执行失败；recoverable=false 时跳过自动恢复直接交给用户
    #[error("agent '{agent}' failed: {message}")]
    Agent {
        agent: String,
        message: String,
        recoverable: bool,
    },

    #[error(transparent)]
    Llm(#[from] LlmError),

    #[error("state inconsistency: {message}")]
    State {
        message: String,
        entity: Option<String>,
    },

    #[error("session error: {message}")]
    Session {
        message: String,
        session_id: Option<String>,
    },

    #[error("operation '{operation}' timed out after {threshold:?}")]
    Timeout {
        operation: String,
        threshold: Duration,
    },

    #[error("recovery failed: {message}")]
    Recovery {
        message: String,
        session_id: Option<String>,
    },

    #[error("state rollback failed: {message}")]
    Rollback {
        message: String,
        checkpoint: Option<String>,
    },
}

impl DmError {
    pub fn agent(agent: impl Into<String>, message: impl Into<String>) -> Self {
        DmError::Agent {
            agent: agent.into(),
            message: message.into(),
            recoverable: true,
        }
    }

    /// 需要人工决定的失败（如内容策略拒绝）
    pub fn unrecoverable(agent: impl Into<String>, message: impl Into<String>) -> Self {
        DmError::Agent {
            agent: agent.into(),
            message: message.into(),
            recoverable: false,
        }
    }

    pub fn timeout(operation: impl Into<String>, threshold: Duration) -> Self {
        DmError::Timeout {
            operation: operation.into(),
            threshold,
        }
    }

    pub fn session(message: impl Into<String>, session_id: Option<&str>) -> Self {
        DmError::Session {
            message: message.into(),
            session_id: session_id.map(String::from),
        }
    }

    pub fn recovery(message: impl Into<String>, session_id: Option<&str>) -> Self {
        DmError::Recovery {
            message: message.into(),
            session_id: session_id.map(String::from),
        }
    }

    /// 只有显式标记为不可恢复的 Agent 错误与被拒绝的请求返回 false
    pub fn is_recoverable(&self) -> bool {
        match self {
            DmError::Agent { recoverable, .. } => *recoverable,
            DmError::Llm(LlmError::Rejected(_)) => false,
            _ => true,
        }
    }

    /// 稳定的类别名，恢复层按关键字（timeout / connection / network / api / rate）识别瞬时故障
    pub fn kind_name(&self) -> &'static str {
        match self {
            DmError::Agent { .. } => "AgentError",
            DmError::Llm(e) => match e {
                LlmError::Network(_) => "NetworkConnectionError",
                LlmError::Timeout => "LlmTimeoutError",
                LlmError::RateLimited { .. } => "RateLimitError",
                LlmError::Api { .. } => "ApiError",
                LlmError::Rejected(_) => "RejectedRequestError",
                LlmError::Other(_) => "LlmError",
            },
            DmError::State { .. } => "StateError",
            DmError::Session { .. } => "SessionError",
            DmError::Timeout { .. } => "OperationTimeoutError",
            DmError::Recovery { .. } => "RecoveryError",
            DmError::Rollback { .. } => "RollbackError",
        }
    }

    /// 结构化细节（写日志与返回给宿主用）
    pub fn details(&self) -> Map<String, Value> {
        let value = match self {
            DmError::Agent {
                agent, recoverable, ..
            } => json!({ "agent_name": agent, "recoverable": recoverable }),
            DmError::Llm(e) => json!({ "llm_error": e.kind_name() }),
            DmError::State { entity, .. } => json!({ "entity": entity }),
            DmError::Session { session_id, .. } => json!({ "session_id": session_id }),
            DmError::Timeout {
                operation,
                threshold,
            } => json!({ "operation": operation, "threshold_secs": threshold.as_secs_f64() }),
            DmError::Recovery { session_id, .. } => json!({ "session_id": session_id }),
            DmError::Rollback { checkpoint, .. } => json!({ "checkpoint": checkpoint }),
        };
        match value {
            Value::Object(map) => map,
            _ => Map::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unrecoverable_agent_error() {
        let err = DmError::unrecoverable("narrator", "content policy");
        assert!(!err.is_recoverable());
        assert_eq!(err.details()["agent_name"], "narrator");
        assert_eq!(err.details()["recoverable"], false);
    }

    #[test]
    fn test_llm_errors_recoverable_except_rejected() {
        assert!(DmError::from(LlmError::Timeout).is_recoverable());
        assert!(DmError::from(LlmError::Network("reset".into())).is_recoverable());
        assert!(!DmError::from(LlmError::Rejected("policy".into())).is_recoverable());
    }

    #[test]
    fn test_timeout_details_and_display() {
        let err = DmError::timeout("agent.narrator", Duration::from_secs(30));
        assert_eq!(err.kind_name(), "OperationTimeoutError");
        assert_eq!(err.details()["threshold_secs"], 30.0);
        assert!(err.to_string().contains("agent.narrator"));
    }
}
