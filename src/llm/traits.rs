//! LLM 客户端抽象
//!
//! 所有后端（OpenAI 兼容 / Mock）实现 LlmClient::generate；Agent 的 act 阶段是唯一调用点。
//! 错误按类别区分，恢复层据此判断是否属于瞬时故障。

use async_trait::async_trait;
use thiserror::Error;

/// LLM 调用失败的类别
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum LlmError {
    #[error("network connection error: {0}")]
    Network(String),

    #[error("request timeout")]
    Timeout,

    #[error("rate limited (retry after {retry_after_ms}ms)")]
    RateLimited { retry_after_ms: u64 },

    #[error("api error {status}: {message}")]
    Api { status: u16, message: String },

    /// 内容策略拒绝等：重试无意义
    #[error("request rejected: {0}")]
    Rejected(String),

    #[error("llm error: {0}")]
    Other(String),
}

impl LlmError {
    /// 稳定的类别名，供恢复层做关键字匹配
    pub fn kind_name(&self) -> &'static str {
        match self {
            LlmError::Network(_) => "network_connection",
            LlmError::Timeout => "timeout",
            LlmError::RateLimited { .. } => "rate_limit",
            LlmError::Api { .. } => "api",
            LlmError::Rejected(_) => "rejected",
            LlmError::Other(_) => "other",
        }
    }

    /// 从后端的错误文本粗分类（后端错误类型不稳定，只依赖文本）
    pub fn classify_message(message: &str) -> Self {
        let lower = message.to_lowercase();
        if lower.contains("rate limit") || lower.contains("429") {
            LlmError::RateLimited { retry_after_ms: 1000 }
        } else if lower.contains("timed out") || lower.contains("timeout") {
            LlmError::Timeout
        } else if lower.contains("connect") || lower.contains("network") || lower.contains("dns") {
            LlmError::Network(message.to_string())
        } else if lower.contains("content policy") || lower.contains("content_filter") {
            LlmError::Rejected(message.to_string())
        } else {
            LlmError::Api {
                status: 0,
                message: message.to_string(),
            }
        }
    }
}

/// LLM 客户端 trait：单次非流式生成
#[async_trait]
pub trait LlmClient: Send + Sync {
    async fn generate(&self, prompt: &str, max_tokens: u32) -> Result<String, LlmError>;

    /// 获取累计 token 使用统计：(prompt_tokens, completion_tokens, total_tokens)
    /// 默认返回 (0, 0, 0)，具体实现可覆盖
    fn token_usage(&self) -> (u64, u64, u64) {
        (0, 0, 0)
    }
}
