//! Agent 层：reason -> act -> observe 三段式执行契约
//!
//! - reason：纯解释，不做 I/O，产出推理文本
//! - act：唯一的挂起点，调用外部 LLM
//! - observe：对结果做事后分析，产出观察表
//!
//! Agent 自身不重试；重试 / 回退 / 降级都由编排器与恢复管理器负责。

pub mod arbiter;
pub mod archivist;
pub mod consistency;
pub mod module_keeper;
pub mod narrator;
pub mod registry;

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::core::DmError;
use crate::llm::{LlmClient, LlmError};

pub use arbiter::ArbiterAgent;
pub use archivist::ArchivistAgent;
pub use consistency::ConsistencyAgent;
pub use module_keeper::ModuleKeeperAgent;
pub use narrator::NarratorAgent;
pub use registry::{AgentRegistry, FallbackPolicy};

/// 任意键值的上下文 / 元数据 / 观察表
pub type ContextMap = Map<String, Value>;

/// 编排器内置 Agent 的逻辑名
pub const NARRATOR: &str = "narrator";
pub const ARCHIVIST: &str = "archivist";
pub const ARBITER: &str = "arbiter";
pub const MODULE_KEEPER: &str = "module_keeper";
pub const CONSISTENCY: &str = "consistency";

/// Agent 职能，决定回退路由
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentRole {
    Narrator,
    Archivist,
    ModuleKeeper,
    Consistency,
}

impl AgentRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            AgentRole::Narrator => "narrator",
            AgentRole::Archivist => "archivist",
            AgentRole::ModuleKeeper => "module_keeper",
            AgentRole::Consistency => "consistency",
        }
    }
}

impl fmt::Display for AgentRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 输入信封：每次调用由编排器新建，之后不再修改
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AgentRequest {
    pub context: ContextMap,
    pub metadata: ContextMap,
}

impl AgentRequest {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_context(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.context.insert(key.to_string(), value.into());
        self
    }

    pub fn with_metadata(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.metadata.insert(key.to_string(), value.into());
        self
    }

    /// 取字符串型上下文字段，缺失或非字符串时返回空串
    pub fn context_str(&self, key: &str) -> &str {
        self.context.get(key).and_then(Value::as_str).unwrap_or("")
    }

    /// 玩家原始动作文本
    pub fn action(&self) -> &str {
        self.context_str("action")
    }

    /// 字符串数组型上下文字段（如 established_facts）
    pub fn context_list(&self, key: &str) -> Vec<String> {
        self.context
            .get(key)
            .and_then(Value::as_array)
            .map(|items| {
                items
                    .iter()
                    .filter_map(|v| v.as_str().map(String::from))
                    .collect()
            })
            .unwrap_or_default()
    }
}

/// 输出信封：值对象，创建后不再修改
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentResponse {
    pub agent_name: String,
    pub agent_role: AgentRole,
    pub reasoning: String,
    pub action_result: String,
    pub observations: ContextMap,
    pub metadata: ContextMap,
}

/// 所有专职 Agent 的多态契约
#[async_trait]
pub trait Agent: Send + Sync {
    fn name(&self) -> &str;

    fn role(&self) -> AgentRole;

    /// 解释请求，返回推理文本；不得产生外部副作用
    fn reason(&self, request: &AgentRequest) -> Result<String, DmError>;

    /// 执行动作（通常是一次 LLM 调用）
    async fn act(&self, reasoning: &str, request: &AgentRequest) -> Result<String, DmError>;

    /// 分析 act 的产出；不得产生外部副作用
    fn observe(&self, result: &str) -> ContextMap;

    /// 固定顺序 reason -> act -> observe；任一阶段失败直接向上传播
    async fn run(&self, request: &AgentRequest) -> Result<AgentResponse, DmError> {
        let reasoning = self.reason(request)?;
        let action_result = self.act(&reasoning, request).await?;
        let observations = self.observe(&action_result);
        Ok(AgentResponse {
            agent_name: self.name().to_string(),
            agent_role: self.role(),
            reasoning,
            action_result,
            observations,
            metadata: request.metadata.clone(),
        })
    }
}

/// 共享 LLM 调用：内容策略拒绝转为不可恢复的 Agent 错误，其余保持 LLM 错误类别
pub(crate) async fn generate(
    llm: &Arc<dyn LlmClient>,
    agent: &str,
    prompt: &str,
    max_tokens: u32,
) -> Result<String, DmError> {
    match llm.generate(prompt, max_tokens).await {
        Ok(text) => Ok(text),
        Err(LlmError::Rejected(reason)) => Err(DmError::unrecoverable(agent, reason)),
        Err(e) => {
            tracing::debug!(agent, error = %e, "LLM call failed");
            Err(DmError::Llm(e))
        }
    }
}

/// 常用观察：字数与是否为空
pub(crate) fn basic_observations(result: &str) -> ContextMap {
    let mut obs = ContextMap::new();
    let words = result.split_whitespace().count();
    obs.insert("word_count".into(), Value::from(words));
    obs.insert("is_empty".into(), Value::from(result.trim().is_empty()));
    obs
}

/// prompt 中可选段落：值为空时整段省略
pub(crate) fn optional_section(title: &str, body: &str) -> String {
    if body.trim().is_empty() {
        String::new()
    } else {
        format!("{}:\n{}\n\n", title, body.trim())
    }
}


#[cfg(test)]
mod tests {
    use super::test_support::StubAgent;
    use super::*;

    #[tokio::test]
    async fn test_run_binds_phases_in_order() {
        let agent = StubAgent::ok("narrator", AgentRole::Narrator);
        let request = AgentRequest::new()
            .with_context("action", "look around")
            .with_metadata("turn", 4);
        let response = agent.run(&request).await.unwrap();
        assert_eq!(response.agent_name, "narrator");
        assert_eq!(response.agent_role, AgentRole::Narrator);
        assert_eq!(response.reasoning, "stub reasoning for look around");
        assert_eq!(response.action_result, "narrator output");
        assert_eq!(response.observations["word_count"], 2);
        assert_eq!(response.metadata["turn"], 4);
    }

    #[tokio::test]
    async fn test_run_propagates_act_failure() {
        let agent = StubAgent::failing(
            "narrator",
            AgentRole::Narrator,
            1,
            DmError::Llm(LlmError::Timeout),
        );
        let err = agent.run(&AgentRequest::new()).await.unwrap_err();
        assert!(matches!(err, DmError::Llm(LlmError::Timeout)));
    }

    #[test]
    fn test_request_context_helpers() {
        let request = AgentRequest::new()
            .with_context("action", "attack")
            .with_context("established_facts", serde_json::json!(["a", "b"]));
        assert_eq!(request.action(), "attack");
        assert_eq!(request.context_str("missing"), "");
        assert_eq!(request.context_list("established_facts"), vec!["a", "b"]);
    }
}
