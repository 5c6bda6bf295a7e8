//! Module Keeper：回答与冒险模组内容相关的问题（地点、NPC、传说）

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;

use super::{basic_observations, generate, optional_section, Agent, AgentRequest, AgentRole, ContextMap};
use crate::core::DmError;
use crate::llm::LlmClient;

pub struct ModuleKeeperAgent {
    name: String,
    llm: Arc<dyn LlmClient>,
    max_tokens: u32,
}

impl ModuleKeeperAgent {
    pub fn new(llm: Arc<dyn LlmClient>) -> Self {
        Self {
            name: super::MODULE_KEEPER.to_string(),
            llm,
            max_tokens: 600,
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn with_token_ceiling(mut self, ceiling: u32) -> Self {
        self.max_tokens = self.max_tokens.min(ceiling);
        self
    }
}

#[async_trait]
impl Agent for ModuleKeeperAgent {
    fn name(&self) -> &str {
        &self.name
    }

    fn role(&self) -> AgentRole {
        AgentRole::ModuleKeeper
    }

    fn reason(&self, request: &AgentRequest) -> Result<String, DmError> {
        let grounded = !request.context_str("context").trim().is_empty();
        Ok(if grounded {
            format!(
                "Answer '{}' using only the adventure module excerpts provided; do not reveal \
                 secrets the characters have not discovered.",
                request.action()
            )
        } else {
            format!(
                "No module excerpt is available. Answer '{}' in a way that stays consistent with \
                 a classic fantasy setting and flag anything invented.",
                request.action()
            )
        })
    }

    async fn act(&self, reasoning: &str, request: &AgentRequest) -> Result<String, DmError> {
        let prompt = format!(
            "{}Player action: {}\n\nInstruction: {}",
            optional_section("Module excerpts", request.context_str("context")),
            request.action(),
            reasoning
        );
        generate(&self.llm, &self.name, &prompt, self.max_tokens).await
    }

    fn observe(&self, result: &str) -> ContextMap {
        let mut obs = basic_observations(result);
        obs.insert("lore_chars".into(), Value::from(result.len()));
        let paragraphs = result.split("\n\n").filter(|p| !p.trim().is_empty()).count();
        obs.insert("paragraphs".into(), Value::from(paragraphs));
        obs
    }
}
