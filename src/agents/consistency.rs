//! Consistency：检查叙述 / 动作是否与已确立的事实冲突

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;

use super::{basic_observations, generate, optional_section, Agent, AgentRequest, AgentRole, ContextMap};
use crate::core::DmError;
use crate::llm::LlmClient;

const CONTRADICTION_PREFIX: &str = "CONTRADICTION:";

pub struct ConsistencyAgent {
    name: String,
    llm: Arc<dyn LlmClient>,
    max_tokens: u32,
}

impl ConsistencyAgent {
    pub fn new(llm: Arc<dyn LlmClient>) -> Self {
        Self {
            name: super::CONSISTENCY.to_string(),
            llm,
            max_tokens: 300,
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
impl Agent for ConsistencyAgent {
    fn name(&self) -> &str {
        &self.name
    }

    fn role(&self) -> AgentRole {
        AgentRole::Consistency
    }

    fn reason(&self, request: &AgentRequest) -> Result<String, DmError> {
        let facts = request.context_list("established_facts");
        Ok(format!(
            "Compare the new content against {} established fact(s). Reply 'CONSISTENT' or \
             '{} <what conflicts>' on a single line.",
            facts.len(),
            CONTRADICTION_PREFIX
        ))
    }

    async fn act(&self, reasoning: &str, request: &AgentRequest) -> Result<String, DmError> {
        let facts = request
            .context_list("established_facts")
            .iter()
            .map(|f| format!("- {}", f))
            .collect::<Vec<_>>()
            .join("\n");
        let prompt = format!(
            "{}{}{}Player action: {}\n\nInstruction: {}",
            optional_section("Established facts", &facts),
            optional_section("Recent events", request.context_str("history")),
            optional_section("New narration", request.context_str("narrative")),
            request.action(),
            reasoning
        );
        generate(&self.llm, &self.name, &prompt, self.max_tokens).await
    }

    fn observe(&self, result: &str) -> ContextMap {
        let mut obs = basic_observations(result);
        let trimmed = result.trim();
        let n = CONTRADICTION_PREFIX.len();
        let contradiction = trimmed
            .get(..n)
            .filter(|head| head.eq_ignore_ascii_case(CONTRADICTION_PREFIX))
            .and_then(|_| trimmed.get(n..))
            .map(|rest| rest.trim().to_string());
        obs.insert("consistent".into(), Value::from(contradiction.is_none()));
        if let Some(detail) = contradiction {
            obs.insert("contradiction".into(), Value::from(detail));
        }
        obs
    }
}
