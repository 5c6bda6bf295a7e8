//! Narrator：把玩家动作转为第二人称的场景叙述

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;

use super::{basic_observations, generate, optional_section, Agent, AgentRequest, AgentRole, ContextMap};
use crate::core::DmError;
use crate::llm::LlmClient;

const COMBAT_WORDS: &[&str] = &["attack", "strike", "fight", "shoot", "cast", "slash", "stab"];
const SOCIAL_WORDS: &[&str] = &["talk", "ask", "say", "persuade", "greet", "tell", "bribe"];

pub struct NarratorAgent {
    name: String,
    llm: Arc<dyn LlmClient>,
    max_tokens: u32,
}

impl NarratorAgent {
    pub fn new(llm: Arc<dyn LlmClient>) -> Self {
        Self {
            name: super::NARRATOR.to_string(),
            llm,
            max_tokens: 800,
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    /// 单次调用的 token 上限不超过 ceiling
    pub fn with_token_ceiling(mut self, ceiling: u32) -> Self {
        self.max_tokens = self.max_tokens.min(ceiling);
        self
    }

    pub fn with_max_tokens(mut self, max_tokens: u32) -> Self {
        self.max_tokens = max_tokens;
        self
    }

    fn tone_for(action: &str) -> &'static str {
        let lower = action.to_lowercase();
        if COMBAT_WORDS.iter().any(|w| lower.contains(w)) {
            "tense combat"
        } else if SOCIAL_WORDS.iter().any(|w| lower.contains(w)) {
            "character dialogue"
        } else {
            "atmospheric exploration"
        }
    }
}

#[async_trait]
impl Agent for NarratorAgent {
    fn name(&self) -> &str {
        &self.name
    }

    fn role(&self) -> AgentRole {
        AgentRole::Narrator
    }

    fn reason(&self, request: &AgentRequest) -> Result<String, DmError> {
        let action = request.action();
        if action.trim().is_empty() {
            return Err(DmError::agent(&self.name, "no player action to narrate"));
        }
        let location = match request.context_str("location") {
            "" => "an unknown place",
            l => l,
        };
        Ok(format!(
            "The player at {} wants to: {}. Narrate the outcome as {} in second person, \
             without deciding the player's next move.",
            location,
            action,
            Self::tone_for(action)
        ))
    }

    async fn act(&self, reasoning: &str, request: &AgentRequest) -> Result<String, DmError> {
        let prompt = format!(
            "{}{}{}Player action: {}\n\nInstruction: {}",
            optional_section("Relevant context", request.context_str("context")),
            optional_section("Recent events", request.context_str("history")),
            optional_section("Location", request.context_str("location")),
            request.action(),
            reasoning
        );
        generate(&self.llm, &self.name, &prompt, self.max_tokens).await
    }

    fn observe(&self, result: &str) -> ContextMap {
        let mut obs = basic_observations(result);
        let has_dialogue = result.contains('"') || result.contains('\u{201c}');
        obs.insert("has_dialogue".into(), Value::from(has_dialogue));
        obs
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::ScriptedLlmClient;

    #[test]
    fn test_reason_picks_tone_and_rejects_empty_action() {
        let agent = NarratorAgent::new(Arc::new(ScriptedLlmClient::always("")));
        let request = AgentRequest::new()
            .with_context("action", "I attack the goblin")
            .with_context("location", "the crypt");
        let reasoning = agent.reason(&request).unwrap();
        assert!(reasoning.contains("tense combat"));
        assert!(reasoning.contains("the crypt"));

        assert!(agent.reason(&AgentRequest::new()).is_err());
    }

    #[tokio::test]
    async fn test_act_sends_action_line_and_observe_detects_dialogue() {
        let llm = Arc::new(ScriptedLlmClient::always(
            "The innkeeper smiles. \"Welcome, traveller.\"",
        ));
        let agent = NarratorAgent::new(llm.clone());
        let request = AgentRequest::new().with_context("action", "greet the innkeeper");
        let response = agent.run(&request).await.unwrap();

        assert!(llm.prompts()[0].contains("Player action: greet the innkeeper"));
        assert_eq!(response.observations["has_dialogue"], true);
        assert_eq!(response.observations["is_empty"], false);
        assert_eq!(response.observations["word_count"], 5);
    }
}
