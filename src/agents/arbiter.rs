//! Arbiter：规则裁定。判断动作是否需要检定、是否被允许；规则正确性交给 LLM 的 prompt。
//!
//! 裁定结果同属档案类职能（记录结论），故登记为 Archivist 角色，可作为 Consistency 的回退。

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;

use super::{basic_observations, generate, optional_section, Agent, AgentRequest, AgentRole, ContextMap};
use crate::core::DmError;
use crate::llm::LlmClient;

/// 动作关键字 -> 建议检定属性
const CHECK_HINTS: &[(&str, &str)] = &[
    ("attack", "attack roll"),
    ("climb", "Strength (Athletics)"),
    ("jump", "Strength (Athletics)"),
    ("sneak", "Dexterity (Stealth)"),
    ("pick", "Dexterity (Sleight of Hand)"),
    ("persuade", "Charisma (Persuasion)"),
    ("lie", "Charisma (Deception)"),
    ("search", "Wisdom (Perception)"),
    ("recall", "Intelligence (History)"),
    ("cast", "spellcasting rules"),
];

pub struct ArbiterAgent {
    name: String,
    llm: Arc<dyn LlmClient>,
    max_tokens: u32,
}

impl ArbiterAgent {
    pub fn new(llm: Arc<dyn LlmClient>) -> Self {
        Self {
            name: super::ARBITER.to_string(),
            llm,
            max_tokens: 400,
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

    fn suggested_check(action: &str) -> Option<&'static str> {
        let lower = action.to_lowercase();
        CHECK_HINTS
            .iter()
            .find(|(word, _)| lower.contains(word))
            .map(|(_, check)| *check)
    }

    fn ruling_of(result: &str) -> &'static str {
        let lower = result.to_lowercase();
        if lower.contains("roll") || lower.contains("check") || lower.contains("d20") {
            "roll_required"
        } else if lower.contains("denied") || lower.contains("not allowed") || lower.contains("cannot") {
            "denied"
        } else if lower.contains("allowed") || lower.contains("succeeds") {
            "allowed"
        } else {
            "unclear"
        }
    }
}

#[async_trait]
impl Agent for ArbiterAgent {
    fn name(&self) -> &str {
        &self.name
    }

    fn role(&self) -> AgentRole {
        AgentRole::Archivist
    }

    fn reason(&self, request: &AgentRequest) -> Result<String, DmError> {
        let action = request.action();
        Ok(match Self::suggested_check(action) {
            Some(check) => format!(
                "The action '{}' likely needs a {}. State whether it is allowed, which roll is \
                 required and its DC.",
                action, check
            ),
            None => format!(
                "Decide whether '{}' is allowed under the rules as written and whether any roll \
                 is required.",
                action
            ),
        })
    }

    async fn act(&self, reasoning: &str, request: &AgentRequest) -> Result<String, DmError> {
        let prompt = format!(
            "{}Player action: {}\n\nAs the rules arbiter: {}",
            optional_section("Relevant rules and context", request.context_str("context")),
            request.action(),
            reasoning
        );
        generate(&self.llm, &self.name, &prompt, self.max_tokens).await
    }

    fn observe(&self, result: &str) -> ContextMap {
        let mut obs = basic_observations(result);
        obs.insert("ruling".into(), Value::from(Self::ruling_of(result)));
        obs.insert(
            "mentions_dice".into(),
            Value::from(result.to_lowercase().contains("d20")),
        );
        obs
    }
}
