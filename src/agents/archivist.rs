//! Archivist：从玩家动作中提取需要记录的状态变化（物品、伤势、位置、任务进度）

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;

use super::{basic_observations, generate, optional_section, Agent, AgentRequest, AgentRole, ContextMap};
use crate::core::DmError;
use crate::llm::LlmClient;

pub struct ArchivistAgent {
    name: String,
    llm: Arc<dyn LlmClient>,
    max_tokens: u32,
}

impl ArchivistAgent {
    pub fn new(llm: Arc<dyn LlmClient>) -> Self {
        Self {
            name: super::ARCHIVIST.to_string(),
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

    /// 统计结果中列出的变化条数：JSON 数组、{"changes": [...]}，或退化为非空行数
    fn count_changes(result: &str) -> (bool, usize) {
        match serde_json::from_str::<Value>(result.trim()) {
            Ok(Value::Array(items)) => (true, items.len()),
            Ok(Value::Object(map)) => {
                let n = map.get("changes").and_then(Value::as_array).map_or(0, Vec::len);
                (true, n)
            }
            Ok(_) => (true, 0),
            Err(_) => (
                false,
                result.lines().filter(|l| !l.trim().is_empty()).count(),
            ),
        }
    }
}

#[async_trait]
impl Agent for ArchivistAgent {
    fn name(&self) -> &str {
        &self.name
    }

    fn role(&self) -> AgentRole {
        AgentRole::Archivist
    }

    fn reason(&self, request: &AgentRequest) -> Result<String, DmError> {
        let subject = match request.context_str("narrative") {
            "" => "the player's action",
            _ => "the player's action and the narrated outcome",
        };
        Ok(format!(
            "Record every concrete change to game state caused by {}: items gained or lost, \
             hit points, location, quest progress. Reply with a JSON object {{\"changes\": [..]}}.",
            subject
        ))
    }

    async fn act(&self, reasoning: &str, request: &AgentRequest) -> Result<String, DmError> {
        let prompt = format!(
            "{}{}Player action: {}\n\nInstruction: {}",
            optional_section("Narrated outcome", request.context_str("narrative")),
            optional_section("Recent events", request.context_str("history")),
            request.action(),
            reasoning
        );
        generate(&self.llm, &self.name, &prompt, self.max_tokens).await
    }

    fn observe(&self, result: &str) -> ContextMap {
        let mut obs = basic_observations(result);
        let (parsed, changes) = Self::count_changes(result);
        obs.insert("parsed_json".into(), Value::from(parsed));
        obs.insert("change_count".into(), Value::from(changes));
        obs
    }
}
