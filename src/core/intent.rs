//! 玩家意图识别与 Agent 分派计划
//!
//! 只做关键字规则匹配，不调用 LLM。每个意图对应一个降级动作类别，
//! 计划按当前降级级别裁剪。

use serde::{Deserialize, Serialize};

use crate::agents::{ARBITER, ARCHIVIST, CONSISTENCY, MODULE_KEEPER, NARRATOR};
use crate::core::degradation::DegradationLevel;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SystemCommand {
    Save,
    Status,
    Help,
    Quit,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PlayerIntent {
    /// 一般动作
    Action,
    Exploration,
    Dialogue,
    Combat,
    /// 规则问题
    Rules,
    /// 模组设定 / 背景
    Lore,
    /// 回顾之前发生的事
    Recall,
    System(SystemCommand),
}

impl PlayerIntent {
    /// 对应的降级动作类别
    pub fn action_category(&self) -> &'static str {
        match self {
            PlayerIntent::Action => "basic_actions",
            PlayerIntent::Exploration => "exploration",
            PlayerIntent::Dialogue => "npc_dialogue",
            PlayerIntent::Combat => "combat",
            PlayerIntent::Rules => "rules_lookup",
            PlayerIntent::Lore => "module_lore",
            PlayerIntent::Recall => "simple_responses",
            PlayerIntent::System(SystemCommand::Quit) => "exit",
            PlayerIntent::System(_) => "save_session",
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            PlayerIntent::Action => "action",
            PlayerIntent::Exploration => "exploration",
            PlayerIntent::Dialogue => "dialogue",
            PlayerIntent::Combat => "combat",
            PlayerIntent::Rules => "rules",
            PlayerIntent::Lore => "lore",
            PlayerIntent::Recall => "recall",
            PlayerIntent::System(SystemCommand::Save) => "system:save",
            PlayerIntent::System(SystemCommand::Status) => "system:status",
            PlayerIntent::System(SystemCommand::Help) => "system:help",
            PlayerIntent::System(SystemCommand::Quit) => "system:quit",
        }
    }
}

const COMBAT_WORDS: &[&str] = &[
    "attack", "strike", "stab", "shoot", "fight", "cast", "swing", "slash", "initiative", "charge",
];
const RULES_WORDS: &[&str] = &[
    "can i", "am i allowed", "what's the rule", "what is the rule", "how does", "do i need to roll",
    "advantage", "saving throw", "spell slot", "rules",
];
const LORE_WORDS: &[&str] = &[
    "history of", "legend", "lore", "who rules", "what do i know about", "tell me about",
];
const RECALL_WORDS: &[&str] = &[
    "what happened", "remind me", "recap", "last session", "what did", "where was i",
];
const DIALOGUE_WORDS: &[&str] = &["talk", "ask", "say", "tell", "greet", "persuade", "convince", "\""];
const EXPLORATION_WORDS: &[&str] = &[
    "look", "search", "explore", "examine", "inspect", "investigate", "walk", "go to", "enter", "open",
];

fn contains_word(haystack: &str, needle: &str) -> bool {
    if needle.contains(' ') || !needle.chars().all(char::is_alphanumeric) {
        return haystack.contains(needle);
    }
    haystack
        .split(|c: char| !c.is_alphanumeric() && c != '\'')
        .any(|w| w == needle)
}

fn any_of(haystack: &str, words: &[&str]) -> bool {
    words.iter().any(|w| contains_word(haystack, w))
}

/// 规则优先级：系统命令 > 回顾 > 规则 > 设定 > 战斗 > 对话 > 探索 > 一般动作
pub fn classify_intent(text: &str) -> PlayerIntent {
    let lower = text.trim().to_lowercase();

    if let Some(cmd) = lower.strip_prefix('/') {
        let cmd = cmd.split_whitespace().next().unwrap_or("");
        return PlayerIntent::System(match cmd {
            "save" => SystemCommand::Save,
            "quit" | "exit" => SystemCommand::Quit,
            "status" => SystemCommand::Status,
            _ => SystemCommand::Help,
        });
    }

    if any_of(&lower, RECALL_WORDS) {
        PlayerIntent::Recall
    } else if any_of(&lower, RULES_WORDS) {
        PlayerIntent::Rules
    } else if any_of(&lower, LORE_WORDS) {
        PlayerIntent::Lore
    } else if any_of(&lower, COMBAT_WORDS) {
        PlayerIntent::Combat
    } else if any_of(&lower, DIALOGUE_WORDS) {
        PlayerIntent::Dialogue
    } else if any_of(&lower, EXPLORATION_WORDS) {
        PlayerIntent::Exploration
    } else {
        PlayerIntent::Action
    }
}

/// 一回合的 Agent 计划：primary 先执行，supporting 在其后并拿到 primary 的叙述
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AgentPlan {
    pub intent: PlayerIntent,
    pub primary: Vec<&'static str>,
    pub supporting: Vec<&'static str>,
    /// 被降级替换成一般动作时为 true
    pub downgraded: bool,
}

impl AgentPlan {
    pub fn for_intent(intent: PlayerIntent) -> Self {
        let (primary, supporting): (Vec<&'static str>, Vec<&'static str>) = match intent {
            PlayerIntent::Action | PlayerIntent::Exploration => {
                (vec![NARRATOR], vec![CONSISTENCY, ARCHIVIST])
            }
            PlayerIntent::Dialogue => (vec![NARRATOR], vec![CONSISTENCY]),
            PlayerIntent::Combat => (vec![NARRATOR], vec![ARBITER, ARCHIVIST]),
            PlayerIntent::Rules => (vec![ARBITER], vec![]),
            PlayerIntent::Lore => (vec![MODULE_KEEPER], vec![CONSISTENCY]),
            PlayerIntent::Recall => (vec![ARCHIVIST], vec![]),
            PlayerIntent::System(_) => (vec![], vec![]),
        };
        Self {
            intent,
            primary,
            supporting,
            downgraded: false,
        }
    }

    /// 按降级级别裁剪；当前级别完全不允许时返回 None
    pub fn for_level(intent: PlayerIntent, level: DegradationLevel) -> Option<Self> {
        let allowed = level.available_actions();
        let mut plan = if allowed.contains(&intent.action_category()) {
            Self::for_intent(intent)
        } else if allowed.contains(&"basic_actions") {
            Self {
                downgraded: true,
                ..Self::for_intent(PlayerIntent::Action)
            }
        } else {
            return None;
        };

        match level {
            DegradationLevel::Full => {}
            DegradationLevel::Reduced => plan.supporting.clear(),
            DegradationLevel::Minimal | DegradationLevel::Emergency => {
                plan.supporting.clear();
                if !plan.primary.is_empty() {
                    plan.primary = vec![NARRATOR];
                }
            }
        }
        Some(plan)
    }

    pub fn agents(&self) -> impl Iterator<Item = &'static str> + '_ {
        self.primary.iter().chain(self.supporting.iter()).copied()
    }
}
