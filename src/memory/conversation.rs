//! 短期记忆：对话历史
//!
//! 保留最近 N 轮（玩家行动 + 地下城主叙述），超出时自动剪枝；会话快照与上下文拼装都从这里取历史。

use serde::{Deserialize, Serialize};

/// 消息角色
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    Player,
    DungeonMaster,
    System,
}

/// 单条消息
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub role: Role,
    pub content: String,
}

impl Message {
    pub fn player(content: impl Into<String>) -> Self {
        Self {
            role: Role::Player,
            content: content.into(),
        }
    }

    pub fn dungeon_master(content: impl Into<String>) -> Self {
        Self {
            role: Role::DungeonMaster,
            content: content.into(),
        }
    }

    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: Role::System,
            content: content.into(),
        }
    }
}

/// 最近 N 轮对话（每轮含 player + dm，故实际保留约 max_turns*2 条消息）
#[derive(Clone, Debug)]
pub struct ConversationMemory {
    messages: Vec<Message>,
    max_turns: usize,
}

impl ConversationMemory {
    pub fn new(max_turns: usize) -> Self {
        Self {
            messages: Vec::new(),
            max_turns,
        }
    }

    pub fn from_messages(messages: Vec<Message>, max_turns: usize) -> Self {
        let mut memory = Self { messages, max_turns };
        memory.prune();
        memory
    }

    pub fn push(&mut self, msg: Message) {
        self.messages.push(msg);
        self.prune();
    }

    pub fn messages(&self) -> &[Message] {
        &self.messages
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    pub fn clear(&mut self) {
        self.messages.clear();
    }

    /// 最近 n 条消息格式化为 "Player: ..." / "DM: ..." 文本，供 prompt 使用
    pub fn excerpt(&self, n: usize) -> String {
        let start = self.messages.len().saturating_sub(n);
        self.messages[start..]
            .iter()
            .map(|m| {
                let who = match m.role {
                    Role::Player => "Player",
                    Role::DungeonMaster => "DM",
                    Role::System => "System",
                };
                format!("{}: {}", who, m.content)
            })
            .collect::<Vec<_>>()
            .join("\n")
    }

    /// 超出 max_turns*2 时丢弃最旧的消息，保留最近部分
    fn prune(&mut self) {
        let keep = self.max_turns * 2;
        if self.messages.len() > keep {
            self.messages.drain(..self.messages.len() - keep);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_prune_keeps_recent_turns() {
        let mut mem = ConversationMemory::new(1);
        mem.push(Message::player("a"));
        mem.push(Message::dungeon_master("b"));
        mem.push(Message::player("c"));
        assert_eq!(mem.messages().len(), 2);
        assert_eq!(mem.messages()[0].content, "b");
    }

    #[test]
    fn test_excerpt_formats_roles() {
        let mut mem = ConversationMemory::new(10);
        mem.push(Message::player("I open the door"));
        mem.push(Message::dungeon_master("It creaks."));
        assert_eq!(mem.excerpt(5), "Player: I open the door\nDM: It creaks.");
        assert_eq!(mem.excerpt(1), "DM: It creaks.");
    }
}
