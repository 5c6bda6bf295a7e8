//! 游戏会话与会话序列化
//!
//! GameSession 是编排器持有的可变状态；落盘时投影为固定字段的 SessionSnapshot。
//! 序列化器是外部协作方，这里给出 JSON 文件实现与内存实现。

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use anyhow::Context;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};

use crate::memory::{ConversationMemory, Message};

/// 会话内保留的对话轮数
pub const HISTORY_TURNS: usize = 50;
const FACTS_KEY: &str = "established_facts";

pub type SharedSession = Arc<Mutex<GameSession>>;

/// 落盘的会话快照
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionSnapshot {
    pub session_id: String,
    pub campaign_id: String,
    pub config: Value,
    pub started_at: DateTime<Utc>,
    pub turn_count: u32,
    pub conversation_history: Vec<Message>,
    pub active_agents: Vec<String>,
    #[serde(default)]
    pub metadata: Map<String, Value>,
}

#[derive(Debug, Clone)]
pub struct GameSession {
    pub session_id: String,
    pub campaign_id: String,
    pub config: Value,
    pub started_at: DateTime<Utc>,
    pub turn_count: u32,
    pub history: ConversationMemory,
    pub active_agents: Vec<String>,
    pub metadata: Map<String, Value>,
}

impl GameSession {
    pub fn new(campaign_id: impl Into<String>) -> Self {
        Self {
            session_id: uuid::Uuid::new_v4().to_string(),
            campaign_id: campaign_id.into(),
            config: Value::Object(Map::new()),
            started_at: Utc::now(),
            turn_count: 0,
            history: ConversationMemory::new(HISTORY_TURNS),
            active_agents: Vec::new(),
            metadata: Map::new(),
        }
    }

    pub fn with_session_id(mut self, id: impl Into<String>) -> Self {
        self.session_id = id.into();
        self
    }

    pub fn snapshot(&self) -> SessionSnapshot {
        SessionSnapshot {
            session_id: self.session_id.clone(),
            campaign_id: self.campaign_id.clone(),
            config: self.config.clone(),
            started_at: self.started_at,
            turn_count: self.turn_count,
            conversation_history: self.history.messages().to_vec(),
            active_agents: self.active_agents.clone(),
            metadata: self.metadata.clone(),
        }
    }

    pub fn from_snapshot(snapshot: SessionSnapshot) -> Self {
        Self {
            session_id: snapshot.session_id,
            campaign_id: snapshot.campaign_id,
            config: snapshot.config,
            started_at: snapshot.started_at,
            turn_count: snapshot.turn_count,
            history: ConversationMemory::from_messages(snapshot.conversation_history, HISTORY_TURNS),
            active_agents: snapshot.active_agents,
            metadata: snapshot.metadata,
        }
    }

    /// 由 Archivist 记录、供 Consistency 核对的既成事实
    pub fn facts(&self) -> Vec<String> {
        self.metadata
            .get(FACTS_KEY)
            .and_then(Value::as_array)
            .map(|items| items.iter().filter_map(|v| v.as_str().map(String::from)).collect())
            .unwrap_or_default()
    }

    pub fn add_fact(&mut self, fact: impl Into<String>) {
        let fact = fact.into();
        if fact.trim().is_empty() {
            return;
        }
        let entry = self
            .metadata
            .entry(FACTS_KEY.to_string())
            .or_insert_with(|| Value::Array(Vec::new()));
        if let Value::Array(items) = entry {
            if !items.iter().any(|v| v.as_str() == Some(fact.as_str())) {
                items.push(Value::from(fact));
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SaveMode {
    Pause,
    Checkpoint,
    End,
}

impl SaveMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            SaveMode::Pause => "pause",
            SaveMode::Checkpoint => "checkpoint",
            SaveMode::End => "end",
        }
    }
}

/// 外部会话存储
pub trait SessionSerializer: Send + Sync {
    fn save_session(&self, session_data: &Value, mode: SaveMode, summary_notes: &str) -> anyhow::Result<()>;

    /// 不存在时返回 Ok(None)
    fn load_session(&self, session_id: &str) -> anyhow::Result<Option<Value>>;
}

/// `<campaign_dir>/sessions/<session_id>.json`
#[derive(Debug, Clone)]
pub struct JsonFileSessionSerializer {
    dir: PathBuf,
}

impl JsonFileSessionSerializer {
    pub fn new(campaign_dir: impl AsRef<Path>) -> Self {
        Self {
            dir: campaign_dir.as_ref().join("sessions"),
        }
    }

    fn path_for(&self, session_id: &str) -> anyhow::Result<PathBuf> {
        if session_id.is_empty() || session_id.contains(['/', '\\']) || session_id.contains("..") {
            anyhow::bail!("invalid session id '{}'", session_id);
        }
        Ok(self.dir.join(format!("{}.json", session_id)))
    }
}

impl SessionSerializer for JsonFileSessionSerializer {
    fn save_session(&self, session_data: &Value, mode: SaveMode, summary_notes: &str) -> anyhow::Result<()> {
        let session_id = session_data
            .get("session_id")
            .and_then(Value::as_str)
            .context("session data has no session_id")?;
        let path = self.path_for(session_id)?;
        std::fs::create_dir_all(&self.dir)
            .with_context(|| format!("creating {}", self.dir.display()))?;
        let payload = json!({
            "mode": mode,
            "notes": summary_notes,
            "saved_at": Utc::now(),
            "session": session_data,
        });
        // 先写临时文件再改名，避免中途崩溃留下半个文件
        let tmp = path.with_extension("json.tmp");
        std::fs::write(&tmp, serde_json::to_string_pretty(&payload)?)
            .with_context(|| format!("writing {}", tmp.display()))?;
        std::fs::rename(&tmp, &path).with_context(|| format!("replacing {}", path.display()))?;
        Ok(())
    }

    fn load_session(&self, session_id: &str) -> anyhow::Result<Option<Value>> {
        let path = self.path_for(session_id)?;
        if !path.exists() {
            return Ok(None);
        }
        let data = std::fs::read_to_string(&path).with_context(|| format!("reading {}", path.display()))?;
        let mut payload: Value = serde_json::from_str(&data)?;
        Ok(payload.get_mut("session").map(Value::take))
    }
}

/// 保存记录：数据、模式、备注
pub type SavedSession = (Value, SaveMode, String);

/// 内存存储，测试与无盘运行用；可切换为持续失败
#[derive(Debug, Default)]
pub struct InMemorySessionSerializer {
    sessions: Mutex<HashMap<String, SavedSession>>,
    failing: AtomicBool,
    saves: AtomicUsize,
}

impl InMemorySessionSerializer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    pub fn save_count(&self) -> usize {
        self.saves.load(Ordering::SeqCst)
    }

    pub fn get(&self, session_id: &str) -> Option<SavedSession> {
        self.sessions.lock().get(session_id).cloned()
    }
}

impl SessionSerializer for InMemorySessionSerializer {
    fn save_session(&self, session_data: &Value, mode: SaveMode, summary_notes: &str) -> anyhow::Result<()> {
        if self.failing.load(Ordering::SeqCst) {
            anyhow::bail!("session store unavailable");
        }
        let id = session_data
            .get("session_id")
            .and_then(Value::as_str)
            .context("session data has no session_id")?
            .to_string();
        self.sessions
            .lock()
            .insert(id, (session_data.clone(), mode, summary_notes.to_string()));
        self.saves.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn load_session(&self, session_id: &str) -> anyhow::Result<Option<Value>> {
        if self.failing.load(Ordering::SeqCst) {
            anyhow::bail!("session store unavailable");
        }
        Ok(self.sessions.lock().get(session_id).map(|(v, _, _)| v.clone()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_snapshot_roundtrips_through_file_serializer() {
        let dir = tempfile::tempdir().unwrap();
        let serializer = JsonFileSessionSerializer::new(dir.path());
        let mut session = GameSession::new("lost-mine").with_session_id("s-1");
        session.turn_count = 7;
        session.history.push(Message::player("I open the door"));
        session.add_fact("The door is oak");

        let data = serde_json::to_value(session.snapshot()).unwrap();
        serializer.save_session(&data, SaveMode::Pause, "auto").unwrap();
        assert!(dir.path().join("sessions/s-1.json").exists());

        let loaded = serializer.load_session("s-1").unwrap().unwrap();
        let restored = GameSession::from_snapshot(serde_json::from_value(loaded).unwrap());
        assert_eq!(restored.turn_count, 7);
        assert_eq!(restored.history.messages().len(), 1);
        assert_eq!(restored.facts(), vec!["The door is oak"]);
        assert!(serializer.load_session("missing").unwrap().is_none());
    }

    #[test]
    fn test_rejects_path_like_session_ids() {
        let dir = tempfile::tempdir().unwrap();
        let serializer = JsonFileSessionSerializer::new(dir.path());
        assert!(serializer.load_session("../escape").is_err());
        assert!(serializer
            .save_session(&json!({"session_id": "a/b"}), SaveMode::Pause, "")
            .is_err());
    }

    #[test]
    fn test_snapshot_has_documented_fields() {
        let session = GameSession::new("c");
        let data = serde_json::to_value(session.snapshot()).unwrap();
        for key in [
            "session_id",
            "campaign_id",
            "config",
            "started_at",
            "turn_count",
            "conversation_history",
            "active_agents",
            "metadata",
        ] {
            assert!(data.get(key).is_some(), "missing {key}");
        }
    }

    #[test]
    fn test_add_fact_dedups() {
        let mut session = GameSession::new("c");
        session.add_fact("Sildar is captured");
        session.add_fact("Sildar is captured");
        session.add_fact("  ");
        assert_eq!(session.facts().len(), 1);
    }
}
