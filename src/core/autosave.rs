//! 自动存档：按间隔持久化会话，并记录检查点
//!
//! 周期存档失败只记日志返回 false；中断存档是最后机会，失败必须向调用方报告。

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use tokio::time::Instant;
use tracing::{debug, error, info};

use crate::config::AutoSaveSection;
use crate::core::session::{SaveMode, SessionSerializer, SharedSession};
use crate::core::{DmError, DmResult};

const AUTOSAVE_NOTE: &str = "Automatic save";

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Checkpoint {
    pub timestamp: DateTime<Utc>,
    pub turn: u32,
    pub description: String,
}

pub struct AutoSaveManager {
    session: SharedSession,
    serializer: Arc<dyn SessionSerializer>,
    interval: Duration,
    max_checkpoints: usize,
    last_save: Mutex<Option<Instant>>,
    checkpoints: Mutex<VecDeque<Checkpoint>>,
}

impl AutoSaveManager {
    pub fn new(session: SharedSession, serializer: Arc<dyn SessionSerializer>, config: &AutoSaveSection) -> Self {
        Self {
            session,
            serializer,
            interval: config.interval(),
            max_checkpoints: config.max_checkpoints.max(1),
            last_save: Mutex::new(None),
            checkpoints: Mutex::new(VecDeque::new()),
        }
    }

    pub fn should_save(&self) -> bool {
        match *self.last_save.lock() {
            None => true,
            Some(at) => at.elapsed() >= self.interval,
        }
    }

    fn save(&self, mode: SaveMode, notes: &str) -> anyhow::Result<u32> {
        let (data, turn) = {
            let session = self.session.lock();
            let mut data = serde_json::to_value(session.snapshot())?;
            let checkpoints = serde_json::to_value(self.checkpoints())?;
            if let Some(meta) = data.get_mut("metadata").and_then(|m| m.as_object_mut()) {
                meta.insert("checkpoints".into(), checkpoints);
            }
            (data, session.turn_count)
        };
        self.serializer.save_session(&data, mode, notes)?;
        *self.last_save.lock() = Some(Instant::now());
        Ok(turn)
    }

    /// 未到间隔时不做任何事；失败记日志并返回 false
    pub fn trigger_autosave(&self) -> bool {
        if !self.should_save() {
            return false;
        }
        match self.save(SaveMode::Pause, AUTOSAVE_NOTE) {
            Ok(turn) => {
                debug!(turn, "autosave complete");
                true
            }
            Err(e) => {
                error!(error = %format!("{:#}", e), "autosave failed");
                false
            }
        }
    }

    /// 立即保存，不看间隔；失败返回错误
    pub fn save_now(&self, notes: &str) -> DmResult<()> {
        let session_id = self.session.lock().session_id.clone();
        match self.save(SaveMode::Pause, notes) {
            Ok(turn) => {
                info!(session_id = %session_id, turn, notes, "session saved");
                Ok(())
            }
            Err(e) => Err(DmError::session(format!("save failed: {:#}", e), Some(&session_id))),
        }
    }

    /// 中断时的最后一次保存
    pub fn save_on_interrupt(&self) -> DmResult<()> {
        self.save_now(&format!("Session interrupted at {}", Utc::now().to_rfc3339()))
    }

    /// 追加检查点，只保留最近 max_checkpoints 个
    pub fn mark_checkpoint(&self, description: impl Into<String>) {
        let turn = self.session.lock().turn_count;
        let mut checkpoints = self.checkpoints.lock();
        checkpoints.push_back(Checkpoint {
            timestamp: Utc::now(),
            turn,
            description: description.into(),
        });
        while checkpoints.len() > self.max_checkpoints {
            checkpoints.pop_front();
        }
    }

    pub fn checkpoints(&self) -> Vec<Checkpoint> {
        self.checkpoints.lock().iter().cloned().collect()
    }
}
