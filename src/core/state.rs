//! 回合状态投影：宿主只看到轻量的 TurnState，完整状态由编排器维护

use serde::Serialize;

use crate::core::degradation::DegradationLevel;

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TurnPhase {
    Idle,
    Processing,
    Saving,
    Error,
    Closed,
}

/// 通过 watch 通道推送给宿主的状态
#[derive(Clone, Debug, Serialize)]
pub struct TurnState {
    pub phase: TurnPhase,
    pub turn: u32,
    pub degradation_level: DegradationLevel,
    /// 最近一次回合的叙述
    pub last_narrative: Option<String>,
    pub degradation_notice: Option<String>,
    pub warnings: Vec<String>,
    pub input_locked: bool,
    pub error_message: Option<String>,
}

impl Default for TurnState {
    fn default() -> Self {
        Self {
            phase: TurnPhase::Idle,
            turn: 0,
            degradation_level: DegradationLevel::Full,
            last_narrative: None,
            degradation_notice: None,
            warnings: Vec::new(),
            input_locked: false,
            error_message: None,
        }
    }
}

impl TurnState {
    /// 锁定输入并进入指定阶段，其余字段沿用
    pub fn busy(&self, phase: TurnPhase) -> Self {
        Self {
            phase,
            input_locked: true,
            error_message: None,
            ..self.clone()
        }
    }

    pub fn failed(&self, message: impl Into<String>) -> Self {
        Self {
            phase: TurnPhase::Error,
            input_locked: false,
            error_message: Some(message.into()),
            ..self.clone()
        }
    }
}
