//! 优雅降级状态机：FULL -> REDUCED -> MINIMAL -> EMERGENCY
//!
//! 级别只能通过 degrade_to / upgrade_to 改变；降级只往更受限走，升级只往更宽松走。

use std::fmt;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum DegradationLevel {
    Full,
    Reduced,
    Minimal,
    Emergency,
}

impl DegradationLevel {
    pub const ALL: [DegradationLevel; 4] = [
        DegradationLevel::Full,
        DegradationLevel::Reduced,
        DegradationLevel::Minimal,
        DegradationLevel::Emergency,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            DegradationLevel::Full => "FULL",
            DegradationLevel::Reduced => "REDUCED",
            DegradationLevel::Minimal => "MINIMAL",
            DegradationLevel::Emergency => "EMERGENCY",
        }
    }

    /// 下一个更受限的级别；EMERGENCY 没有
    pub fn next_stricter(self) -> Option<Self> {
        match self {
            DegradationLevel::Full => Some(DegradationLevel::Reduced),
            DegradationLevel::Reduced => Some(DegradationLevel::Minimal),
            DegradationLevel::Minimal => Some(DegradationLevel::Emergency),
            DegradationLevel::Emergency => None,
        }
    }

    pub fn next_looser(self) -> Option<Self> {
        match self {
            DegradationLevel::Full => None,
            DegradationLevel::Reduced => Some(DegradationLevel::Full),
            DegradationLevel::Minimal => Some(DegradationLevel::Reduced),
            DegradationLevel::Emergency => Some(DegradationLevel::Minimal),
        }
    }

    /// 该级别下可用的动作类别
    pub fn available_actions(self) -> &'static [&'static str] {
        match self {
            DegradationLevel::Full => &[
                "basic_actions",
                "simple_responses",
                "combat",
                "npc_dialogue",
                "exploration",
                "rules_lookup",
                "module_lore",
                "save_session",
            ],
            DegradationLevel::Reduced => &[
                "basic_actions",
                "simple_responses",
                "combat",
                "exploration",
                "save_session",
            ],
            DegradationLevel::Minimal => &["basic_actions", "simple_responses", "save_session"],
            DegradationLevel::Emergency => &["save_session", "exit"],
        }
    }

    fn notice(self) -> &'static str {
        match self {
            DegradationLevel::Full => "",
            DegradationLevel::Reduced => {
                "The weave of magic flickers for a moment. The world around you feels a little \
                 less vivid, though your adventure continues."
            }
            DegradationLevel::Minimal => {
                "A heavy fog rolls over the land. Only the simplest actions can pierce it now; \
                 the finer details of the world are hidden until it lifts."
            }
            DegradationLevel::Emergency => {
                "Time itself seems to stand still. The Dungeon Master must pause the tale: \
                 you may save your progress or leave the table."
            }
        }
    }
}

impl fmt::Display for DegradationLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug)]
struct DegradationState {
    level: DegradationLevel,
    reasons: Vec<String>,
}

/// 全局唯一的当前级别，读写都持锁
#[derive(Debug)]
pub struct DegradationManager {
    state: Mutex<DegradationState>,
}

impl Default for DegradationManager {
    fn default() -> Self {
        Self::new()
    }
}

impl DegradationManager {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(DegradationState {
                level: DegradationLevel::Full,
                reasons: Vec::new(),
            }),
        }
    }

    pub fn current_level(&self) -> DegradationLevel {
        self.state.lock().level
    }

    pub fn reasons(&self) -> Vec<String> {
        self.state.lock().reasons.clone()
    }

    /// 目标必须严格更受限，否则返回 false 不做任何事
    pub fn degrade_to(&self, level: DegradationLevel, reason: impl Into<String>) -> bool {
        let mut state = self.state.lock();
        if level <= state.level {
            return false;
        }
        let reason = reason.into();
        warn!(from = %state.level, to = %level, reason = %reason, "degrading service level");
        state.level = level;
        state.reasons.push(reason);
        true
    }

    /// 目标必须严格更宽松；每次成功升级丢弃最近一条原因
    pub fn upgrade_to(&self, level: DegradationLevel) -> bool {
        let mut state = self.state.lock();
        if level >= state.level {
            return false;
        }
        info!(from = %state.level, to = %level, "restoring service level");
        state.level = level;
        state.reasons.pop();
        true
    }

    pub fn degrade_one_step(&self, reason: impl Into<String>) -> Option<DegradationLevel> {
        let mut state = self.state.lock();
        let target = state.level.next_stricter()?;
        let reason = reason.into();
        warn!(from = %state.level, to = %target, reason = %reason, "degrading service level");
        state.level = target;
        state.reasons.push(reason);
        Some(target)
    }

    pub fn upgrade_one_step(&self) -> Option<DegradationLevel> {
        let mut state = self.state.lock();
        let target = state.level.next_looser()?;
        info!(from = %state.level, to = %target, "restoring service level");
        state.level = target;
        state.reasons.pop();
        Some(target)
    }

    pub fn get_available_actions(&self) -> Vec<&'static str> {
        self.current_level().available_actions().to_vec()
    }

    pub fn is_action_allowed(&self, action_type: &str) -> bool {
        self.current_level().available_actions().contains(&action_type)
    }

    /// FULL 时为空；否则是角色内的提示，附最近一次降级原因
    pub fn notify_user(&self) -> String {
        let state = self.state.lock();
        if state.level == DegradationLevel::Full {
            return String::new();
        }
        let mut message = state.level.notice().to_string();
        if let Some(reason) = state.reasons.last() {
            message.push_str(&format!("\n\n(Technical note: {})", reason));
        }
        message
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn at(level: DegradationLevel) -> DegradationManager {
        let m = DegradationManager::new();
        if level != DegradationLevel::Full {
            assert!(m.degrade_to(level, "setup"));
        }
        m
    }

    #[test]
    fn test_transitions_are_strictly_monotonic() {
        for a in DegradationLevel::ALL {
            for b in DegradationLevel::ALL {
                assert_eq!(at(a).degrade_to(b, "x"), b > a, "degrade {a} -> {b}");
                assert_eq!(at(a).upgrade_to(b), b < a, "upgrade {a} -> {b}");
            }
        }
        assert!(!DegradationManager::new().upgrade_to(DegradationLevel::Reduced));
    }

    #[test]
    fn test_degrade_to_minimal_limits_actions() {
        let m = DegradationManager::new();
        assert!(m.degrade_to(DegradationLevel::Minimal, "network down"));
        assert_eq!(m.current_level(), DegradationLevel::Minimal);
        assert_eq!(
            m.get_available_actions(),
            vec!["basic_actions", "simple_responses", "save_session"]
        );
        assert!(!m.is_action_allowed("combat"));
    }

    #[test]
    fn test_action_counts_per_level() {
        let counts: Vec<usize> = DegradationLevel::ALL
            .iter()
            .map(|l| l.available_actions().len())
            .collect();
        assert_eq!(counts, vec![8, 5, 3, 2]);
        assert_eq!(DegradationLevel::Emergency.available_actions(), &["save_session", "exit"]);
    }

    #[test]
    fn test_notice_carries_latest_reason() {
        let m = DegradationManager::new();
        assert_eq!(m.notify_user(), "");
        m.degrade_to(DegradationLevel::Reduced, "narrator timed out");
        m.degrade_to(DegradationLevel::Minimal, "archivist offline");
        let notice = m.notify_user();
        assert!(notice.contains("fog"));
        assert!(notice.ends_with("(Technical note: archivist offline)"));

        // 升级只弹出一条原因
        assert!(m.upgrade_to(DegradationLevel::Full));
        assert_eq!(m.reasons(), vec!["narrator timed out"]);
        assert_eq!(m.notify_user(), "");
    }

    #[test]
    fn test_one_step_helpers_stop_at_ends() {
        let m = DegradationManager::new();
        assert_eq!(m.upgrade_one_step(), None);
        for _ in 0..3 {
            assert!(m.degrade_one_step("x").is_some());
        }
        assert_eq!(m.degrade_one_step("x"), None);
        assert_eq!(m.current_level(), DegradationLevel::Emergency);
        assert_eq!(m.upgrade_one_step(), Some(DegradationLevel::Minimal));
    }
}
