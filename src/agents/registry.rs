//! Agent 注册表：名字 -> Agent，以及按角色索引的名单
//!
//! 回退路由不扫描全部 Agent：FallbackPolicy 给出「角色 -> 可接受的回退角色（有序）」，
//! 再到按角色索引中取第一个不是自己的 Agent。

use std::collections::HashMap;
use std::sync::Arc;

use super::{Agent, AgentRole};

/// 回退策略：角色 -> 有序的可接受回退角色
#[derive(Debug, Clone)]
pub struct FallbackPolicy {
    routes: HashMap<AgentRole, Vec<AgentRole>>,
}

impl Default for FallbackPolicy {
    /// Module Keeper 可由 Narrator 顶替，Consistency 可由 Archivist 顶替；
    /// Narrator 与 Archivist 不设回退
    fn default() -> Self {
        let mut routes = HashMap::new();
        routes.insert(AgentRole::ModuleKeeper, vec![AgentRole::Narrator]);
        routes.insert(AgentRole::Consistency, vec![AgentRole::Archivist]);
        Self { routes }
    }
}

impl FallbackPolicy {
    /// 不允许任何回退
    pub fn none() -> Self {
        Self {
            routes: HashMap::new(),
        }
    }

    pub fn with_route(mut self, role: AgentRole, fallbacks: Vec<AgentRole>) -> Self {
        self.routes.insert(role, fallbacks);
        self
    }

    pub fn fallback_roles(&self, role: AgentRole) -> &[AgentRole] {
        self.routes.get(&role).map(Vec::as_slice).unwrap_or(&[])
    }
}

/// 宿主在处理第一回合前填充；编排器与恢复管理器只读
#[derive(Default)]
pub struct AgentRegistry {
    agents: HashMap<String, Arc<dyn Agent>>,
    by_role: HashMap<AgentRole, Vec<String>>,
    policy: FallbackPolicy,
}

impl AgentRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_policy(mut self, policy: FallbackPolicy) -> Self {
        self.policy = policy;
        self
    }

    /// 注册 Agent；同名覆盖旧实例
    pub fn register<A: Agent + 'static>(&mut self, agent: A) {
        self.register_arc(Arc::new(agent));
    }

    pub fn register_arc(&mut self, agent: Arc<dyn Agent>) {
        let name = agent.name().to_string();
        if let Some(old) = self.agents.insert(name.clone(), agent.clone()) {
            if let Some(names) = self.by_role.get_mut(&old.role()) {
                names.retain(|n| n != &name);
            }
        }
        self.by_role.entry(agent.role()).or_default().push(name);
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Agent>> {
        self.agents.get(name).cloned()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.agents.contains_key(name)
    }

    /// 某角色下的所有 Agent（按注册顺序）
    pub fn by_role(&self, role: AgentRole) -> Vec<Arc<dyn Agent>> {
        self.by_role
            .get(&role)
            .map(|names| names.iter().filter_map(|n| self.get(n)).collect())
            .unwrap_or_default()
    }

    /// 为失败的 Agent 找回退：按策略的角色顺序，取第一个不是它自己的 Agent
    pub fn find_fallback(&self, agent_name: &str, role: AgentRole) -> Option<Arc<dyn Agent>> {
        self.policy.fallback_roles(role).iter().find_map(|fallback_role| {
            self.by_role
                .get(fallback_role)?
                .iter()
                .find(|n| n.as_str() != agent_name)
                .and_then(|n| self.get(n))
        })
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.agents.keys().cloned().collect();
        names.sort();
        names
    }

    pub fn len(&self) -> usize {
        self.agents.len()
    }

    pub fn is_empty(&self) -> bool {
        self.agents.is_empty()
    }
}
