//! 编排器：一回合 = 识别意图 -> 拼装上下文 -> 分批调用 Agent -> 失败恢复 -> 合并叙述 -> 更新会话
//!
//! 宿主可以直接调用 process_turn，也可以用 spawn_session_loop 建立 cmd/state 两条通道，
//! 在后台任务中消费命令（Submit / Save / Checkpoint / Quit）并推送 TurnState。

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use serde_json::Value;
use tokio::sync::{mpsc, watch};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::agents::{
    Agent, AgentRegistry, AgentRequest, AgentResponse, ARBITER, ARCHIVIST, CONSISTENCY, NARRATOR,
};
use crate::config::OrchestratorSection;
use crate::core::autosave::AutoSaveManager;
use crate::core::degradation::{DegradationLevel, DegradationManager};
use crate::core::intent::{classify_intent, AgentPlan, PlayerIntent, SystemCommand};
use crate::core::recovery::{AgentRecoveryManager, RecoveryStrategy};
use crate::core::session::SharedSession;
use crate::core::state::{TurnPhase, TurnState};
use crate::core::{DmError, DmResult};
use crate::llm::LlmClient;
use crate::memory::Message;
use crate::performance::{
    AgentRun, LazyLoadManager, ModuleCache, OptimizedContextBuilder, ParallelAgentExecutor,
    PerformanceProfiler,
};

/// prompt 中带入的最近消息条数
const HISTORY_EXCERPT: usize = 6;
/// 既成事实在上下文中的 source 名
const FACTS_SOURCE: &str = "facts";

/// 一次恢复的记录，随回合响应返回
#[derive(Debug, Clone, Serialize)]
pub struct RecoveryNote {
    pub agent: String,
    pub strategy: RecoveryStrategy,
    pub success: bool,
    pub message: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct OrchestratorResponse {
    pub narrative: String,
    pub agent_responses: Vec<AgentResponse>,
    pub intent: PlayerIntent,
    pub degradation_level: DegradationLevel,
    pub degradation_notice: Option<String>,
    pub warnings: Vec<String>,
    pub recoveries: Vec<RecoveryNote>,
    /// 有 Agent 需要玩家 / 主持人决定
    pub needs_user_intervention: bool,
    pub context_tokens: usize,
    pub elapsed: Duration,
}

/// 宿主发往编排器的命令
#[derive(Debug, Clone)]
pub enum Command {
    Submit(String),
    /// 立即存档
    Save,
    Checkpoint(String),
    Quit,
}

pub struct Orchestrator {
    registry: Arc<AgentRegistry>,
    recovery: AgentRecoveryManager,
    degradation: Arc<DegradationManager>,
    profiler: Arc<PerformanceProfiler>,
    cache: Arc<ModuleCache<String>>,
    context_builder: OptimizedContextBuilder,
    executor: ParallelAgentExecutor,
    session: SharedSession,
    autosave: Arc<AutoSaveManager>,
    module_content: Option<Arc<LazyLoadManager<String>>>,
    config: OrchestratorSection,
    healthy_turns: AtomicU32,
    /// 仅用于读取 token 用量
    llm: Option<Arc<dyn LlmClient>>,
}

/// 一批 Agent 执行加恢复之后的结果
#[derive(Default)]
struct BatchOutcome {
    responses: Vec<AgentResponse>,
    failures: usize,
}

impl Orchestrator {
    /// 由 OrchestratorBuilder 调用
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        registry: Arc<AgentRegistry>,
        recovery: AgentRecoveryManager,
        degradation: Arc<DegradationManager>,
        profiler: Arc<PerformanceProfiler>,
        cache: Arc<ModuleCache<String>>,
        executor: ParallelAgentExecutor,
        session: SharedSession,
        autosave: Arc<AutoSaveManager>,
        module_content: Option<Arc<LazyLoadManager<String>>>,
        config: OrchestratorSection,
    ) -> Self {
        let context_builder = OptimizedContextBuilder::new(Some(cache.clone()), config.context_budget_chars);
        Self {
            registry,
            recovery,
            degradation,
            profiler,
            cache,
            context_builder,
            executor,
            session,
            autosave,
            module_content,
            config,
            healthy_turns: AtomicU32::new(0),
            llm: None,
        }
    }

    pub(crate) fn with_llm(mut self, llm: Option<Arc<dyn LlmClient>>) -> Self {
        self.llm = llm;
        self
    }

    /// 共享 LLM 客户端的累计用量 (prompt, completion, total)；自定义注册表时为 None
    pub fn token_usage(&self) -> Option<(u64, u64, u64)> {
        self.llm.as_ref().map(|llm| llm.token_usage())
    }

    pub fn registry(&self) -> &Arc<AgentRegistry> {
        &self.registry
    }

    pub fn recovery(&self) -> &AgentRecoveryManager {
        &self.recovery
    }

    pub fn degradation(&self) -> &Arc<DegradationManager> {
        &self.degradation
    }

    pub fn profiler(&self) -> &Arc<PerformanceProfiler> {
        &self.profiler
    }

    pub fn cache(&self) -> &Arc<ModuleCache<String>> {
        &self.cache
    }

    pub fn session(&self) -> &SharedSession {
        &self.session
    }

    pub fn autosave(&self) -> &Arc<AutoSaveManager> {
        &self.autosave
    }

    pub async fn process_turn(&self, input: &str) -> DmResult<OrchestratorResponse> {
        let start = Instant::now();
        let _trace = self.profiler.trace("orchestrator.turn");
        let input = input.trim();
        if input.is_empty() {
            return Err(DmError::State {
                message: "player input is empty".to_string(),
                entity: None,
            });
        }

        let intent = classify_intent(input);
        if let PlayerIntent::System(command) = intent {
            return Ok(self.system_response(command, start));
        }

        let mut level = self.degradation.current_level();
        if level == DegradationLevel::Emergency && self.check_narrator_health(input).await {
            level = self.degradation.current_level();
        }
        let Some(plan) = AgentPlan::for_level(intent, level) else {
            info!(intent = intent.as_str(), %level, "action refused at current service level");
            let notice = self.degradation.notify_user();
            return Ok(self.bare_response(intent, notice.clone(), Some(notice), start));
        };
        debug!(intent = intent.as_str(), agents = ?plan.agents().collect::<Vec<_>>(), "dispatching turn");

        let base = self.base_request(input, intent).await;
        let context_tokens = base
            .context
            .get("context")
            .and_then(Value::as_str)
            .map_or(0, |c| c.chars().count() / 4);

        let mut warnings = Vec::new();
        let mut recoveries = Vec::new();
        let mut degraded_this_turn = false;
        let mut total_failures = 0;
        if plan.downgraded {
            warnings.push(format!(
                "{} is unavailable right now; handled as a simple action",
                intent.as_str()
            ));
        }

        let primary = self
            .run_batch(&plan.primary, &base, &mut warnings, &mut recoveries, &mut degraded_this_turn)
            .await;
        total_failures += primary.failures;

        let narrative_so_far = primary
            .responses
            .iter()
            .map(|r| r.action_result.as_str())
            .collect::<Vec<_>>()
            .join("\n\n");
        let mut support_request = base.clone();
        if !narrative_so_far.is_empty() {
            support_request
                .context
                .insert("narrative".into(), Value::from(narrative_so_far));
        }
        let supporting = self
            .run_batch(
                &plan.supporting,
                &support_request,
                &mut warnings,
                &mut recoveries,
                &mut degraded_this_turn,
            )
            .await;
        total_failures += supporting.failures;

        self.track_health(total_failures);

        let needs_user_intervention = recoveries
            .iter()
            .any(|r| r.strategy == RecoveryStrategy::UserIntervention);
        let narrative = self.merge_narrative(intent, &primary.responses, &supporting.responses, &mut warnings);

        let mut agent_responses = primary.responses;
        agent_responses.extend(supporting.responses);
        self.update_session(input, intent, &narrative, &agent_responses);
        self.autosave.trigger_autosave();

        let notice = self.degradation.notify_user();
        Ok(OrchestratorResponse {
            narrative,
            agent_responses,
            intent,
            degradation_level: self.degradation.current_level(),
            degradation_notice: (!notice.is_empty()).then_some(notice),
            warnings,
            recoveries,
            needs_user_intervention,
            context_tokens,
            elapsed: start.elapsed(),
        })
    }

    /// 所有 Agent 共用的请求：动作、历史、既成事实、按相关度拼装的上下文
    async fn base_request(&self, input: &str, intent: PlayerIntent) -> AgentRequest {
        let (history, facts, location, turn, session_id) = {
            let session = self.session.lock();
            (
                session.history.excerpt(HISTORY_EXCERPT),
                session.facts(),
                session
                    .metadata
                    .get("location")
                    .and_then(Value::as_str)
                    .unwrap_or("")
                    .to_string(),
                session.turn_count,
                session.session_id.clone(),
            )
        };

        let mut request = AgentRequest::new()
            .with_context("action", input)
            .with_context("intent", intent.as_str())
            .with_metadata("turn", turn + 1)
            .with_metadata("session_id", session_id);
        if !location.is_empty() {
            request = request.with_context("location", location);
        }

        let mut sources: Vec<(String, String)> = Vec::new();
        if let Some(content) = &self.module_content {
            // 设定问题才触发加载，其它回合只用已加载的内容
            let names = if intent == PlayerIntent::Lore {
                content.section_names()
            } else {
                content.loaded_names()
            };
            for name in names {
                match content.get(&name).await {
                    Ok(text) => sources.push((name, text)),
                    Err(e) => warn!(section = %name, error = %e, "module section unavailable"),
                }
            }
        }
        if !facts.is_empty() {
            sources.push((FACTS_SOURCE.to_string(), facts.join("\n")));
        }
        if !sources.is_empty() {
            let _t = self.profiler.trace("context.build");
            let refs: Vec<(&str, &str)> = sources.iter().map(|(n, c)| (n.as_str(), c.as_str())).collect();
            let built = self.context_builder.build_context(&request, &refs, None);
            debug!(sources = ?built.sources_used, tokens = built.token_estimate, "context built");
            request = request.with_context("context", built.context);
        }

        request
            .with_context("history", history)
            .with_context("established_facts", facts)
    }

    /// 执行一批 Agent；失败的逐个交给恢复管理器（顺序执行，不并发恢复）
    async fn run_batch(
        &self,
        names: &[&'static str],
        request: &AgentRequest,
        warnings: &mut Vec<String>,
        recoveries: &mut Vec<RecoveryNote>,
        degraded_this_turn: &mut bool,
    ) -> BatchOutcome {
        let mut outcome = BatchOutcome::default();
        let agents: Vec<Arc<dyn Agent>> = names
            .iter()
            .filter_map(|name| {
                let agent = self.registry.get(name);
                if agent.is_none() {
                    warn!(agent = name, "agent not registered, skipping");
                }
                agent
            })
            .collect();
        if agents.is_empty() {
            return outcome;
        }

        let runs: Vec<AgentRun> = if self.config.parallel_agents {
            let jobs = agents.iter().map(|a| (a.clone(), request.clone())).collect();
            self.executor.execute_all(jobs).await.runs
        } else {
            let mut runs = Vec::with_capacity(agents.len());
            for agent in &agents {
                let report = self.executor.execute_all(vec![(agent.clone(), request.clone())]).await;
                runs.extend(report.runs);
            }
            runs
        };

        for (agent, run) in agents.iter().zip(runs) {
            if run.is_cancelled() {
                debug!(agent = %run.agent_name, "agent cancelled by shutdown, skipping recovery");
                continue;
            }
            let Some(error) = run.error() else {
                self.recovery.reset_failure_count(agent.name());
                if let Some(response) = run.response() {
                    outcome.responses.push(response.clone());
                }
                continue;
            };

            outcome.failures += 1;
            let result = self
                .recovery
                .handle_agent_failure(agent, &error, &run.request)
                .await;
            recoveries.push(RecoveryNote {
                agent: run.agent_name.clone(),
                strategy: result.strategy_used,
                success: result.success,
                message: result.message.clone(),
            });

            match result.strategy_used {
                RecoveryStrategy::Retry | RecoveryStrategy::Fallback if result.success => {
                    if let Some(response) = result.response {
                        outcome.responses.push(response);
                    }
                }
                RecoveryStrategy::UserIntervention => {
                    warnings.push(format!("{} needs your decision: {}", run.agent_name, error));
                }
                _ => {
                    warnings.push(format!("{} is unavailable this turn", run.agent_name));
                    if !*degraded_this_turn {
                        *degraded_this_turn = self.degradation.degrade_one_step(result.message).is_some();
                    }
                }
            }
        }
        outcome
    }

    /// EMERGENCY 下不会有 Agent 回合，只能靠这里恢复：
    /// 用本回合动作单独试一次 Narrator（不走恢复流程），成功则升一级
    async fn check_narrator_health(&self, input: &str) -> bool {
        let Some(narrator) = self.registry.get(NARRATOR) else {
            return false;
        };
        let request = AgentRequest::new().with_context("action", input);
        let report = self.executor.execute_all(vec![(narrator, request)]).await;
        if report.succeeded().is_empty() {
            debug!("narrator health check failed, staying in emergency mode");
            return false;
        }
        self.healthy_turns.store(0, Ordering::Relaxed);
        match self.degradation.upgrade_one_step() {
            Some(level) => {
                info!(%level, "narrator answered a health check, leaving emergency mode");
                true
            }
            None => false,
        }
    }

    /// 连续 N 个无故障回合后升一级
    fn track_health(&self, failures: usize) {
        if failures > 0 {
            self.healthy_turns.store(0, Ordering::Relaxed);
            return;
        }
        let healthy = self.healthy_turns.fetch_add(1, Ordering::Relaxed) + 1;
        let needed = self.config.healthy_turns_before_upgrade.max(1);
        if healthy >= needed && self.degradation.current_level() != DegradationLevel::Full {
            if let Some(level) = self.degradation.upgrade_one_step() {
                info!(%level, healthy_turns = healthy, "service recovered one level");
            }
            self.healthy_turns.store(0, Ordering::Relaxed);
        }
    }

    fn merge_narrative(
        &self,
        intent: PlayerIntent,
        primary: &[AgentResponse],
        supporting: &[AgentResponse],
        warnings: &mut Vec<String>,
    ) -> String {
        let mut parts: Vec<String> = primary
            .iter()
            .map(|r| r.action_result.trim().to_string())
            .filter(|t| !t.is_empty())
            .collect();

        for response in supporting {
            match response.agent_name.as_str() {
                CONSISTENCY => {
                    if let Some(detail) = response.observations.get("contradiction").and_then(Value::as_str) {
                        warnings.push(format!("Continuity: {}", detail));
                    }
                }
                ARBITER if intent != PlayerIntent::Rules => {
                    let ruling = response.action_result.trim();
                    if !ruling.is_empty() {
                        parts.push(format!("Ruling: {}", ruling));
                    }
                }
                _ => {}
            }
        }

        if parts.is_empty() {
            let notice = self.degradation.notify_user();
            if notice.is_empty() {
                "The Dungeon Master pauses, gathering their thoughts. Try that again in a moment."
                    .to_string()
            } else {
                notice
            }
        } else {
            parts.join("\n\n")
        }
    }

    fn update_session(&self, input: &str, intent: PlayerIntent, narrative: &str, responses: &[AgentResponse]) {
        let combat_started = {
            let mut session = self.session.lock();
            session.turn_count += 1;
            session.history.push(Message::player(input));
            session.history.push(Message::dungeon_master(narrative));

            session.active_agents = responses.iter().map(|r| r.agent_name.clone()).collect();
            let known_facts = session.facts().len();
            for response in responses.iter().filter(|r| r.agent_name == ARCHIVIST) {
                for fact in extract_changes(&response.action_result) {
                    session.add_fact(fact);
                }
            }
            if session.facts().len() != known_facts {
                // 缓存里的 facts 已过时
                self.context_builder.invalidate_source(FACTS_SOURCE);
            }

            let previous = session
                .metadata
                .insert("last_intent".into(), Value::from(intent.as_str()));
            intent == PlayerIntent::Combat
                && previous.as_ref().and_then(Value::as_str) != Some(PlayerIntent::Combat.as_str())
        };
        if combat_started {
            let turn = self.session.lock().turn_count;
            self.autosave.mark_checkpoint(format!("Combat started at turn {}", turn));
        }
    }

    fn system_response(&self, command: SystemCommand, start: Instant) -> OrchestratorResponse {
        let intent = PlayerIntent::System(command);
        let text = match command {
            SystemCommand::Save => match self.autosave.save_now("Saved by player") {
                Ok(()) => "Your progress has been saved.".to_string(),
                Err(e) => format!("The chronicle could not be written: {}", e),
            },
            SystemCommand::Status => {
                let (turn, session_id) = {
                    let s = self.session.lock();
                    (s.turn_count, s.session_id.clone())
                };
                let level = self.degradation.current_level();
                let cache = self.cache.get_stats();
                let mut status = format!(
                    "Session {} | turn {} | service level {} | available: {} | cache hit rate {:.0}%",
                    session_id,
                    turn,
                    level,
                    level.available_actions().join(", "),
                    cache.hit_rate * 100.0
                );
                if let Some((prompt, completion, total)) = self.token_usage() {
                    status.push_str(&format!(
                        " | LLM tokens {} (prompt {}, completion {})",
                        total, prompt, completion
                    ));
                }
                status
            }
            SystemCommand::Help => {
                "Describe what your character does. Commands: /save, /status, /help, /quit.".to_string()
            }
            SystemCommand::Quit => "The session draws to a close. Until next time, adventurer.".to_string(),
        };
        self.bare_response(intent, text, None, start)
    }

    fn bare_response(
        &self,
        intent: PlayerIntent,
        narrative: String,
        notice: Option<String>,
        start: Instant,
    ) -> OrchestratorResponse {
        OrchestratorResponse {
            narrative,
            agent_responses: Vec::new(),
            intent,
            degradation_level: self.degradation.current_level(),
            degradation_notice: notice.filter(|n| !n.is_empty()),
            warnings: Vec::new(),
            recoveries: Vec::new(),
            needs_user_intervention: false,
            context_tokens: 0,
            elapsed: start.elapsed(),
        }
    }
}

/// Archivist 输出中的变化条目：{"changes": [..]} 或 JSON 数组中的字符串
fn extract_changes(result: &str) -> Vec<String> {
    let items = match serde_json::from_str::<Value>(result.trim()) {
        Ok(Value::Array(items)) => items,
        Ok(Value::Object(mut map)) => match map.remove("changes") {
            Some(Value::Array(items)) => items,
            _ => Vec::new(),
        },
        _ => Vec::new(),
    };
    items
        .into_iter()
        .filter_map(|v| v.as_str().map(str::to_string))
        .collect()
}

/// 在后台任务中运行会话：消费命令、推送状态
pub fn spawn_session_loop(
    orchestrator: Arc<Orchestrator>,
) -> (mpsc::UnboundedSender<Command>, watch::Receiver<TurnState>, tokio::task::JoinHandle<()>) {
    let (cmd_tx, mut cmd_rx) = mpsc::unbounded_channel::<Command>();
    let (state_tx, state_rx) = watch::channel(TurnState::default());

    let handle = tokio::spawn(async move {
        while let Some(cmd) = cmd_rx.recv().await {
            let current = state_tx.borrow().clone();
            match cmd {
                Command::Submit(input) => {
                    let _ = state_tx.send(current.busy(TurnPhase::Processing));
                    match orchestrator.process_turn(&input).await {
                        Ok(response) => {
                            let quit = response.intent == PlayerIntent::System(SystemCommand::Quit);
                            let _ = state_tx.send(TurnState {
                                phase: if quit { TurnPhase::Closed } else { TurnPhase::Idle },
                                turn: orchestrator.session.lock().turn_count,
                                degradation_level: response.degradation_level,
                                last_narrative: Some(response.narrative),
                                degradation_notice: response.degradation_notice,
                                warnings: response.warnings,
                                input_locked: false,
                                error_message: None,
                            });
                            if quit {
                                break;
                            }
                        }
                        Err(e) => {
                            let _ = state_tx.send(current.failed(e.to_string()));
                        }
                    }
                }
                Command::Save => {
                    let _ = state_tx.send(current.busy(TurnPhase::Saving));
                    let next = match orchestrator.autosave.save_now("Saved by host") {
                        Ok(()) => TurnState {
                            phase: TurnPhase::Idle,
                            input_locked: false,
                            ..current
                        },
                        Err(e) => current.failed(e.to_string()),
                    };
                    let _ = state_tx.send(next);
                }
                Command::Checkpoint(description) => {
                    orchestrator.autosave.mark_checkpoint(description);
                }
                Command::Quit => break,
            }
        }
        let closed = TurnState {
            phase: TurnPhase::Closed,
            input_locked: true,
            ..state_tx.borrow().clone()
        };
        let _ = state_tx.send(closed);
    });

    (cmd_tx, state_rx, handle)
}
