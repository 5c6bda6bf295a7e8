//! 编排器端到端测试：脚本化 LLM 驱动真实 Agent，覆盖正常回合、恢复、降级、系统命令与崩溃恢复

use std::sync::Arc;
use std::time::Duration;

use claudmaster::agents::{
    AgentRegistry, ArbiterAgent, ArchivistAgent, ConsistencyAgent, ModuleKeeperAgent, NarratorAgent,
};
use claudmaster::config::AppConfig;
use claudmaster::core::{
    spawn_session_loop, Command, CrashRecoveryManager, DegradationLevel, InMemorySessionSerializer,
    JsonFileSessionSerializer, Orchestrator, OrchestratorBuilder, PlayerIntent, RecoveryStrategy,
    SessionSerializer, TurnPhase,
};
use claudmaster::llm::{LlmClient, LlmError, ScriptedLlmClient};
use claudmaster::performance::{LazyLoadManager, Loader};
use tokio_util::sync::CancellationToken;

const NARRATION: &str = "You step into the ruins. Broken pillars lean against each other in the gloom.";

/// 除 Narrator 外的 Agent 都给固定回答
fn registry(narrator: Arc<ScriptedLlmClient>) -> AgentRegistry {
    let mut registry = AgentRegistry::new();
    registry.register(NarratorAgent::new(narrator));
    registry.register(ConsistencyAgent::new(Arc::new(ScriptedLlmClient::always("CONSISTENT"))));
    registry.register(ArchivistAgent::new(Arc::new(ScriptedLlmClient::always(
        r#"{"changes": ["The party entered the ruins"]}"#,
    ))));
    registry.register(ArbiterAgent::new(Arc::new(ScriptedLlmClient::always(
        "Roll a DC 12 Athletics check.",
    ))));
    registry.register(ModuleKeeperAgent::new(Arc::new(ScriptedLlmClient::always(
        "Phandalin was rebuilt on the ruins of an older town.",
    ))));
    registry
}

fn build(narrator: Arc<ScriptedLlmClient>) -> (Orchestrator, Arc<InMemorySessionSerializer>) {
    let serializer = Arc::new(InMemorySessionSerializer::new());
    let orchestrator = OrchestratorBuilder::new(AppConfig::default())
        .with_registry(registry(narrator))
        .with_serializer(serializer.clone())
        .build();
    (orchestrator, serializer)
}

#[tokio::test(start_paused = true)]
async fn test_normal_exploration_turn() {
    let narrator = Arc::new(ScriptedLlmClient::always(NARRATION));
    let (orchestrator, serializer) = build(narrator.clone());

    let response = orchestrator.process_turn("I enter the ruins").await.unwrap();

    assert_eq!(response.intent, PlayerIntent::Exploration);
    assert_eq!(response.narrative, NARRATION);
    assert_eq!(response.degradation_level, DegradationLevel::Full);
    assert!(response.degradation_notice.is_none());
    assert!(response.warnings.is_empty());
    assert!(response.recoveries.is_empty());
    assert_eq!(response.agent_responses.len(), 3);
    assert!(narrator.prompts()[0].contains("I enter the ruins"));

    let session = orchestrator.session().lock();
    assert_eq!(session.turn_count, 1);
    assert_eq!(session.history.messages().len(), 2);
    assert_eq!(session.facts(), vec!["The party entered the ruins"]);
    drop(session);

    // 第一回合一定触发自动存档
    assert_eq!(serializer.save_count(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_transient_failure_recovered_by_retry() {
    let narrator = Arc::new(ScriptedLlmClient::new(
        vec![Err(LlmError::Network("connection reset".into()))],
        Ok(NARRATION.to_string()),
    ));
    let (orchestrator, _) = build(narrator.clone());

    let response = orchestrator.process_turn("I enter the ruins").await.unwrap();

    assert_eq!(response.narrative, NARRATION);
    assert_eq!(response.recoveries.len(), 1);
    assert_eq!(response.recoveries[0].strategy, RecoveryStrategy::Retry);
    assert!(response.recoveries[0].success);
    assert_eq!(response.degradation_level, DegradationLevel::Full);
    assert_eq!(narrator.calls(), 2);
    assert_eq!(orchestrator.recovery().failure_count("narrator"), 0);
}

#[tokio::test(start_paused = true)]
async fn test_timeout_exhausts_recovery_and_degrades() {
    // 每次调用都超过 30 秒的 Agent 超时
    let narrator = Arc::new(ScriptedLlmClient::always(NARRATION).with_delay(Duration::from_secs(60)));
    let (orchestrator, _) = build(narrator.clone());

    let response = orchestrator.process_turn("I enter the ruins").await.unwrap();

    assert_eq!(response.degradation_level, DegradationLevel::Reduced);
    assert_eq!(orchestrator.degradation().current_level(), DegradationLevel::Reduced);
    let note = &response.recoveries[0];
    assert_eq!(note.agent, "narrator");
    assert_eq!(note.strategy, RecoveryStrategy::Degradation);
    assert!(!note.success);
    assert!(response
        .warnings
        .iter()
        .any(|w| w == "narrator is unavailable this turn"));
    // 首次执行 + 3 次重试
    assert_eq!(narrator.calls(), 4);
    // 30s 超时 x4 加上 1 + 2 + 4 秒退避
    assert!(response.elapsed >= Duration::from_secs(127));
    assert!(response.degradation_notice.is_some());
    assert_eq!(response.narrative, orchestrator.degradation().notify_user());
}

#[tokio::test(start_paused = true)]
async fn test_rejected_request_needs_user_intervention() {
    let narrator = Arc::new(ScriptedLlmClient::failing(LlmError::Rejected(
        "content policy".into(),
    )));
    let (orchestrator, _) = build(narrator.clone());

    let response = orchestrator.process_turn("I enter the ruins").await.unwrap();

    assert!(response.needs_user_intervention);
    assert_eq!(response.recoveries[0].strategy, RecoveryStrategy::UserIntervention);
    assert_eq!(response.degradation_level, DegradationLevel::Full);
    assert!(response.warnings.iter().any(|w| w.starts_with("narrator needs your decision")));
    // 不重试
    assert_eq!(narrator.calls(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_healthy_turns_restore_service_level() {
    let (orchestrator, _) = build(Arc::new(ScriptedLlmClient::always(NARRATION)));
    orchestrator
        .degradation()
        .degrade_to(DegradationLevel::Reduced, "narrator timeouts");

    for _ in 0..2 {
        let response = orchestrator.process_turn("I enter the ruins").await.unwrap();
        assert_eq!(response.degradation_level, DegradationLevel::Reduced);
        // REDUCED 只保留主 Agent
        assert_eq!(response.agent_responses.len(), 1);
    }
    let response = orchestrator.process_turn("I enter the ruins").await.unwrap();
    assert_eq!(response.degradation_level, DegradationLevel::Full);
    assert!(response.degradation_notice.is_none());
}

#[tokio::test(start_paused = true)]
async fn test_emergency_refuses_play_but_allows_save() {
    let narrator = Arc::new(ScriptedLlmClient::failing(LlmError::Network("connection refused".into())));
    let (orchestrator, serializer) = build(narrator.clone());
    orchestrator
        .degradation()
        .degrade_to(DegradationLevel::Emergency, "all agents down");

    let response = orchestrator.process_turn("I attack the goblin").await.unwrap();
    assert_eq!(response.intent, PlayerIntent::Combat);
    assert!(response.agent_responses.is_empty());
    assert!(response.recoveries.is_empty());
    assert_eq!(Some(response.narrative.clone()), response.degradation_notice);
    assert!(response.narrative.contains("(Technical note: all agents down)"));
    // 只有一次健康检查，不重试
    assert_eq!(narrator.calls(), 1);
    assert_eq!(orchestrator.degradation().current_level(), DegradationLevel::Emergency);
    assert_eq!(orchestrator.session().lock().turn_count, 0);

    let saved = orchestrator.process_turn("/save").await.unwrap();
    assert_eq!(saved.narrative, "Your progress has been saved.");
    assert_eq!(serializer.save_count(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_emergency_climbs_back_once_narrator_answers() {
    let narrator = Arc::new(ScriptedLlmClient::always(NARRATION));
    let (orchestrator, _) = build(narrator.clone());
    orchestrator
        .degradation()
        .degrade_to(DegradationLevel::Emergency, "all agents down");

    let response = orchestrator.process_turn("I look around").await.unwrap();
    assert_eq!(response.degradation_level, DegradationLevel::Minimal);
    assert_eq!(response.narrative, NARRATION);
    assert_eq!(orchestrator.session().lock().turn_count, 1);

    let mut levels = Vec::new();
    for _ in 0..5 {
        let response = orchestrator.process_turn("I look around").await.unwrap();
        levels.push(response.degradation_level);
    }
    assert_eq!(
        levels,
        vec![
            DegradationLevel::Minimal,
            DegradationLevel::Reduced,
            DegradationLevel::Reduced,
            DegradationLevel::Reduced,
            DegradationLevel::Full,
        ]
    );
}

#[tokio::test(start_paused = true)]
async fn test_new_facts_reach_later_prompts() {
    let narrator = Arc::new(ScriptedLlmClient::always(NARRATION));
    let archivist = Arc::new(ScriptedLlmClient::new(
        vec![
            Ok(r#"{"changes": ["fact one"]}"#.to_string()),
            Ok(r#"{"changes": ["fact two"]}"#.to_string()),
        ],
        Ok(r#"{"changes": []}"#.to_string()),
    ));
    let mut registry = registry(narrator.clone());
    registry.register(ArchivistAgent::new(archivist));
    let orchestrator = OrchestratorBuilder::new(AppConfig::default())
        .with_registry(registry)
        .with_serializer(Arc::new(InMemorySessionSerializer::new()))
        .build();

    for _ in 0..3 {
        orchestrator.process_turn("I enter the ruins").await.unwrap();
    }

    assert_eq!(orchestrator.session().lock().facts(), vec!["fact one", "fact two"]);
    let prompts = narrator.prompts();
    assert!(!prompts[0].contains("[facts]"));
    assert!(prompts[1].contains("[facts] fact one"));
    assert!(prompts[2].contains("[facts] fact one\nfact two"));
}

#[tokio::test(start_paused = true)]
async fn test_shutdown_cancellation_skips_recovery() {
    let token = CancellationToken::new();
    token.cancel();
    let narrator = Arc::new(ScriptedLlmClient::always(NARRATION));
    let orchestrator = OrchestratorBuilder::new(AppConfig::default())
        .with_registry(registry(narrator.clone()))
        .with_serializer(Arc::new(InMemorySessionSerializer::new()))
        .with_cancellation(token)
        .build();

    let response = orchestrator.process_turn("I enter the ruins").await.unwrap();
    assert!(response.recoveries.is_empty());
    assert!(response.agent_responses.is_empty());
    assert_eq!(response.degradation_level, DegradationLevel::Full);
    assert_eq!(narrator.calls(), 0);
    assert_eq!(orchestrator.recovery().failure_count("narrator"), 0);
}

#[tokio::test]
async fn test_status_reports_token_usage() {
    let llm = Arc::new(ScriptedLlmClient::always(NARRATION));
    let orchestrator = OrchestratorBuilder::new(AppConfig::default())
        .with_llm(llm.clone())
        .with_serializer(Arc::new(InMemorySessionSerializer::new()))
        .build();
    orchestrator.process_turn("I enter the ruins").await.unwrap();

    let (prompt, completion, total) = llm.token_usage();
    assert!(total > 0);
    let status = orchestrator.process_turn("/status").await.unwrap();
    assert!(status.narrative.contains(&format!(
        "LLM tokens {} (prompt {}, completion {})",
        total, prompt, completion
    )));
}

#[tokio::test(start_paused = true)]
async fn test_downgraded_intent_handled_as_basic_action() {
    let narrator = Arc::new(ScriptedLlmClient::always(NARRATION));
    let (orchestrator, _) = build(narrator.clone());
    orchestrator
        .degradation()
        .degrade_to(DegradationLevel::Reduced, "module keeper offline");

    let response = orchestrator
        .process_turn("Tell me about the history of Phandalin")
        .await
        .unwrap();
    assert_eq!(response.intent, PlayerIntent::Lore);
    assert_eq!(response.narrative, NARRATION);
    assert_eq!(response.agent_responses[0].agent_name, "narrator");
    assert!(response.warnings[0].contains("lore is unavailable"));
}

#[tokio::test]
async fn test_system_commands_skip_agents() {
    let narrator = Arc::new(ScriptedLlmClient::always(NARRATION));
    let (orchestrator, serializer) = build(narrator.clone());

    let status = orchestrator.process_turn("/status").await.unwrap();
    assert!(status.narrative.contains("turn 0"));
    assert!(status.narrative.contains("service level FULL"));

    let help = orchestrator.process_turn("/help").await.unwrap();
    assert!(help.narrative.contains("/save"));

    orchestrator.process_turn("/save").await.unwrap();
    assert_eq!(serializer.save_count(), 1);

    assert!(orchestrator.process_turn("   ").await.is_err());
    assert_eq!(narrator.calls(), 0);
}

#[tokio::test]
async fn test_lore_question_loads_module_content() {
    let content = Arc::new(LazyLoadManager::new());
    content.register(
        "01_phandalin",
        Loader::sync(|| Ok("Phandalin is a frontier town built over older ruins.".to_string())),
        254,
    );
    let keeper = Arc::new(ScriptedLlmClient::always("The old town burned a century ago."));
    let mut registry = registry(Arc::new(ScriptedLlmClient::always(NARRATION)));
    registry.register(ModuleKeeperAgent::new(keeper.clone()));

    let orchestrator = OrchestratorBuilder::new(AppConfig::default())
        .with_registry(registry)
        .with_serializer(Arc::new(InMemorySessionSerializer::new()))
        .with_module_content(content.clone())
        .build();

    assert!(!content.is_loaded("01_phandalin"));
    let response = orchestrator
        .process_turn("Tell me about the history of Phandalin")
        .await
        .unwrap();

    assert_eq!(response.intent, PlayerIntent::Lore);
    assert!(response.narrative.starts_with("The old town burned a century ago."));
    assert!(content.is_loaded("01_phandalin"));
    assert!(keeper.prompts()[0].contains("frontier town"));
    assert!(response.context_tokens > 0);
}

#[tokio::test]
async fn test_session_loop_pushes_turn_state() {
    let (orchestrator, _) = build(Arc::new(ScriptedLlmClient::always(NARRATION)));
    let (cmd_tx, mut state_rx, handle) = spawn_session_loop(Arc::new(orchestrator));

    cmd_tx.send(Command::Submit("I enter the ruins".into())).unwrap();
    let state = loop {
        state_rx.changed().await.unwrap();
        let state = state_rx.borrow_and_update().clone();
        if state.phase == TurnPhase::Idle {
            break state;
        }
    };
    assert_eq!(state.turn, 1);
    assert_eq!(state.last_narrative.as_deref(), Some(NARRATION));
    assert!(!state.input_locked);

    cmd_tx.send(Command::Quit).unwrap();
    handle.await.unwrap();
    assert_eq!(state_rx.borrow().phase, TurnPhase::Closed);
}

#[tokio::test]
async fn test_crash_marker_resumes_saved_session() {
    let dir = tempfile::tempdir().unwrap();
    let serializer: Arc<dyn SessionSerializer> = Arc::new(JsonFileSessionSerializer::new(dir.path()));

    let session_id = {
        let orchestrator = OrchestratorBuilder::new(AppConfig::default())
            .with_registry(registry(Arc::new(ScriptedLlmClient::always(NARRATION))))
            .with_serializer(serializer.clone())
            .build();
        let crash = CrashRecoveryManager::new(dir.path(), serializer.clone());
        let id = orchestrator.session().lock().session_id.clone();
        crash.write_recovery_marker(&id);
        orchestrator.process_turn("I enter the ruins").await.unwrap();
        // 进程在这里"崩溃"：标记没有被清理
        id
    };

    let crash = CrashRecoveryManager::new(dir.path(), serializer.clone());
    assert_eq!(crash.check_for_crash().as_deref(), Some(session_id.as_str()));

    let recovery = crash.recover_session(&session_id);
    assert!(recovery.result.success);
    assert_eq!(recovery.result.strategy_used, RecoveryStrategy::CrashRecovery);
    assert_eq!(crash.check_for_crash(), None);

    let session = recovery.session.unwrap();
    assert_eq!(session.turn_count, 1);
    assert_eq!(session.facts(), vec!["The party entered the ruins"]);

    let resumed = OrchestratorBuilder::new(AppConfig::default())
        .with_registry(registry(Arc::new(ScriptedLlmClient::always(NARRATION))))
        .with_serializer(serializer)
        .with_session(session)
        .build();
    resumed.process_turn("I search the rubble").await.unwrap();
    let session = resumed.session().lock();
    assert_eq!(session.session_id, session_id);
    assert_eq!(session.turn_count, 2);
}
