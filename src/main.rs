//! Claudmaster - AI 地下城主
//!
//! 入口：初始化日志与配置，检查崩溃标记并恢复会话，启动编排器与标准输入主循环。
//! `--benchmark` 只跑一轮回合延迟基准后退出。

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use claudmaster::config::{load_config, AppConfig};
use claudmaster::core::{
    load_module_sections, run_with_graceful_shutdown, spawn_session_loop, AutoSaveCleanup, Command,
    CrashMarkerCleanup, CrashRecoveryManager, JsonFileSessionSerializer, Orchestrator, OrchestratorBuilder,
    SessionSerializer, ShutdownCoordinator, ShutdownManager, TurnPhase,
};
use claudmaster::observability;
use claudmaster::performance::{Benchmark, PerformanceTargets};
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{info, warn};

/// 启动时预加载的模组 section（前缀 00-05）
const PRELOAD_PRIORITY: u8 = 250;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    observability::init();

    let mut benchmark = false;
    let mut config_path = None;
    for arg in std::env::args().skip(1) {
        match arg.as_str() {
            "--benchmark" => benchmark = true,
            other => config_path = Some(PathBuf::from(other)),
        }
    }

    let cfg = load_config(config_path).context("Failed to load config")?;
    std::fs::create_dir_all(&cfg.app.campaign_dir)
        .with_context(|| format!("Failed to create {}", cfg.app.campaign_dir.display()))?;

    let serializer: Arc<dyn SessionSerializer> = Arc::new(JsonFileSessionSerializer::new(&cfg.app.campaign_dir));
    let crash = Arc::new(CrashRecoveryManager::new(&cfg.app.campaign_dir, serializer.clone()));
    let shutdown = Arc::new(ShutdownManager::new());

    let mut builder = OrchestratorBuilder::new(cfg.clone())
        .with_serializer(serializer)
        .with_cancellation(shutdown.token());

    if let Some(session_id) = crash.check_for_crash() {
        let recovery = crash.recover_session(&session_id);
        println!("{}", recovery.result.message);
        if let Some(session) = recovery.session {
            builder = builder.with_session(session);
        }
    }

    let module_dir = cfg.app.campaign_dir.join("module");
    if module_dir.is_dir() {
        let content = Arc::new(load_module_sections(&module_dir)?);
        let loaded = content.preload_by_priority(PRELOAD_PRIORITY).await;
        info!(sections = content.section_names().len(), preloaded = loaded, "module content registered");
        builder = builder.with_module_content(content);
    }

    let orchestrator = Arc::new(builder.build());

    if benchmark {
        return run_benchmark(&cfg, &orchestrator).await;
    }

    let session_id = orchestrator.session().lock().session_id.clone();
    crash.write_recovery_marker(&session_id);
    info!(session_id = %session_id, campaign = %cfg.app.campaign_id, "session started");

    let mut coordinator = ShutdownCoordinator::new(shutdown.clone());
    coordinator.register(AutoSaveCleanup::new(orchestrator.autosave().clone()));
    coordinator.register(CrashMarkerCleanup::new(crash));

    let app = run_repl(orchestrator.clone(), shutdown.clone());
    run_with_graceful_shutdown(shutdown, app, || async move {
        for (name, outcome) in coordinator.run_cleanup().await {
            info!(task = name, ?outcome, "cleanup finished");
        }
    })
    .await;

    Ok(())
}

/// 从标准输入逐行读取玩家输入，打印叙述、降级提示与警告
async fn run_repl(orchestrator: Arc<Orchestrator>, shutdown: Arc<ShutdownManager>) {
    let (cmd_tx, mut state_rx, _handle) = spawn_session_loop(orchestrator);
    let mut lines = BufReader::new(tokio::io::stdin()).lines();

    println!("Welcome, adventurer. Type /help for commands.");
    loop {
        let line = match lines.next_line().await {
            Ok(Some(line)) => line,
            Ok(None) => break,
            Err(e) => {
                warn!(error = %e, "failed to read input");
                break;
            }
        };
        if line.trim().is_empty() {
            continue;
        }
        if cmd_tx.send(Command::Submit(line)).is_err() {
            break;
        }

        // 等到回合结束（状态离开 Processing / Saving）
        let state = loop {
            if state_rx.changed().await.is_err() {
                return;
            }
            let state = state_rx.borrow_and_update().clone();
            if !matches!(state.phase, TurnPhase::Processing | TurnPhase::Saving) {
                break state;
            }
        };

        if let Some(narrative) = &state.last_narrative {
            println!("\n{}\n", narrative);
        }
        if let Some(notice) = &state.degradation_notice {
            println!("[{}] {}", state.degradation_level.as_str(), notice);
        }
        for warning in &state.warnings {
            println!("! {}", warning);
        }
        if let Some(err) = &state.error_message {
            println!("Error: {}", err);
        }
        if state.phase == TurnPhase::Closed {
            break;
        }
    }
    shutdown.shutdown(claudmaster::core::ShutdownReason::UserInitiated);
}

async fn run_benchmark(cfg: &AppConfig, orchestrator: &Orchestrator) -> anyhow::Result<()> {
    let targets = PerformanceTargets::from_config(&cfg.performance);
    let result = Benchmark::new("turn", 10)
        .with_warmup(2)
        .run(&targets, move || orchestrator.process_turn("I look around the tavern"))
        .await;
    println!("{}", serde_json::to_string_pretty(&result)?);
    println!(
        "{}",
        serde_json::to_string_pretty(&orchestrator.profiler().get_report())?
    );
    if let Some((prompt, completion, total)) = orchestrator.token_usage() {
        println!("LLM tokens: {} (prompt {}, completion {})", total, prompt, completion);
    }
    Ok(())
}
