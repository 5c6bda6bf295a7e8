//! 编排器构建：根据配置组装 LLM、Agent 注册表、恢复 / 降级 / 性能组件与会话
//!
//! 二进制入口与集成测试共用同一套初始化逻辑；测试通过 with_* 注入替身。

use std::path::Path;
use std::sync::Arc;

use parking_lot::Mutex;
use serde_json::json;
use tokio_util::sync::CancellationToken;

use crate::agents::{
    AgentRegistry, ArbiterAgent, ArchivistAgent, ConsistencyAgent, ModuleKeeperAgent, NarratorAgent,
};
use crate::config::AppConfig;
use crate::core::autosave::AutoSaveManager;
use crate::core::degradation::DegradationManager;
use crate::core::orchestrator::Orchestrator;
use crate::core::recovery::AgentRecoveryManager;
use crate::core::session::{GameSession, JsonFileSessionSerializer, SessionSerializer};
use crate::core::{DmError, DmResult};
use crate::llm::{LlmClient, MockLlmClient, OpenAiClient};
use crate::performance::{
    LazyLoadManager, Loader, ModuleCache, ParallelAgentExecutor, PerformanceProfiler, PerformanceTargets,
};

/// 根据配置与环境变量选择 LLM 后端（OpenAI 兼容 / Mock）
pub fn create_llm_from_config(cfg: &AppConfig) -> Arc<dyn LlmClient> {
    let provider = cfg.llm.provider.to_lowercase();
    let api_key = std::env::var("OPENAI_API_KEY").ok();

    match (provider.as_str(), api_key) {
        ("mock", _) => {
            tracing::info!("Using Mock LLM (configured)");
            Arc::new(MockLlmClient)
        }
        (_, Some(key)) => {
            tracing::info!("Using OpenAI-compatible LLM ({})", cfg.llm.model);
            Arc::new(OpenAiClient::new(cfg.llm.base_url.as_deref(), &cfg.llm.model, Some(&key)))
        }
        (_, None) => {
            tracing::warn!("OPENAI_API_KEY not set, using Mock LLM");
            Arc::new(MockLlmClient)
        }
    }
}

/// 五个内置 Agent 共用一个 LLM 客户端；max_tokens 是单次调用的上限
pub fn default_registry(llm: Arc<dyn LlmClient>, max_tokens: u32) -> AgentRegistry {
    let mut registry = AgentRegistry::new();
    registry.register(NarratorAgent::new(llm.clone()).with_token_ceiling(max_tokens));
    registry.register(ArchivistAgent::new(llm.clone()).with_token_ceiling(max_tokens));
    registry.register(ArbiterAgent::new(llm.clone()).with_token_ceiling(max_tokens));
    registry.register(ModuleKeeperAgent::new(llm.clone()).with_token_ceiling(max_tokens));
    registry.register(ConsistencyAgent::new(llm).with_token_ceiling(max_tokens));
    registry
}

/// 文件名前缀数字越小优先级越高（"01_intro.md" -> 254），无前缀为 0
fn section_priority(file_stem: &str) -> u8 {
    let digits: String = file_stem.chars().take_while(char::is_ascii_digit).collect();
    match digits.parse::<u8>() {
        Ok(n) if !digits.is_empty() => 255 - n,
        _ => 0,
    }
}

/// 把目录下每个 .md / .txt 文件注册为一个延迟加载的模组 section
pub fn load_module_sections(dir: &Path) -> DmResult<LazyLoadManager<String>> {
    let manager = LazyLoadManager::new();
    let entries = std::fs::read_dir(dir).map_err(|e| DmError::State {
        message: format!("cannot read module directory {}: {}", dir.display(), e),
        entity: Some(dir.display().to_string()),
    })?;

    for entry in entries.flatten() {
        let path = entry.path();
        let is_text = matches!(
            path.extension().and_then(|e| e.to_str()),
            Some("md") | Some("txt")
        );
        let Some(stem) = path.file_stem().and_then(|s| s.to_str()).map(String::from) else {
            continue;
        };
        if !is_text {
            continue;
        }
        let priority = section_priority(&stem);
        let file = path.clone();
        let name = stem.clone();
        manager.register(
            stem,
            Loader::sync(move || {
                std::fs::read_to_string(&file).map_err(|e| DmError::State {
                    message: format!("cannot read module section: {}", e),
                    entity: Some(name.clone()),
                })
            }),
            priority,
        );
    }
    Ok(manager)
}

pub struct OrchestratorBuilder {
    config: AppConfig,
    llm: Option<Arc<dyn LlmClient>>,
    registry: Option<AgentRegistry>,
    serializer: Option<Arc<dyn SessionSerializer>>,
    session: Option<GameSession>,
    module_content: Option<Arc<LazyLoadManager<String>>>,
    targets: Option<PerformanceTargets>,
    cancel: CancellationToken,
}

impl OrchestratorBuilder {
    pub fn new(config: AppConfig) -> Self {
        Self {
            config,
            llm: None,
            registry: None,
            serializer: None,
            session: None,
            module_content: None,
            targets: None,
            cancel: CancellationToken::new(),
        }
    }

    /// 未提供时由 create_llm_from_config 决定
    pub fn with_llm(mut self, llm: Arc<dyn LlmClient>) -> Self {
        self.llm = Some(llm);
        self
    }

    /// 自定义注册表；提供后忽略 with_llm
    pub fn with_registry(mut self, registry: AgentRegistry) -> Self {
        self.registry = Some(registry);
        self
    }

    pub fn with_serializer(mut self, serializer: Arc<dyn SessionSerializer>) -> Self {
        self.serializer = Some(serializer);
        self
    }

    /// 继续已有会话（如崩溃恢复得到的会话）
    pub fn with_session(mut self, session: GameSession) -> Self {
        self.session = Some(session);
        self
    }

    pub fn with_module_content(mut self, content: Arc<LazyLoadManager<String>>) -> Self {
        self.module_content = Some(content);
        self
    }

    pub fn with_targets(mut self, targets: PerformanceTargets) -> Self {
        self.targets = Some(targets);
        self
    }

    /// 关机时取消正在执行的 Agent
    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancel = token;
        self
    }

    pub fn serializer(&self) -> Arc<dyn SessionSerializer> {
        self.serializer
            .clone()
            .unwrap_or_else(|| Arc::new(JsonFileSessionSerializer::new(&self.config.app.campaign_dir)))
    }

    pub fn build(self) -> Orchestrator {
        let cfg = &self.config;
        let serializer = self.serializer();
        let (registry, llm) = match self.registry {
            Some(registry) => (registry, self.llm.clone()),
            None => {
                let llm = self.llm.clone().unwrap_or_else(|| create_llm_from_config(cfg));
                (default_registry(llm.clone(), cfg.llm.max_tokens), Some(llm))
            }
        };
        let registry = Arc::new(registry);

        let agent_timeout = cfg.orchestrator.agent_timeout();
        let recovery = AgentRecoveryManager::new(registry.clone(), &cfg.recovery).with_attempt_timeout(agent_timeout);
        let profiler = Arc::new(PerformanceProfiler::new(
            self.targets
                .unwrap_or_else(|| PerformanceTargets::from_config(&cfg.performance)),
        ));
        let cache = Arc::new(ModuleCache::new(
            cfg.performance.cache_max_size_mb,
            cfg.performance.cache_ttl_minutes,
        ));
        let executor = ParallelAgentExecutor::new(cfg.orchestrator.max_concurrent_agents, agent_timeout)
            .with_profiler(profiler.clone())
            .with_cancellation(self.cancel.clone());

        let mut session = self
            .session
            .unwrap_or_else(|| GameSession::new(cfg.app.campaign_id.clone()));
        session.config = json!({
            "model": cfg.llm.model,
            "agent_timeout_secs": cfg.orchestrator.agent_timeout_secs,
            "parallel_agents": cfg.orchestrator.parallel_agents,
            "max_retries": cfg.recovery.max_retries,
        });
        session.active_agents = registry.names();
        let session = Arc::new(Mutex::new(session));
        let autosave = Arc::new(AutoSaveManager::new(session.clone(), serializer, &cfg.autosave));

        Orchestrator::new(
            registry,
            recovery,
            Arc::new(DegradationManager::new()),
            profiler,
            cache,
            executor,
            session,
            autosave,
            self.module_content,
            cfg.orchestrator.clone(),
        )
        .with_llm(llm)
    }
}
