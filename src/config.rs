//! 应用配置：从 config/default.toml 与环境变量加载
//!
//! 加载顺序：先读 TOML 文件，再用环境变量 `CLAUDMASTER__*` 覆盖（双下划线表示嵌套，如 `CLAUDMASTER__RECOVERY__MAX_RETRIES=5`）。
//! 各组件只拿到自己那一段的不可变副本，测试可直接构造替代阈值。

use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

use serde::Deserialize;

/// 应用配置根（对应 config/default.toml 的顶层）
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct AppConfig {
    pub app: AppSection,
    pub llm: LlmSection,
    pub orchestrator: OrchestratorSection,
    pub recovery: RecoverySection,
    pub performance: PerformanceSection,
    pub autosave: AutoSaveSection,
}

/// [app] 段：战役目录与会话名
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AppSection {
    /// 战役数据目录（崩溃标记、会话 JSON 都放在这里）
    pub campaign_dir: PathBuf,
    pub campaign_id: String,
}

impl Default for AppSection {
    fn default() -> Self {
        Self {
            campaign_dir: PathBuf::from("campaigns/default"),
            campaign_id: "default".to_string(),
        }
    }
}

/// [llm] 段：后端选择
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LlmSection {
    /// openai / mock；openai 需要 OPENAI_API_KEY
    pub provider: String,
    pub model: String,
    pub base_url: Option<String>,
    pub max_tokens: u32,
}

impl Default for LlmSection {
    fn default() -> Self {
        Self {
            provider: "openai".to_string(),
            model: "gpt-4o-mini".to_string(),
            base_url: None,
            max_tokens: 1024,
        }
    }
}

/// [orchestrator] 段：单个 Agent 超时、并行分发与上下文预算
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct OrchestratorSection {
    pub agent_timeout_secs: u64,
    /// 同一回合内多个 Agent 是否并行执行
    pub parallel_agents: bool,
    pub max_concurrent_agents: usize,
    /// 拼装 prompt 上下文的字符预算
    pub context_budget_chars: usize,
    /// 连续多少个健康回合后尝试升级一级
    pub healthy_turns_before_upgrade: u32,
}

impl Default for OrchestratorSection {
    fn default() -> Self {
        Self {
            agent_timeout_secs: 30,
            parallel_agents: true,
            max_concurrent_agents: 3,
            context_budget_chars: 8000,
            healthy_turns_before_upgrade: 3,
        }
    }
}

impl OrchestratorSection {
    pub fn agent_timeout(&self) -> Duration {
        Duration::from_secs(self.agent_timeout_secs)
    }
}

/// [recovery] 段：重试次数、退避表、错误分类策略
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RecoverySection {
    pub max_retries: u32,
    /// 退避秒数表，超出表长后停留在最后一项
    pub backoff_secs: Vec<u64>,
    /// true 时只有已知瞬时错误才会重试，未知错误直接交给用户
    pub strict_classification: bool,
}

impl Default for RecoverySection {
    fn default() -> Self {
        Self {
            max_retries: 3,
            backoff_secs: vec![1, 2, 4],
            strict_classification: false,
        }
    }
}

impl RecoverySection {
    pub fn backoff_delays(&self) -> Vec<Duration> {
        self.backoff_secs.iter().map(|s| Duration::from_secs(*s)).collect()
    }
}

/// [performance] 段：缓存容量与 TTL、瓶颈阈值、各操作 p95 目标
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PerformanceSection {
    pub cache_max_size_mb: u64,
    pub cache_ttl_minutes: u64,
    pub bottleneck_threshold_secs: f64,
    /// 操作名 -> p95 目标（秒）
    pub targets: HashMap<String, f64>,
}

impl Default for PerformanceSection {
    fn default() -> Self {
        Self {
            cache_max_size_mb: 100,
            cache_ttl_minutes: 30,
            bottleneck_threshold_secs: 5.0,
            targets: HashMap::new(),
        }
    }
}

/// [autosave] 段
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AutoSaveSection {
    pub interval_minutes: u64,
    pub max_checkpoints: usize,
}

impl Default for AutoSaveSection {
    fn default() -> Self {
        Self {
            interval_minutes: 5,
            max_checkpoints: 10,
        }
    }
}

impl AutoSaveSection {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_minutes * 60)
    }
}

/// 从 config 目录加载配置，环境变量 CLAUDMASTER__* 可覆盖
///
/// 1. 按顺序查找 config/default.toml、../config/default.toml，找到则作为第一源
/// 2. 若传入 config_path 且文件存在，则追加该文件（可覆盖前面的键）
/// 3. 最后叠加环境变量 CLAUDMASTER__*（双下划线表示嵌套键）
pub fn load_config(config_path: Option<PathBuf>) -> Result<AppConfig, config::ConfigError> {
    let mut builder = config::Config::builder();

    for name in ["config/default", "../config/default"] {
        let path = format!("{}.toml", name);
        if std::path::Path::new(&path).exists() {
            builder = builder.add_source(config::File::with_name(name).required(false));
            break;
        }
    }

    if let Some(ref path) = config_path {
        if path.exists() {
            builder = builder.add_source(config::File::from(path.clone()).required(false));
        }
    }

    builder = builder.add_source(
        config::Environment::with_prefix("CLAUDMASTER")
            .separator("__")
            .try_parsing(true),
    );

    builder.build()?.try_deserialize()
}
