//! Claudmaster - AI 地下城主多智能体编排核心
//!
//! 模块划分：
//! - **agents**: Narrator / Archivist / Arbiter / ModuleKeeper / Consistency 与注册表
//! - **config**: 应用配置加载（TOML + 环境变量）
//! - **core**: 编排、意图分派、故障恢复、降级、会话存档与崩溃恢复
//! - **llm**: LLM 客户端抽象与实现（OpenAI 兼容 / Mock）
//! - **memory**: 会话对话记录
//! - **observability**: tracing 初始化
//! - **performance**: 性能分析、模组缓存、延迟加载、并行执行、上下文构建、基准测试

pub mod agents;
pub mod config;
pub mod core;
pub mod llm;
pub mod memory;
pub mod observability;
pub mod performance;

pub use crate::core::{Orchestrator, OrchestratorBuilder};
