//! 性能层：剖析器、缓存、延迟加载、并行执行、上下文拼装、基准测试

pub mod benchmark;
pub mod cache;
pub mod context;
pub mod lazy;
pub mod parallel;
pub mod profiler;

pub use benchmark::{Benchmark, BenchmarkResult};
pub use cache::{CacheStats, ModuleCache};
pub use context::{BuiltContext, OptimizedContextBuilder};
pub use lazy::{LazyLoadManager, LazyLoadStats, Loader};
pub use parallel::{AgentOutcome, AgentRun, BatchReport, ParallelAgentExecutor};
pub use profiler::{OperationMetrics, PerformanceProfiler, PerformanceReport, PerformanceTargets};
