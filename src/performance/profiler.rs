//! 性能剖析器：按操作名记录耗时，计算最近秩百分位与瓶颈
//!
//! trace() 返回作用域计时器，离开作用域（包括 `?` 提前返回或 panic 展开）时记录耗时。
//! 阈值来自注入的 PerformanceTargets，不使用全局常量。
//! 每个操作只保留最近 sample_limit 个样本，长会话中内存不随回合数增长。

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde::Serialize;
use tokio::time::Instant;

use crate::config::PerformanceSection;

/// 每个操作默认保留的样本数
pub const DEFAULT_SAMPLE_LIMIT: usize = 1000;

/// 各操作的 p95 目标与默认瓶颈阈值（构造时注入，测试可直接替换）
#[derive(Debug, Clone)]
pub struct PerformanceTargets {
    pub default_threshold: Duration,
    pub targets: HashMap<String, Duration>,
}

impl Default for PerformanceTargets {
    fn default() -> Self {
        Self {
            default_threshold: Duration::from_secs(5),
            targets: HashMap::new(),
        }
    }
}

impl PerformanceTargets {
    pub fn from_config(cfg: &PerformanceSection) -> Self {
        Self {
            default_threshold: Duration::from_secs_f64(cfg.bottleneck_threshold_secs.max(0.0)),
            targets: cfg
                .targets
                .iter()
                .map(|(k, v)| (k.clone(), Duration::from_secs_f64(v.max(0.0))))
                .collect(),
        }
    }

    pub fn with_target(mut self, operation: impl Into<String>, target: Duration) -> Self {
        self.targets.insert(operation.into(), target);
        self
    }

    pub fn threshold_for(&self, operation: &str) -> Duration {
        self.targets
            .get(operation)
            .copied()
            .unwrap_or(self.default_threshold)
    }
}

/// 最近秩百分位：取第 ceil(p/100 * n) 小的样本（1 起），越界时夹到有效范围；空序列返回 0
pub fn nearest_rank(sorted: &[f64], p: f64) -> f64 {
    if sorted.is_empty() {
        return 0.0;
    }
    let rank = (p / 100.0 * sorted.len() as f64).ceil() as i64 - 1;
    let idx = rank.clamp(0, sorted.len() as i64 - 1) as usize;
    sorted[idx]
}

/// 一组耗时（秒）的统计摘要；按需从原始样本重算
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct OperationMetrics {
    pub operation: String,
    pub count: usize,
    pub total: f64,
    pub min: f64,
    pub max: f64,
    pub avg: f64,
    pub p50: f64,
    pub p95: f64,
    pub p99: f64,
}

impl OperationMetrics {
    pub fn from_samples(operation: impl Into<String>, samples: &[f64]) -> Option<Self> {
        if samples.is_empty() {
            return None;
        }
        let mut sorted = samples.to_vec();
        sorted.sort_by(|a, b| a.total_cmp(b));
        let total: f64 = sorted.iter().sum();
        Some(Self {
            operation: operation.into(),
            count: sorted.len(),
            total,
            min: sorted[0],
            max: sorted[sorted.len() - 1],
            avg: total / sorted.len() as f64,
            p50: nearest_rank(&sorted, 50.0),
            p95: nearest_rank(&sorted, 95.0),
            p99: nearest_rank(&sorted, 99.0),
        })
    }
}

/// p95 超过阈值的操作
#[derive(Debug, Clone, Serialize)]
pub struct Bottleneck {
    pub operation: String,
    pub p95: f64,
    pub threshold: f64,
}

#[derive(Debug, Clone, Serialize)]
pub struct PerformanceReport {
    pub operations: BTreeMap<String, OperationMetrics>,
    pub bottlenecks: Vec<Bottleneck>,
}

#[derive(Debug)]
pub struct PerformanceProfiler {
    samples: Mutex<HashMap<String, VecDeque<f64>>>,
    targets: PerformanceTargets,
    sample_limit: usize,
}

impl Default for PerformanceProfiler {
    fn default() -> Self {
        Self::new(PerformanceTargets::default())
    }
}

impl PerformanceProfiler {
    pub fn new(targets: PerformanceTargets) -> Self {
        Self {
            samples: Mutex::new(HashMap::new()),
            targets,
            sample_limit: DEFAULT_SAMPLE_LIMIT,
        }
    }

    /// 每个操作保留的样本数，超出后丢弃最旧的
    pub fn with_sample_limit(mut self, limit: usize) -> Self {
        self.sample_limit = limit.max(1);
        self
    }

    fn samples_of(&self, operation: &str) -> Option<Vec<f64>> {
        self.samples
            .lock()
            .get(operation)
            .map(|v| v.iter().copied().collect())
    }

    /// 作用域计时器，Drop 时记录
    pub fn trace(self: &Arc<Self>, operation: impl Into<String>) -> TraceGuard {
        TraceGuard {
            profiler: Arc::clone(self),
            operation: operation.into(),
            start: Instant::now(),
        }
    }

    pub fn record(&self, operation: &str, duration: Duration) {
        let mut samples = self.samples.lock();
        let values = samples.entry(operation.to_string()).or_default();
        if values.len() >= self.sample_limit {
            values.pop_front();
        }
        values.push_back(duration.as_secs_f64());
    }

    /// 百分位（秒）；无数据返回 0.0
    pub fn get_percentile(&self, operation: &str, p: f64) -> f64 {
        let Some(mut sorted) = self.samples_of(operation) else {
            return 0.0;
        };
        sorted.sort_by(|a, b| a.total_cmp(b));
        nearest_rank(&sorted, p)
    }

    pub fn get_metrics(&self, operation: &str) -> Option<OperationMetrics> {
        self.samples_of(operation)
            .and_then(|v| OperationMetrics::from_samples(operation, &v))
    }

    pub fn get_report(&self) -> PerformanceReport {
        let snapshot: Vec<(String, Vec<f64>)> = self
            .samples
            .lock()
            .iter()
            .map(|(op, v)| (op.clone(), v.iter().copied().collect()))
            .collect();
        let operations: BTreeMap<String, OperationMetrics> = snapshot
            .iter()
            .filter_map(|(op, v)| OperationMetrics::from_samples(op.clone(), v).map(|m| (op.clone(), m)))
            .collect();
        let bottlenecks = operations
            .values()
            .filter_map(|m| {
                let threshold = self.targets.threshold_for(&m.operation).as_secs_f64();
                (m.p95 > threshold).then(|| Bottleneck {
                    operation: m.operation.clone(),
                    p95: m.p95,
                    threshold,
                })
            })
            .collect();
        PerformanceReport {
            operations,
            bottlenecks,
        }
    }

    pub fn reset(&self) {
        self.samples.lock().clear();
    }

    pub fn reset_operation(&self, operation: &str) {
        self.samples.lock().remove(operation);
    }

    pub fn targets(&self) -> &PerformanceTargets {
        &self.targets
    }
}

/// trace() 的返回值；持有期间计时
#[must_use = "the timer records when dropped"]
pub struct TraceGuard {
    profiler: Arc<PerformanceProfiler>,
    operation: String,
    start: Instant,
}

impl TraceGuard {
    pub fn elapsed(&self) -> Duration {
        self.start.elapsed()
    }
}

impl Drop for TraceGuard {
    fn drop(&mut self) {
        self.profiler.record(&self.operation, self.start.elapsed());
    }
}
