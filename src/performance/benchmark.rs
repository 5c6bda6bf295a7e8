//! 基准测试工具：对一个异步操作跑 N 次（含预热），产出不可变的统计结果

use std::future::Future;
use std::time::Duration;

use serde::Serialize;
use tokio::time::Instant;
use tracing::info;

use super::profiler::{OperationMetrics, PerformanceTargets};

#[derive(Debug, Clone, Serialize)]
pub struct BenchmarkResult {
    pub name: String,
    pub iterations: usize,
    pub failures: usize,
    pub metrics: Option<OperationMetrics>,
    /// p95 目标（秒）
    pub target: f64,
    pub meets_target: bool,
}

pub struct Benchmark {
    name: String,
    iterations: usize,
    warmup: usize,
}

impl Benchmark {
    pub fn new(name: impl Into<String>, iterations: usize) -> Self {
        Self {
            name: name.into(),
            iterations: iterations.max(1),
            warmup: 1,
        }
    }

    pub fn with_warmup(mut self, warmup: usize) -> Self {
        self.warmup = warmup;
        self
    }

    /// 失败的迭代不计入耗时统计，只计数
    pub async fn run<F, Fut, T, E>(&self, targets: &PerformanceTargets, mut op: F) -> BenchmarkResult
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        for _ in 0..self.warmup {
            let _ = op().await;
        }

        let mut samples = Vec::with_capacity(self.iterations);
        let mut failures = 0;
        for _ in 0..self.iterations {
            let start = Instant::now();
            match op().await {
                Ok(_) => samples.push(start.elapsed().as_secs_f64()),
                Err(_) => failures += 1,
            }
        }

        let metrics = OperationMetrics::from_samples(self.name.clone(), &samples);
        let target: Duration = targets.threshold_for(&self.name);
        let meets_target = failures == 0
            && metrics
                .as_ref()
                .map(|m| m.p95 <= target.as_secs_f64())
                .unwrap_or(false);
        info!(
            benchmark = %self.name,
            iterations = self.iterations,
            failures,
            p95 = metrics.as_ref().map(|m| m.p95).unwrap_or(0.0),
            meets_target,
            "benchmark finished"
        );
        BenchmarkResult {
            name: self.name.clone(),
            iterations: self.iterations,
            failures,
            metrics,
            target: target.as_secs_f64(),
            meets_target,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_benchmark_against_injected_target() {
        let targets = PerformanceTargets::default().with_target("narrate", Duration::from_millis(600));
        let mut n = 0u64;
        let result = Benchmark::new("narrate", 5)
            .with_warmup(0)
            .run(&targets, || {
                n += 1;
                let delay = Duration::from_millis(100 * n);
                async move {
                    tokio::time::sleep(delay).await;
                    Ok::<_, String>(())
                }
            })
            .await;
        let metrics = result.metrics.unwrap();
        assert_eq!(metrics.count, 5);
        assert!((metrics.p50 - 0.3).abs() < 0.01);
        assert!((metrics.p95 - 0.5).abs() < 0.01);
        assert!(result.meets_target);
    }

    #[tokio::test]
    async fn test_failures_fail_the_target() {
        let result = Benchmark::new("flaky", 3)
            .run(&PerformanceTargets::default(), || async { Err::<(), _>("down") })
            .await;
        assert_eq!(result.failures, 3);
        assert!(result.metrics.is_none());
        assert!(!result.meets_target);
    }
}
