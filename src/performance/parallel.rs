//! 并行执行 Agent：Semaphore 限制并发，每个 Agent 独立超时
//!
//! 单个 Agent 失败或超时不会中断同批其它 Agent；超时与报错分开报告。
//! 依赖批次按顺序执行，前一批全部结束后才开始下一批。

use std::sync::Arc;
use std::time::Duration;

use futures_util::future::join_all;
use tokio::sync::Semaphore;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::agents::{Agent, AgentRequest, AgentResponse};
use crate::core::DmError;
use crate::performance::PerformanceProfiler;

#[derive(Debug, Clone)]
pub enum AgentOutcome {
    Succeeded(AgentResponse),
    TimedOut(Duration),
    Failed(DmError),
    /// 关机取消：不是 Agent 故障，不进入恢复流程
    Cancelled,
}

#[derive(Debug, Clone)]
pub struct AgentRun {
    pub agent_name: String,
    pub outcome: AgentOutcome,
    pub elapsed: Duration,
    /// 原样保留，便于调用方对失败的 Agent 做恢复
    pub request: AgentRequest,
}

impl AgentRun {
    pub fn response(&self) -> Option<&AgentResponse> {
        match &self.outcome {
            AgentOutcome::Succeeded(r) => Some(r),
            _ => None,
        }
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self.outcome, AgentOutcome::Cancelled)
    }

    /// 失败或超时统一转成 DmError；成功与取消返回 None
    pub fn error(&self) -> Option<DmError> {
        match &self.outcome {
            AgentOutcome::Succeeded(_) | AgentOutcome::Cancelled => None,
            AgentOutcome::TimedOut(limit) => {
                Some(DmError::timeout(format!("agent.{}", self.agent_name), *limit))
            }
            AgentOutcome::Failed(e) => Some(e.clone()),
        }
    }
}

/// 一批 Agent 的执行结果（顺序与提交顺序一致）
#[derive(Debug, Clone, Default)]
pub struct BatchReport {
    pub runs: Vec<AgentRun>,
}

impl BatchReport {
    fn names_where(&self, pred: impl Fn(&AgentOutcome) -> bool) -> Vec<&str> {
        self.runs
            .iter()
            .filter(|r| pred(&r.outcome))
            .map(|r| r.agent_name.as_str())
            .collect()
    }

    pub fn succeeded(&self) -> Vec<&str> {
        self.names_where(|o| matches!(o, AgentOutcome::Succeeded(_)))
    }

    pub fn timed_out(&self) -> Vec<&str> {
        self.names_where(|o| matches!(o, AgentOutcome::TimedOut(_)))
    }

    pub fn failed(&self) -> Vec<&str> {
        self.names_where(|o| matches!(o, AgentOutcome::Failed(_)))
    }

    pub fn cancelled(&self) -> Vec<&str> {
        self.names_where(|o| matches!(o, AgentOutcome::Cancelled))
    }

    pub fn responses(&self) -> impl Iterator<Item = &AgentResponse> {
        self.runs.iter().filter_map(AgentRun::response)
    }

    pub fn get(&self, agent_name: &str) -> Option<&AgentRun> {
        self.runs.iter().find(|r| r.agent_name == agent_name)
    }
}

pub struct ParallelAgentExecutor {
    semaphore: Arc<Semaphore>,
    agent_timeout: Duration,
    profiler: Option<Arc<PerformanceProfiler>>,
    cancel: CancellationToken,
}

impl ParallelAgentExecutor {
    pub fn new(max_concurrent: usize, agent_timeout: Duration) -> Self {
        Self {
            semaphore: Arc::new(Semaphore::new(max_concurrent.max(1))),
            agent_timeout,
            profiler: None,
            cancel: CancellationToken::new(),
        }
    }

    pub fn with_profiler(mut self, profiler: Arc<PerformanceProfiler>) -> Self {
        self.profiler = Some(profiler);
        self
    }

    /// 关机时取消：尚未开始的 Agent 不再启动，正在执行的在下一个挂起点放弃
    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancel = token;
        self
    }

    pub fn agent_timeout(&self) -> Duration {
        self.agent_timeout
    }

    async fn run_one(&self, agent: Arc<dyn Agent>, request: AgentRequest) -> AgentRun {
        let name = agent.name().to_string();
        let start = Instant::now();
        let cancelled = |start: Instant, request: AgentRequest| {
            debug!(agent = %name, "agent run cancelled");
            AgentRun {
                agent_name: name.clone(),
                outcome: AgentOutcome::Cancelled,
                elapsed: start.elapsed(),
                request,
            }
        };

        // 取消分支放在前面，已取消时不会再拿到许可
        let permit = tokio::select! {
            biased;
            _ = self.cancel.cancelled() => None,
            permit = self.semaphore.acquire() => Some(permit),
        };
        let Some(permit) = permit else {
            return cancelled(start, request);
        };
        let Ok(_permit) = permit else {
            return AgentRun {
                agent_name: name.clone(),
                outcome: AgentOutcome::Failed(DmError::agent(name.as_str(), "executor closed")),
                elapsed: start.elapsed(),
                request,
            };
        };

        let _trace = self
            .profiler
            .as_ref()
            .map(|p| p.trace(format!("agent.{}", name)));
        let result = tokio::select! {
            biased;
            _ = self.cancel.cancelled() => None,
            r = tokio::time::timeout(self.agent_timeout, agent.run(&request)) => Some(r),
        };
        let Some(result) = result else {
            return cancelled(start, request);
        };

        let outcome = match result {
            Ok(Ok(response)) => AgentOutcome::Succeeded(response),
            Ok(Err(e)) => {
                debug!(agent = %name, error = %e, "agent failed");
                AgentOutcome::Failed(e)
            }
            Err(_) => {
                warn!(agent = %name, timeout = ?self.agent_timeout, "agent timed out");
                AgentOutcome::TimedOut(self.agent_timeout)
            }
        };
        AgentRun {
            agent_name: name,
            outcome,
            elapsed: start.elapsed(),
            request,
        }
    }

    /// 同一批并发执行
    pub async fn execute_all(&self, jobs: Vec<(Arc<dyn Agent>, AgentRequest)>) -> BatchReport {
        let runs = join_all(
            jobs.into_iter()
                .map(|(agent, request)| self.run_one(agent, request)),
        )
        .await;
        BatchReport { runs }
    }

    /// 按依赖顺序执行多批；build_request 可读取之前批次的结果来构造请求
    pub async fn execute_batches<F>(
        &self,
        batches: Vec<Vec<Arc<dyn Agent>>>,
        mut build_request: F,
    ) -> Vec<BatchReport>
    where
        F: FnMut(&dyn Agent, &[BatchReport]) -> AgentRequest,
    {
        let mut reports: Vec<BatchReport> = Vec::with_capacity(batches.len());
        for batch in batches {
            if batch.is_empty() {
                continue;
            }
            let jobs = batch
                .into_iter()
                .map(|agent| {
                    let request = build_request(agent.as_ref(), &reports);
                    (agent, request)
                })
                .collect();
            reports.push(self.execute_all(jobs).await);
        }
        reports
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agents::test_support::StubAgent;
    use crate::agents::{AgentRole, ContextMap};
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// act 会挂起指定时长
    struct SlowAgent {
        name: &'static str,
        delay: Duration,
        running: Arc<AtomicUsize>,
        peak: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl Agent for SlowAgent {
        fn name(&self) -> &str {
            self.name
        }
        fn role(&self) -> AgentRole {
            AgentRole::Narrator
        }
        fn reason(&self, _request: &AgentRequest) -> Result<String, DmError> {
            Ok(String::new())
        }
        async fn act(&self, _reasoning: &str, _request: &AgentRequest) -> Result<String, DmError> {
            let now = self.running.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(now, Ordering::SeqCst);
            tokio::time::sleep(self.delay).await;
            self.running.fetch_sub(1, Ordering::SeqCst);
            Ok(format!("{} done", self.name))
        }
        fn observe(&self, _result: &str) -> ContextMap {
            ContextMap::new()
        }
    }

    fn slow(name: &'static str, secs: u64, running: &Arc<AtomicUsize>, peak: &Arc<AtomicUsize>) -> Arc<dyn Agent> {
        Arc::new(SlowAgent {
            name,
            delay: Duration::from_secs(secs),
            running: running.clone(),
            peak: peak.clone(),
        })
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_and_failure_reported_separately() {
        let running = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));
        let executor = ParallelAgentExecutor::new(3, Duration::from_secs(5));
        let failing: Arc<dyn Agent> = Arc::new(StubAgent::failing(
            "consistency",
            AgentRole::Consistency,
            1,
            DmError::agent("consistency", "boom"),
        ));
        let report = executor
            .execute_all(vec![
                (slow("narrator", 1, &running, &peak), AgentRequest::new()),
                (slow("archivist", 10, &running, &peak), AgentRequest::new()),
                (failing, AgentRequest::new()),
            ])
            .await;

        assert_eq!(report.succeeded(), vec!["narrator"]);
        assert_eq!(report.timed_out(), vec!["archivist"]);
        assert_eq!(report.failed(), vec!["consistency"]);
        assert!(matches!(
            report.get("archivist").unwrap().error(),
            Some(DmError::Timeout { .. })
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrency_cap() {
        let running = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));
        let executor = ParallelAgentExecutor::new(2, Duration::from_secs(30));
        let jobs = ["a", "b", "c", "d"]
            .into_iter()
            .map(|n| (slow(n, 1, &running, &peak), AgentRequest::new()))
            .collect();
        let report = executor.execute_all(jobs).await;
        assert_eq!(report.succeeded().len(), 4);
        assert_eq!(peak.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_batches_see_previous_results() {
        let executor = ParallelAgentExecutor::new(3, Duration::from_secs(5));
        let primary: Arc<dyn Agent> = Arc::new(StubAgent::ok("narrator", AgentRole::Narrator));
        let support: Arc<dyn Agent> = Arc::new(StubAgent::ok("archivist", AgentRole::Archivist));

        let mut seen = Vec::new();
        let reports = executor
            .execute_batches(vec![vec![primary], vec![], vec![support]], |agent, done| {
                seen.push((agent.name().to_string(), done.len()));
                AgentRequest::new()
            })
            .await;
        assert_eq!(reports.len(), 2);
        assert_eq!(seen, vec![("narrator".to_string(), 0), ("archivist".to_string(), 1)]);
    }

    #[tokio::test]
    async fn test_cancelled_executor_skips_agents() {
        let token = CancellationToken::new();
        token.cancel();
        let executor = ParallelAgentExecutor::new(1, Duration::from_secs(5)).with_cancellation(token);
        let stub = Arc::new(StubAgent::ok("narrator", AgentRole::Narrator));
        let agent: Arc<dyn Agent> = stub.clone();
        let report = executor.execute_all(vec![(agent, AgentRequest::new())]).await;
        assert_eq!(report.cancelled(), vec!["narrator"]);
        assert!(report.failed().is_empty());
        assert!(report.get("narrator").unwrap().error().is_none());
        assert_eq!(stub.calls(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_during_run_abandons_agent() {
        let running = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));
        let token = CancellationToken::new();
        let executor = ParallelAgentExecutor::new(2, Duration::from_secs(30)).with_cancellation(token.clone());

        let canceller = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(1)).await;
            token.cancel();
        });
        let report = executor
            .execute_all(vec![(slow("narrator", 10, &running, &peak), AgentRequest::new())])
            .await;
        canceller.await.unwrap();

        assert_eq!(report.cancelled(), vec!["narrator"]);
        assert!(report.get("narrator").unwrap().elapsed < Duration::from_secs(10));
    }
}
