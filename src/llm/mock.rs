//! Mock LLM 客户端（无需 API）
//!
//! MockLlmClient：离线模式下按 prompt 中的玩家动作给出固定风格的叙述，便于本地跑通编排流程。
//! ScriptedLlmClient：测试替身，按队列依次返回预设结果或错误，并统计调用次数、token 上限与用量。

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;

use crate::llm::{LlmClient, LlmError};

/// Mock 客户端：回显 prompt 中 "Player action:" 之后的一行
#[derive(Debug, Default)]
pub struct MockLlmClient;

#[async_trait]
impl LlmClient for MockLlmClient {
    async fn generate(&self, prompt: &str, _max_tokens: u32) -> Result<String, LlmError> {
        let action = prompt
            .lines()
            .find_map(|l| l.trim().strip_prefix("Player action:"))
            .map(str::trim)
            .unwrap_or("(nothing)");

        Ok(format!(
            "The torchlight flickers as you {}. The dungeon waits, silent, for your next move.",
            action.trim_end_matches('.')
        ))
    }
}

/// 脚本化客户端：队列耗尽后重复 fallback 结果
#[derive(Debug)]
pub struct ScriptedLlmClient {
    script: Mutex<VecDeque<Result<String, LlmError>>>,
    fallback: Result<String, LlmError>,
    delay: Option<Duration>,
    calls: AtomicUsize,
    prompts: Mutex<Vec<String>>,
    budgets: Mutex<Vec<u32>>,
    /// 按空白分词粗算的 (prompt, completion)
    usage: Mutex<(u64, u64)>,
}

impl ScriptedLlmClient {
    /// 总是返回同一段文本
    pub fn always(text: impl Into<String>) -> Self {
        Self::new(Vec::new(), Ok(text.into()))
    }

    /// 总是失败
    pub fn failing(err: LlmError) -> Self {
        Self::new(Vec::new(), Err(err))
    }

    pub fn new(script: Vec<Result<String, LlmError>>, fallback: Result<String, LlmError>) -> Self {
        Self {
            script: Mutex::new(script.into()),
            fallback,
            delay: None,
            calls: AtomicUsize::new(0),
            prompts: Mutex::new(Vec::new()),
            budgets: Mutex::new(Vec::new()),
            usage: Mutex::new((0, 0)),
        }
    }

    /// 每次调用前先 sleep（用于超时测试）
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn prompts(&self) -> Vec<String> {
        self.prompts.lock().clone()
    }

    /// 每次调用传入的 max_tokens
    pub fn budgets(&self) -> Vec<u32> {
        self.budgets.lock().clone()
    }
}

#[async_trait]
impl LlmClient for ScriptedLlmClient {
    async fn generate(&self, prompt: &str, max_tokens: u32) -> Result<String, LlmError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.prompts.lock().push(prompt.to_string());
        self.budgets.lock().push(max_tokens);
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        let next = self.script.lock().pop_front();
        let result = next.unwrap_or_else(|| self.fallback.clone());
        if let Ok(text) = &result {
            let mut usage = self.usage.lock();
            usage.0 += prompt.split_whitespace().count() as u64;
            usage.1 += text.split_whitespace().count() as u64;
        }
        result
    }

    fn token_usage(&self) -> (u64, u64, u64) {
        let (prompt, completion) = *self.usage.lock();
        (prompt, completion, prompt + completion)
    }
}
