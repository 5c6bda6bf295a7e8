//! 按相关度拼装 prompt 上下文，长度不超过字符预算
//!
//! 相关度 = 0.7 * 关键词覆盖率 + 0.3 * 关键词密度（上限 1.0）；
//! 关键词取请求上下文里所有字符串字段中长度 >= 3 的词。缓存缺失时每次查找都视为未命中。

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::time::Instant;

use crate::agents::AgentRequest;
use crate::performance::ModuleCache;

const CACHE_PREFIX: &str = "context:";
const NEUTRAL_RELEVANCE: f64 = 0.5;
const SEPARATOR: &str = "\n\n";
const ELLIPSIS: &str = "...";
/// 剩余预算大于此值才截断放入，否则直接停止
const MIN_PARTIAL_CHARS: usize = 100;

#[derive(Debug, Clone, Serialize)]
pub struct BuiltContext {
    pub context: String,
    pub token_estimate: usize,
    pub build_time: Duration,
    /// 被放入的 source 名，截断的记为 "name (truncated)"
    pub sources_used: Vec<String>,
}

pub struct OptimizedContextBuilder {
    cache: Option<Arc<ModuleCache<String>>>,
    max_chars: usize,
}

impl OptimizedContextBuilder {
    pub fn new(cache: Option<Arc<ModuleCache<String>>>, max_chars: usize) -> Self {
        Self { cache, max_chars }
    }

    pub fn max_chars(&self) -> usize {
        self.max_chars
    }

    fn cache_key(name: &str) -> String {
        format!("{}{}", CACHE_PREFIX, name)
    }

    /// source 内容变化后调用，下次构建改用新内容
    pub fn invalidate_source(&self, name: &str) -> bool {
        self.cache
            .as_ref()
            .is_some_and(|cache| cache.invalidate(&Self::cache_key(name)))
    }

    fn cached_or_store(&self, name: &str, content: &str) -> String {
        let Some(cache) = &self.cache else {
            return content.to_string();
        };
        let key = Self::cache_key(name);
        if let Some(hit) = cache.get(&key) {
            return hit;
        }
        cache.put(key, content.to_string(), content.len() as u64);
        content.to_string()
    }

    /// budget 为 None 时使用构造时的预算
    pub fn build_context(
        &self,
        request: &AgentRequest,
        sources: &[(&str, &str)],
        budget: Option<usize>,
    ) -> BuiltContext {
        let start = Instant::now();
        let budget = budget.unwrap_or(self.max_chars);
        let keywords = extract_keywords(request);

        let mut scored: Vec<(f64, usize, &str, String)> = sources
            .iter()
            .enumerate()
            .map(|(i, (name, content))| {
                let content = self.cached_or_store(name, content);
                (relevance(&keywords, &content), i, *name, content)
            })
            .collect();
        // 相关度降序，同分保持输入顺序
        scored.sort_by(|a, b| b.0.total_cmp(&a.0).then(a.1.cmp(&b.1)));

        let mut context = String::new();
        let mut used = Vec::new();
        for (_, _, name, content) in scored {
            let sep = if context.is_empty() { "" } else { SEPARATOR };
            let block = format!("{}[{}] {}", sep, name, content);
            let remaining = budget.saturating_sub(context.chars().count());
            let block_chars = block.chars().count();
            if block_chars <= remaining {
                context.push_str(&block);
                used.push(name.to_string());
                continue;
            }

            let overhead = format!("{}[{}] ", sep, name).chars().count() + ELLIPSIS.chars().count();
            if remaining > overhead + MIN_PARTIAL_CHARS {
                let keep = remaining - overhead;
                let truncated: String = content.chars().take(keep).collect();
                context.push_str(&format!("{}[{}] {}{}", sep, name, truncated, ELLIPSIS));
                used.push(format!("{} (truncated)", name));
            }
            break;
        }

        BuiltContext {
            token_estimate: context.chars().count() / 4,
            context,
            build_time: start.elapsed(),
            sources_used: used,
        }
    }
}

/// 请求上下文中所有字符串字段的词：小写、去掉尾部标点、长度 >= 3、去重
pub fn extract_keywords(request: &AgentRequest) -> BTreeSet<String> {
    request
        .context
        .values()
        .filter_map(|v| v.as_str())
        .flat_map(str::split_whitespace)
        .map(|w| {
            w.to_lowercase()
                .trim_end_matches(|c: char| c.is_ascii_punctuation())
                .to_string()
        })
        .filter(|w| w.chars().count() >= 3)
        .collect()
}

pub fn relevance(keywords: &BTreeSet<String>, content: &str) -> f64 {
    if keywords.is_empty() {
        return NEUTRAL_RELEVANCE;
    }
    let lower = content.to_lowercase();
    let words = lower.split_whitespace().count();
    let covered = keywords.iter().filter(|k| lower.contains(k.as_str())).count();
    let occurrences: usize = keywords.iter().map(|k| lower.matches(k.as_str()).count()).sum();

    let coverage = covered as f64 / keywords.len() as f64;
    let density = if words == 0 {
        0.0
    } else {
        (occurrences as f64 / words as f64).min(1.0)
    };
    (0.7 * coverage + 0.3 * density).min(1.0)
}
