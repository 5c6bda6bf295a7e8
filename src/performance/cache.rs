//! 模块内容缓存：按字节容量与 TTL 双重约束的 LRU
//!
//! 不变量：live 条目 size 之和 == current_size。淘汰与过期都是整条移除，不原地修改。
//! TTL 从 created_at 起算，访问不续期；last_accessed 只用于 LRU 排序。

use std::collections::HashMap;
use std::time::Duration;

use parking_lot::Mutex;
use serde::Serialize;
use tokio::time::Instant;
use tracing::debug;

const BYTES_PER_MB: u64 = 1024 * 1024;

#[derive(Debug, Clone)]
pub struct CacheEntry<V> {
    pub key: String,
    pub value: V,
    pub size: u64,
    pub created_at: Instant,
    pub last_accessed: Instant,
    pub access_count: u64,
    /// 同一时刻多次访问时的先后次序
    touch_seq: u64,
}

impl<V> CacheEntry<V> {
    fn is_expired(&self, now: Instant, ttl: Duration) -> bool {
        now.saturating_duration_since(self.created_at) > ttl
    }

    fn lru_key(&self) -> (Instant, u64) {
        (self.last_accessed, self.touch_seq)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CacheStats {
    pub entries: usize,
    pub total_size_bytes: u64,
    pub max_size_bytes: u64,
    pub hits: u64,
    pub misses: u64,
    pub hit_rate: f64,
    pub evictions: u64,
    pub avg_entry_size: f64,
}

#[derive(Debug)]
struct Inner<V> {
    entries: HashMap<String, CacheEntry<V>>,
    current_size: u64,
    hits: u64,
    misses: u64,
    evictions: u64,
    seq: u64,
}

impl<V> Inner<V> {
    fn next_seq(&mut self) -> u64 {
        self.seq += 1;
        self.seq
    }

    fn remove(&mut self, key: &str) -> Option<CacheEntry<V>> {
        let entry = self.entries.remove(key)?;
        self.current_size -= entry.size;
        Some(entry)
    }

    /// 按 last_accessed 升序淘汰，直到腾出 needed 字节或清空
    fn evict_for(&mut self, needed: u64, max_size: u64) -> u64 {
        let mut order: Vec<(Instant, u64, String)> = self
            .entries
            .values()
            .map(|e| {
                let (t, s) = e.lru_key();
                (t, s, e.key.clone())
            })
            .collect();
        order.sort();

        let mut evicted = 0;
        for (_, _, key) in order {
            if self.current_size + needed <= max_size {
                break;
            }
            if self.remove(&key).is_some() {
                self.evictions += 1;
                evicted += 1;
            }
        }
        evicted
    }
}

/// 线程安全的 LRU 缓存；每个逻辑操作持锁一次
#[derive(Debug)]
pub struct ModuleCache<V = String> {
    inner: Mutex<Inner<V>>,
    max_size: u64,
    ttl: Duration,
}

impl<V: Clone> ModuleCache<V> {
    pub fn new(max_size_mb: u64, ttl_minutes: u64) -> Self {
        Self::with_limits(
            max_size_mb * BYTES_PER_MB,
            Duration::from_secs(ttl_minutes * 60),
        )
    }

    pub fn with_limits(max_size_bytes: u64, ttl: Duration) -> Self {
        Self {
            inner: Mutex::new(Inner {
                entries: HashMap::new(),
                current_size: 0,
                hits: 0,
                misses: 0,
                evictions: 0,
                seq: 0,
            }),
            max_size: max_size_bytes,
            ttl,
        }
    }

    pub fn get(&self, key: &str) -> Option<V> {
        let now = Instant::now();
        let mut inner = self.inner.lock();
        let Some(expired) = inner.entries.get(key).map(|e| e.is_expired(now, self.ttl)) else {
            inner.misses += 1;
            return None;
        };
        if expired {
            inner.remove(key);
            inner.misses += 1;
            debug!(key, "cache entry expired on access");
            return None;
        }

        let seq = inner.next_seq();
        inner.hits += 1;
        let entry = inner.entries.get_mut(key)?;
        entry.last_accessed = now;
        entry.access_count += 1;
        entry.touch_seq = seq;
        Some(entry.value.clone())
    }

    /// 写入；替换同名条目时先扣掉旧 size，空间不足先做 LRU 淘汰
    pub fn put(&self, key: impl Into<String>, value: V, size: u64) {
        let key = key.into();
        let now = Instant::now();
        let mut inner = self.inner.lock();

        inner.remove(&key);
        if inner.current_size + size > self.max_size {
            let evicted = inner.evict_for(size, self.max_size);
            if evicted > 0 {
                debug!(evicted, incoming = size, "cache evicted entries");
            }
        }

        let seq = inner.next_seq();
        inner.current_size += size;
        inner.entries.insert(
            key.clone(),
            CacheEntry {
                key,
                value,
                size,
                created_at: now,
                last_accessed: now,
                access_count: 0,
                touch_seq: seq,
            },
        );
    }

    pub fn contains(&self, key: &str) -> bool {
        self.inner.lock().entries.contains_key(key)
    }

    pub fn invalidate(&self, key: &str) -> bool {
        self.inner.lock().remove(key).is_some()
    }

    /// 移除 key 含有 pattern 的所有条目，返回移除个数
    pub fn invalidate_pattern(&self, pattern: &str) -> usize {
        let mut inner = self.inner.lock();
        let keys: Vec<String> = inner
            .entries
            .keys()
            .filter(|k| k.contains(pattern))
            .cloned()
            .collect();
        for key in &keys {
            inner.remove(key);
        }
        keys.len()
    }

    /// 清理所有过期条目，返回清理个数
    pub fn cleanup_expired(&self) -> usize {
        let now = Instant::now();
        let mut inner = self.inner.lock();
        let keys: Vec<String> = inner
            .entries
            .values()
            .filter(|e| e.is_expired(now, self.ttl))
            .map(|e| e.key.clone())
            .collect();
        for key in &keys {
            inner.remove(key);
        }
        keys.len()
    }

    pub fn clear(&self) {
        let mut inner = self.inner.lock();
        inner.entries.clear();
        inner.current_size = 0;
    }

    pub fn get_stats(&self) -> CacheStats {
        let inner = self.inner.lock();
        let requests = inner.hits + inner.misses;
        let entries = inner.entries.len();
        CacheStats {
            entries,
            total_size_bytes: inner.current_size,
            max_size_bytes: self.max_size,
            hits: inner.hits,
            misses: inner.misses,
            hit_rate: if requests == 0 {
                0.0
            } else {
                inner.hits as f64 / requests as f64
            },
            evictions: inner.evictions,
            avg_entry_size: if entries == 0 {
                0.0
            } else {
                inner.current_size as f64 / entries as f64
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_second_large_put_evicts_first() {
        let cache: ModuleCache<String> = ModuleCache::new(1, 30);
        cache.put("a", "x".into(), 600_000);
        cache.put("b", "y".into(), 600_000);
        assert_eq!(cache.get("a"), None);
        assert_eq!(cache.get("b").as_deref(), Some("y"));
        let stats = cache.get_stats();
        assert_eq!(stats.evictions, 1);
        assert_eq!(stats.total_size_bytes, 600_000);
    }

    #[test]
    fn test_no_eviction_within_budget_and_size_tracks_entries() {
        let cache: ModuleCache<u32> = ModuleCache::with_limits(1000, Duration::from_secs(60));
        cache.put("a", 1, 300);
        cache.put("b", 2, 300);
        cache.put("c", 3, 400);
        let stats = cache.get_stats();
        assert_eq!(stats.entries, 3);
        assert_eq!(stats.total_size_bytes, 1000);
        assert_eq!(stats.evictions, 0);

        // 替换同名条目：旧 size 先扣除，不触发淘汰
        cache.put("c", 4, 100);
        let stats = cache.get_stats();
        assert_eq!(stats.total_size_bytes, 700);
        assert_eq!(stats.evictions, 0);
        assert_eq!(stats.avg_entry_size, 700.0 / 3.0);
    }

    #[test]
    fn test_eviction_follows_last_accessed_order() {
        let cache: ModuleCache<u32> = ModuleCache::with_limits(300, Duration::from_secs(60));
        cache.put("a", 1, 100);
        cache.put("b", 2, 100);
        cache.put("c", 3, 100);
        // a 最近被访问，b 变成最久未用
        assert_eq!(cache.get("a"), Some(1));

        cache.put("d", 4, 150);
        assert!(!cache.contains("b"));
        assert!(!cache.contains("c"));
        assert!(cache.contains("a"));
        assert!(cache.contains("d"));
        assert_eq!(cache.get_stats().evictions, 2);
    }

    #[test]
    fn test_oversized_entry_empties_cache() {
        let cache: ModuleCache<u32> = ModuleCache::with_limits(100, Duration::from_secs(60));
        cache.put("a", 1, 50);
        cache.put("huge", 2, 500);
        assert!(!cache.contains("a"));
        assert_eq!(cache.get_stats().total_size_bytes, 500);
    }

    #[tokio::test(start_paused = true)]
    async fn test_ttl_expiry_is_a_miss_and_removes_entry() {
        let cache: ModuleCache<u32> = ModuleCache::with_limits(1000, Duration::from_secs(10));
        cache.put("a", 1, 10);
        tokio::time::advance(Duration::from_secs(5)).await;
        assert_eq!(cache.get("a"), Some(1));
        // 访问不续期
        tokio::time::advance(Duration::from_secs(6)).await;
        assert_eq!(cache.get("a"), None);
        let stats = cache.get_stats();
        assert_eq!(stats.entries, 0);
        assert_eq!(stats.total_size_bytes, 0);
        assert_eq!((stats.hits, stats.misses), (1, 1));
    }

    #[test]
    fn test_invalidate_pattern_and_hit_rate() {
        let cache: ModuleCache<u32> = ModuleCache::with_limits(1000, Duration::from_secs(60));
        assert_eq!(cache.get_stats().hit_rate, 0.0);
        cache.put("context:lore", 1, 10);
        cache.put("context:combat", 2, 10);
        cache.put("npc:goblin", 3, 10);
        assert_eq!(cache.invalidate_pattern("context:"), 2);
        assert!(cache.invalidate("npc:goblin"));
        assert!(!cache.invalidate("npc:goblin"));
        assert_eq!(cache.get("npc:goblin"), None);
        assert_eq!(cache.get_stats().total_size_bytes, 0);
    }
}
