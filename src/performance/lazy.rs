//! 延迟加载：模块内容按 section 注册，首次访问时才加载
//!
//! 每个 section 一个 OnceCell，get_or_try_init 即原子认领：并发调用方等待同一次加载，不会重复加载。
//! 加载失败不会占住 cell，下次访问重新尝试。

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures_util::future::join_all;
use parking_lot::RwLock;
use serde::Serialize;
use tokio::sync::OnceCell;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::core::{DmError, DmResult};

type BoxFuture<T> = Pin<Box<dyn Future<Output = T> + Send>>;

/// 零参数生产者，同步或异步
#[derive(Clone)]
pub enum Loader<T> {
    Sync(Arc<dyn Fn() -> DmResult<T> + Send + Sync>),
    Async(Arc<dyn Fn() -> BoxFuture<DmResult<T>> + Send + Sync>),
}

impl<T> Loader<T> {
    pub fn sync<F>(f: F) -> Self
    where
        F: Fn() -> DmResult<T> + Send + Sync + 'static,
    {
        Loader::Sync(Arc::new(f))
    }

    pub fn from_async<F, Fut>(f: F) -> Self
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = DmResult<T>> + Send + 'static,
    {
        Loader::Async(Arc::new(move || Box::pin(f())))
    }

    async fn load(&self) -> DmResult<T> {
        match self {
            Loader::Sync(f) => f(),
            Loader::Async(f) => f().await,
        }
    }
}

pub struct LoadableSection<T> {
    pub name: String,
    pub priority: u8,
    loader: Loader<T>,
    data: OnceCell<T>,
    load_count: AtomicU64,
}

impl<T> LoadableSection<T> {
    fn new(name: String, loader: Loader<T>, priority: u8) -> Self {
        Self {
            name,
            priority,
            loader,
            data: OnceCell::new(),
            load_count: AtomicU64::new(0),
        }
    }

    pub fn is_loaded(&self) -> bool {
        self.data.initialized()
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct LazyLoadStats {
    pub registered: usize,
    pub loaded: usize,
    /// 实际调用 loader 的次数（含失败）
    pub loads: u64,
    pub load_times: HashMap<String, Duration>,
}

pub struct LazyLoadManager<T = String> {
    sections: RwLock<HashMap<String, Arc<LoadableSection<T>>>>,
    load_times: RwLock<HashMap<String, Duration>>,
}

impl<T> Default for LazyLoadManager<T> {
    fn default() -> Self {
        Self {
            sections: RwLock::new(HashMap::new()),
            load_times: RwLock::new(HashMap::new()),
        }
    }
}

impl<T: Clone + Send + Sync + 'static> LazyLoadManager<T> {
    pub fn new() -> Self {
        Self::default()
    }

    /// 注册 section；同名注册替换旧 section（已加载的数据一并丢弃）
    pub fn register(&self, name: impl Into<String>, loader: Loader<T>, priority: u8) {
        let name = name.into();
        let section = Arc::new(LoadableSection::new(name.clone(), loader, priority));
        self.sections.write().insert(name, section);
    }

    fn section(&self, name: &str) -> DmResult<Arc<LoadableSection<T>>> {
        self.sections.read().get(name).cloned().ok_or_else(|| DmError::State {
            message: format!("unknown content section '{}'", name),
            entity: Some(name.to_string()),
        })
    }

    /// 取 section 数据，未加载则加载
    pub async fn get(&self, name: &str) -> DmResult<T> {
        let section = self.section(name)?;
        let value = section
            .data
            .get_or_try_init(|| async {
                section.load_count.fetch_add(1, Ordering::Relaxed);
                let start = Instant::now();
                let result = section.loader.load().await;
                let elapsed = start.elapsed();
                if result.is_ok() {
                    self.load_times.write().insert(section.name.clone(), elapsed);
                    debug!(section = %section.name, ?elapsed, "section loaded");
                }
                result
            })
            .await?;
        Ok(value.clone())
    }

    /// 并发预加载指定 section，返回成功个数；失败只记日志
    pub async fn preload(&self, names: &[&str]) -> usize {
        let results = join_all(names.iter().map(|n| async move { (*n, self.get(n).await) })).await;
        results
            .into_iter()
            .filter(|(name, r)| match r {
                Ok(_) => true,
                Err(e) => {
                    warn!(section = %name, error = %e, "preload failed");
                    false
                }
            })
            .count()
    }

    /// 预加载 priority >= min_priority 的所有 section
    pub async fn preload_by_priority(&self, min_priority: u8) -> usize {
        let min = min_priority;
        let names = self.sorted_names(|s| s.priority >= min);
        let refs: Vec<&str> = names.iter().map(String::as_str).collect();
        self.preload(&refs).await
    }

    /// 丢弃已加载数据，保留注册；下次 get 重新加载
    pub fn unload(&self, name: &str) -> bool {
        let mut sections = self.sections.write();
        let Some(old) = sections.get(name) else {
            return false;
        };
        let was_loaded = old.is_loaded();
        let fresh = LoadableSection::new(old.name.clone(), old.loader.clone(), old.priority);
        fresh
            .load_count
            .store(old.load_count.load(Ordering::Relaxed), Ordering::Relaxed);
        sections.insert(name.to_string(), Arc::new(fresh));
        self.load_times.write().remove(name);
        was_loaded
    }

    /// 按优先级降序、同级按名字排列
    pub fn section_names(&self) -> Vec<String> {
        self.sorted_names(|_| true)
    }

    pub fn loaded_names(&self) -> Vec<String> {
        self.sorted_names(LoadableSection::is_loaded)
    }

    fn sorted_names(&self, pred: impl Fn(&LoadableSection<T>) -> bool) -> Vec<String> {
        let mut selected: Vec<(u8, String)> = self
            .sections
            .read()
            .values()
            .filter(|s| pred(s))
            .map(|s| (s.priority, s.name.clone()))
            .collect();
        selected.sort_by(|a, b| b.0.cmp(&a.0).then_with(|| a.1.cmp(&b.1)));
        selected.into_iter().map(|(_, n)| n).collect()
    }

    pub fn is_loaded(&self, name: &str) -> bool {
        self.sections
            .read()
            .get(name)
            .map(|s| s.is_loaded())
            .unwrap_or(false)
    }

    pub fn stats(&self) -> LazyLoadStats {
        let sections = self.sections.read();
        LazyLoadStats {
            registered: sections.len(),
            loaded: sections.values().filter(|s| s.is_loaded()).count(),
            loads: sections
                .values()
                .map(|s| s.load_count.load(Ordering::Relaxed))
                .sum(),
            load_times: self.load_times.read().clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[tokio::test]
    async fn test_concurrent_get_loads_once() {
        let calls = Arc::new(AtomicUsize::new(0));
        let manager: Arc<LazyLoadManager<String>> = Arc::new(LazyLoadManager::new());
        let c = calls.clone();
        manager.register(
            "chapter_1",
            Loader::from_async(move || {
                let c = c.clone();
                async move {
                    c.fetch_add(1, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(20)).await;
                    Ok("The Sunless Citadel".to_string())
                }
            }),
            5,
        );

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let m = manager.clone();
                tokio::spawn(async move { m.get("chapter_1").await })
            })
            .collect();
        for h in handles {
            assert_eq!(h.await.unwrap().unwrap(), "The Sunless Citadel");
        }
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(manager.stats().loads, 1);
    }

    #[tokio::test]
    async fn test_failed_load_retries_next_time() {
        let calls = Arc::new(AtomicUsize::new(0));
        let c = calls.clone();
        let manager: LazyLoadManager<u32> = LazyLoadManager::new();
        manager.register(
            "npcs",
            Loader::sync(move || {
                if c.fetch_add(1, Ordering::SeqCst) == 0 {
                    Err(DmError::agent("loader", "disk busy"))
                } else {
                    Ok(7)
                }
            }),
            1,
        );
        assert!(manager.get("npcs").await.is_err());
        assert!(!manager.is_loaded("npcs"));
        assert_eq!(manager.get("npcs").await.unwrap(), 7);
        assert!(manager.is_loaded("npcs"));
    }

    #[tokio::test]
    async fn test_preload_by_priority_and_unload() {
        let manager: LazyLoadManager<u32> = LazyLoadManager::new();
        manager.register("core", Loader::sync(|| Ok(1)), 9);
        manager.register("maps", Loader::sync(|| Ok(2)), 5);
        manager.register("appendix", Loader::sync(|| Ok(3)), 1);

        assert_eq!(manager.preload_by_priority(5).await, 2);
        assert!(manager.is_loaded("core"));
        assert!(manager.is_loaded("maps"));
        assert!(!manager.is_loaded("appendix"));

        assert!(manager.unload("core"));
        assert!(!manager.is_loaded("core"));
        assert!(!manager.unload("missing"));
        let stats = manager.stats();
        assert_eq!((stats.registered, stats.loaded), (3, 1));
        assert!(manager.get("missing").await.is_err());
    }
}
