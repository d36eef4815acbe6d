// libs/conversation-cell/src/services/cache.rs
use std::collections::HashMap;
use std::future::Future;
use std::hash::Hash;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio::sync::RwLock;
use tracing::debug;

use agenda_cell::models::{AgendaConfig, Professional};
use agenda_cell::services::{Directory, RepositoryError};

struct Entry<V> {
    value: V,
    stored_at: Instant,
}

/// Cache-aside map with a fixed time-to-live per entry.
pub struct TtlCache<K, V> {
    ttl: Duration,
    entries: RwLock<HashMap<K, Entry<V>>>,
}

impl<K, V> TtlCache<K, V>
where
    K: Eq + Hash + Clone + Send + Sync,
    V: Clone + Send + Sync,
{
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            entries: RwLock::new(HashMap::new()),
        }
    }

    pub async fn get(&self, key: &K) -> Option<V> {
        let entries = self.entries.read().await;
        entries
            .get(key)
            .filter(|entry| entry.stored_at.elapsed() < self.ttl)
            .map(|entry| entry.value.clone())
    }

    pub async fn insert(&self, key: K, value: V) {
        self.entries.write().await.insert(
            key,
            Entry {
                value,
                stored_at: Instant::now(),
            },
        );
    }

    pub async fn invalidate(&self, key: &K) {
        self.entries.write().await.remove(key);
    }

    /// Returns the cached value, or runs `refresh` and caches its success.
    /// Errors are passed through and nothing is cached.
    pub async fn get_or_refresh<F, Fut, E>(&self, key: K, refresh: F) -> Result<V, E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<V, E>>,
    {
        if let Some(value) = self.get(&key).await {
            return Ok(value);
        }

        let value = refresh().await?;
        self.insert(key, value.clone()).await;
        Ok(value)
    }
}

/// Directory reads through two TTL caches.
pub struct CachedDirectory {
    inner: Arc<dyn Directory>,
    professionals: TtlCache<String, Vec<Professional>>,
    configs: TtlCache<String, Option<AgendaConfig>>,
}

impl CachedDirectory {
    pub fn new(inner: Arc<dyn Directory>, ttl: Duration) -> Self {
        Self {
            inner,
            professionals: TtlCache::new(ttl),
            configs: TtlCache::new(ttl),
        }
    }
}

#[async_trait]
impl Directory for CachedDirectory {
    async fn professionals(&self, center_id: &str) -> Result<Vec<Professional>, RepositoryError> {
        self.professionals
            .get_or_refresh(center_id.to_string(), || async {
                debug!("Refreshing professionals of {}", center_id);
                self.inner.professionals(center_id).await
            })
            .await
    }

    async fn agenda_config(&self, professional_id: &str) -> Result<Option<AgendaConfig>, RepositoryError> {
        self.configs
            .get_or_refresh(professional_id.to_string(), || self.inner.agenda_config(professional_id))
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountingDirectory {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl Directory for CountingDirectory {
        async fn professionals(&self, center_id: &str) -> Result<Vec<Professional>, RepositoryError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(vec![Professional {
                id: "p1".into(),
                center_id: center_id.into(),
                name: "Dra. Soto".into(),
                specialty: None,
            }])
        }

        async fn agenda_config(&self, _professional_id: &str) -> Result<Option<AgendaConfig>, RepositoryError> {
            Err(RepositoryError::Unavailable("down".into()))
        }
    }

    #[tokio::test]
    async fn refresh_runs_once_within_ttl() {
        let inner = Arc::new(CountingDirectory { calls: AtomicUsize::new(0) });
        let cached = CachedDirectory::new(inner.clone(), Duration::from_secs(60));

        cached.professionals("c1").await.unwrap();
        cached.professionals("c1").await.unwrap();
        assert_eq!(inner.calls.load(Ordering::SeqCst), 1);

        cached.professionals("c2").await.unwrap();
        assert_eq!(inner.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn expired_entries_are_refreshed() {
        let inner = Arc::new(CountingDirectory { calls: AtomicUsize::new(0) });
        let cached = CachedDirectory::new(inner.clone(), Duration::ZERO);

        cached.professionals("c1").await.unwrap();
        cached.professionals("c1").await.unwrap();
        assert_eq!(inner.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn failures_are_not_cached() {
        let cache: TtlCache<&str, u32> = TtlCache::new(Duration::from_secs(60));
        let failed: Result<u32, &str> = cache.get_or_refresh("k", || async { Err("nope") }).await;
        assert!(failed.is_err());
        assert_eq!(cache.get(&"k").await, None);

        let value: Result<u32, &str> = cache.get_or_refresh("k", || async { Ok(7) }).await;
        assert_eq!(value, Ok(7));
        cache.invalidate(&"k").await;
        assert_eq!(cache.get(&"k").await, None);
    }
}
