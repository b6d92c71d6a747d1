//! In-memory store for pending `WebAuthn` ceremonies.
//!
//! Entries expire after the ceremony timeout. Expired entries are never
//! returned; `get`/`take` drop them lazily and the server's sweeper calls
//! `purge_expired` for the rest. `take` removes an entry so a finish step can
//! consume its session exactly once.

use std::{collections::HashMap, time::Duration};
use tokio::{sync::RwLock, time::Instant};

struct Entry<V> {
    value: V,
    inserted_at: Instant,
}

impl<V> Entry<V> {
    fn is_live(&self, ttl: Duration) -> bool {
        self.inserted_at.elapsed() < ttl
    }
}

pub struct ChallengeCache<V> {
    entries: RwLock<HashMap<String, Entry<V>>>,
    ttl: Duration,
}

impl<V> ChallengeCache<V> {
    #[must_use]
    pub fn new(ttl: Duration) -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            ttl,
        }
    }

    #[must_use]
    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// Store `value` under `key`, replacing any previous entry.
    pub async fn set(&self, key: impl Into<String>, value: V) {
        self.entries.write().await.insert(
            key.into(),
            Entry {
                value,
                inserted_at: Instant::now(),
            },
        );
    }

    /// Remove and return the live entry under `key`.
    pub async fn take(&self, key: &str) -> Option<V> {
        let entry = self.entries.write().await.remove(key)?;
        entry.is_live(self.ttl).then_some(entry.value)
    }

    /// Drop every expired entry, returning how many were removed.
    pub async fn purge_expired(&self) -> usize {
        let mut entries = self.entries.write().await;
        let before = entries.len();
        prune(&mut entries, self.ttl);
        before - entries.len()
    }

    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.entries.read().await.is_empty()
    }
}

impl<V: Clone> ChallengeCache<V> {
    pub async fn get(&self, key: &str) -> Option<V> {
        {
            let entries = self.entries.read().await;
            match entries.get(key) {
                None => return None,
                Some(entry) if entry.is_live(self.ttl) => return Some(entry.value.clone()),
                Some(_) => {}
            }
        }

        // expired: evict unless a writer replaced it meanwhile
        let mut entries = self.entries.write().await;
        if entries
            .get(key)
            .is_some_and(|entry| !entry.is_live(self.ttl))
        {
            entries.remove(key);
        }
        None
    }
}

fn prune<V>(entries: &mut HashMap<String, Entry<V>>, ttl: Duration) {
    entries.retain(|_, entry| entry.is_live(ttl));
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    const TTL: Duration = Duration::from_secs(60);

    #[tokio::test]
    async fn set_then_get() {
        let cache = ChallengeCache::new(TTL);
        cache.set("a", 1_u32).await;
        assert_eq!(cache.get("a").await, Some(1));
        assert_eq!(cache.get("b").await, None);
    }

    #[tokio::test]
    async fn set_overwrites() {
        let cache = ChallengeCache::new(TTL);
        cache.set("a", 1_u32).await;
        cache.set("a", 2_u32).await;
        assert_eq!(cache.get("a").await, Some(2));
        assert_eq!(cache.len().await, 1);
    }

    #[tokio::test]
    async fn take_consumes_once() {
        let cache = ChallengeCache::new(TTL);
        cache.set("a", "state".to_string()).await;
        assert_eq!(cache.take("a").await.as_deref(), Some("state"));
        assert_eq!(cache.take("a").await, None);
        assert_eq!(cache.get("a").await, None);
    }

    #[tokio::test(start_paused = true)]
    async fn expired_entries_are_not_returned() {
        let cache = ChallengeCache::new(TTL);
        cache.set("a", 1_u32).await;
        cache.set("b", 2_u32).await;

        tokio::time::advance(Duration::from_secs(59)).await;
        assert_eq!(cache.get("a").await, Some(1));

        tokio::time::advance(Duration::from_secs(2)).await;
        assert_eq!(cache.get("a").await, None);
        assert_eq!(cache.take("b").await, None);
        assert!(cache.is_empty().await);
    }

    #[tokio::test(start_paused = true)]
    async fn set_leaves_expired_entries_to_the_sweeper() {
        let cache = ChallengeCache::new(TTL);
        cache.set("old", 1_u32).await;
        tokio::time::advance(Duration::from_secs(61)).await;
        cache.set("new", 2_u32).await;
        assert_eq!(cache.len().await, 2);
        assert_eq!(cache.get("new").await, Some(2));
        assert_eq!(cache.purge_expired().await, 1);
        assert_eq!(cache.len().await, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn purge_expired_counts_removed() {
        let cache = ChallengeCache::new(TTL);
        cache.set("a", 1_u32).await;
        cache.set("b", 2_u32).await;
        tokio::time::advance(Duration::from_secs(30)).await;
        cache.set("c", 3_u32).await;
        tokio::time::advance(Duration::from_secs(31)).await;
        assert_eq!(cache.purge_expired().await, 2);
        assert_eq!(cache.get("c").await, Some(3));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_ceremonies_do_not_cross() {
        let cache = Arc::new(ChallengeCache::new(TTL));
        let mut handles = Vec::new();
        for i in 0..64_u32 {
            let cache = cache.clone();
            handles.push(tokio::spawn(async move {
                let key = format!("session-{i}");
                cache.set(key.clone(), i).await;
                tokio::task::yield_now().await;
                cache.get(&key).await
            }));
        }
        for (i, handle) in handles.into_iter().enumerate() {
            let value = handle.await.expect("task");
            assert_eq!(value, u32::try_from(i).ok());
        }
        assert_eq!(cache.len().await, 64);
    }
}
