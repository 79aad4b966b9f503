use std::collections::HashMap;
use std::time::Duration;
use tokio::time::Instant;
use tokio::sync::Mutex;

/// Time-bounded read cache keyed by row id.
///
/// Writes never touch it, so a cached value may lag a commit by up to `ttl`.
/// Fresh reads refresh the entry with what they observed, unless a newer
/// revision is already cached.
pub(crate) struct ReadCache<V> {
    ttl: Duration,
    entries: Mutex<HashMap<i64, (Instant, V)>>,
}

impl<V: Clone> ReadCache<V> {
    pub(crate) fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            entries: Mutex::new(HashMap::new()),
        }
    }

    pub(crate) async fn get(&self, id: i64) -> Option<V> {
        let mut entries = self.entries.lock().await;
        match entries.get(&id) {
            Some((stored_at, value)) if stored_at.elapsed() < self.ttl => Some(value.clone()),
            Some(_) => {
                entries.remove(&id);
                None
            }
            None => None,
        }
    }

    pub(crate) async fn put(&self, id: i64, value: V) {
        if self.ttl.is_zero() {
            return;
        }
        self.entries
            .lock()
            .await
            .insert(id, (Instant::now(), value));
    }

    /// Like [`ReadCache::put`], but keeps a live entry whose version is
    /// higher than `value`'s. Concurrent fresh reads may finish out of order.
    pub(crate) async fn put_versioned<F>(&self, id: i64, value: V, version: F)
    where
        F: Fn(&V) -> i64,
    {
        if self.ttl.is_zero() {
            return;
        }
        let mut entries = self.entries.lock().await;
        if let Some((stored_at, current)) = entries.get(&id)
            && stored_at.elapsed() < self.ttl
            && version(current) > version(&value)
        {
            return;
        }
        entries.insert(id, (Instant::now(), value));
    }

    pub(crate) async fn evict(&self, id: i64) {
        self.entries.lock().await.remove(&id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn returns_value_within_ttl() {
        let cache = ReadCache::new(Duration::from_secs(60));
        cache.put(1, "a".to_string()).await;
        assert_eq!(cache.get(1).await.as_deref(), Some("a"));
        assert_eq!(cache.get(2).await, None);
    }

    #[tokio::test]
    async fn expired_entries_are_dropped() {
        let cache = ReadCache::new(Duration::from_millis(5));
        cache.put(1, 10u32).await;
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(cache.get(1).await, None);
    }

    #[tokio::test]
    async fn zero_ttl_disables_caching() {
        let cache = ReadCache::new(Duration::ZERO);
        cache.put(1, 10u32).await;
        assert_eq!(cache.get(1).await, None);
    }

    #[tokio::test]
    async fn older_version_does_not_replace_newer() {
        let cache = ReadCache::new(Duration::from_secs(60));
        cache.put_versioned(3, (5i64, "new"), |v| v.0).await;
        cache.put_versioned(3, (4i64, "old"), |v| v.0).await;
        assert_eq!(cache.get(3).await, Some((5, "new")));

        cache.put_versioned(3, (5i64, "same"), |v| v.0).await;
        assert_eq!(cache.get(3).await, Some((5, "same")));
    }

    #[tokio::test]
    async fn evict_removes_entry() {
        let cache = ReadCache::new(Duration::from_secs(60));
        cache.put(4, 1u8).await;
        cache.evict(4).await;
        assert_eq!(cache.get(4).await, None);
    }
}
