use chrono::{DateTime, Duration, Utc};
use std::sync::{Arc, RwLock};
use tracing::debug;

use crate::error::StoreResult;
use crate::models::StatusResponse;
use crate::store::{Store, SNAPSHOT_KEY};

#[derive(Debug, Clone)]
struct Shadow {
    snapshot: StatusResponse,
    valid_until: DateTime<Utc>,
}

pub struct SnapshotCache {
    store: Arc<dyn Store>,
    ttl: Duration,
    shadow_ttl: Option<Duration>,
    shadow: RwLock<Option<Shadow>>,
}

impl SnapshotCache {
    /// `ttl` is clamped to at least one millisecond so `expiresAt` always
    /// lands after `timestamp`.
    pub fn new(store: Arc<dyn Store>, ttl: std::time::Duration) -> Self {
        let ttl = Duration::from_std(ttl).unwrap_or(Duration::MAX).max(Duration::milliseconds(1));
        Self {
            store,
            ttl,
            shadow_ttl: None,
            shadow: RwLock::new(None),
        }
    }

    pub fn with_shadow(mut self, shadow_ttl: std::time::Duration) -> Self {
        self.shadow_ttl = Duration::from_std(shadow_ttl).ok().filter(|ttl| *ttl > Duration::zero());
        self
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    pub async fn get(&self) -> StoreResult<Option<StatusResponse>> {
        self.get_at(Utc::now()).await
    }

    pub async fn get_at(&self, now: DateTime<Utc>) -> StoreResult<Option<StatusResponse>> {
        if let Some(snapshot) = self.shadow_hit(now) {
            return Ok(Some(snapshot));
        }

        let Some(raw) = self.store.get(SNAPSHOT_KEY).await? else {
            return Ok(None);
        };
        let snapshot: StatusResponse = serde_json::from_str(&raw)?;

        if snapshot.is_expired_at(now) {
            debug!("Evicting expired snapshot (expired {})", snapshot.expires_at);
            self.clear_shadow();
            // a writer may have refreshed the key since the read
            self.store.delete_if(SNAPSHOT_KEY, &raw).await?;
            return Ok(None);
        }

        self.fill_shadow(&snapshot, now);
        Ok(Some(snapshot))
    }

    /// Stamps `expiresAt` and stores the snapshot, replacing any previous one.
    pub async fn set(&self, snapshot: StatusResponse) -> StoreResult<StatusResponse> {
        self.set_at(snapshot, Utc::now()).await
    }

    pub async fn set_at(&self, mut snapshot: StatusResponse, now: DateTime<Utc>) -> StoreResult<StatusResponse> {
        snapshot.expires_at = now.max(snapshot.timestamp) + self.ttl;

        let raw = serde_json::to_string(&snapshot)?;
        let backstop = snapshot.expires_at - now;
        self.store.set(SNAPSHOT_KEY, raw, Some(backstop)).await?;

        self.fill_shadow(&snapshot, now);
        Ok(snapshot)
    }

    pub async fn delete(&self) -> StoreResult<()> {
        self.clear_shadow();
        self.store.delete(SNAPSHOT_KEY).await
    }

    fn shadow_hit(&self, now: DateTime<Utc>) -> Option<StatusResponse> {
        self.shadow_ttl?;
        let shadow = self.shadow.read().unwrap_or_else(|e| e.into_inner());
        shadow
            .as_ref()
            .filter(|s| now <= s.valid_until)
            .map(|s| s.snapshot.clone())
    }

    fn fill_shadow(&self, snapshot: &StatusResponse, now: DateTime<Utc>) {
        let Some(shadow_ttl) = self.shadow_ttl else {
            return;
        };
        let valid_until = (now + shadow_ttl).min(snapshot.expires_at);
        *self.shadow.write().unwrap_or_else(|e| e.into_inner()) = Some(Shadow {
            snapshot: snapshot.clone(),
            valid_until,
        });
    }

    fn clear_shadow(&self) {
        *self.shadow.write().unwrap_or_else(|e| e.into_inner()) = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{CategoryStatus, MonitorStatus, Status};
    use crate::store::{MemoryStore, SqliteStore};
    use async_trait::async_trait;
    use chrono::TimeZone;

    /// Hands out a stale value first, as if a refresh landed right after the
    /// read.
    struct RefreshedAfterRead {
        inner: MemoryStore,
        stale: std::sync::Mutex<Option<String>>,
    }

    #[async_trait]
    impl Store for RefreshedAfterRead {
        async fn get(&self, key: &str) -> StoreResult<Option<String>> {
            if let Some(stale) = self.stale.lock().unwrap().take() {
                return Ok(Some(stale));
            }
            self.inner.get(key).await
        }

        async fn set(&self, key: &str, value: String, ttl: Option<Duration>) -> StoreResult<()> {
            self.inner.set(key, value, ttl).await
        }

        async fn delete(&self, key: &str) -> StoreResult<()> {
            self.inner.delete(key).await
        }

        async fn delete_if(&self, key: &str, expected: &str) -> StoreResult<bool> {
            self.inner.delete_if(key, expected).await
        }

        async fn keys(&self, prefix: &str) -> StoreResult<Vec<String>> {
            self.inner.keys(prefix).await
        }
    }

    fn snapshot(timestamp: DateTime<Utc>) -> StatusResponse {
        StatusResponse {
            overall_status: Status::Degraded,
            categories: vec![CategoryStatus {
                id: "core".into(),
                label: "Core".into(),
                status: Status::Degraded,
                up: 1,
                degraded: 1,
                down: 0,
                unknown: 0,
                total: 2,
            }],
            monitors: vec![MonitorStatus {
                id: "api".into(),
                label: "API".into(),
                category: "core".into(),
                url: "https://api.example.com".into(),
                status: Status::Degraded,
                status_code: Some(429),
                response_time_ms: Some(87),
                error_message: None,
                checked_at: Some(timestamp),
            }],
            timestamp,
            expires_at: timestamp,
        }
    }

    fn secs(n: u64) -> std::time::Duration {
        std::time::Duration::from_secs(n)
    }

    #[tokio::test]
    async fn empty_cache_returns_none() {
        let cache = SnapshotCache::new(Arc::new(MemoryStore::new()), secs(60));
        assert!(cache.get().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn set_stamps_expiry_after_timestamp() {
        let cache = SnapshotCache::new(Arc::new(MemoryStore::new()), secs(60));
        let now = Utc::now();
        let stored = cache.set_at(snapshot(now), now).await.unwrap();

        assert!(stored.expires_at > stored.timestamp);
        assert_eq!(stored.expires_at, now + Duration::seconds(60));
        assert_eq!(cache.get_at(now).await.unwrap(), Some(stored));
    }

    #[tokio::test]
    async fn expired_snapshot_is_evicted() {
        let store = Arc::new(MemoryStore::new());
        let cache = SnapshotCache::new(store.clone(), secs(60));
        let now = Utc::now();
        cache.set_at(snapshot(now), now).await.unwrap();

        let later = now + Duration::seconds(61);
        assert!(cache.get_at(later).await.unwrap().is_none());
        assert!(store.get(SNAPSHOT_KEY).await.unwrap().is_none());
        // a second eviction of the same key is harmless
        assert!(cache.get_at(later).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn delete_clears_snapshot_and_shadow() {
        let cache = SnapshotCache::new(Arc::new(MemoryStore::new()), secs(60)).with_shadow(secs(10));
        let now = Utc::now();
        cache.set_at(snapshot(now), now).await.unwrap();
        cache.delete().await.unwrap();
        assert!(cache.get_at(now).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn shadow_serves_without_backend() {
        let store = Arc::new(MemoryStore::new());
        let cache = SnapshotCache::new(store.clone(), secs(60)).with_shadow(secs(10));
        let now = Utc::now();
        let stored = cache.set_at(snapshot(now), now).await.unwrap();

        // remove behind the cache's back; the shadow still answers
        store.delete(SNAPSHOT_KEY).await.unwrap();
        assert_eq!(cache.get_at(now + Duration::seconds(5)).await.unwrap(), Some(stored));

        // past the shadow window the backend is consulted again
        assert!(cache.get_at(now + Duration::seconds(11)).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn shadow_never_outlives_expiry() {
        let cache = SnapshotCache::new(Arc::new(MemoryStore::new()), secs(5)).with_shadow(secs(30));
        let now = Utc::now();
        cache.set_at(snapshot(now), now).await.unwrap();
        assert!(cache.get_at(now + Duration::seconds(6)).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn persisted_round_trip_preserves_timestamps() {
        let store = Arc::new(SqliteStore::open_in_memory().unwrap());
        let cache = SnapshotCache::new(store, secs(300));

        let timestamp = Utc.timestamp_opt(1_760_000_000, 123_456_789).unwrap();
        let stored = cache.set_at(snapshot(timestamp), timestamp).await.unwrap();
        let loaded = cache.get_at(timestamp).await.unwrap().unwrap();

        assert_eq!(loaded.timestamp, timestamp);
        assert_eq!(loaded.timestamp.timestamp_subsec_nanos(), 123_456_789);
        assert_eq!(loaded.expires_at, stored.expires_at);
        assert_eq!(loaded.monitors[0].checked_at, Some(timestamp));
        assert_eq!(loaded, stored);
    }

    #[tokio::test]
    async fn eviction_keeps_snapshot_refreshed_meanwhile() {
        let now = Utc::now();
        let mut stale = snapshot(now - Duration::minutes(5));
        stale.expires_at = now - Duration::minutes(4);

        let store = Arc::new(RefreshedAfterRead {
            inner: MemoryStore::new(),
            stale: std::sync::Mutex::new(Some(serde_json::to_string(&stale).unwrap())),
        });
        let writer = SnapshotCache::new(store.clone(), secs(60));
        let fresh = writer.set_at(snapshot(now), now).await.unwrap();

        let reader = SnapshotCache::new(store.clone(), secs(60));
        assert!(reader.get_at(now).await.unwrap().is_none());
        assert_eq!(reader.get_at(now).await.unwrap(), Some(fresh));
    }
}
