use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;

use crate::clock::Clock;
use crate::debounce::{Debouncer, Persist};
use crate::persistence::StateStore;

const CACHE_FILE_NAME: &str = "esi-cache.json";
const CACHE_FORMAT_VERSION: u32 = 1;

/// An ETag-addressable cached response, with the expiry the server handed us.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheEntry {
    pub data: serde_json::Value,
    pub etag: String,
    pub expires_at: u64,
}

#[derive(Debug, Serialize, Deserialize)]
struct PersistedPayload {
    data: serde_json::Value,
    etag: String,
    expires: u64,
}

#[derive(Debug, Serialize, Deserialize)]
struct PersistedEntry {
    key: String,
    entry: PersistedPayload,
}

#[derive(Debug, Serialize, Deserialize)]
struct PersistedCache {
    version: u32,
    entries: Vec<PersistedEntry>,
}

/// Bounded, TTL-aware, ETag-aware response cache. One entry per `(principal, language,
/// endpoint)` tuple. Entries past their expiry are invisible to [`ResponseCache::get`]
/// but kept around (for [`ResponseCache::get_stale`] / [`ResponseCache::get_etag`]) so a
/// 304 response can revalidate them without a second round trip.
pub struct ResponseCache {
    clock: Arc<dyn Clock>,
    max_entries: usize,
    state: Mutex<HashMap<String, CacheEntry>>,
    store: Arc<dyn StateStore>,
    debouncer: Arc<Debouncer>,
}

impl ResponseCache {
    pub fn new(clock: Arc<dyn Clock>, store: Arc<dyn StateStore>, max_entries: usize, save_debounce: Duration) -> Arc<Self> {
        Arc::new(Self {
            clock,
            max_entries: max_entries.max(1),
            state: Mutex::new(HashMap::new()),
            store,
            debouncer: Debouncer::new(save_debounce),
        })
    }

    pub fn make_key(character_id: Option<u64>, endpoint: &str, language: Option<&str>) -> String {
        let principal = character_id.map(|c| c.to_string()).unwrap_or_else(|| "public".to_string());
        let lang = language.unwrap_or("en");
        format!("{principal}:{lang}:{endpoint}")
    }

    /// Loads whatever was persisted on a previous run. Safe to call once at startup;
    /// a missing or unreadable blob just leaves the cache empty.
    pub async fn load(&self) {
        let Some(bytes) = self.store.load(CACHE_FILE_NAME).await else { return };
        match serde_json::from_slice::<PersistedCache>(&bytes) {
            Ok(blob) if blob.version == CACHE_FORMAT_VERSION => {
                let mut guard = self.state.lock().await;
                for entry in blob.entries {
                    guard.insert(entry.key, CacheEntry { data: entry.entry.data, etag: entry.entry.etag, expires_at: entry.entry.expires });
                }
            }
            Ok(_) => tracing::warn!("ignoring response cache snapshot with unrecognized version"),
            Err(err) => tracing::warn!(%err, "failed to parse response cache snapshot; starting empty"),
        }
    }

    pub async fn get(&self, key: &str) -> Option<CacheEntry> {
        let now = self.clock.now_ms();
        self.state.lock().await.get(key).filter(|e| now < e.expires_at).cloned()
    }

    /// Like [`Self::get`], but ignores expiry. Used to recover the cached body on a
    /// 304 response, whether or not the locally-tracked expiry had already elapsed.
    pub async fn get_stale(&self, key: &str) -> Option<CacheEntry> {
        self.state.lock().await.get(key).cloned()
    }

    pub async fn get_etag(&self, key: &str) -> Option<String> {
        self.state.lock().await.get(key).map(|e| e.etag.clone())
    }

    pub async fn set(self: &Arc<Self>, key: String, data: serde_json::Value, etag: String, expires_at: u64) {
        {
            let mut guard = self.state.lock().await;
            if !guard.contains_key(&key) && guard.len() + 1 > self.max_entries {
                let now = self.clock.now_ms();
                evict(&mut guard, self.max_entries, now);
            }
            guard.insert(key, CacheEntry { data, etag, expires_at });
        }
        self.schedule_save().await;
    }

    /// Called on a 304 to push the expiry out without touching the cached body.
    pub async fn update_expires(self: &Arc<Self>, key: &str, expires_at: u64) {
        let changed = {
            let mut guard = self.state.lock().await;
            match guard.get_mut(key) {
                Some(entry) => {
                    entry.expires_at = expires_at;
                    true
                }
                None => false,
            }
        };
        if changed {
            self.schedule_save().await;
        }
    }

    pub async fn delete(self: &Arc<Self>, key: &str) {
        let removed = self.state.lock().await.remove(key).is_some();
        if removed {
            self.schedule_save().await;
        }
    }

    pub async fn clear(self: &Arc<Self>) {
        self.state.lock().await.clear();
        self.schedule_save().await;
    }

    pub async fn clear_by_pattern(self: &Arc<Self>, pattern: &str) -> usize {
        let removed = {
            let mut guard = self.state.lock().await;
            let keys: Vec<String> = guard.keys().filter(|k| k.contains(pattern)).cloned().collect();
            for key in &keys {
                guard.remove(key);
            }
            keys.len()
        };
        if removed > 0 {
            self.schedule_save().await;
        }
        removed
    }

    pub async fn len(&self) -> usize {
        self.state.lock().await.len()
    }

    async fn schedule_save(self: &Arc<Self>) {
        let target: Arc<dyn Persist> = self.clone();
        self.debouncer.schedule(target).await;
    }

    pub async fn save_immediately(self: &Arc<Self>) {
        let target: Arc<dyn Persist> = self.clone();
        self.debouncer.flush_now(&target).await;
    }
}

/// Drops entries past their expiry first, then evicts the entries with the oldest
/// `expires_at` until the map is back under 90% of its cap, leaving headroom so every
/// insert doesn't trigger another eviction pass.
fn evict(map: &mut HashMap<String, CacheEntry>, max_entries: usize, now: u64) {
    map.retain(|_, e| e.expires_at >= now);
    let target = ((max_entries as f64) * 0.9).floor() as usize;
    while map.len() > target {
        let Some(oldest) = map.iter().min_by_key(|(_, e)| e.expires_at).map(|(k, _)| k.clone()) else { break };
        map.remove(&oldest);
    }
}

#[async_trait::async_trait]
impl Persist for ResponseCache {
    async fn persist_now(&self) {
        let now = self.clock.now_ms();
        let entries: Vec<PersistedEntry> = {
            let guard = self.state.lock().await;
            guard
                .iter()
                .filter(|(_, e)| e.expires_at > now)
                .map(|(key, e)| PersistedEntry {
                    key: key.clone(),
                    entry: PersistedPayload { data: e.data.clone(), etag: e.etag.clone(), expires: e.expires_at },
                })
                .collect()
        };
        let blob = PersistedCache { version: CACHE_FORMAT_VERSION, entries };
        match serde_json::to_vec(&blob) {
            Ok(bytes) => {
                if let Err(err) = self.store.save(CACHE_FILE_NAME, bytes).await {
                    tracing::warn!(%err, "failed to persist response cache");
                }
            }
            Err(err) => tracing::warn!(%err, "failed to serialize response cache"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::TestClock;
    use crate::persistence::InMemoryStateStore;
    use serde_json::json;

    fn cache_with(max_entries: usize, clock: TestClock) -> Arc<ResponseCache> {
        ResponseCache::new(Arc::new(clock), Arc::new(InMemoryStateStore::new()), max_entries, Duration::from_millis(10))
    }

    #[tokio::test]
    async fn get_hides_expired_entries_but_get_stale_still_sees_them() {
        let clock = TestClock::new(1_000);
        let cache = cache_with(10, clock.clone());
        cache.set("k".into(), json!({"a": 1}), "etag-1".into(), 2_000).await;

        assert!(cache.get("k").await.is_some());
        clock.set(2_500);
        assert!(cache.get("k").await.is_none());
        assert!(cache.get_stale("k").await.is_some());
        assert_eq!(cache.get_etag("k").await.as_deref(), Some("etag-1"));
    }

    #[tokio::test]
    async fn update_expires_keeps_cached_body_on_revalidation() {
        let clock = TestClock::new(0);
        let cache = cache_with(10, clock);
        cache.set("k".into(), json!([1, 2, 3]), "etag-1".into(), 1_000).await;
        cache.update_expires("k", 5_000).await;

        let entry = cache.get("k").await.unwrap();
        assert_eq!(entry.data, json!([1, 2, 3]));
        assert_eq!(entry.expires_at, 5_000);
    }

    #[tokio::test]
    async fn eviction_drops_expired_first_then_oldest_expiry() {
        let clock = TestClock::new(0);
        let cache = cache_with(5, clock.clone());
        for i in 0..4 {
            cache.set(format!("k{i}"), json!(i), format!("e{i}"), 100 + i as u64).await;
        }
        // k0's expiry already elapsed; inserting a 5th entry should trigger eviction
        // and drop it first rather than falling through to LRU-by-expiry logic.
        clock.set(101);
        cache.set("k4".into(), json!(4), "e4".into(), 200).await;

        assert!(cache.get_stale("k0").await.is_none());
        assert_eq!(cache.len().await, 4);
    }

    #[tokio::test]
    async fn clear_by_pattern_removes_only_matching_keys() {
        let clock = TestClock::new(0);
        let cache = cache_with(10, clock);
        cache.set("5:en:/characters/5/assets/".into(), json!([]), "e1".into(), 1_000).await;
        cache.set("5:en:/characters/5/wallet/".into(), json!([]), "e2".into(), 1_000).await;
        cache.set("6:en:/characters/6/assets/".into(), json!([]), "e3".into(), 1_000).await;

        let removed = cache.clear_by_pattern("5:en:").await;
        assert_eq!(removed, 2);
        assert_eq!(cache.len().await, 1);
    }

    #[tokio::test]
    async fn persist_then_load_round_trips_unexpired_entries() {
        let clock = TestClock::new(0);
        let store = Arc::new(InMemoryStateStore::new());
        let cache = ResponseCache::new(Arc::new(clock.clone()), store.clone(), 10, Duration::from_millis(1));
        cache.set("k".into(), json!({"a": 1}), "etag-1".into(), 1_000).await;
        cache.set("expired".into(), json!(1), "etag-2".into(), 50).await;
        clock.set(100);
        cache.save_immediately().await;

        let reloaded = ResponseCache::new(Arc::new(clock), store, 10, Duration::from_millis(1));
        reloaded.load().await;
        assert!(reloaded.get_stale("k").await.is_some());
        assert!(reloaded.get_stale("expired").await.is_none());
    }
}
