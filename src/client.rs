use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use tokio::sync::{Mutex, RwLock};

use crate::cache::ResponseCache;
use crate::clock::{Clock, SystemClock};
use crate::config::Config;
use crate::error::EsiError;
use crate::health::{HealthChecker, HealthSnapshot};
use crate::persistence::{InMemoryStateStore, StateStore};
use crate::pipeline::{FetchOptions, SharedResponse, WithMeta};
use crate::rate_limit::RateLimitTracker;
use crate::rng::{JitterRng, ThreadRng};
use crate::token_provider::{NoTokenProvider, TokenProvider};

/// The process-wide authenticated client. Cheap to clone (it's handed out as an
/// `Arc<EsiClient>`); every field that needs interior mutability is behind its own
/// lock so concurrent callers never block each other on unrelated state.
pub struct EsiClient {
    pub(crate) config: Config,
    pub(crate) http: reqwest::Client,
    pub(crate) cache: Arc<ResponseCache>,
    pub(crate) rate_limit: Arc<RateLimitTracker>,
    pub(crate) health: Arc<HealthChecker>,
    token_provider: RwLock<Arc<dyn TokenProvider>>,
    inflight: Mutex<HashMap<String, SharedResponse>>,
    paused: AtomicBool,
    active_requests: AtomicU64,
}

/// Snapshot of rate-limit and load state, useful for surfacing in a status bar.
#[derive(Debug, Clone, Copy)]
pub struct RateLimitInfo {
    pub global_retry_after_ms: Option<u64>,
    pub active_requests: u64,
}

impl EsiClient {
    pub fn builder(config: Config) -> EsiClientBuilder {
        EsiClientBuilder::new(config)
    }

    pub async fn fetch<T: serde::de::DeserializeOwned>(self: &Arc<Self>, endpoint: &str, options: FetchOptions) -> Result<T, EsiError> {
        let resp = self.execute_with_rate_limit(endpoint, options).await?;
        serde_json::from_value(resp.data).map_err(|err| EsiError::new(format!("failed to decode response: {err}"), 0))
    }

    /// Like [`Self::fetch`], but returns cache metadata alongside the decoded value.
    /// When the cache already holds a fresh, non-preempted entry, this short-circuits
    /// without going through the pipeline at all.
    pub async fn fetch_with_meta<T: serde::de::DeserializeOwned>(self: &Arc<Self>, endpoint: &str, options: FetchOptions) -> Result<WithMeta<T>, EsiError> {
        if options.etag_override.is_none() {
            let key = ResponseCache::make_key(options.character_id, endpoint, options.language.as_deref());
            if let Some(entry) = self.cache.get(&key).await {
                let data: T = serde_json::from_value(entry.data)
                    .map_err(|err| EsiError::new(format!("failed to decode cached response: {err}"), 0))?;
                return Ok(WithMeta { data, expires_at: Some(entry.expires_at), etag: Some(entry.etag), not_modified: true });
            }
        }

        let resp = self.execute_with_rate_limit(endpoint, options).await?;
        let data: T = serde_json::from_value(resp.data).map_err(|err| EsiError::new(format!("failed to decode response: {err}"), 0))?;
        Ok(WithMeta { data, expires_at: resp.meta.expires_at, etag: resp.meta.etag, not_modified: resp.meta.not_modified })
    }

    pub async fn clear_cache(self: &Arc<Self>) {
        self.cache.clear().await;
    }

    pub async fn clear_cache_by_pattern(self: &Arc<Self>, pattern: &str) -> usize {
        self.cache.clear_by_pattern(pattern).await
    }

    pub fn pause(&self) {
        self.paused.store(true, Ordering::SeqCst);
    }

    pub fn resume(&self) {
        self.paused.store(false, Ordering::SeqCst);
    }

    pub(crate) fn is_paused(&self) -> bool {
        self.paused.load(Ordering::SeqCst)
    }

    pub async fn get_health_status(self: &Arc<Self>) -> HealthSnapshot {
        self.health.get_health_status().await
    }

    pub async fn get_cached_health_status(&self) -> Option<HealthSnapshot> {
        self.health.get_cached_health_status().await
    }

    pub async fn get_rate_limit_info(&self) -> RateLimitInfo {
        RateLimitInfo {
            global_retry_after_ms: self.rate_limit.get_global_retry_after().await,
            active_requests: self.active_requests.load(Ordering::SeqCst),
        }
    }

    pub async fn set_token_provider(&self, provider: Arc<dyn TokenProvider>) {
        *self.token_provider.write().await = provider;
    }

    pub(crate) async fn token_provider(&self) -> Arc<dyn TokenProvider> {
        self.token_provider.read().await.clone()
    }

    /// Flushes both the response cache and the rate-limit tracker to the state store
    /// right away, bypassing their debounce windows. Also run on drop, best-effort.
    pub async fn save_immediately(self: &Arc<Self>) {
        self.cache.save_immediately().await;
        self.rate_limit.save_immediately().await;
    }

    /// Atomically checks the in-flight table and registers `fut` as the entry for `key`
    /// if nothing is already there. Must be a single critical section: any `await`
    /// between the check and the insert would let two concurrent callers both observe
    /// a miss and both dispatch their own transport call. Returns the future everyone
    /// should await, plus whether the caller is the one that registered it (and is
    /// therefore responsible for removing it once it resolves).
    pub(crate) async fn inflight_get_or_insert(&self, key: String, fut: SharedResponse) -> (SharedResponse, bool) {
        let mut guard = self.inflight.lock().await;
        match guard.get(&key) {
            Some(existing) => (existing.clone(), false),
            None => {
                guard.insert(key, fut.clone());
                (fut, true)
            }
        }
    }

    pub(crate) async fn inflight_remove(&self, key: &str) {
        self.inflight.lock().await.remove(key);
    }

    pub(crate) fn enter_active_request(self: &Arc<Self>) -> ActiveRequestGuard {
        self.active_requests.fetch_add(1, Ordering::SeqCst);
        ActiveRequestGuard { client: self.clone() }
    }
}

impl Drop for EsiClient {
    /// Best-effort flush: if a save is still debounced when the last handle to the
    /// client is dropped, fire it off on the current runtime rather than lose it.
    /// Callers that care about durability should still call `save_immediately`
    /// explicitly before shutting down.
    fn drop(&mut self) {
        if let Ok(handle) = tokio::runtime::Handle::try_current() {
            let cache = self.cache.clone();
            let rate_limit = self.rate_limit.clone();
            handle.spawn(async move {
                cache.save_immediately().await;
                rate_limit.save_immediately().await;
            });
        }
    }
}

pub(crate) struct ActiveRequestGuard {
    client: Arc<EsiClient>,
}

impl Drop for ActiveRequestGuard {
    fn drop(&mut self) {
        self.client.active_requests.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Assembles an [`EsiClient`], wiring in whichever clock, RNG, token provider, and
/// state store the caller needs, with in-memory/system defaults for everything not
/// explicitly set.
pub struct EsiClientBuilder {
    config: Config,
    token_provider: Arc<dyn TokenProvider>,
    state_store: Arc<dyn StateStore>,
    clock: Arc<dyn Clock>,
    rng: Arc<dyn JitterRng>,
}

impl EsiClientBuilder {
    pub fn new(config: Config) -> Self {
        Self {
            config,
            token_provider: Arc::new(NoTokenProvider),
            state_store: Arc::new(InMemoryStateStore::new()),
            clock: Arc::new(SystemClock),
            rng: Arc::new(ThreadRng),
        }
    }

    pub fn token_provider(mut self, provider: Arc<dyn TokenProvider>) -> Self {
        self.token_provider = provider;
        self
    }

    pub fn state_store(mut self, store: Arc<dyn StateStore>) -> Self {
        self.state_store = store;
        self
    }

    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn rng(mut self, rng: Arc<dyn JitterRng>) -> Self {
        self.rng = rng;
        self
    }

    /// Builds the client and reloads persisted cache/rate-limit state from the
    /// configured store.
    pub async fn build(self) -> Arc<EsiClient> {
        let http = reqwest::Client::builder()
            .user_agent(self.config.user_agent.clone())
            .build()
            .expect("reqwest client configuration is always valid");

        let cache = ResponseCache::new(self.clock.clone(), self.state_store.clone(), self.config.cache_max_entries, self.config.cache_save_debounce);
        let rate_limit = RateLimitTracker::new(
            self.clock.clone(),
            self.rng.clone(),
            self.config.group_overrides.clone(),
            self.config.contract_items_per_window,
            self.state_store.clone(),
            self.config.rate_limit_save_debounce,
        );
        let health = HealthChecker::new(self.clock.clone(), http.clone(), &self.config.base_url, self.config.health_request_timeout, self.config.health_cache_ttl);

        cache.load().await;
        rate_limit.load().await;

        Arc::new(EsiClient {
            config: self.config,
            http,
            cache,
            rate_limit,
            health,
            token_provider: RwLock::new(self.token_provider),
            inflight: Mutex::new(HashMap::new()),
            paused: AtomicBool::new(false),
            active_requests: AtomicU64::new(0),
        })
    }
}
