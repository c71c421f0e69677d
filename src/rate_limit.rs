use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;

use crate::clock::Clock;
use crate::config::GroupOverride;
use crate::debounce::{Debouncer, Persist};
use crate::persistence::StateStore;
use crate::rng::JitterRng;

const RATE_LIMIT_FILE_NAME: &str = "rate-limits.json";
const CONTRACT_ITEMS_WINDOW_MS: u64 = 10_000;

/// Snapshot of the header-reported rate-limit window for one `(principal, group)` pair.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct RateLimitGroupState {
    pub remaining: u32,
    pub limit: u32,
    pub window_ms: u64,
    pub window_start: u64,
}

/// Tracks per-group rate-limit windows (from response headers), a global cooldown (from
/// a 429/420's `Retry-After`), and the contract-items burst window, with the same state
/// persisted to survive a restart.
pub struct RateLimitTracker {
    clock: Arc<dyn Clock>,
    rng: Arc<dyn JitterRng>,
    group_overrides: HashMap<String, GroupOverride>,
    contract_items_per_window: usize,
    state: Mutex<HashMap<String, RateLimitGroupState>>,
    global_retry_until: Mutex<Option<u64>>,
    contract_windows: Mutex<HashMap<String, VecDeque<u64>>>,
    store: Arc<dyn StateStore>,
    debouncer: Arc<Debouncer>,
}

impl RateLimitTracker {
    pub fn new(
        clock: Arc<dyn Clock>,
        rng: Arc<dyn JitterRng>,
        group_overrides: HashMap<String, GroupOverride>,
        contract_items_per_window: usize,
        store: Arc<dyn StateStore>,
        save_debounce: Duration,
    ) -> Arc<Self> {
        Arc::new(Self {
            clock,
            rng,
            group_overrides,
            contract_items_per_window: contract_items_per_window.max(1),
            state: Mutex::new(HashMap::new()),
            global_retry_until: Mutex::new(None),
            contract_windows: Mutex::new(HashMap::new()),
            store,
            debouncer: Debouncer::new(save_debounce),
        })
    }

    pub async fn load(&self) {
        let Some(bytes) = self.store.load(RATE_LIMIT_FILE_NAME).await else { return };
        match serde_json::from_slice::<HashMap<String, RateLimitGroupState>>(&bytes) {
            Ok(map) => {
                let now = self.clock.now_ms();
                let mut guard = self.state.lock().await;
                for (key, state) in map {
                    if now.saturating_sub(state.window_start) < state.window_ms {
                        guard.insert(key, state);
                    }
                }
            }
            Err(err) => tracing::warn!(%err, "failed to parse rate-limit snapshot; starting empty"),
        }
    }

    /// Folds `X-Ratelimit-*` response headers into the tracked state for this
    /// principal/group. A window reset is detected by `remaining` going up rather than
    /// down since the last observation.
    pub async fn update_from_headers(self: &Arc<Self>, principal_id: u64, headers: &reqwest::header::HeaderMap) {
        let Some(group) = header_str(headers, "X-Ratelimit-Group") else { return };
        let Some(remaining) = header_str(headers, "X-Ratelimit-Remaining").and_then(|s| s.parse::<u32>().ok()) else { return };
        let (limit, window_ms) = header_str(headers, "X-Ratelimit-Limit")
            .and_then(parse_limit_header)
            .unwrap_or((150, 15 * 60_000));

        let now = self.clock.now_ms();
        let key = format!("{principal_id}:{group}");
        {
            let mut guard = self.state.lock().await;
            let window_start = match guard.get(&key) {
                Some(prev) if remaining > prev.remaining => now,
                Some(prev) => prev.window_start,
                None => now,
            };
            guard.insert(key, RateLimitGroupState { remaining, limit, window_ms, window_start });
        }
        self.persist().await;
    }

    pub async fn set_global_retry_after(&self, seconds: u64) {
        let until = self.clock.now_ms() + seconds * 1_000;
        *self.global_retry_until.lock().await = Some(until);
    }

    /// Remaining cooldown in milliseconds, or `None` if there's no active cooldown.
    pub async fn get_global_retry_after(&self) -> Option<u64> {
        let mut guard = self.global_retry_until.lock().await;
        match *guard {
            Some(until) => {
                let now = self.clock.now_ms();
                if now >= until {
                    *guard = None;
                    None
                } else {
                    Some(until - now)
                }
            }
            None => None,
        }
    }

    /// How long to wait, in milliseconds, before the next request against this
    /// principal/group. A global cooldown always wins; absent one, the delay grows as
    /// the tracked window's `remaining` fraction shrinks, with jitter so concurrent
    /// callers don't all wake up at once.
    pub async fn get_delay_ms(&self, principal_id: u64, group: &str) -> u64 {
        if let Some(wait) = self.get_global_retry_after().await {
            return wait;
        }

        let now = self.clock.now_ms();
        let key = format!("{principal_id}:{group}");
        let state = self.state.lock().await.get(&key).copied();
        let Some(state) = state else { return 100 };

        let elapsed = now.saturating_sub(state.window_start);
        if elapsed >= state.window_ms {
            self.state.lock().await.remove(&key);
            return 100;
        }
        if state.remaining == 0 {
            return state.window_ms.saturating_sub(elapsed);
        }

        let pct = state.remaining as f64 / state.limit.max(1) as f64;
        let GroupOverride { warn_at, slowdown_at } = self.group_overrides.get(group).copied().unwrap_or_default();

        if pct < 0.05 {
            self.rng.gen_range_ms(2_000, 5_000)
        } else if pct < slowdown_at {
            self.rng.gen_range_ms(500, 2_000)
        } else if pct < warn_at {
            self.rng.gen_range_ms(100, 500)
        } else {
            100
        }
    }

    pub async fn record_contract_items_request(&self, principal_id: u64) {
        let now = self.clock.now_ms();
        let mut guard = self.contract_windows.lock().await;
        let deque = guard.entry(principal_id.to_string()).or_default();
        deque.push_back(now);
        prune_window(deque, now);
    }

    pub async fn get_contract_items_delay(&self, principal_id: u64) -> u64 {
        let now = self.clock.now_ms();
        let mut guard = self.contract_windows.lock().await;
        let Some(deque) = guard.get_mut(&principal_id.to_string()) else { return 0 };
        prune_window(deque, now);
        if deque.len() < self.contract_items_per_window {
            return 0;
        }
        let oldest = *deque.front().expect("window is non-empty since len >= 1");
        CONTRACT_ITEMS_WINDOW_MS.saturating_sub(now.saturating_sub(oldest))
    }
}

fn prune_window(deque: &mut VecDeque<u64>, now: u64) {
    while let Some(&front) = deque.front() {
        if now.saturating_sub(front) > CONTRACT_ITEMS_WINDOW_MS {
            deque.pop_front();
        } else {
            break;
        }
    }
}

fn header_str<'a>(headers: &'a reqwest::header::HeaderMap, name: &str) -> Option<&'a str> {
    headers.get(name).and_then(|v| v.to_str().ok())
}

/// Parses a `"<limit>/<count><unit>"` window spec, e.g. `"150/15m"` → limit 150 over a
/// 15-minute window. Unrecognized units fail to parse so the caller can fall back to a
/// sane default.
fn parse_limit_header(value: &str) -> Option<(u32, u64)> {
    let (limit_str, rest) = value.split_once('/')?;
    let limit: u32 = limit_str.parse().ok()?;
    let unit_pos = rest.find(|c: char| c.is_ascii_alphabetic())?;
    let (count_str, unit) = rest.split_at(unit_pos);
    let count: u64 = count_str.parse().ok()?;
    let multiplier = match unit {
        "s" => 1_000,
        "m" => 60_000,
        "h" => 3_600_000,
        _ => return None,
    };
    Some((limit, count * multiplier))
}

#[async_trait::async_trait]
impl Persist for RateLimitTracker {
    async fn persist_now(&self) {
        let snapshot = self.state.lock().await.clone();
        match serde_json::to_vec(&snapshot) {
            Ok(bytes) => {
                if let Err(err) = self.store.save(RATE_LIMIT_FILE_NAME, bytes).await {
                    tracing::warn!(%err, "failed to persist rate-limit state");
                }
            }
            Err(err) => tracing::warn!(%err, "failed to serialize rate-limit state"),
        }
    }
}

impl RateLimitTracker {
    pub async fn persist(self: &Arc<Self>) {
        let target: Arc<dyn Persist> = self.clone();
        self.debouncer.schedule(target).await;
    }

    pub async fn save_immediately(self: &Arc<Self>) {
        let target: Arc<dyn Persist> = self.clone();
        self.debouncer.flush_now(&target).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::TestClock;
    use crate::persistence::InMemoryStateStore;
    use crate::rng::FixedRng;
    use reqwest::header::{HeaderMap, HeaderValue};

    fn headers(group: &str, remaining: &str, limit: &str) -> HeaderMap {
        let mut h = HeaderMap::new();
        h.insert("X-Ratelimit-Group", HeaderValue::from_str(group).unwrap());
        h.insert("X-Ratelimit-Remaining", HeaderValue::from_str(remaining).unwrap());
        h.insert("X-Ratelimit-Limit", HeaderValue::from_str(limit).unwrap());
        h
    }

    fn tracker(clock: TestClock) -> Arc<RateLimitTracker> {
        RateLimitTracker::new(
            Arc::new(clock),
            Arc::new(FixedRng(300)),
            HashMap::new(),
            20,
            Arc::new(InMemoryStateStore::new()),
            Duration::from_millis(10),
        )
    }

    #[test]
    fn parses_window_spec() {
        assert_eq!(parse_limit_header("150/15m"), Some((150, 900_000)));
        assert_eq!(parse_limit_header("20/10s"), Some((20, 20_000)));
        assert_eq!(parse_limit_header("garbage"), None);
    }

    #[tokio::test]
    async fn delay_grows_as_window_depletes() {
        let clock = TestClock::new(0);
        let t = tracker(clock);
        // 40/150 = 0.267, above the default warn_at (0.2): no jitter yet.
        t.update_from_headers(1, &headers("char-asset", "40", "150/15m")).await;
        assert_eq!(t.get_delay_ms(1, "char-asset").await, 100);

        // 10/150 = 0.067, below slowdown_at (0.15) but above 0.05: medium jitter band.
        t.update_from_headers(1, &headers("char-asset", "10", "150/15m")).await;
        assert_eq!(t.get_delay_ms(1, "char-asset").await, 500);

        // 5/150 = 0.033, below the 0.05 floor: the most severe jitter band.
        t.update_from_headers(1, &headers("char-asset", "5", "150/15m")).await;
        assert_eq!(t.get_delay_ms(1, "char-asset").await, 2000);
    }

    #[tokio::test]
    async fn zero_remaining_waits_out_the_window() {
        let clock = TestClock::new(1_000);
        let t = tracker(clock);
        t.update_from_headers(1, &headers("char-asset", "0", "150/15m")).await;
        let delay = t.get_delay_ms(1, "char-asset").await;
        assert_eq!(delay, 900_000);
    }

    #[tokio::test]
    async fn global_retry_after_overrides_group_state() {
        let clock = TestClock::new(0);
        let t = tracker(clock);
        t.set_global_retry_after(5).await;
        assert_eq!(t.get_global_retry_after().await, Some(5_000));
        assert_eq!(t.get_delay_ms(1, "anything").await, 5_000);
    }

    #[tokio::test]
    async fn contract_items_window_throttles_after_the_cap() {
        let clock = TestClock::new(0);
        let t = tracker(clock.clone());
        for _ in 0..20 {
            t.record_contract_items_request(1).await;
        }
        assert!(t.get_contract_items_delay(1).await > 0);

        clock.advance(10_001);
        assert_eq!(t.get_contract_items_delay(1).await, 0);
    }
}
