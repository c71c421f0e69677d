use std::collections::HashMap;
use std::time::Duration;

/// The default ESI compatibility date sent on every request via `X-Compatibility-Date`.
pub const DEFAULT_COMPATIBILITY_DATE: &str = "2025-11-06";

/// Per-group thresholds that decide when the pipeline starts spacing out requests as a
/// rate-limit window runs low. `warn_at`/`slowdown_at` are fractions of `remaining/limit`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct GroupOverride {
    pub warn_at: f64,
    pub slowdown_at: f64,
}

impl Default for GroupOverride {
    fn default() -> Self {
        Self { warn_at: 0.2, slowdown_at: 0.15 }
    }
}

/// Every tunable the pipeline needs. Construct with [`Config::new`] and adjust with
/// the `with_*` builder methods, mirroring how `RateLimitPolicy` is assembled in the
/// rate-limiting reference this crate is built against.
#[derive(Debug, Clone)]
pub struct Config {
    pub base_url: url::Url,
    pub compatibility_date: String,
    pub user_agent: String,
    pub cache_max_entries: usize,
    pub cache_save_debounce: Duration,
    pub rate_limit_save_debounce: Duration,
    pub request_timeout: Duration,
    pub health_request_timeout: Duration,
    pub health_cache_ttl: Duration,
    pub max_retries: u32,
    pub max_timeout_retries: u32,
    pub max_concurrent_pages: usize,
    pub contract_items_per_window: usize,
    pub group_overrides: HashMap<String, GroupOverride>,
}

impl Config {
    pub fn new(base_url: url::Url, user_agent: impl Into<String>) -> Self {
        Self {
            base_url,
            compatibility_date: DEFAULT_COMPATIBILITY_DATE.to_string(),
            user_agent: user_agent.into(),
            cache_max_entries: 5_000,
            cache_save_debounce: Duration::from_millis(1_000),
            rate_limit_save_debounce: Duration::from_millis(5_000),
            request_timeout: Duration::from_millis(30_000),
            health_request_timeout: Duration::from_millis(5_000),
            health_cache_ttl: Duration::from_millis(60_000),
            max_retries: 3,
            max_timeout_retries: 2,
            max_concurrent_pages: 4,
            contract_items_per_window: 20,
            group_overrides: default_group_overrides(),
        }
    }

    pub fn with_compatibility_date(mut self, date: impl Into<String>) -> Self {
        self.compatibility_date = date.into();
        self
    }

    pub fn with_cache_max_entries(mut self, n: usize) -> Self {
        self.cache_max_entries = n;
        self
    }

    pub fn with_cache_save_debounce(mut self, d: Duration) -> Self {
        self.cache_save_debounce = d;
        self
    }

    pub fn with_rate_limit_save_debounce(mut self, d: Duration) -> Self {
        self.rate_limit_save_debounce = d;
        self
    }

    pub fn with_request_timeout(mut self, d: Duration) -> Self {
        self.request_timeout = d;
        self
    }

    pub fn with_health_request_timeout(mut self, d: Duration) -> Self {
        self.health_request_timeout = d;
        self
    }

    pub fn with_health_cache_ttl(mut self, d: Duration) -> Self {
        self.health_cache_ttl = d;
        self
    }

    pub fn with_max_retries(mut self, n: u32) -> Self {
        self.max_retries = n;
        self
    }

    pub fn with_max_timeout_retries(mut self, n: u32) -> Self {
        self.max_timeout_retries = n;
        self
    }

    pub fn with_max_concurrent_pages(mut self, n: usize) -> Self {
        self.max_concurrent_pages = n;
        self
    }

    pub fn with_contract_items_per_window(mut self, n: usize) -> Self {
        self.contract_items_per_window = n;
        self
    }

    pub fn with_group_override(mut self, group: impl Into<String>, override_: GroupOverride) -> Self {
        self.group_overrides.insert(group.into(), override_);
        self
    }
}

fn default_group_overrides() -> HashMap<String, GroupOverride> {
    let mut m = HashMap::new();
    m.insert("char-wallet".to_string(), GroupOverride { warn_at: 0.3, slowdown_at: 0.2 });
    m.insert("corp-wallet".to_string(), GroupOverride { warn_at: 0.25, slowdown_at: 0.15 });
    m
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_config_carries_the_known_wallet_overrides() {
        let config = Config::new(url::Url::parse("https://esi.example/").unwrap(), "test/0.0");
        assert_eq!(config.group_overrides.get("char-wallet"), Some(&GroupOverride { warn_at: 0.3, slowdown_at: 0.2 }));
        assert_eq!(config.group_overrides.get("corp-wallet"), Some(&GroupOverride { warn_at: 0.25, slowdown_at: 0.15 }));
    }

    #[test]
    fn with_group_override_replaces_or_adds_a_group() {
        let config = Config::new(url::Url::parse("https://esi.example/").unwrap(), "test/0.0")
            .with_group_override("markets", GroupOverride { warn_at: 0.1, slowdown_at: 0.05 });
        assert_eq!(config.group_overrides.get("markets"), Some(&GroupOverride { warn_at: 0.1, slowdown_at: 0.05 }));
    }
}
