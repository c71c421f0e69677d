use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use futures::future::{BoxFuture, FutureExt, Shared};
use serde::Deserialize;
use tokio::sync::Mutex;

use crate::classify::extract_base;
use crate::clock::Clock;

/// Per-route status as reported by the service-health endpoint. Declaration order is
/// significant: `Ord` derives from it, and `worst_of` relies on `Down` sorting highest.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum RouteStatus {
    Ok,
    Recovering,
    Degraded,
    Unknown,
    Down,
}

/// The wire casing of `status` isn't pinned down by anything this crate was built
/// against, so this matches case-insensitively rather than gambling on one casing.
fn parse_status(raw: &str) -> RouteStatus {
    match raw.to_ascii_lowercase().as_str() {
        "ok" => RouteStatus::Ok,
        "recovering" => RouteStatus::Recovering,
        "degraded" => RouteStatus::Degraded,
        "down" => RouteStatus::Down,
        _ => RouteStatus::Unknown,
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OverallStatus {
    Healthy,
    Degraded,
    Down,
    Unknown,
}

#[derive(Debug, Clone, Deserialize)]
struct RawRoute {
    method: String,
    path: String,
    status: String,
}

#[derive(Debug, Clone, Deserialize)]
struct RawHealthBody {
    #[serde(default)]
    routes: Vec<RawRoute>,
}

#[derive(Debug, Clone)]
pub struct RouteHealth {
    pub method: String,
    pub path: String,
    pub status: RouteStatus,
}

/// Cached result of a service-health probe, along with per-base-route status so
/// `ensure_healthy` can gate a single endpoint family without the whole service being
/// declared down.
#[derive(Debug, Clone)]
pub struct HealthSnapshot {
    pub fetched_at: u64,
    pub overall: OverallStatus,
    pub routes: Vec<RouteHealth>,
    pub base_status: HashMap<String, RouteStatus>,
}

type SharedProbe = Shared<BoxFuture<'static, HealthSnapshot>>;

/// Polls `meta/status`, caches the result for `cache_ttl`, and single-flights concurrent
/// callers that show up while a probe is already in progress.
pub struct HealthChecker {
    clock: Arc<dyn Clock>,
    http: reqwest::Client,
    status_url: url::Url,
    request_timeout: Duration,
    cache_ttl: Duration,
    snapshot: Mutex<Option<HealthSnapshot>>,
    inflight: Mutex<Option<SharedProbe>>,
}

impl HealthChecker {
    pub fn new(clock: Arc<dyn Clock>, http: reqwest::Client, base_url: &url::Url, request_timeout: Duration, cache_ttl: Duration) -> Arc<Self> {
        let status_url = base_url.join("meta/status").unwrap_or_else(|_| base_url.clone());
        Arc::new(Self {
            clock,
            http,
            status_url,
            request_timeout,
            cache_ttl,
            snapshot: Mutex::new(None),
            inflight: Mutex::new(None),
        })
    }

    /// Returns the cached snapshot if it's still fresh; otherwise probes the service,
    /// collapsing concurrent callers into a single request.
    pub async fn get_health_status(self: &Arc<Self>) -> HealthSnapshot {
        {
            let guard = self.snapshot.lock().await;
            if let Some(snap) = &*guard {
                if self.clock.now_ms().saturating_sub(snap.fetched_at) < self.cache_ttl.as_millis() as u64 {
                    return snap.clone();
                }
            }
        }

        let fut = {
            let mut inflight = self.inflight.lock().await;
            match &*inflight {
                Some(existing) => existing.clone(),
                None => {
                    let this = self.clone();
                    let fut: SharedProbe = async move { this.probe().await }.boxed().shared();
                    *inflight = Some(fut.clone());
                    fut
                }
            }
        };

        let result = fut.await;
        *self.inflight.lock().await = None;
        *self.snapshot.lock().await = Some(result.clone());
        result
    }

    pub async fn get_cached_health_status(&self) -> Option<HealthSnapshot> {
        self.snapshot.lock().await.clone()
    }

    /// Fails closed when the overall status is `Down`, or when the base route covering
    /// `endpoint` is specifically `Down` or `Unknown`. A base route with no reported
    /// status at all (not covered by the probe) is treated as healthy.
    pub async fn ensure_healthy(self: &Arc<Self>, endpoint: &str) -> Result<(), ()> {
        let snapshot = self.get_health_status().await;
        if snapshot.overall == OverallStatus::Down {
            return Err(());
        }
        match snapshot.base_status.get(&extract_base(endpoint)) {
            Some(RouteStatus::Down) | Some(RouteStatus::Unknown) => Err(()),
            _ => Ok(()),
        }
    }

    async fn probe(&self) -> HealthSnapshot {
        let now = self.clock.now_ms();
        let sent = tokio::time::timeout(self.request_timeout, self.http.get(self.status_url.clone()).send()).await;
        match sent {
            Ok(Ok(resp)) if resp.status().is_success() => match resp.json::<RawHealthBody>().await {
                Ok(body) => {
                    let routes: Vec<RouteHealth> = body
                        .routes
                        .into_iter()
                        .map(|r| RouteHealth { method: r.method, path: r.path, status: parse_status(&r.status) })
                        .collect();
                    let overall = derive_overall(&routes);
                    let base_status = derive_base_status(&routes);
                    HealthSnapshot { fetched_at: now, overall, routes, base_status }
                }
                Err(err) => {
                    tracing::warn!(%err, "failed to decode service-health response");
                    self.fallback(now).await
                }
            },
            Ok(Ok(resp)) => {
                tracing::warn!(status = %resp.status(), "service-health probe returned an error status");
                self.fallback(now).await
            }
            Ok(Err(err)) => {
                tracing::warn!(%err, "service-health probe failed");
                self.fallback(now).await
            }
            Err(_) => {
                tracing::warn!("service-health probe timed out");
                self.fallback(now).await
            }
        }
    }

    /// On a failed probe, keep serving the last known snapshot for up to five cache
    /// TTLs before giving up and reporting `Unknown`.
    async fn fallback(&self, now: u64) -> HealthSnapshot {
        let last = self.snapshot.lock().await.clone();
        if let Some(snap) = last {
            if now.saturating_sub(snap.fetched_at) < 5 * self.cache_ttl.as_millis() as u64 {
                return snap;
            }
        }
        HealthSnapshot { fetched_at: now, overall: OverallStatus::Unknown, routes: Vec::new(), base_status: HashMap::new() }
    }
}

fn derive_overall(routes: &[RouteHealth]) -> OverallStatus {
    if routes.is_empty() {
        return OverallStatus::Unknown;
    }
    let len = routes.len();
    let down = routes.iter().filter(|r| r.status == RouteStatus::Down).count();
    let degraded = routes.iter().filter(|r| r.status == RouteStatus::Degraded).count();
    let unknown = routes.iter().filter(|r| r.status == RouteStatus::Unknown).count();

    if down as f64 / len as f64 > 0.5 {
        OverallStatus::Down
    } else if down > 0 || degraded > 0 {
        OverallStatus::Degraded
    } else if unknown * 2 > len {
        OverallStatus::Unknown
    } else {
        OverallStatus::Healthy
    }
}

fn derive_base_status(routes: &[RouteHealth]) -> HashMap<String, RouteStatus> {
    let mut map: HashMap<String, RouteStatus> = HashMap::new();
    for route in routes {
        let base = extract_base(&route.path);
        map.entry(base).and_modify(|existing| *existing = (*existing).max(route.status)).or_insert(route.status);
    }
    map
}

#[cfg(test)]
mod tests {
    use super::*;

    fn route(path: &str, status: RouteStatus) -> RouteHealth {
        RouteHealth { method: "get".into(), path: path.into(), status }
    }

    #[test]
    fn status_ordering_makes_down_the_worst() {
        assert!(RouteStatus::Ok < RouteStatus::Recovering);
        assert!(RouteStatus::Recovering < RouteStatus::Degraded);
        assert!(RouteStatus::Degraded < RouteStatus::Unknown);
        assert!(RouteStatus::Unknown < RouteStatus::Down);
    }

    #[test]
    fn overall_status_escalates_with_proportion_down() {
        let mostly_down = vec![route("/characters/{id}/assets/", RouteStatus::Down); 3]
            .into_iter()
            .chain(vec![route("/markets/{id}/orders/", RouteStatus::Ok)])
            .collect::<Vec<_>>();
        assert_eq!(derive_overall(&mostly_down), OverallStatus::Down);

        let one_degraded = vec![route("/a/", RouteStatus::Degraded), route("/b/", RouteStatus::Ok)];
        assert_eq!(derive_overall(&one_degraded), OverallStatus::Degraded);

        let all_ok = vec![route("/a/", RouteStatus::Ok), route("/b/", RouteStatus::Recovering)];
        assert_eq!(derive_overall(&all_ok), OverallStatus::Healthy);
    }

    #[test]
    fn parse_status_is_case_insensitive() {
        assert_eq!(parse_status("OK"), RouteStatus::Ok);
        assert_eq!(parse_status("Down"), RouteStatus::Down);
        assert_eq!(parse_status("DEGRADED"), RouteStatus::Degraded);
        assert_eq!(parse_status("something else"), RouteStatus::Unknown);
    }

    #[test]
    fn base_status_takes_the_worst_route_per_base() {
        let routes = vec![
            route("/characters/{id}/assets/", RouteStatus::Ok),
            route("/characters/{id}/wallet/", RouteStatus::Down),
        ];
        let map = derive_base_status(&routes);
        assert_eq!(map.get("/characters/"), Some(&RouteStatus::Down));
    }
}
