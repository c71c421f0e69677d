use std::sync::Arc;
use std::time::Duration;

use futures::future::{BoxFuture, FutureExt, Shared};

use crate::cache::ResponseCache;
use crate::classify::{classify, is_contract_items};
use crate::client::EsiClient;
use crate::error::{EsiError, PipelineError};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Method {
    Get,
    Post,
}

impl Default for Method {
    fn default() -> Self {
        Method::Get
    }
}

/// Per-call overrides. Everything defaults to the sensible per-endpoint behavior:
/// GET, auth required when a `character_id` is given, no body.
#[derive(Debug, Clone, Default)]
pub struct FetchOptions {
    pub character_id: Option<u64>,
    pub language: Option<String>,
    pub method: Option<Method>,
    pub body: Option<serde_json::Value>,
    pub requires_auth: Option<bool>,
    /// A caller-supplied ETag to revalidate against, bypassing both the cache
    /// fast-path and the tracker's own stored ETag for this call.
    pub etag_override: Option<String>,
}

#[derive(Debug, Clone, Default)]
pub(crate) struct ResponseMeta {
    pub expires_at: Option<u64>,
    pub etag: Option<String>,
    pub not_modified: bool,
    pub x_pages: Option<u32>,
}

#[derive(Debug, Clone)]
pub(crate) struct PipelineResponse {
    pub data: serde_json::Value,
    pub meta: ResponseMeta,
}

/// A decoded value plus the cache metadata that came with it.
#[derive(Debug, Clone)]
pub struct WithMeta<T> {
    pub data: T,
    pub expires_at: Option<u64>,
    pub etag: Option<String>,
    pub not_modified: bool,
}

pub(crate) type SharedResponse = Shared<BoxFuture<'static, Result<PipelineResponse, EsiError>>>;

impl EsiClient {
    /// Entry point for every request: pause gate, health gate, single-flight dedup,
    /// then (inside the shared future so dedup'd callers only pay for it once) the
    /// contract-items throttle and per-group rate-limit wait before the request
    /// actually goes out.
    pub(crate) async fn execute_with_rate_limit(self: &Arc<Self>, endpoint: &str, options: FetchOptions) -> Result<PipelineResponse, EsiError> {
        while self.is_paused() {
            tokio::time::sleep(Duration::from_millis(100)).await;
        }

        if self.health.ensure_healthy(endpoint).await.is_err() {
            return Err(PipelineError::HealthGate.into());
        }

        let method = options.method.unwrap_or_default();
        let principal_id = options.character_id.unwrap_or(0);
        let key = ResponseCache::make_key(options.character_id, endpoint, options.language.as_deref());

        // POSTs are never deduplicated or shared across callers, so the throttle waits
        // just happen inline.
        if method == Method::Post {
            self.wait_for_dispatch(endpoint, principal_id).await;
            return self.execute_request(endpoint.to_string(), options, key, 0, false).await.map_err(EsiError::from);
        }

        let fut: SharedResponse = {
            let this = self.clone();
            let endpoint = endpoint.to_string();
            let key = key.clone();
            let options = options.clone();
            async move {
                this.wait_for_dispatch(&endpoint, principal_id).await;
                this.execute_request(endpoint, options, key, 0, false).await.map_err(EsiError::from)
            }
            .boxed()
            .shared()
        };

        // Checking for an existing in-flight entry and registering this one on a miss
        // must happen without an `.await` in between — otherwise two callers racing
        // for the same key could both observe a miss and both end up dispatching.
        let (shared, is_new) = self.inflight_get_or_insert(key.clone(), fut).await;
        let result = shared.await;
        if is_new {
            self.inflight_remove(&key).await;
        }
        result
    }

    /// The contract-items burst throttle, then the per-group rate-limit wait. Lives
    /// inside the single-flight future for GETs so concurrent identical callers only
    /// wait out the throttle once, not once each.
    async fn wait_for_dispatch(self: &Arc<Self>, endpoint: &str, principal_id: u64) {
        if is_contract_items(endpoint) {
            let delay = self.rate_limit.get_contract_items_delay(principal_id).await;
            if delay > 0 {
                tokio::time::sleep(Duration::from_millis(delay)).await;
            }
            self.rate_limit.record_contract_items_request(principal_id).await;
        }

        let group = classify(endpoint);
        let delay = self.rate_limit.get_delay_ms(principal_id, group).await;
        if delay > 0 {
            tokio::time::sleep(Duration::from_millis(delay)).await;
        }
    }

    /// Sends one attempt, retrying transport failures and rate-limit responses
    /// according to the configured budgets. `etag_stripped` is set on the one extra
    /// attempt allowed after a 304 with no corresponding cache entry to revalidate
    /// against — that retry doesn't count against the normal retry budget.
    pub(crate) async fn execute_request(
        self: &Arc<Self>,
        endpoint: String,
        options: FetchOptions,
        cache_key: String,
        attempt: u32,
        etag_stripped: bool,
    ) -> Result<PipelineResponse, PipelineError> {
        let _guard = self.enter_active_request();

        let method = options.method.unwrap_or_default();
        let url = self
            .config
            .base_url
            .join(endpoint.trim_start_matches('/'))
            .map_err(|err| PipelineError::Protocol { status: 0, message: format!("invalid endpoint: {err}") })?;

        let mut builder = match method {
            Method::Get => self.http.get(url),
            Method::Post => self.http.post(url),
        };

        builder = builder
            .header("Content-Type", "application/json")
            .header("X-Compatibility-Date", self.config.compatibility_date.clone())
            .header("User-Agent", self.config.user_agent.clone())
            .header("Accept-Language", options.language.clone().unwrap_or_else(|| "en".to_string()));

        if let Some(body) = &options.body {
            builder = builder.json(body);
        }

        if options.requires_auth.unwrap_or(true) {
            if let Some(character_id) = options.character_id {
                let token = self.token_provider().await.access_token(character_id).await;
                match token {
                    Ok(Some(token)) => builder = builder.bearer_auth(token),
                    Ok(None) => return Err(PipelineError::AuthMissingToken),
                    Err(err) => return Err(PipelineError::AuthProviderError(err.to_string())),
                }
            }
        }

        let etag = if etag_stripped { None } else { options.etag_override.clone().or(self.cache.get_etag(&cache_key).await) };
        if let Some(etag) = &etag {
            builder = builder.header("If-None-Match", etag.clone());
        }

        let request = builder.build().map_err(|err| PipelineError::Protocol { status: 0, message: format!("failed to build request: {err}") })?;

        let sent = tokio::time::timeout(self.config.request_timeout, self.http.execute(request)).await;
        let response = match sent {
            Err(_elapsed) => return self.retry_transport_failure(endpoint, options, cache_key, attempt, etag_stripped, true, "request timeout".to_string()).await,
            Ok(Err(err)) => return self.retry_transport_failure(endpoint, options, cache_key, attempt, etag_stripped, false, err.to_string()).await,
            Ok(Ok(resp)) => resp,
        };

        let principal_id = options.character_id.unwrap_or(0);
        self.rate_limit.update_from_headers(principal_id, response.headers()).await;

        let status = response.status();

        if status.as_u16() == 429 || status.as_u16() == 420 {
            let retry_after = response
                .headers()
                .get("Retry-After")
                .and_then(|v| v.to_str().ok())
                .and_then(|s| s.parse::<u64>().ok())
                .unwrap_or(60);
            self.rate_limit.set_global_retry_after(retry_after).await;

            if attempt < self.config.max_retries {
                tokio::time::sleep(Duration::from_millis(retry_after * 1_000)).await;
                return Box::pin(self.execute_request(endpoint, options, cache_key, attempt + 1, etag_stripped)).await;
            }
            return Err(PipelineError::RateLimited { status: status.as_u16(), retry_after });
        }

        let expires_at = response.headers().get("Expires").and_then(|v| v.to_str().ok()).and_then(parse_http_date_ms);
        let response_etag = response.headers().get("ETag").and_then(|v| v.to_str().ok()).map(|s| s.to_string());
        let x_pages = response.headers().get("X-Pages").and_then(|v| v.to_str().ok()).and_then(|s| s.parse::<u32>().ok());

        if status.as_u16() == 304 {
            if let Some(mut entry) = self.cache.get_stale(&cache_key).await {
                if let Some(new_expires) = expires_at {
                    self.cache.update_expires(&cache_key, new_expires).await;
                    entry.expires_at = new_expires;
                }
                return Ok(PipelineResponse {
                    data: entry.data,
                    meta: ResponseMeta { expires_at: Some(entry.expires_at), etag: Some(entry.etag), not_modified: true, x_pages },
                });
            }
            // No cache entry to revalidate against: one bounded retry without the
            // conditional header, which doesn't count against the retry budget.
            if etag.is_some() && !etag_stripped {
                return Box::pin(self.execute_request(endpoint, options, cache_key, attempt, true)).await;
            }
            return Err(PipelineError::Protocol { status: 304, message: "304 with no cached entry to revalidate".to_string() });
        }

        if !status.is_success() {
            let body_text = response.text().await.unwrap_or_default();
            let message = serde_json::from_str::<serde_json::Value>(&body_text)
                .ok()
                .and_then(|v| v.get("error").and_then(|e| e.as_str()).map(|s| s.to_string()))
                .unwrap_or_else(|| format!("ESI error: {status}"));
            return Err(PipelineError::Protocol { status: status.as_u16(), message });
        }

        let data: serde_json::Value = response
            .json()
            .await
            .map_err(|err| PipelineError::Protocol { status: status.as_u16(), message: format!("failed to decode response: {err}") })?;

        if let (Some(etag_val), Some(expires_val)) = (&response_etag, expires_at) {
            self.cache.set(cache_key.clone(), data.clone(), etag_val.clone(), expires_val).await;
        }

        Ok(PipelineResponse { data, meta: ResponseMeta { expires_at, etag: response_etag, not_modified: false, x_pages } })
    }

    async fn retry_transport_failure(
        self: &Arc<Self>,
        endpoint: String,
        options: FetchOptions,
        cache_key: String,
        attempt: u32,
        etag_stripped: bool,
        is_timeout: bool,
        message: String,
    ) -> Result<PipelineResponse, PipelineError> {
        let budget = if is_timeout { self.config.max_timeout_retries } else { self.config.max_retries };
        if attempt < budget {
            let backoff_ms = (1_000u64.saturating_mul(1u64 << attempt.min(10))).min(10_000);
            tokio::time::sleep(Duration::from_millis(backoff_ms)).await;
            return Box::pin(self.execute_request(endpoint, options, cache_key, attempt + 1, etag_stripped)).await;
        }
        if is_timeout {
            Err(PipelineError::Timeout)
        } else {
            Err(PipelineError::Network(message))
        }
    }
}

/// Parses an HTTP-date (`Expires` header) into epoch milliseconds. Accepts both the
/// RFC 2822-ish form `chrono` understands directly and the IMF-fixdate `GMT` form ESI
/// actually sends.
fn parse_http_date_ms(value: &str) -> Option<u64> {
    use chrono::{DateTime, NaiveDateTime};

    let parsed = DateTime::parse_from_rfc2822(value).ok().or_else(|| {
        NaiveDateTime::parse_from_str(value, "%a, %d %b %Y %H:%M:%S GMT")
            .ok()
            .map(|naive| naive.and_utc().fixed_offset())
    })?;
    Some(parsed.timestamp_millis().max(0) as u64)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_imf_fixdate_expires_header() {
        let ms = parse_http_date_ms("Thu, 01 Jan 1970 00:00:01 GMT").unwrap();
        assert_eq!(ms, 1_000);
    }

    #[test]
    fn rejects_garbage_dates() {
        assert!(parse_http_date_ms("not a date").is_none());
    }
}
