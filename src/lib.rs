//! A shared, process-wide authenticated client for EVE Online's ESI API.
//!
//! Wraps a single `reqwest::Client` with the policy an asset-management app needs on
//! top of the raw HTTP surface: adaptive per-group rate limiting driven by response
//! headers, an ETag-aware response cache with bounded size and persistence across
//! restarts, single-flight deduplication of concurrent identical requests, a cached
//! service-health probe that gates dispatch, and bounded-concurrency pagination with
//! progress reporting.
//!
//! OAuth itself, WebSocket subscriptions, and server push are out of scope — token
//! acquisition and refresh are the caller's responsibility via [`TokenProvider`].

pub mod cache;
pub mod classify;
pub mod client;
pub mod clock;
pub mod config;
mod debounce;
pub mod error;
pub mod health;
pub mod pagination;
pub mod persistence;
mod pipeline;
pub mod rate_limit;
pub mod rng;
pub mod token_provider;

pub use cache::{CacheEntry, ResponseCache};
pub use classify::{classify, extract_base, is_contract_items};
pub use client::{EsiClient, EsiClientBuilder, RateLimitInfo};
pub use clock::{Clock, SystemClock, TestClock};
pub use config::{Config, GroupOverride};
pub use error::EsiError;
pub use health::{HealthSnapshot, OverallStatus, RouteHealth, RouteStatus};
pub use pagination::Progress;
pub use persistence::{FileStateStore, InMemoryStateStore, StateStore};
pub use pipeline::{FetchOptions, Method, WithMeta};
pub use rate_limit::{RateLimitGroupState, RateLimitTracker};
pub use rng::{FixedRng, JitterRng, ThreadRng};
pub use token_provider::{NoTokenProvider, TokenProvider};
