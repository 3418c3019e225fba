//! Token-bucket rate limiting
//!
//! Limiters are created lazily on the first matching request and keyed by
//! routing key (or routing key + client IP when the policy is per-client).
//! The registry is kept apart from the published `DomainConfig` values so
//! bucket state survives configuration reloads.

use crate::domain::RateLimitPolicy;
use dashmap::DashMap;
use governor::clock::DefaultClock;
use governor::state::{InMemoryState, NotKeyed};
use governor::{Quota, RateLimiter};
use std::net::IpAddr;
use std::num::NonZeroU32;
use std::sync::Arc;

type TokenBucket = RateLimiter<NotKeyed, InMemoryState, DefaultClock>;

#[derive(Default)]
pub struct RateLimiterRegistry {
    buckets: DashMap<String, Arc<TokenBucket>>,
}

impl RateLimiterRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether a request from `client` against `routing_key` is admitted
    /// under `policy`. Creates the bucket on first use with load-or-store
    /// semantics, so concurrent requests for the same key share one bucket.
    pub fn allow(&self, routing_key: &str, client: IpAddr, policy: &RateLimitPolicy) -> bool {
        let key = if policy.per_client {
            format!("{}-{}", routing_key, client)
        } else {
            routing_key.to_string()
        };

        let bucket = self
            .buckets
            .entry(key)
            .or_insert_with(|| Arc::new(RateLimiter::direct(quota_for(policy))))
            .clone();

        bucket.check().is_ok()
    }

    /// Number of live buckets (entries are never reclaimed; stale ones are
    /// harmless)
    pub fn len(&self) -> usize {
        self.buckets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buckets.is_empty()
    }
}

fn quota_for(policy: &RateLimitPolicy) -> Quota {
    let rps = NonZeroU32::new(policy.requests_per_second).unwrap_or(NonZeroU32::MIN);
    let burst = NonZeroU32::new(policy.burst_size).unwrap_or(NonZeroU32::MIN);
    Quota::per_second(rps).allow_burst(burst)
}
