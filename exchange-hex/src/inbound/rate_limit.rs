//! Per-caller request throttling with Governor.
//!
//! Runs after [`auth_middleware`](super::auth::auth_middleware), so callers are
//! told apart by who they are rather than by what they send. Signed-in users
//! get a bucket per account. Anonymous callers and tokens that fail
//! verification are charged to their peer address, or to one shared bucket
//! when the address is unknown.

use std::net::{IpAddr, SocketAddr};
use std::num::NonZeroU32;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use axum::{
    Json,
    body::Body,
    extract::{ConnectInfo, State},
    http::{Request, StatusCode},
    middleware::Next,
    response::{IntoResponse, Response},
};
use dashmap::DashMap;
use governor::{
    Quota, RateLimiter,
    clock::DefaultClock,
    state::{InMemoryState, NotKeyed},
};
use serde_json::json;

use exchange_types::{Actor, UserId};

/// Idle buckets are swept once every this many checks.
const SWEEP_EVERY: u64 = 1024;

/// Which bucket a request draws from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RateKey {
    User(UserId),
    Address(IpAddr),
    Anonymous,
}

impl RateKey {
    pub fn for_caller(actor: Option<&Actor>, addr: Option<IpAddr>) -> Self {
        match (actor.and_then(|a| a.user_id), addr) {
            (Some(user_id), _) => Self::User(user_id),
            (None, Some(ip)) => Self::Address(ip),
            (None, None) => Self::Anonymous,
        }
    }
}

struct Bucket {
    limiter: RateLimiter<NotKeyed, InMemoryState, DefaultClock>,
    /// Milliseconds since the state was created
    last_seen: AtomicU64,
}

/// Rate limiter state shared across requests.
pub struct RateLimiterState {
    buckets: DashMap<RateKey, Bucket>,
    quota: Quota,
    /// A bucket untouched this long has fully refilled and can be dropped
    idle_after: Duration,
    started: Instant,
    checks: AtomicU64,
}

impl Default for RateLimiterState {
    fn default() -> Self {
        Self::new(100, Duration::from_secs(60))
    }
}

impl RateLimiterState {
    /// Allows a burst of `requests`, refilled evenly over `period`.
    ///
    /// Zero values are raised to the smallest usable quota.
    pub fn new(requests: u32, period: Duration) -> Self {
        let burst = NonZeroU32::new(requests).unwrap_or(NonZeroU32::MIN);
        let replenish = period / burst.get();
        let quota = Quota::with_period(replenish)
            .unwrap_or_else(|| Quota::per_second(NonZeroU32::MIN))
            .allow_burst(burst);

        Self {
            buckets: DashMap::new(),
            quota,
            idle_after: period.max(Duration::from_secs(1)),
            started: Instant::now(),
            checks: AtomicU64::new(0),
        }
    }

    /// Returns true if the request is allowed, false if rate limited.
    pub fn check(&self, key: RateKey) -> bool {
        let now = self.elapsed_ms();
        let allowed = {
            let bucket = self.buckets.entry(key).or_insert_with(|| Bucket {
                limiter: RateLimiter::direct(self.quota),
                last_seen: AtomicU64::new(now),
            });
            bucket.last_seen.store(now, Ordering::Relaxed);
            bucket.limiter.check().is_ok()
        };

        // The entry guard is released above; retain needs every shard lock
        if self.checks.fetch_add(1, Ordering::Relaxed) % SWEEP_EVERY == SWEEP_EVERY - 1 {
            self.evict_idle();
        }
        allowed
    }

    /// Drops buckets that have been idle long enough to be full again.
    pub fn evict_idle(&self) {
        let now = self.elapsed_ms();
        let idle_ms = self.idle_after.as_millis() as u64;
        let before = self.buckets.len();
        self.buckets
            .retain(|_, bucket| now.saturating_sub(bucket.last_seen.load(Ordering::Relaxed)) < idle_ms);
        let evicted = before.saturating_sub(self.buckets.len());
        if evicted > 0 {
            tracing::debug!("Evicted {} idle rate limit buckets", evicted);
        }
    }

    /// Number of live buckets.
    pub fn len(&self) -> usize {
        self.buckets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buckets.is_empty()
    }

    pub fn retry_after_seconds(&self) -> u64 {
        self.idle_after.as_secs()
    }

    fn elapsed_ms(&self) -> u64 {
        self.started.elapsed().as_millis() as u64
    }
}

/// Peer address of the connection, when the server recorded one.
pub fn client_addr(request: &Request<Body>) -> Option<IpAddr> {
    request
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ConnectInfo(addr)| addr.ip())
}

pub fn too_many_requests(limiter: &RateLimiterState) -> Response {
    (
        StatusCode::TOO_MANY_REQUESTS,
        Json(json!({
            "error": "Rate limit exceeded. Please try again later.",
            "code": 429,
            "kind": "rate_limited",
            "retry_after_seconds": limiter.retry_after_seconds()
        })),
    )
        .into_response()
}

/// Throttles the [`Actor`] resolved by the auth middleware.
pub async fn rate_limit_middleware(
    State(limiter): State<Arc<RateLimiterState>>,
    request: Request<Body>,
    next: Next,
) -> Response {
    if request.uri().path() == "/health" {
        return next.run(request).await;
    }

    let key = RateKey::for_caller(request.extensions().get::<Actor>(), client_addr(&request));
    if !limiter.check(key) {
        tracing::warn!(?key, "Rate limit exceeded");
        return too_many_requests(&limiter);
    }

    next.run(request).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeSet;
    use std::net::Ipv4Addr;

    fn user(user_id: UserId) -> Actor {
        Actor {
            user_id: Some(user_id),
            roles: BTreeSet::new(),
        }
    }

    fn addr(n: u32) -> RateKey {
        RateKey::Address(IpAddr::V4(Ipv4Addr::from(n)))
    }

    #[test]
    fn test_burst_then_limited() {
        let state = RateLimiterState::new(3, Duration::from_secs(60));
        let key = RateKey::User(UserId::new());
        assert!(state.check(key));
        assert!(state.check(key));
        assert!(state.check(key));
        assert!(!state.check(key));
    }

    #[test]
    fn test_keys_are_independent() {
        let state = RateLimiterState::new(1, Duration::from_secs(60));
        assert!(state.check(addr(1)));
        assert!(!state.check(addr(1)));
        assert!(state.check(addr(2)));
        assert!(state.check(RateKey::User(UserId::new())));
    }

    #[test]
    fn test_zero_quota_is_raised() {
        let state = RateLimiterState::new(0, Duration::from_secs(60));
        assert!(state.check(RateKey::Anonymous));
    }

    #[test]
    fn test_key_for_caller() {
        let id = UserId::new();
        let ip = IpAddr::V4(Ipv4Addr::LOCALHOST);

        assert_eq!(RateKey::for_caller(Some(&user(id)), Some(ip)), RateKey::User(id));
        assert_eq!(
            RateKey::for_caller(Some(&Actor::anonymous()), Some(ip)),
            RateKey::Address(ip)
        );
        assert_eq!(RateKey::for_caller(None, Some(ip)), RateKey::Address(ip));
        assert_eq!(RateKey::for_caller(None, None), RateKey::Anonymous);
    }

    #[test]
    fn test_idle_buckets_are_evicted() {
        let state = RateLimiterState::new(1, Duration::from_secs(1));
        for n in 0..1000 {
            state.check(addr(n));
        }
        assert_eq!(state.len(), 1000);

        std::thread::sleep(Duration::from_millis(1100));
        state.evict_idle();
        assert!(state.is_empty());
    }

    #[test]
    fn test_busy_bucket_survives_sweep() {
        let state = RateLimiterState::new(1, Duration::from_secs(1));
        for n in 0..100 {
            state.check(addr(n));
        }
        std::thread::sleep(Duration::from_millis(1100));

        // Enough checks on one key to trigger a sweep
        let busy = RateKey::User(UserId::new());
        for _ in 0..SWEEP_EVERY {
            state.check(busy);
        }

        assert_eq!(state.len(), 1);
        // Still throttled after the sweep
        assert!(!state.check(busy));
    }
}
