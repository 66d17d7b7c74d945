//! Sliding-window rate limiting with named tiers.
//!
//! Each `(identifier, tier)` pair owns a bucket of request timestamps. A request is
//! admitted when fewer than `max_requests` timestamps fall inside the trailing window;
//! rejected requests are not recorded, so a client hammering a closed window does not
//! extend its own lockout.

use std::collections::{BTreeMap, VecDeque};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use dashmap::DashMap;
use serde::Serialize;
use tokio::sync::broadcast;
use tokio::time::{self, Instant};

use crate::config::{RateLimitConfig, RateLimitTier};
use crate::error::LinkError;
use crate::observability::metrics;

/// Used only if the configured default tier is missing.
const FALLBACK_TIER: RateLimitTier = RateLimitTier {
    max_requests: 100,
    window_ms: 60_000,
};

/// Outcome of one admission decision.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RateLimitDecision {
    pub allowed: bool,
    /// Tier actually applied (after default-tier fallback).
    pub tier: String,
    pub limit: u32,
    pub remaining: u32,
    /// Time until the oldest recorded request leaves the window.
    #[serde(skip)]
    pub reset_after: Duration,
    /// Unix timestamp (seconds) when a slot frees up.
    pub reset_at: u64,
}

impl RateLimitDecision {
    /// Standard rate-limit response headers for this decision.
    pub fn headers(&self) -> Vec<(&'static str, String)> {
        let mut headers = vec![
            ("X-RateLimit-Limit", self.limit.to_string()),
            ("X-RateLimit-Remaining", self.remaining.to_string()),
            ("X-RateLimit-Reset", self.reset_at.to_string()),
        ];
        if !self.allowed {
            headers.push(("Retry-After", retry_after_secs(self.reset_after).to_string()));
        }
        headers
    }
}

fn retry_after_secs(wait: Duration) -> u64 {
    let secs = wait.as_secs();
    if wait.subsec_nanos() > 0 {
        secs + 1
    } else {
        secs
    }
}

#[derive(Debug)]
struct Bucket {
    window: Duration,
    hits: VecDeque<Instant>,
}

impl Bucket {
    fn purge(&mut self, now: Instant) {
        while let Some(&oldest) = self.hits.front() {
            if now.saturating_duration_since(oldest) >= self.window {
                self.hits.pop_front();
            } else {
                break;
            }
        }
    }
}

pub struct RateLimiter {
    enabled: bool,
    default_tier: String,
    tiers: BTreeMap<String, RateLimitTier>,
    sweep_interval: Duration,
    buckets: DashMap<(String, String), Bucket>,
}

impl RateLimiter {
    pub fn new(config: &RateLimitConfig) -> Self {
        Self {
            enabled: config.enabled,
            default_tier: config.default_tier.clone(),
            tiers: config.tiers.clone(),
            sweep_interval: Duration::from_secs(config.sweep_interval_secs.max(1)),
            buckets: DashMap::new(),
        }
    }

    fn resolve_tier(&self, tier: &str) -> (String, RateLimitTier) {
        if let Some(policy) = self.tiers.get(tier) {
            return (tier.to_string(), *policy);
        }
        tracing::debug!(tier = %tier, fallback = %self.default_tier, "Unknown rate limit tier");
        let policy = self.tiers.get(&self.default_tier).copied().unwrap_or(FALLBACK_TIER);
        (self.default_tier.clone(), policy)
    }

    /// Decide whether `identifier` may make one more request under `tier`.
    pub fn allow(&self, identifier: &str, tier: &str) -> RateLimitDecision {
        let (tier_name, policy) = self.resolve_tier(tier);
        let window = policy.window();

        if !self.enabled {
            return RateLimitDecision {
                allowed: true,
                tier: tier_name,
                limit: policy.max_requests,
                remaining: policy.max_requests,
                reset_after: Duration::ZERO,
                reset_at: unix_secs_after(Duration::ZERO),
            };
        }

        let now = Instant::now();
        let (allowed, used, reset_after) = {
            let mut bucket = self
                .buckets
                .entry((identifier.to_string(), tier_name.clone()))
                .or_insert_with(|| Bucket {
                    window,
                    hits: VecDeque::new(),
                });
            bucket.window = window;
            bucket.purge(now);

            let allowed = (bucket.hits.len() as u32) < policy.max_requests;
            if allowed {
                bucket.hits.push_back(now);
            }
            let reset_after = bucket
                .hits
                .front()
                .map(|oldest| (*oldest + window).saturating_duration_since(now))
                .unwrap_or(window);
            (allowed, bucket.hits.len() as u32, reset_after)
        };

        if !allowed {
            tracing::debug!(identifier = %identifier, tier = %tier_name, "Rate limit exceeded");
            metrics::record_rate_limited(&tier_name);
        }

        RateLimitDecision {
            allowed,
            tier: tier_name,
            limit: policy.max_requests,
            remaining: policy.max_requests.saturating_sub(used),
            reset_after,
            reset_at: unix_secs_after(reset_after),
        }
    }

    /// Like `allow`, but a denial is an error carrying a retry-after hint.
    pub fn check(&self, identifier: &str, tier: &str) -> Result<RateLimitDecision, LinkError> {
        let decision = self.allow(identifier, tier);
        if decision.allowed {
            Ok(decision)
        } else {
            Err(LinkError::RateLimitExceeded {
                identifier: identifier.to_string(),
                tier: decision.tier,
                retry_after: decision.reset_after,
            })
        }
    }

    /// Drop buckets with no timestamps left in their window. Returns how many were removed.
    pub fn sweep(&self) -> usize {
        let now = Instant::now();
        let before = self.buckets.len();
        self.buckets.retain(|_, bucket| {
            bucket.purge(now);
            !bucket.hits.is_empty()
        });
        before.saturating_sub(self.buckets.len())
    }

    pub fn tracked_buckets(&self) -> usize {
        self.buckets.len()
    }

    /// Sweep on `sweep_interval` until shutdown.
    pub async fn run_sweeper(self: Arc<Self>, mut shutdown: broadcast::Receiver<()>) {
        let mut ticker = time::interval_at(Instant::now() + self.sweep_interval, self.sweep_interval);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let removed = self.sweep();
                    if removed > 0 {
                        tracing::debug!(removed, remaining = self.buckets.len(), "Swept idle rate limit buckets");
                    }
                }
                _ = shutdown.recv() => {
                    tracing::debug!("Rate limit sweeper shutting down");
                    break;
                }
            }
        }
    }
}

fn unix_secs_after(wait: Duration) -> u64 {
    (SystemTime::now() + wait)
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn limiter(max_requests: u32, window_ms: u64) -> RateLimiter {
        let mut config = RateLimitConfig::default();
        config.tiers.insert("hardware".into(), RateLimitTier::new(max_requests, window_ms));
        RateLimiter::new(&config)
    }

    #[tokio::test(start_paused = true)]
    async fn admits_up_to_the_limit_within_the_window() {
        let limiter = limiter(3, 1_000);

        for expected_remaining in [2, 1, 0] {
            let decision = limiter.allow("10.0.0.9", "hardware");
            assert!(decision.allowed);
            assert_eq!(decision.remaining, expected_remaining);
        }

        let denied = limiter.allow("10.0.0.9", "hardware");
        assert!(!denied.allowed);
        assert_eq!(denied.limit, 3);
        assert_eq!(denied.remaining, 0);
        assert_eq!(denied.reset_after, Duration::from_millis(1_000));

        // Other identifiers have their own bucket.
        assert!(limiter.allow("10.0.0.10", "hardware").allowed);
    }

    #[tokio::test(start_paused = true)]
    async fn window_slides_and_rejections_are_not_recorded() {
        let limiter = limiter(2, 1_000);
        assert!(limiter.allow("panel", "hardware").allowed);
        time::advance(Duration::from_millis(600)).await;
        assert!(limiter.allow("panel", "hardware").allowed);

        time::advance(Duration::from_millis(300)).await;
        // Denied attempts must not push the reset further out.
        for _ in 0..5 {
            assert!(!limiter.allow("panel", "hardware").allowed);
        }

        time::advance(Duration::from_millis(100)).await;
        // First request (t=0) has left the window at t=1000.
        let decision = limiter.allow("panel", "hardware");
        assert!(decision.allowed);
        assert_eq!(decision.remaining, 0);
    }

    #[tokio::test]
    async fn unknown_tier_uses_default() {
        let limiter = limiter(1, 1_000);
        let decision = limiter.allow("panel", "platinum");
        assert_eq!(decision.tier, "default");
        assert_eq!(decision.limit, 100);
    }

    #[tokio::test(start_paused = true)]
    async fn check_reports_retry_after_and_headers() {
        let limiter = limiter(1, 2_500);
        limiter.check("kiosk", "hardware").unwrap();

        let err = limiter.check("kiosk", "hardware").unwrap_err();
        assert_eq!(err.retry_after(), Some(Duration::from_millis(2_500)));

        let headers = limiter.allow("kiosk", "hardware").headers();
        assert!(headers.contains(&("Retry-After", "3".to_string())));
        assert!(headers.contains(&("X-RateLimit-Remaining", "0".to_string())));
    }

    #[tokio::test(start_paused = true)]
    async fn sweep_drops_empty_buckets() {
        let limiter = limiter(5, 1_000);
        limiter.allow("a", "hardware");
        limiter.allow("b", "hardware");
        assert_eq!(limiter.tracked_buckets(), 2);

        time::advance(Duration::from_millis(500)).await;
        assert_eq!(limiter.sweep(), 0);

        time::advance(Duration::from_millis(600)).await;
        assert_eq!(limiter.sweep(), 2);
        assert_eq!(limiter.tracked_buckets(), 0);
    }

    #[tokio::test]
    async fn disabled_limiter_admits_everything() {
        let mut config = RateLimitConfig::default();
        config.enabled = false;
        let limiter = RateLimiter::new(&config);
        for _ in 0..500 {
            assert!(limiter.allow("panel", "sensitive").allowed);
        }
        assert_eq!(limiter.tracked_buckets(), 0);
    }
}
