//! Per-domain request throttle.
//!
//! Each domain keeps the instant of its latest reserved request slot. A caller
//! reserves `max(now, last + interval)` under the lock and then sleeps until
//! that slot outside of it, so concurrent callers for one domain queue up one
//! interval apart.

use std::collections::HashMap;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use kbingest_shared::{RateLimitConfig, extract_domain};
use serde::Serialize;
use tokio::time::Instant;
use tracing::debug;

#[derive(Debug, Clone, Default)]
struct DomainState {
    /// Latest reserved request slot.
    last_request: Option<Instant>,
    /// Overrides the default interval.
    interval: Option<Duration>,
}

/// Snapshot of one domain's throttle state.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RateLimitInfo {
    pub domain: String,
    pub enabled: bool,
    pub interval_ms: u64,
    /// Milliseconds a request issued now would wait.
    pub wait_ms: u64,
    /// Milliseconds since the last recorded request, if any.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub since_last_ms: Option<u64>,
}

/// Enforces a minimum interval between requests to the same domain.
#[derive(Debug)]
pub struct RateLimiter {
    default_interval: Duration,
    enabled: AtomicBool,
    domains: Mutex<HashMap<String, DomainState>>,
}

impl Default for RateLimiter {
    fn default() -> Self {
        Self::new(&RateLimitConfig::default())
    }
}

impl RateLimiter {
    pub fn new(config: &RateLimitConfig) -> Self {
        let domains = config
            .domain_intervals
            .iter()
            .map(|(domain, interval)| {
                (
                    domain.to_lowercase(),
                    DomainState {
                        last_request: None,
                        interval: Some(*interval),
                    },
                )
            })
            .collect();

        Self {
            default_interval: config.default_interval,
            enabled: AtomicBool::new(config.enabled),
            domains: Mutex::new(domains),
        }
    }

    /// Wait until a request to `domain` is allowed and record it.
    pub async fn wait_for_domain(&self, domain: &str) {
        if !self.is_enabled() {
            return;
        }
        let domain = domain.to_lowercase();

        let wait = {
            let mut domains = self.lock();
            let state = domains.entry(domain.clone()).or_default();
            let interval = state.interval.unwrap_or(self.default_interval);
            let now = Instant::now();
            let slot = match state.last_request {
                Some(last) => (last + interval).max(now),
                None => now,
            };
            state.last_request = Some(slot);
            slot.saturating_duration_since(now)
        };

        if !wait.is_zero() {
            debug!(%domain, wait_ms = wait.as_millis() as u64, "rate limiting");
            tokio::time::sleep(wait).await;
        }
    }

    /// [`wait_for_domain`](Self::wait_for_domain) for the host of `url`.
    /// Malformed URLs are throttled under their raw string.
    pub async fn wait_for_url(&self, url: &str) {
        self.wait_for_domain(&extract_domain(url)).await;
    }

    /// Mark a request to `domain` as issued now without waiting.
    pub fn record_request(&self, domain: &str) {
        let mut domains = self.lock();
        let state = domains.entry(domain.to_lowercase()).or_default();
        let now = Instant::now();
        state.last_request = Some(match state.last_request {
            Some(last) if last > now => last,
            _ => now,
        });
    }

    /// Milliseconds until the next request to `domain` would be allowed.
    pub fn get_wait_time(&self, domain: &str) -> u64 {
        if !self.is_enabled() {
            return 0;
        }
        let domains = self.lock();
        match domains.get(&domain.to_lowercase()) {
            Some(state) => self.wait_for_state(state).as_millis() as u64,
            None => 0,
        }
    }

    /// Override the interval for one domain.
    pub fn set_domain_interval(&self, domain: &str, interval_ms: u64) {
        let mut domains = self.lock();
        domains.entry(domain.to_lowercase()).or_default().interval =
            Some(Duration::from_millis(interval_ms));
    }

    /// Forget request history for one domain, or all of them. Interval
    /// overrides survive.
    pub fn clear_history(&self, domain: Option<&str>) {
        let mut domains = self.lock();
        match domain {
            Some(domain) => {
                if let Some(state) = domains.get_mut(&domain.to_lowercase()) {
                    state.last_request = None;
                }
            }
            None => {
                for state in domains.values_mut() {
                    state.last_request = None;
                }
            }
        }
    }

    pub fn set_enabled(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::Relaxed);
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::Relaxed)
    }

    pub fn info(&self, domain: &str) -> RateLimitInfo {
        let domain = domain.to_lowercase();
        let domains = self.lock();
        let state = domains.get(&domain).cloned().unwrap_or_default();
        let now = Instant::now();

        RateLimitInfo {
            enabled: self.is_enabled(),
            interval_ms: state.interval.unwrap_or(self.default_interval).as_millis() as u64,
            wait_ms: if self.is_enabled() {
                self.wait_for_state(&state).as_millis() as u64
            } else {
                0
            },
            since_last_ms: state
                .last_request
                .map(|last| now.saturating_duration_since(last).as_millis() as u64),
            domain,
        }
    }

    fn wait_for_state(&self, state: &DomainState) -> Duration {
        let interval = state.interval.unwrap_or(self.default_interval);
        match state.last_request {
            Some(last) => (last + interval).saturating_duration_since(Instant::now()),
            None => Duration::ZERO,
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, DomainState>> {
        self.domains
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;
    use std::sync::Arc;

    fn limiter(interval_ms: u64) -> RateLimiter {
        RateLimiter::new(&RateLimitConfig {
            enabled: true,
            default_interval: Duration::from_millis(interval_ms),
            domain_intervals: BTreeMap::new(),
        })
    }

    #[tokio::test]
    async fn consecutive_requests_are_spaced() {
        let limiter = limiter(0);
        limiter.set_domain_interval("example.com", 200);
        let start = std::time::Instant::now();
        limiter.wait_for_domain("example.com").await;
        limiter.wait_for_domain("example.com").await;
        assert!(start.elapsed() >= Duration::from_millis(200));

        let other = std::time::Instant::now();
        limiter.wait_for_domain("other.com").await;
        limiter.wait_for_domain("other.com").await;
        assert!(other.elapsed() < Duration::from_millis(150));
    }

    #[tokio::test]
    async fn concurrent_requests_queue_up() {
        let limiter = Arc::new(limiter(100));
        let start = std::time::Instant::now();
        let tasks: Vec<_> = (0..3)
            .map(|_| {
                let limiter = Arc::clone(&limiter);
                tokio::spawn(async move { limiter.wait_for_domain("a.com").await })
            })
            .collect();
        for task in tasks {
            task.await.unwrap();
        }
        assert!(start.elapsed() >= Duration::from_millis(200));
    }

    #[tokio::test]
    async fn domains_are_independent() {
        let limiter = limiter(500);
        limiter.wait_for_url("https://a.com/x").await;
        let start = std::time::Instant::now();
        limiter.wait_for_url("https://b.com/y").await;
        assert!(start.elapsed() < Duration::from_millis(400));
        assert!(limiter.get_wait_time("a.com") > 0);
        assert_eq!(limiter.get_wait_time("b.org"), 0);
    }

    #[tokio::test]
    async fn disabled_limiter_never_waits() {
        let limiter = limiter(10_000);
        limiter.set_enabled(false);
        let start = std::time::Instant::now();
        limiter.wait_for_domain("a.com").await;
        limiter.wait_for_domain("a.com").await;
        assert!(start.elapsed() < Duration::from_millis(1000));
        assert_eq!(limiter.get_wait_time("a.com"), 0);
    }

    #[test]
    fn overrides_and_history() {
        let limiter = RateLimiter::new(&RateLimitConfig {
            enabled: true,
            default_interval: Duration::from_millis(1000),
            domain_intervals: BTreeMap::from([("Slow.com".to_string(), Duration::from_secs(5))]),
        });
        assert_eq!(limiter.info("slow.com").interval_ms, 5000);

        limiter.set_domain_interval("fast.com", 10);
        limiter.record_request("fast.com");
        let info = limiter.info("FAST.com");
        assert_eq!(info.interval_ms, 10);
        assert!(info.since_last_ms.is_some());

        limiter.clear_history(Some("fast.com"));
        assert!(limiter.info("fast.com").since_last_ms.is_none());
        assert_eq!(limiter.info("fast.com").interval_ms, 10);

        limiter.record_request("slow.com");
        assert!(limiter.get_wait_time("slow.com") > 4000);
        limiter.clear_history(None);
        assert_eq!(limiter.get_wait_time("slow.com"), 0);
    }
}
