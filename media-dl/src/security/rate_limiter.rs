//! Per-host admission rate limiting.
//!
//! Token buckets keyed by host. The map is owned by the limiter instance
//! (no process-wide state), bounded in size, and swept of idle hosts either
//! on demand or by the background sweeper.

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

/// Configuration for the host rate limiter.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HostRateLimitConfig {
    /// Maximum tokens (burst capacity) per host.
    pub max_tokens: u32,
    /// Tokens added per second.
    pub refill_rate: f64,
    /// Hosts idle for longer than this are evicted by `sweep`.
    pub idle_ttl_secs: u64,
    /// Hard bound on tracked hosts; the least recently seen host is evicted first.
    pub max_hosts: usize,
}

impl Default for HostRateLimitConfig {
    fn default() -> Self {
        Self {
            max_tokens: 30,
            refill_rate: 1.0,
            idle_ttl_secs: 600,
            max_hosts: 1024,
        }
    }
}

#[derive(Debug)]
struct Bucket {
    tokens: f64,
    last_refill: Instant,
    last_seen: Instant,
}

impl Bucket {
    fn new(max_tokens: u32, now: Instant) -> Self {
        Self {
            tokens: f64::from(max_tokens),
            last_refill: now,
            last_seen: now,
        }
    }

    fn try_acquire(&mut self, config: &HostRateLimitConfig, now: Instant) -> bool {
        let elapsed = now.saturating_duration_since(self.last_refill);
        self.tokens = (self.tokens + elapsed.as_secs_f64() * config.refill_rate)
            .min(f64::from(config.max_tokens));
        self.last_refill = now;
        self.last_seen = now;

        if self.tokens >= 1.0 {
            self.tokens -= 1.0;
            true
        } else {
            false
        }
    }
}

/// Token-bucket limiter keyed by host name.
#[derive(Debug)]
pub struct HostRateLimiter {
    config: HostRateLimitConfig,
    buckets: Mutex<HashMap<String, Bucket>>,
}

impl HostRateLimiter {
    pub fn new(config: HostRateLimitConfig) -> Self {
        Self {
            config,
            buckets: Mutex::new(HashMap::new()),
        }
    }

    pub fn config(&self) -> &HostRateLimitConfig {
        &self.config
    }

    /// Try to take one token for `host`.
    pub fn try_acquire(&self, host: &str) -> bool {
        self.try_acquire_at(host, Instant::now())
    }

    pub(crate) fn try_acquire_at(&self, host: &str, now: Instant) -> bool {
        let host = host.to_ascii_lowercase();
        let mut buckets = self.buckets.lock();

        if !buckets.contains_key(&host) && buckets.len() >= self.config.max_hosts.max(1) {
            let oldest = buckets
                .iter()
                .min_by_key(|(_, bucket)| bucket.last_seen)
                .map(|(key, _)| key.clone());
            if let Some(oldest) = oldest {
                trace!(host = %oldest, "Evicting least recently seen host");
                buckets.remove(&oldest);
            }
        }

        buckets
            .entry(host)
            .or_insert_with(|| Bucket::new(self.config.max_tokens, now))
            .try_acquire(&self.config, now)
    }

    /// Evict hosts idle for longer than the configured TTL.
    ///
    /// Returns the number of evicted hosts.
    pub fn sweep(&self) -> usize {
        self.sweep_at(Instant::now())
    }

    pub(crate) fn sweep_at(&self, now: Instant) -> usize {
        let ttl = Duration::from_secs(self.config.idle_ttl_secs);
        let mut buckets = self.buckets.lock();
        let before = buckets.len();
        buckets.retain(|_, bucket| now.saturating_duration_since(bucket.last_seen) < ttl);
        before - buckets.len()
    }

    /// Number of hosts currently tracked.
    pub fn tracked_hosts(&self) -> usize {
        self.buckets.lock().len()
    }

    /// Spawn a task that sweeps idle hosts every `interval` until `token` is cancelled.
    pub fn spawn_sweeper(
        self: &Arc<Self>,
        interval: Duration,
        token: CancellationToken,
    ) -> tokio::task::JoinHandle<()> {
        let limiter = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = ticker.tick() => {
                        let evicted = limiter.sweep();
                        if evicted > 0 {
                            debug!(evicted, "Swept idle rate-limit buckets");
                        }
                    }
                }
            }
        })
    }
}

impl Default for HostRateLimiter {
    fn default() -> Self {
        Self::new(HostRateLimitConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn limiter(max_tokens: u32, refill_rate: f64) -> HostRateLimiter {
        HostRateLimiter::new(HostRateLimitConfig {
            max_tokens,
            refill_rate,
            idle_ttl_secs: 60,
            max_hosts: 2,
        })
    }

    #[test]
    fn test_burst_then_limited() {
        let limiter = limiter(2, 1.0);
        let now = Instant::now();
        assert!(limiter.try_acquire_at("cdn.example", now));
        assert!(limiter.try_acquire_at("cdn.example", now));
        assert!(!limiter.try_acquire_at("cdn.example", now));
        // Other hosts have their own bucket.
        assert!(limiter.try_acquire_at("other.example", now));
    }

    #[test]
    fn test_refill() {
        let limiter = limiter(1, 2.0);
        let now = Instant::now();
        assert!(limiter.try_acquire_at("a", now));
        assert!(!limiter.try_acquire_at("a", now));
        assert!(limiter.try_acquire_at("a", now + Duration::from_millis(600)));
    }

    #[test]
    fn test_bounded_host_count() {
        let limiter = limiter(5, 1.0);
        let now = Instant::now();
        limiter.try_acquire_at("a", now);
        limiter.try_acquire_at("b", now + Duration::from_millis(1));
        limiter.try_acquire_at("c", now + Duration::from_millis(2));
        assert_eq!(limiter.tracked_hosts(), 2);
    }

    #[test]
    fn test_sweep_evicts_idle_hosts() {
        let limiter = limiter(5, 1.0);
        let now = Instant::now();
        limiter.try_acquire_at("a", now);
        limiter.try_acquire_at("b", now + Duration::from_secs(50));
        assert_eq!(limiter.sweep_at(now + Duration::from_secs(70)), 1);
        assert_eq!(limiter.tracked_hosts(), 1);
    }

    #[tokio::test]
    async fn test_sweeper_stops_on_cancel() {
        let limiter = Arc::new(limiter(5, 1.0));
        let token = CancellationToken::new();
        let handle = limiter.spawn_sweeper(Duration::from_millis(10), token.clone());
        token.cancel();
        handle.await.unwrap();
    }
}
