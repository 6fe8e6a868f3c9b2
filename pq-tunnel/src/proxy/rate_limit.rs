//! Per-source token bucket for handshake attempts.
//!
//! Checked before any PQC work so a flood of connections cannot force
//! repeated key generation and signing.

use std::collections::HashMap;
use std::net::IpAddr;
use std::time::{Duration, Instant};

/// Token bucket for a single IP
#[derive(Debug)]
struct Bucket {
    tokens: f64,
    last_refill: Instant,
}

impl Bucket {
    fn new(capacity: f64, now: Instant) -> Self {
        Self {
            tokens: capacity,
            last_refill: now,
        }
    }

    fn refill(&mut self, capacity: f64, rate: f64, now: Instant) {
        let elapsed = now.saturating_duration_since(self.last_refill).as_secs_f64();
        self.tokens = (self.tokens + elapsed * rate).min(capacity);
        self.last_refill = now;
    }
}

/// Handshake rate limiter. Owned by the event loop, so no locking.
#[derive(Debug)]
pub struct HandshakeRateLimiter {
    buckets: HashMap<IpAddr, Bucket>,
    capacity: f64,
    refill_per_sec: f64,
    idle_after: Duration,
    last_cleanup: Instant,
}

impl HandshakeRateLimiter {
    pub fn new(burst: u32, refill_per_sec: f64) -> Self {
        let capacity = f64::from(burst.max(1));
        // A bucket that has refilled completely carries no state worth keeping
        let idle_after = Duration::from_secs_f64((capacity / refill_per_sec.max(f64::EPSILON)).max(1.0));
        Self {
            buckets: HashMap::new(),
            capacity,
            refill_per_sec,
            idle_after,
            last_cleanup: Instant::now(),
        }
    }

    /// Take one token for `ip`. Returns false if the attempt is rate limited.
    pub fn check(&mut self, ip: IpAddr) -> bool {
        self.check_at(ip, Instant::now())
    }

    pub fn check_at(&mut self, ip: IpAddr, now: Instant) -> bool {
        self.maybe_cleanup(now);

        let bucket = self
            .buckets
            .entry(ip)
            .or_insert_with(|| Bucket::new(self.capacity, now));
        bucket.refill(self.capacity, self.refill_per_sec, now);

        if bucket.tokens >= 1.0 {
            bucket.tokens -= 1.0;
            true
        } else {
            false
        }
    }

    /// Get number of tracked IPs.
    pub fn tracked_count(&self) -> usize {
        self.buckets.len()
    }

    fn maybe_cleanup(&mut self, now: Instant) {
        if now.saturating_duration_since(self.last_cleanup) < self.idle_after {
            return;
        }
        let idle_after = self.idle_after;
        self.buckets
            .retain(|_, bucket| now.saturating_duration_since(bucket.last_refill) < idle_after);
        self.last_cleanup = now;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_burst_then_blocked() {
        let mut limiter = HandshakeRateLimiter::new(5, 1.0);
        let ip: IpAddr = "192.168.1.1".parse().unwrap();
        let now = Instant::now();

        for _ in 0..5 {
            assert!(limiter.check_at(ip, now));
        }
        assert!(!limiter.check_at(ip, now));
    }

    #[test]
    fn test_refill_over_time() {
        let mut limiter = HandshakeRateLimiter::new(2, 1.0);
        let ip: IpAddr = "10.0.0.1".parse().unwrap();
        let now = Instant::now();

        assert!(limiter.check_at(ip, now));
        assert!(limiter.check_at(ip, now));
        assert!(!limiter.check_at(ip, now + Duration::from_millis(500)));
        assert!(limiter.check_at(ip, now + Duration::from_millis(1600)));
        assert!(!limiter.check_at(ip, now + Duration::from_millis(1700)));
    }

    #[test]
    fn test_independent_sources() {
        let mut limiter = HandshakeRateLimiter::new(1, 1.0);
        let ip1: IpAddr = "192.168.1.1".parse().unwrap();
        let ip2: IpAddr = "192.168.1.2".parse().unwrap();
        let now = Instant::now();

        assert!(limiter.check_at(ip1, now));
        assert!(!limiter.check_at(ip1, now));
        assert!(limiter.check_at(ip2, now));
    }

    #[test]
    fn test_idle_buckets_pruned() {
        let mut limiter = HandshakeRateLimiter::new(5, 1.0);
        let now = Instant::now();
        for i in 0..10u8 {
            limiter.check_at(IpAddr::from([10, 0, 0, i]), now);
        }
        assert_eq!(limiter.tracked_count(), 10);

        limiter.check_at(IpAddr::from([10, 0, 1, 0]), now + Duration::from_secs(60));
        assert_eq!(limiter.tracked_count(), 1);
    }
}
