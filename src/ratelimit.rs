//! Per-peer rate limiting for rejected connections (spec.md §6, scenario S6):
//! at most `burst` warnings are emitted per `interval`, every other rejection
//! in that window stays silent.

use std::collections::HashMap;
use std::net::IpAddr;
use std::time::Instant;

use crate::config::RateLimitConfig;

struct Bucket {
    window_start: Instant,
    count: u32,
}

/// Not a general-purpose limiter: tracks only warn-emission counts for
/// rejected peers, keyed by IP. One instance per listener.
pub struct RateLimiter {
    interval: std::time::Duration,
    burst: u32,
    buckets: HashMap<IpAddr, Bucket>,
}

impl RateLimiter {
    pub fn new(cfg: &RateLimitConfig) -> Self {
        Self {
            interval: std::time::Duration::from_secs(cfg.interval_s.max(1) as u64),
            burst: cfg.burst.max(1),
            buckets: HashMap::new(),
        }
    }

    /// Returns `true` exactly when a warning should be emitted for this peer
    /// right now.
    pub fn should_warn(&mut self, peer: IpAddr) -> bool {
        let now = Instant::now();
        let bucket = self.buckets.entry(peer).or_insert(Bucket { window_start: now, count: 0 });
        if now.duration_since(bucket.window_start) >= self.interval {
            bucket.window_start = now;
            bucket.count = 0;
        }
        if bucket.count < self.burst {
            bucket.count += 1;
            true
        } else {
            false
        }
    }
}
