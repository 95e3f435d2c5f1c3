// outpost: Per-key sliding-window rate limiter shared by all fronts

use crate::ringlog::DaemonLogger;
use dashmap::DashMap;
use std::time::{SystemTime, UNIX_EPOCH};

/// Window duration for every front
pub const RATE_LIMIT_INTERVAL_SEC: u64 = 1;

/// Evict silent keys once the map grows past this many entries
const EVICTION_THRESHOLD: usize = 4096;

struct Entry {
    window_start: u64,
    count: u32,
}

/// Counts requests per key (client IP) within the current one-second window
/// and rejects the ones above the ceiling. Safe for concurrent use from many
/// fronts; counters outside the current window reset on the next add.
pub struct RateLimiter {
    max_per_interval: u32,
    entries: DashMap<String, Entry>,
    logger: DaemonLogger,
}

impl RateLimiter {
    /// Ceiling of zero means unlimited.
    pub fn new(max_per_interval: u32, logger: DaemonLogger) -> Self {
        Self {
            max_per_interval,
            entries: DashMap::new(),
            logger,
        }
    }

    fn now_window() -> u64 {
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or(0);
        now / RATE_LIMIT_INTERVAL_SEC
    }

    /// Count one request for the key and report whether it is admitted.
    /// A denied, non-quiet add emits a warning line with the key.
    pub fn add(&self, key: &str, quiet: bool) -> bool {
        if self.max_per_interval == 0 {
            return true;
        }
        let window = Self::now_window();
        let admitted;
        {
            let mut entry = self.entries.entry(key.to_string()).or_insert(Entry {
                window_start: window,
                count: 0,
            });
            if entry.window_start != window {
                entry.window_start = window;
                entry.count = 0;
            }
            entry.count += 1;
            admitted = entry.count <= self.max_per_interval;
        }
        if !admitted && !quiet {
            self.logger.warning("add", key, "exceeded the rate limit");
        }
        if self.entries.len() > EVICTION_THRESHOLD {
            self.entries.retain(|_, entry| entry.window_start == window);
        }
        admitted
    }

    pub fn max_per_interval(&self) -> u32 {
        self.max_per_interval
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ringlog::LogBuffers;

    fn test_logger() -> DaemonLogger {
        DaemonLogger::new("RATELIMIT", "", LogBuffers::new())
    }

    #[test]
    fn test_burst_admits_at_most_ceiling_per_window() {
        let limiter = RateLimiter::new(10, test_logger());
        let mut admitted = 0;
        for _ in 0..100 {
            if limiter.add("192.0.2.1", true) {
                admitted += 1;
            }
        }
        // The burst may straddle one window boundary
        assert!((10..=20).contains(&admitted), "admitted {}", admitted);
    }

    #[test]
    fn test_zero_ceiling_is_unlimited() {
        let limiter = RateLimiter::new(0, test_logger());
        for _ in 0..1000 {
            assert!(limiter.add("192.0.2.2", true));
        }
    }

    #[test]
    fn test_keys_are_counted_independently() {
        let limiter = RateLimiter::new(1, test_logger());
        assert!(limiter.add("a", true));
        assert!(limiter.add("b", true));
        assert!(!limiter.add("a", true));
    }

    #[test]
    fn test_denied_noisy_add_logs_warning() {
        let buffers = LogBuffers::new();
        let limiter = RateLimiter::new(1, DaemonLogger::new("RATELIMIT", "", buffers.clone()));
        limiter.add("203.0.113.9", false);
        limiter.add("203.0.113.9", false);
        assert!(!buffers.warnings.is_empty());
        assert!(buffers.warnings.snapshot()[0].contains("203.0.113.9"));
    }
}
