//! Per-host outbound rate limiting (§4.1, §5 "per-host rate limiters").
//! Generalized from the teacher's `middleware::rate_limit::RateLimitLayer`,
//! which applied a sliding window per inbound IP; here the same sliding
//! window is applied per outbound venue host, with warning/critical
//! thresholds instead of a single hard cutoff, and `Retry-After` honored
//! when a venue returns one.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tracing::warn;

#[derive(Clone)]
pub struct HostRateLimitConfig {
    pub max_requests_per_window: u32,
    pub window: Duration,
    pub warning_threshold: f64,
    pub critical_threshold: f64,
}

impl Default for HostRateLimitConfig {
    fn default() -> Self {
        Self {
            max_requests_per_window: 1200,
            window: Duration::from_secs(60),
            warning_threshold: 0.80,
            critical_threshold: 0.95,
        }
    }
}

struct HostWindow {
    count: u32,
    window_start: Instant,
    retry_after_until: Option<Instant>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RateLimitDecision {
    Proceed,
    Warn,
    Backoff { wait: Duration },
}

/// One limiter instance is shared across all requests to a single venue
/// host; construct per-venue at wiring time (no import-time singleton).
pub struct HostRateLimiter {
    config: HostRateLimitConfig,
    windows: Mutex<HashMap<String, HostWindow>>,
}

impl HostRateLimiter {
    pub fn new(config: HostRateLimitConfig) -> Self {
        Self { config, windows: Mutex::new(HashMap::new()) }
    }

    pub fn check(&self, host: &str) -> RateLimitDecision {
        let mut windows = self.windows.lock();
        let now = Instant::now();
        let entry = windows.entry(host.to_string()).or_insert_with(|| HostWindow {
            count: 0,
            window_start: now,
            retry_after_until: None,
        });

        if let Some(until) = entry.retry_after_until {
            if now < until {
                return RateLimitDecision::Backoff { wait: until - now };
            }
            entry.retry_after_until = None;
        }

        if now.duration_since(entry.window_start) >= self.config.window {
            entry.count = 0;
            entry.window_start = now;
        }

        entry.count += 1;
        let ratio = entry.count as f64 / self.config.max_requests_per_window as f64;

        if ratio >= 1.0 {
            let reset_at = entry.window_start + self.config.window;
            RateLimitDecision::Backoff { wait: reset_at.saturating_duration_since(now) }
        } else if ratio >= self.config.critical_threshold {
            warn!(host, ratio, "approaching host rate limit (critical)");
            RateLimitDecision::Warn
        } else if ratio >= self.config.warning_threshold {
            RateLimitDecision::Warn
        } else {
            RateLimitDecision::Proceed
        }
    }

    /// Honor a venue's `Retry-After` header on 429/503.
    pub fn record_retry_after(&self, host: &str, retry_after: Duration) {
        let mut windows = self.windows.lock();
        let entry = windows.entry(host.to_string()).or_insert_with(|| HostWindow {
            count: 0,
            window_start: Instant::now(),
            retry_after_until: None,
        });
        entry.retry_after_until = Some(Instant::now() + retry_after);
    }

    pub fn cleanup(&self) {
        let mut windows = self.windows.lock();
        let now = Instant::now();
        let window = self.config.window;
        windows.retain(|_, w| now.duration_since(w.window_start) < window * 2);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn proceeds_under_limit() {
        let limiter = HostRateLimiter::new(HostRateLimitConfig {
            max_requests_per_window: 10,
            window: Duration::from_secs(60),
            ..Default::default()
        });
        for _ in 0..7 {
            assert_eq!(limiter.check("lighter.xyz"), RateLimitDecision::Proceed);
        }
    }

    #[test]
    fn warns_past_threshold_and_backs_off_past_limit() {
        let limiter = HostRateLimiter::new(HostRateLimitConfig {
            max_requests_per_window: 10,
            window: Duration::from_secs(60),
            warning_threshold: 0.5,
            critical_threshold: 0.9,
        });
        for _ in 0..5 {
            limiter.check("x10.xyz");
        }
        assert_eq!(limiter.check("x10.xyz"), RateLimitDecision::Warn);
        for _ in 0..4 {
            limiter.check("x10.xyz");
        }
        assert!(matches!(limiter.check("x10.xyz"), RateLimitDecision::Backoff { .. }));
    }

    #[test]
    fn retry_after_forces_backoff_until_expiry() {
        let limiter = HostRateLimiter::new(HostRateLimitConfig::default());
        limiter.record_retry_after("x10.xyz", Duration::from_millis(50));
        assert!(matches!(limiter.check("x10.xyz"), RateLimitDecision::Backoff { .. }));
    }
}
