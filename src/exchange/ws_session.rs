//! WebSocket connectivity contract shared by every venue adapter (§4.1):
//! jittered exponential backoff, a per-host circuit breaker, and a
//! heartbeat/health monitor. Generalized from the teacher's
//! `scrapers/binance_session.rs`, which implemented the same three pieces
//! for a single fixed endpoint set; here they're host-parameterized so both
//! venue adapters share one implementation.

use std::time::{Duration, Instant};

use tracing::{debug, warn};

#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub backoff_base_ms: u64,
    pub backoff_max_ms: u64,
    pub backoff_multiplier: f64,
    pub jitter_factor: f64,

    pub ping_interval_ms: u64,
    pub pong_timeout_ms: u64,
    pub stale_data_timeout_ms: u64,
    pub consecutive_stale_threshold: u32,
    pub connect_grace_period_ms: u64,

    pub circuit_breaker_threshold: u32,
    pub circuit_breaker_cooldown_secs: u64,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            backoff_base_ms: 200,
            backoff_max_ms: 30_000,
            backoff_multiplier: 2.0,
            jitter_factor: 0.15,

            ping_interval_ms: 15_000,
            pong_timeout_ms: 10_000,
            stale_data_timeout_ms: 30_000,
            consecutive_stale_threshold: 1,
            connect_grace_period_ms: 30_000,

            circuit_breaker_threshold: 8,
            circuit_breaker_cooldown_secs: 45,
        }
    }
}

/// Exponential backoff with +/-jitter_factor jitter (xorshift64 PRNG, same
/// fast-path choice as the teacher's binance session manager).
#[derive(Debug)]
pub struct BackoffCalculator {
    config: SessionConfig,
    attempt: u32,
    rng_state: u64,
}

impl BackoffCalculator {
    pub fn new(config: SessionConfig) -> Self {
        Self {
            config,
            attempt: 0,
            rng_state: std::time::SystemTime::now()
                .duration_since(std::time::UNIX_EPOCH)
                .map(|d| d.as_nanos() as u64)
                .unwrap_or(0x9E3779B97F4A7C15),
        }
    }

    #[inline]
    fn next_random(&mut self) -> f64 {
        self.rng_state ^= self.rng_state << 13;
        self.rng_state ^= self.rng_state >> 7;
        self.rng_state ^= self.rng_state << 17;
        (self.rng_state as f64) / (u64::MAX as f64)
    }

    pub fn next_backoff(&mut self) -> Duration {
        let base =
            (self.config.backoff_base_ms as f64) * self.config.backoff_multiplier.powi(self.attempt as i32);
        let capped = base.min(self.config.backoff_max_ms as f64);
        let jitter_range = capped * self.config.jitter_factor;
        let jitter = (self.next_random() * 2.0 - 1.0) * jitter_range;
        let final_ms = (capped + jitter).max(self.config.backoff_base_ms as f64);
        self.attempt += 1;
        Duration::from_millis(final_ms as u64)
    }

    pub fn reset(&mut self) {
        self.attempt = 0;
    }

    pub fn attempt(&self) -> u32 {
        self.attempt
    }
}

#[derive(Debug, Clone, Copy, Default)]
struct BreakerState {
    consecutive_failures: u32,
    open_until: Option<Instant>,
}

/// Per-host circuit breaker: N consecutive failures opens the circuit for a
/// cooldown; a single success closes it.
#[derive(Debug)]
pub struct HostCircuitBreaker {
    host: String,
    state: BreakerState,
    config: SessionConfig,
}

impl HostCircuitBreaker {
    pub fn new(host: impl Into<String>, config: SessionConfig) -> Self {
        Self { host: host.into(), state: BreakerState::default(), config }
    }

    pub fn is_open(&self) -> bool {
        matches!(self.state.open_until, Some(until) if Instant::now() < until)
    }

    pub fn record_failure(&mut self) {
        self.state.consecutive_failures += 1;
        if self.state.consecutive_failures >= self.config.circuit_breaker_threshold {
            let cooldown = Duration::from_secs(self.config.circuit_breaker_cooldown_secs);
            self.state.open_until = Some(Instant::now() + cooldown);
            warn!(
                host = %self.host,
                failures = self.state.consecutive_failures,
                cooldown_secs = cooldown.as_secs(),
                "circuit opened"
            );
        }
    }

    pub fn record_success(&mut self) {
        if self.state.consecutive_failures > 0 {
            debug!(host = %self.host, prev_failures = self.state.consecutive_failures, "host recovered");
        }
        self.state.consecutive_failures = 0;
        self.state.open_until = None;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeartbeatAction {
    Ok,
    SendPing,
    PongTimeout,
    DataStale,
}

/// Health monitor: a grace period after connect during which staleness is
/// not yet evaluated, then steady-state ping/pong and data-staleness checks.
#[derive(Debug)]
pub struct HeartbeatMonitor {
    config: SessionConfig,
    connected_at: Instant,
    last_ping_sent: Option<Instant>,
    awaiting_pong: bool,
    last_data_received: Instant,
    consecutive_stale_checks: u32,
}

impl HeartbeatMonitor {
    pub fn new(config: SessionConfig) -> Self {
        let now = Instant::now();
        Self {
            config,
            connected_at: now,
            last_ping_sent: None,
            awaiting_pong: false,
            last_data_received: now,
            consecutive_stale_checks: 0,
        }
    }

    pub fn reset(&mut self) {
        let now = Instant::now();
        self.connected_at = now;
        self.last_ping_sent = None;
        self.awaiting_pong = false;
        self.last_data_received = now;
        self.consecutive_stale_checks = 0;
    }

    pub fn record_data_received(&mut self) {
        self.last_data_received = Instant::now();
        self.consecutive_stale_checks = 0;
    }

    pub fn record_ping_sent(&mut self) {
        self.last_ping_sent = Some(Instant::now());
        self.awaiting_pong = true;
    }

    pub fn record_pong_received(&mut self) {
        self.awaiting_pong = false;
    }

    pub fn check(&mut self) -> HeartbeatAction {
        let now = Instant::now();

        if self.awaiting_pong {
            if let Some(ping_time) = self.last_ping_sent {
                if now.duration_since(ping_time) > Duration::from_millis(self.config.pong_timeout_ms) {
                    return HeartbeatAction::PongTimeout;
                }
            }
        }

        let within_grace = now.duration_since(self.connected_at) < Duration::from_millis(self.config.connect_grace_period_ms);
        if !within_grace {
            let data_age = now.duration_since(self.last_data_received);
            if data_age > Duration::from_millis(self.config.stale_data_timeout_ms) {
                self.consecutive_stale_checks += 1;
                if self.consecutive_stale_checks >= self.config.consecutive_stale_threshold {
                    return HeartbeatAction::DataStale;
                }
            }
        }

        let should_ping = match self.last_ping_sent {
            None => true,
            Some(ping_time) => now.duration_since(ping_time) > Duration::from_millis(self.config.ping_interval_ms),
        };
        if should_ping && !self.awaiting_pong {
            return HeartbeatAction::SendPing;
        }

        HeartbeatAction::Ok
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn breaker_opens_after_threshold_and_a_success_closes_it() {
        let mut breaker = HostCircuitBreaker::new(
            "lighter",
            SessionConfig { circuit_breaker_threshold: 3, ..Default::default() },
        );
        for _ in 0..2 {
            breaker.record_failure();
            assert!(!breaker.is_open());
        }
        breaker.record_failure();
        assert!(breaker.is_open());
        breaker.record_success();
        assert!(!breaker.is_open());
    }

    #[test]
    fn backoff_grows_and_resets() {
        let mut backoff = BackoffCalculator::new(SessionConfig::default());
        let first = backoff.next_backoff();
        let second = backoff.next_backoff();
        assert!(second >= first / 2); // jitter tolerant, but generally increasing
        backoff.reset();
        assert_eq!(backoff.attempt(), 0);
    }

    #[test]
    fn heartbeat_requests_ping_when_due() {
        let mut monitor = HeartbeatMonitor::new(SessionConfig { ping_interval_ms: 0, ..Default::default() });
        assert_eq!(monitor.check(), HeartbeatAction::SendPing);
        monitor.record_ping_sent();
        assert_eq!(monitor.check(), HeartbeatAction::Ok);
    }
}
