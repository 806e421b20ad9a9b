//! Closed error taxonomy (§7). Callers pattern-match on `EngineError` kinds;
//! `anyhow::Error` is for internal context that never crosses a component
//! boundary as a typed value.

use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum EngineError {
    /// Invalid credentials or a failed startup validation. Fatal at startup.
    #[error("configuration error: {0}")]
    Configuration(String),

    /// Transient network/HTTP failure. Retry with backoff; circuit-breaker
    /// counts apply.
    #[error("exchange error ({venue}): {message}")]
    Exchange { venue: String, message: String },

    /// 429/503 or venue-equivalent. Honor `retry_after` when present.
    #[error("rate limited{}", .retry_after.map(|d| format!(", retry after {:?}", d)).unwrap_or_default())]
    RateLimit { retry_after: Option<Duration> },

    /// Permanent rejection by the venue (tick/step violation, crossed
    /// post-only, etc). Do not retry the same request.
    #[error("order rejected: {0}")]
    OrderRejected(String),

    /// Local resource condition. Abort the attempt and the trade; never
    /// pauses the whole engine.
    #[error("insufficient balance: {0}")]
    InsufficientBalance(String),

    /// Hedge venue liquidity evaporated during the leg-1 fill wait.
    #[error("leg-1 hedge evaporated: {0}")]
    Leg1HedgeEvaporated(String),

    /// Expected, user-visible exceptional condition. Logged without a
    /// stack trace.
    #[error("domain error: {0}")]
    Domain(String),

    /// Unexpected fault. Logged with full trace; supervisor attempts
    /// emergency close and the process exits nonzero.
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

pub type EngineResult<T> = Result<T, EngineError>;

impl EngineError {
    /// Propagation policy (§7): these kinds are swallowed by the execution
    /// path into KPI rows + alert events rather than unwound to the caller.
    pub fn is_attempt_local(&self) -> bool {
        matches!(
            self,
            EngineError::Domain(_) | EngineError::OrderRejected(_) | EngineError::InsufficientBalance(_)
        )
    }
}
