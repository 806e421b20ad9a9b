//! `tracing-subscriber` bootstrap, matching the teacher's `main.rs` pattern,
//! plus the read-only snapshot structs that feed the out-of-scope HTTP
//! dashboard (§6 "the core must expose read snapshots ... without blocking").

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::Serialize;
use tracing_subscriber::EnvFilter;

use crate::domain::{Symbol, TradeStatus};

pub fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .init();
}

#[derive(Debug, Clone, Serialize)]
pub struct StatusSnapshot {
    pub live_trading: bool,
    pub paused: bool,
    pub pause_reason: Option<String>,
    pub open_trade_count: usize,
    pub write_queue_depth: usize,
    pub as_of: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize)]
pub struct PositionSnapshot {
    pub symbol: Symbol,
    pub status: TradeStatus,
    pub unrealized_pnl: Decimal,
    pub age_seconds: i64,
}

#[derive(Debug, Clone, Serialize)]
pub struct PositionsSnapshot {
    pub positions: Vec<PositionSnapshot>,
    pub as_of: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize)]
pub struct PnlSnapshot {
    pub realized_total: Decimal,
    pub unrealized_total: Decimal,
    pub funding_collected_total: Decimal,
    pub as_of: DateTime<Utc>,
}
