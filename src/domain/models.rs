//! Core domain entities shared by every component.
//!
//! Every price/qty/pnl field is a `Decimal` — see `decimal_utils` for the
//! parsing/clamping helpers applied at the system's boundaries.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;

pub type Symbol = String;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Venue {
    Lighter,
    X10,
}

impl fmt::Display for Venue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Lighter => write!(f, "lighter"),
            Self::X10 => write!(f, "x10"),
        }
    }
}

impl Venue {
    pub fn other(self) -> Venue {
        match self {
            Venue::Lighter => Venue::X10,
            Venue::X10 => Venue::Lighter,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Side {
    Buy,
    Sell,
}

impl Side {
    pub fn opposite(self) -> Side {
        match self {
            Side::Buy => Side::Sell,
            Side::Sell => Side::Buy,
        }
    }

    /// +1 for Buy, -1 for Sell — used in price-pnl sign math.
    pub fn sign(self) -> Decimal {
        match self {
            Side::Buy => Decimal::ONE,
            Side::Sell => -Decimal::ONE,
        }
    }
}

#[derive(Debug, Clone)]
pub struct MarketInfo {
    pub symbol: Symbol,
    pub venue: Venue,
    pub base_asset: String,
    pub quote_asset: String,
    pub tick_size: Decimal,
    pub step_size: Decimal,
    pub min_order_size: Decimal,
    pub max_leverage: Decimal,
}

#[derive(Debug, Clone)]
pub struct FundingRate {
    pub symbol: Symbol,
    pub venue: Venue,
    /// Decimal fraction per hour, e.g. 0.0001 = 0.01%/h.
    pub hourly_rate: Decimal,
    pub next_funding_time: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct PriceSnapshot {
    pub symbol: Symbol,
    pub venue: Venue,
    pub mark_price: Decimal,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct OrderbookLevel {
    pub price: Decimal,
    pub qty: Decimal,
}

#[derive(Debug, Clone)]
pub struct OrderbookSnapshot {
    pub symbol: Symbol,
    pub venue: Venue,
    pub best_bid: Option<OrderbookLevel>,
    pub best_ask: Option<OrderbookLevel>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct OrderbookDepthSnapshot {
    pub symbol: Symbol,
    pub venue: Venue,
    pub bids: Vec<OrderbookLevel>,
    pub asks: Vec<OrderbookLevel>,
    pub updated_at: DateTime<Utc>,
}

impl OrderbookDepthSnapshot {
    /// Walk levels on `side` until `qty` is filled or depth runs out, returning
    /// the notional-weighted average price and the qty actually fillable.
    pub fn walk(&self, side: Side, qty: Decimal) -> (Decimal, Decimal) {
        let levels: &[OrderbookLevel] = match side {
            Side::Buy => &self.asks,
            Side::Sell => &self.bids,
        };
        let mut remaining = qty;
        let mut notional = Decimal::ZERO;
        let mut filled = Decimal::ZERO;
        for level in levels {
            if remaining <= Decimal::ZERO {
                break;
            }
            let take = remaining.min(level.qty);
            notional += take * level.price;
            filled += take;
            remaining -= take;
        }
        if filled.is_zero() {
            return (Decimal::ZERO, Decimal::ZERO);
        }
        (notional / filled, filled)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Position {
    pub venue: Venue,
    pub side: Side,
    pub qty: Decimal,
    pub entry_price: Decimal,
    pub mark_price: Decimal,
    pub liquidation_price: Option<Decimal>,
}

impl Position {
    /// Venues report `qty == 0` as "no position"; callers filter these out.
    pub fn is_flat(&self, tolerance: Decimal) -> bool {
        self.qty.abs() <= tolerance
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OrderType {
    Limit,
    Market,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TimeInForce {
    Gtc,
    Ioc,
    PostOnly,
}

#[derive(Debug, Clone)]
pub struct OrderRequest {
    pub symbol: Symbol,
    pub venue: Venue,
    pub side: Side,
    pub qty: Decimal,
    pub order_type: OrderType,
    pub price: Option<Decimal>,
    pub tif: TimeInForce,
    pub reduce_only: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OrderStatus {
    Pending,
    Open,
    PartiallyFilled,
    Filled,
    Cancelled,
    Rejected,
    Expired,
}

impl OrderStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            OrderStatus::Filled | OrderStatus::Cancelled | OrderStatus::Rejected | OrderStatus::Expired
        )
    }
}

#[derive(Debug, Clone)]
pub struct Order {
    pub order_id: String,
    pub client_order_id: String,
    pub symbol: Symbol,
    pub venue: Venue,
    pub side: Side,
    pub qty: Decimal,
    pub price: Option<Decimal>,
    pub status: OrderStatus,
    pub filled_qty: Decimal,
    pub avg_fill_price: Decimal,
    pub fee: Decimal,
}

impl Order {
    /// `filledQty <= qty`; `avgFillPrice == 0` iff `filledQty == 0`.
    pub fn invariants_hold(&self) -> bool {
        self.filled_qty <= self.qty
            && (self.filled_qty.is_zero() == self.avg_fill_price.is_zero())
    }
}

#[derive(Debug, Clone)]
pub struct TradeLeg {
    pub venue: Venue,
    pub side: Side,
    pub order_id: Option<String>,
    pub qty: Decimal,
    pub filled_qty: Decimal,
    pub entry_price: Decimal,
    pub exit_price: Option<Decimal>,
    pub fees: Decimal,
    /// cumulative-fill accounting high-water-marks for this leg's orders,
    /// keyed by order id — prevents double counting cumulative reports.
    pub qty_seen: Decimal,
    pub fee_seen: Decimal,
}

impl TradeLeg {
    pub fn new(venue: Venue, side: Side, qty: Decimal) -> Self {
        Self {
            venue,
            side,
            order_id: None,
            qty,
            filled_qty: Decimal::ZERO,
            entry_price: Decimal::ZERO,
            exit_price: None,
            fees: Decimal::ZERO,
            qty_seen: Decimal::ZERO,
            fee_seen: Decimal::ZERO,
        }
    }

    /// §8 property 6: replaying the same cumulative (qty, fee) twice yields a
    /// zero delta. Returns the *new* qty/fee delta since the last observation.
    pub fn accumulate(&mut self, cum_qty: Decimal, cum_fee: Decimal) -> (Decimal, Decimal) {
        let qty_delta = (cum_qty - self.qty_seen).max(Decimal::ZERO);
        let fee_delta = (cum_fee - self.fee_seen).max(Decimal::ZERO);
        self.qty_seen = self.qty_seen.max(cum_qty);
        self.fee_seen = self.fee_seen.max(cum_fee);
        (qty_delta, fee_delta)
    }

    /// Running VWAP update when a new fill delta lands at `fill_price`.
    pub fn apply_fill(&mut self, fill_qty: Decimal, fill_price: Decimal, fee: Decimal) {
        if fill_qty <= Decimal::ZERO {
            return;
        }
        let prior_notional = self.entry_price * self.filled_qty;
        let new_notional = prior_notional + fill_price * fill_qty;
        self.filled_qty += fill_qty;
        self.fees += fee;
        if !self.filled_qty.is_zero() {
            self.entry_price = new_notional / self.filled_qty;
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TradeStatus {
    Pending,
    Opening,
    Open,
    Closing,
    Rollback,
    Failed,
    Closed,
    Rejected,
}

impl TradeStatus {
    /// The status DAG edges are the only permitted transitions.
    pub fn can_transition_to(self, next: TradeStatus) -> bool {
        use TradeStatus::*;
        matches!(
            (self, next),
            (Pending, Opening)
                | (Opening, Open)
                | (Opening, Rollback)
                | (Opening, Failed)
                | (Opening, Rejected)
                | (Open, Closing)
                | (Closing, Closed)
                | (Closing, Failed)
                | (Closing, Open) // rebalance returns to Open without closing
                | (Rollback, Failed)
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ExecutionState {
    Pending,
    LegOneInProgress,
    LegOneFilled,
    LegTwoInProgress,
    Opened,
    Aborted,
    RollbackQueued,
    RollbackInProgress,
    RollbackDone,
    RollbackFailed,
    Failed,
}

#[derive(Debug, Clone)]
pub struct TradeEvent {
    pub at: DateTime<Utc>,
    pub kind: String,
    pub detail: String,
}

#[derive(Debug, Clone)]
pub struct Trade {
    pub id: String,
    pub symbol: Symbol,
    pub leg_l: TradeLeg,
    pub leg_x: TradeLeg,
    pub target_qty: Decimal,
    pub target_notional: Decimal,
    pub entry_apy: Decimal,
    pub entry_spread: Decimal,
    pub status: TradeStatus,
    pub execution_state: ExecutionState,
    pub funding_collected: Decimal,
    pub last_funding_update: Option<DateTime<Utc>>,
    pub realized_pnl: Decimal,
    pub unrealized_pnl: Decimal,
    pub high_water_mark: Decimal,
    pub close_reason: Option<String>,
    pub created_at: DateTime<Utc>,
    pub opened_at: Option<DateTime<Utc>>,
    pub closed_at: Option<DateTime<Utc>>,
    pub events: Vec<TradeEvent>,
    /// True once this trade's legacy NET funding migration has run (§9 OQ3).
    pub net_funding_migrated: bool,
}

impl Trade {
    pub fn leg(&self, venue: Venue) -> &TradeLeg {
        match venue {
            Venue::Lighter => &self.leg_l,
            Venue::X10 => &self.leg_x,
        }
    }

    pub fn leg_mut(&mut self, venue: Venue) -> &mut TradeLeg {
        match venue {
            Venue::Lighter => &mut self.leg_l,
            Venue::X10 => &mut self.leg_x,
        }
    }

    /// §8 property 4: once Closed, no further status mutation is permitted
    /// (except post-hoc funding reconciliation fields, handled separately).
    pub fn transition(&mut self, next: TradeStatus) -> Result<(), crate::errors::EngineError> {
        if self.status == TradeStatus::Closed {
            return Err(crate::errors::EngineError::Domain(format!(
                "trade {} already closed, cannot transition to {:?}",
                self.id, next
            )));
        }
        if !self.status.can_transition_to(next) {
            return Err(crate::errors::EngineError::Domain(format!(
                "trade {} illegal transition {:?} -> {:?}",
                self.id, self.status, next
            )));
        }
        self.push_event("status_transition", &format!("{:?} -> {:?}", self.status, next));
        self.status = next;
        Ok(())
    }

    pub fn push_event(&mut self, kind: &str, detail: &str) {
        self.events.push(TradeEvent {
            at: Utc::now(),
            kind: kind.to_string(),
            detail: detail.to_string(),
        });
    }

    /// §8 property 2: leg parity at Open.
    pub fn leg_parity_ok(&self, tolerance: Decimal) -> bool {
        (self.leg_l.filled_qty - self.leg_x.filled_qty).abs() <= tolerance
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FundingEvent {
    pub trade_id_hash: u64,
    pub venue: Venue,
    /// positive = received, negative = paid.
    pub amount: Decimal,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AttemptMode {
    Live,
    Paper,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AttemptStatus {
    Started,
    Opened,
    Rejected,
    Failed,
    Closed,
}

#[derive(Debug, Clone, Default)]
pub struct AttemptKpis {
    pub entry_spread: Option<Decimal>,
    pub slippage_bps: Option<Decimal>,
    pub fill_seconds: Option<f64>,
    pub hedge_latency_submit_ms: Option<f64>,
    pub hedge_latency_ack_ms: Option<f64>,
    pub expected_value_usd: Option<Decimal>,
    pub breakeven_hours: Option<Decimal>,
}

#[derive(Debug, Clone)]
pub struct ExecutionAttempt {
    pub attempt_id: String,
    pub trade_id: Option<String>,
    pub symbol: Symbol,
    pub mode: AttemptMode,
    pub status: AttemptStatus,
    pub stage: String,
    pub reason: Option<String>,
    pub kpis: AttemptKpis,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy)]
pub struct FundingCandle {
    pub symbol_hash: u64,
    pub venue: Venue,
    pub timestamp: DateTime<Utc>,
    pub hourly_rate: Decimal,
    pub apy: Decimal,
}

/// Ranked scan output from the opportunity engine (C5).
#[derive(Debug, Clone)]
pub struct Opportunity {
    pub symbol: Symbol,
    pub long_venue: Venue,
    pub short_venue: Venue,
    pub apy: Decimal,
    pub spread: Decimal,
    pub suggested_qty: Decimal,
    pub suggested_notional: Decimal,
    pub mid_price: Decimal,
    pub breakeven_hours: Decimal,
    pub expected_value_usd: Decimal,
}

/// Per-symbol historical funding-APY distribution, feeding E6 (Z-score crash).
/// Dropped from the distilled spec, kept per `original_source`'s write_queue.
#[derive(Debug, Clone)]
pub struct VolatilityProfile {
    pub symbol: Symbol,
    pub period_days: u32,
    pub calculated_at: DateTime<Utc>,
    pub sample_count: usize,
    pub hourly_std_dev: Decimal,
    pub hourly_range_avg: Decimal,
    pub crash_frequency: Decimal,
    pub avg_crash_duration_minutes: Decimal,
    pub avg_recovery_time_minutes: Decimal,
    pub apy_mean: Decimal,
    pub apy_std: Decimal,
    pub p25: Decimal,
    pub p50: Decimal,
    pub p75: Decimal,
    pub p90: Decimal,
    pub p95: Decimal,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CrashSeverity {
    Crash,
    Emergency,
}

#[derive(Debug, Clone)]
pub struct FundingCrashEvent {
    pub symbol: Symbol,
    pub detected_at: DateTime<Utc>,
    pub z_score: Decimal,
    pub severity: CrashSeverity,
}
