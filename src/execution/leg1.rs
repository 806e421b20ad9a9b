//! Leg-1 (maker) bounded-attempt loop (§4.3). Runs before the trade's
//! second leg exists, mutating the caller's `TradeLeg` in place so the VWAP
//! accounting in `TradeLeg::apply_fill` stays the single source of truth.

use std::sync::Arc;
use std::time::Duration;

use rust_decimal::Decimal;
use tracing::{info, warn};

use crate::config::ExecutionSettings;
use crate::domain::{MarketInfo, OrderRequest, OrderStatus, OrderType, Side, Symbol, TimeInForce, TradeLeg};
use crate::errors::{EngineError, EngineResult};
use crate::exchange::ExchangePort;

pub enum Leg1Error {
    InsufficientBalance(String),
    HedgeEvaporated(String),
    Failed(String),
}

impl std::fmt::Display for Leg1Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Leg1Error::InsufficientBalance(m) => write!(f, "insufficient balance: {m}"),
            Leg1Error::HedgeEvaporated(m) => write!(f, "hedge evaporated: {m}"),
            Leg1Error::Failed(m) => write!(f, "leg-1 failed: {m}"),
        }
    }
}

fn round_to_tick(price: Decimal, tick: Decimal, side: Side) -> Decimal {
    if tick.is_zero() {
        return price;
    }
    let steps = (price / tick).round();
    let rounded = steps * tick;
    match side {
        // Buy quotes round down so we don't overpay the spread; sell quotes
        // round up so we don't undersell it.
        Side::Buy if rounded > price => rounded - tick,
        Side::Sell if rounded < price => rounded + tick,
        _ => rounded,
    }
}

/// Aggressiveness ramps linearly across attempts within [minAggr, maxAggr].
fn aggressiveness(execution: &ExecutionSettings, attempt: u32, max_attempts: u32) -> Decimal {
    if max_attempts <= 1 {
        return execution.leg1_max_aggressiveness;
    }
    let frac = Decimal::from(attempt) / Decimal::from(max_attempts - 1);
    execution.leg1_min_aggressiveness + (execution.leg1_max_aggressiveness - execution.leg1_min_aggressiveness) * frac
}

/// True if the hedge venue can still absorb `remaining` within the impact
/// cap; false triggers `HedgeEvaporated`.
async fn hedge_can_absorb(hedge_port: &Arc<dyn ExchangePort>, symbol: &Symbol, hedge_side: Side, remaining: Decimal, min_size_ratio: Decimal) -> bool {
    let Ok(l1) = hedge_port.get_orderbook_l1(symbol).await else { return false };
    let top = match hedge_side {
        Side::Buy => l1.best_ask,
        Side::Sell => l1.best_bid,
    };
    let Some(top) = top else { return false };
    if top.qty >= remaining * min_size_ratio {
        return true;
    }
    let Ok(depth) = hedge_port.get_orderbook_depth(symbol, crate::exchange::MAX_DEPTH_LEVELS).await else { return false };
    let (_, filled) = depth.walk(hedge_side, remaining);
    filled >= remaining * min_size_ratio
}

#[allow(clippy::too_many_arguments)]
pub async fn run(
    port: &Arc<dyn ExchangePort>,
    hedge_port: &Arc<dyn ExchangePort>,
    hedge_symbol: &Symbol,
    hedge_side: Side,
    leg: &mut TradeLeg,
    market_info: &MarketInfo,
    execution: &ExecutionSettings,
) -> Result<(), Leg1Error> {
    let symbol = hedge_symbol.clone();
    let side = leg.side;
    let target_qty = leg.qty;
    let max_attempts = execution.leg1_max_attempts.max(1);

    for attempt in 0..max_attempts {
        // 1. Pre-attempt position check: a prior ghost fill may already cover target.
        if let Ok(Some(pos)) = port.get_position(&symbol).await {
            if pos.side == side && pos.qty >= target_qty && leg.filled_qty < target_qty {
                info!(%symbol, "leg-1 pre-attempt check found ghost fill covering target");
                leg.apply_fill(target_qty - leg.filled_qty, pos.entry_price, Decimal::ZERO);
                return Ok(());
            }
        }
        if leg.filled_qty >= target_qty {
            return Ok(());
        }

        // 2. Compute price with linear aggressiveness ramp.
        let l1 = port.get_orderbook_l1(&symbol).await.map_err(|e| Leg1Error::Failed(e.to_string()))?;
        let (near, far) = match side {
            Side::Buy => (l1.best_bid.map(|l| l.price), l1.best_ask.map(|l| l.price)),
            Side::Sell => (l1.best_ask.map(|l| l.price), l1.best_bid.map(|l| l.price)),
        };
        let (Some(near), Some(far)) = (near, far) else {
            return Err(Leg1Error::Failed(format!("{symbol} missing L1 quote")));
        };
        let aggr = aggressiveness(execution, attempt, max_attempts);
        let raw_price = near + (far - near) * aggr;
        let price = round_to_tick(raw_price, market_info.tick_size, side);

        let remaining = target_qty - leg.filled_qty;
        let req = OrderRequest {
            symbol: symbol.clone(),
            venue: port.venue(),
            side,
            qty: remaining,
            order_type: OrderType::Limit,
            price: Some(price),
            tif: TimeInForce::PostOnly,
            reduce_only: false,
        };

        // 3. Place (no pre-existing order to modify: each attempt starts clean
        // after the previous one's cancel/escalate below).
        let order = match port.place_order(req).await {
            Ok(o) => o,
            Err(EngineError::InsufficientBalance(m)) => return Err(Leg1Error::InsufficientBalance(m)),
            Err(EngineError::OrderRejected(m)) => {
                warn!(%symbol, attempt, reason = %m, "leg-1 order rejected, retrying next attempt");
                continue;
            }
            Err(e) => return Err(Leg1Error::Failed(e.to_string())),
        };
        leg.order_id = Some(order.order_id.clone());
        leg.qty_seen = Decimal::ZERO;
        leg.fee_seen = Decimal::ZERO;

        // 4-6. Wait for fill, polling; concurrently check hedge integrity each tick.
        let attempt_timeout = Duration::from_secs(execution.leg1_attempt_timeout_seconds);
        let escalate_after = attempt_timeout.mul_f64(execution.leg1_escalate_after_fraction.to_string().parse().unwrap_or(0.6));
        let poll_interval = Duration::from_millis(250);
        let deadline = tokio::time::Instant::now() + attempt_timeout;
        let escalate_at = tokio::time::Instant::now() + escalate_after;
        let mut escalated = false;

        loop {
            if tokio::time::Instant::now() >= deadline {
                break;
            }
            if !escalated && tokio::time::Instant::now() >= escalate_at {
                port.cancel_order(&symbol, &order.order_id).await.ok();
                escalated = true;
                let remaining = target_qty - leg.filled_qty;
                if remaining <= Decimal::ZERO {
                    break;
                }
                let slip = execution.leg1_escalate_to_taker_slippage_pct;
                let ioc_price = match side {
                    Side::Buy => far * (Decimal::ONE + slip),
                    Side::Sell => far * (Decimal::ONE - slip),
                };
                let ioc_req = OrderRequest {
                    symbol: symbol.clone(),
                    venue: port.venue(),
                    side,
                    qty: remaining,
                    order_type: OrderType::Limit,
                    price: Some(ioc_price),
                    tif: TimeInForce::Ioc,
                    reduce_only: false,
                };
                if let Ok(escalated_order) = port.place_order(ioc_req).await {
                    leg.order_id = Some(escalated_order.order_id.clone());
                    leg.qty_seen = Decimal::ZERO;
                    leg.fee_seen = Decimal::ZERO;
                    let (qty_delta, fee_delta) = leg.accumulate(escalated_order.filled_qty, escalated_order.fee);
                    leg.apply_fill(qty_delta, escalated_order.avg_fill_price, fee_delta);
                }
                break;
            }

            let remaining = target_qty - leg.filled_qty;
            if remaining <= Decimal::ZERO {
                break;
            }
            if !hedge_can_absorb(hedge_port, hedge_symbol, hedge_side, remaining, execution.hedge_integrity_min_size_ratio).await {
                port.cancel_order(&symbol, &order.order_id).await.ok();
                return Err(Leg1Error::HedgeEvaporated(format!("{symbol} hedge depth below {}", execution.hedge_integrity_min_size_ratio)));
            }

            if let Ok(refreshed) = port.get_order(&symbol, &order.order_id).await {
                // 5. Guard against double counting cumulative fills.
                let (qty_delta, fee_delta) = leg.accumulate(refreshed.filled_qty, refreshed.fee);
                if !qty_delta.is_zero() {
                    leg.apply_fill(qty_delta, refreshed.avg_fill_price, fee_delta);
                }
                if refreshed.status == OrderStatus::Filled || leg.filled_qty >= target_qty {
                    break;
                }
            }

            // 6. Ghost-fill reconciliation against the live position delta.
            if let Ok(Some(pos)) = port.get_position(&symbol).await {
                if pos.side == side && pos.qty > leg.filled_qty + Decimal::new(1, 6) {
                    let delta = pos.qty - leg.filled_qty;
                    leg.qty_seen += delta;
                    leg.apply_fill(delta, price, Decimal::ZERO);
                }
            }

            tokio::time::sleep(poll_interval).await;
        }

        if leg.filled_qty >= target_qty {
            return Ok(());
        }
    }

    if leg.filled_qty > Decimal::ZERO {
        Ok(()) // partial fill across attempts is handed to leg-2 sized to the shortfall
    } else {
        Err(Leg1Error::Failed(format!("{symbol} unfilled after {max_attempts} attempts")))
    }
}

pub type Leg1Result = EngineResult<()>;
