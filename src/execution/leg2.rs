//! Leg-2 (hedge) single-attempt IOC execution (§4.3): always a taker fill
//! against a fresh L1/depth VWAP, with one price escalation if the first
//! attempt leaves a remainder.

use std::sync::Arc;
use std::time::Duration;

use rust_decimal::Decimal;
use tracing::warn;

use crate::config::ExecutionSettings;
use crate::domain::{OrderRequest, OrderType, Side, Symbol, TimeInForce, TradeLeg};
use crate::errors::EngineResult;
use crate::exchange::ExchangePort;

/// Hedge-latency KPIs, both measured from the leg-1 fill instant.
pub struct Leg2Timing {
    pub submit_ms: f64,
    pub ack_ms: f64,
}

async fn ioc_price(port: &Arc<dyn ExchangePort>, symbol: &Symbol, side: Side, qty: Decimal, slippage_pct: Decimal) -> EngineResult<Decimal> {
    let depth = port.get_orderbook_depth(symbol, crate::exchange::MAX_DEPTH_LEVELS).await?;
    let (vwap, filled) = depth.walk(side, qty);
    let reference = if filled >= qty {
        vwap
    } else {
        let l1 = port.get_orderbook_l1(symbol).await?;
        match side {
            Side::Buy => l1.best_ask.map(|l| l.price).unwrap_or(vwap),
            Side::Sell => l1.best_bid.map(|l| l.price).unwrap_or(vwap),
        }
    };
    Ok(match side {
        Side::Buy => reference * (Decimal::ONE + slippage_pct),
        Side::Sell => reference * (Decimal::ONE - slippage_pct),
    })
}

/// Places the hedge leg, escalating price once within the slippage cap if
/// the first IOC leaves a remainder. Mutates `leg` with VWAP fill accounting.
pub async fn run(port: &Arc<dyn ExchangePort>, symbol: &Symbol, leg: &mut TradeLeg, execution: &ExecutionSettings) -> Result<Leg2Timing, String> {
    let submit_start = tokio::time::Instant::now();
    let target_qty = leg.qty;
    let slip = execution.x10_close_slippage_pct;

    let price = ioc_price(port, symbol, leg.side, target_qty, slip).await.map_err(|e| e.to_string())?;
    let req = OrderRequest {
        symbol: symbol.clone(),
        venue: port.venue(),
        side: leg.side,
        qty: target_qty,
        order_type: OrderType::Limit,
        price: Some(price),
        tif: TimeInForce::Ioc,
        reduce_only: false,
    };
    let ack_start = tokio::time::Instant::now();
    let order = port.place_order(req).await.map_err(|e| e.to_string())?;
    let ack_ms = ack_start.elapsed().as_secs_f64() * 1000.0;
    leg.order_id = Some(order.order_id.clone());
    leg.apply_fill(order.filled_qty, order.avg_fill_price, order.fee);

    let remaining = target_qty - leg.filled_qty;
    if remaining > Decimal::ZERO {
        warn!(%symbol, %remaining, "leg-2 IOC left a remainder, escalating once");
        tokio::time::sleep(Duration::from_millis(50)).await;
        let escalated_price = ioc_price(port, symbol, leg.side, remaining, slip * Decimal::TWO).await.map_err(|e| e.to_string())?;
        let escalated_req = OrderRequest {
            symbol: symbol.clone(),
            venue: port.venue(),
            side: leg.side,
            qty: remaining,
            order_type: OrderType::Limit,
            price: Some(escalated_price),
            tif: TimeInForce::Ioc,
            reduce_only: false,
        };
        if let Ok(escalated) = port.place_order(escalated_req).await {
            leg.apply_fill(escalated.filled_qty, escalated.avg_fill_price, escalated.fee);
        }
    }

    let submit_ms = submit_start.elapsed().as_secs_f64() * 1000.0;
    Ok(Leg2Timing { submit_ms, ack_ms })
}
