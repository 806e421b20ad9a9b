//! Rollback (§4.3): unwinds a trade that failed after leg-1 filled but
//! before both legs were confirmed open. Reduce-only market-closes
//! whatever exposure exists, then verifies flat.

use std::sync::Arc;

use rust_decimal_macros::dec;
use tracing::{error, info};

use crate::domain::{OrderRequest, OrderType, TimeInForce, Trade, Venue};
use crate::exchange::ExchangePort;

pub struct RollbackOutcome {
    pub done: bool,
}

async fn flatten_leg(port: &Arc<dyn ExchangePort>, trade: &Trade, venue: Venue) -> bool {
    let leg = trade.leg(venue);
    if leg.filled_qty.is_zero() {
        return true;
    }
    let req = OrderRequest {
        symbol: trade.symbol.clone(),
        venue,
        side: leg.side.opposite(),
        qty: leg.filled_qty,
        order_type: OrderType::Market,
        price: None,
        tif: TimeInForce::Ioc,
        reduce_only: true,
    };
    if let Err(e) = port.place_order(req).await {
        error!(trade_id = %trade.id, %venue, error = %e, "rollback close failed");
        return false;
    }
    match port.get_position(&trade.symbol).await {
        Ok(pos) => pos.map(|p| p.is_flat(dec!(0.0000001))).unwrap_or(true),
        Err(_) => false,
    }
}

/// Closes whatever exposure exists on both legs reduce-only and verifies
/// flat. `RollbackDone` on success, `RollbackFailed` (operator alert) otherwise.
pub async fn run(lighter: &Arc<dyn ExchangePort>, x10: &Arc<dyn ExchangePort>, trade: &Trade) -> RollbackOutcome {
    let (lighter_flat, x10_flat) = tokio::join!(flatten_leg(lighter, trade, Venue::Lighter), flatten_leg(x10, trade, Venue::X10));
    let done = lighter_flat && x10_flat;
    if done {
        info!(trade_id = %trade.id, "rollback complete, position flat");
    } else {
        error!(trade_id = %trade.id, "rollback failed, position not confirmed flat — operator alert required");
    }
    RollbackOutcome { done }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{Side, TradeEvent, TradeLeg, TradeStatus};
    use crate::execution::test_support::MockPort;
    use rust_decimal::Decimal;
    use rust_decimal_macros::dec;

    fn partially_filled_trade() -> Trade {
        let mut leg_l = TradeLeg::new(Venue::Lighter, Side::Buy, dec!(0.2));
        leg_l.apply_fill(dec!(0.05), dec!(2000), dec!(0.1));
        let leg_x = TradeLeg::new(Venue::X10, Side::Sell, dec!(0.2));
        Trade {
            id: "t1".to_string(),
            symbol: "ETH".to_string(),
            leg_l,
            leg_x,
            target_qty: dec!(0.2),
            target_notional: dec!(400),
            entry_apy: dec!(0.5),
            entry_spread: dec!(0.001),
            status: TradeStatus::Opening,
            execution_state: crate::domain::ExecutionState::LegOneInProgress,
            funding_collected: Decimal::ZERO,
            last_funding_update: None,
            realized_pnl: Decimal::ZERO,
            unrealized_pnl: Decimal::ZERO,
            high_water_mark: Decimal::ZERO,
            close_reason: None,
            created_at: chrono::Utc::now(),
            opened_at: None,
            closed_at: None,
            events: Vec::<TradeEvent>::new(),
            net_funding_migrated: false,
        }
    }

    #[tokio::test]
    async fn rollback_succeeds_when_flatten_confirms_flat() {
        let trade = partially_filled_trade();
        let lighter: Arc<dyn ExchangePort> = Arc::new(MockPort::new(Venue::Lighter).with_flat_after_close());
        let x10: Arc<dyn ExchangePort> = Arc::new(MockPort::new(Venue::X10));
        let outcome = run(&lighter, &x10, &trade).await;
        assert!(outcome.done);
    }

    #[tokio::test]
    async fn rollback_fails_when_position_not_confirmed_flat() {
        let trade = partially_filled_trade();
        let lighter: Arc<dyn ExchangePort> = Arc::new(MockPort::new(Venue::Lighter).with_position_qty(dec!(0.05)));
        let x10: Arc<dyn ExchangePort> = Arc::new(MockPort::new(Venue::X10));
        let outcome = run(&lighter, &x10, &trade).await;
        assert!(!outcome.done);
    }

    #[tokio::test]
    async fn leg_with_no_fill_is_treated_as_already_flat() {
        // x10 leg never filled, so flatten_leg should short-circuit true
        // without placing an order.
        let trade = partially_filled_trade();
        let lighter: Arc<dyn ExchangePort> = Arc::new(MockPort::new(Venue::Lighter).with_flat_after_close());
        let x10: Arc<dyn ExchangePort> = Arc::new(MockPort::new(Venue::X10).with_order_failure());
        let outcome = run(&lighter, &x10, &trade).await;
        assert!(outcome.done);
    }
}
