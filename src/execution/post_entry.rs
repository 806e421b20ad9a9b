//! Post-entry verification (§4.3): the last safety net before a trade is
//! allowed to stand as `Opened`. Confirms both legs actually show a
//! position on their venue, not just an order-fill report.

use std::sync::Arc;
use std::time::Duration;

use rust_decimal_macros::dec;
use tracing::{error, warn};

use crate::domain::{Trade, Venue};
use crate::exchange::ExchangePort;

const RETRIES: u32 = 3;
const RETRY_DELAY: Duration = Duration::from_secs(1);

/// `Ok(true)` if both legs are confirmed open; `Ok(false)` if verification
/// failed after all retries (the caller must then treat this as a broken
/// hedge and initiate an emergency close).
pub async fn verify(lighter: &Arc<dyn ExchangePort>, x10: &Arc<dyn ExchangePort>, trade: &Trade) -> bool {
    for attempt in 0..RETRIES {
        let (lighter_pos, x10_pos) = tokio::join!(lighter.get_position(&trade.symbol), x10.get_position(&trade.symbol));
        let tolerance = dec!(0.000001);
        let lighter_ok = matches!(lighter_pos, Ok(Some(p)) if p.qty >= trade.leg_l.filled_qty - tolerance);
        let x10_ok = matches!(x10_pos, Ok(Some(p)) if p.qty >= trade.leg_x.filled_qty - tolerance);
        if lighter_ok && x10_ok {
            return true;
        }
        warn!(trade_id = %trade.id, attempt, lighter_ok, x10_ok, "post-entry verification not yet satisfied");
        if attempt + 1 < RETRIES {
            tokio::time::sleep(RETRY_DELAY).await;
        }
    }
    error!(trade_id = %trade.id, "post-entry verification failed, hedge is broken");
    false
}

/// Emergency reduce-only close of whichever leg actually has exposure, used
/// when post-entry verification fails. Best-effort: logs and swallows
/// individual leg failures since the trade is already being marked Closing.
pub async fn emergency_close_remaining_leg(lighter: &Arc<dyn ExchangePort>, x10: &Arc<dyn ExchangePort>, trade: &Trade) {
    for (venue, port) in [(Venue::Lighter, lighter), (Venue::X10, x10)] {
        let leg = trade.leg(venue);
        if leg.filled_qty.is_zero() {
            continue;
        }
        let close_side = leg.side.opposite();
        let req = crate::domain::OrderRequest {
            symbol: trade.symbol.clone(),
            venue,
            side: close_side,
            qty: leg.filled_qty,
            order_type: crate::domain::OrderType::Market,
            price: None,
            tif: crate::domain::TimeInForce::Ioc,
            reduce_only: true,
        };
        if let Err(e) = port.place_order(req).await {
            error!(trade_id = %trade.id, %venue, error = %e, "emergency close failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{Side, TradeEvent, TradeLeg, TradeStatus};
    use crate::execution::test_support::MockPort;
    use rust_decimal_macros::dec;

    fn opened_trade() -> Trade {
        let mut leg_l = TradeLeg::new(Venue::Lighter, Side::Buy, dec!(0.2));
        leg_l.apply_fill(dec!(0.2), dec!(2000), dec!(0.1));
        let mut leg_x = TradeLeg::new(Venue::X10, Side::Sell, dec!(0.2));
        leg_x.apply_fill(dec!(0.2), dec!(2000), dec!(0.1));
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
            execution_state: crate::domain::ExecutionState::LegTwoInProgress,
            funding_collected: rust_decimal::Decimal::ZERO,
            last_funding_update: None,
            realized_pnl: rust_decimal::Decimal::ZERO,
            unrealized_pnl: rust_decimal::Decimal::ZERO,
            high_water_mark: rust_decimal::Decimal::ZERO,
            close_reason: None,
            created_at: chrono::Utc::now(),
            opened_at: None,
            closed_at: None,
            events: Vec::<TradeEvent>::new(),
            net_funding_migrated: false,
        }
    }

    #[tokio::test]
    async fn verify_succeeds_when_both_legs_confirmed() {
        let trade = opened_trade();
        let lighter: Arc<dyn ExchangePort> =
            Arc::new(MockPort::new(Venue::Lighter).with_position_qty(dec!(0.2)));
        let x10: Arc<dyn ExchangePort> = Arc::new(MockPort::new(Venue::X10).with_position_qty(dec!(0.2)));
        assert!(verify(&lighter, &x10, &trade).await);
    }

    #[tokio::test]
    async fn verify_fails_after_retries_when_leg_missing() {
        let trade = opened_trade();
        let lighter: Arc<dyn ExchangePort> = Arc::new(MockPort::new(Venue::Lighter).with_flat_after_close());
        let x10: Arc<dyn ExchangePort> = Arc::new(MockPort::new(Venue::X10).with_position_qty(dec!(0.2)));
        assert!(!verify(&lighter, &x10, &trade).await);
    }
}
