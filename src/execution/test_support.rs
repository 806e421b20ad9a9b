//! Shared `ExchangePort` double for this module's unit tests. Not compiled
//! outside `#[cfg(test)]`.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;

use crate::domain::{
    FundingRate, MarketInfo, Order, OrderRequest, OrderStatus, OrderbookDepthSnapshot, OrderbookLevel, OrderbookSnapshot,
    Position, Side, Symbol, Venue,
};
use crate::errors::{EngineError, EngineResult};
use crate::exchange::{ExchangePort, FeeSchedule};

/// Minimal, fully-configurable `ExchangePort` double. Every method has a
/// sane success-path default; `with_*` builders opt individual tests into
/// failure modes.
pub struct MockPort {
    venue: Venue,
    order_should_fail: bool,
    position_after_close: Mutex<Option<Position>>,
}

impl MockPort {
    pub fn new(venue: Venue) -> Self {
        Self { venue, order_should_fail: false, position_after_close: Mutex::new(None) }
    }

    pub fn with_order_failure(mut self) -> Self {
        self.order_should_fail = true;
        self
    }

    /// Position reads as flat after a close order is placed.
    pub fn with_flat_after_close(self) -> Self {
        *self.position_after_close.lock() = Some(Position {
            venue: self.venue,
            side: Side::Buy,
            qty: Decimal::ZERO,
            entry_price: Decimal::ZERO,
            mark_price: Decimal::ZERO,
            liquidation_price: None,
        });
        self
    }

    /// `get_position` returns this qty for every subsequent call.
    pub fn with_position_qty(self, residual_qty: Decimal) -> Self {
        *self.position_after_close.lock() = Some(Position {
            venue: self.venue,
            side: Side::Buy,
            qty: residual_qty,
            entry_price: dec!(2000),
            mark_price: dec!(2000),
            liquidation_price: None,
        });
        self
    }
}

#[async_trait]
impl ExchangePort for MockPort {
    async fn initialize(&self) -> EngineResult<()> {
        Ok(())
    }
    async fn close(&self) -> EngineResult<()> {
        Ok(())
    }
    async fn load_markets(&self) -> EngineResult<Vec<MarketInfo>> {
        Ok(vec![])
    }
    async fn get_market_info(&self, symbol: &Symbol) -> EngineResult<MarketInfo> {
        Ok(MarketInfo {
            symbol: symbol.clone(),
            venue: self.venue,
            base_asset: symbol.clone(),
            quote_asset: "USD".to_string(),
            tick_size: dec!(0.01),
            step_size: dec!(0.001),
            min_order_size: dec!(0.001),
            max_leverage: dec!(10),
        })
    }
    async fn get_mark_price(&self, _symbol: &Symbol) -> EngineResult<Decimal> {
        Ok(dec!(2000))
    }
    async fn get_funding_rate(&self, symbol: &Symbol) -> EngineResult<FundingRate> {
        Ok(FundingRate { symbol: symbol.clone(), venue: self.venue, hourly_rate: dec!(0.0001), next_funding_time: Utc::now() })
    }
    async fn get_orderbook_l1(&self, symbol: &Symbol) -> EngineResult<OrderbookSnapshot> {
        Ok(OrderbookSnapshot {
            symbol: symbol.clone(),
            venue: self.venue,
            best_bid: Some(OrderbookLevel { price: dec!(1999), qty: dec!(1) }),
            best_ask: Some(OrderbookLevel { price: dec!(2001), qty: dec!(1) }),
            updated_at: Utc::now(),
        })
    }
    async fn get_orderbook_depth(&self, symbol: &Symbol, _levels: u32) -> EngineResult<OrderbookDepthSnapshot> {
        Ok(OrderbookDepthSnapshot {
            symbol: symbol.clone(),
            venue: self.venue,
            bids: vec![OrderbookLevel { price: dec!(1999), qty: dec!(10) }],
            asks: vec![OrderbookLevel { price: dec!(2001), qty: dec!(10) }],
            updated_at: Utc::now(),
        })
    }
    async fn get_available_balance(&self) -> EngineResult<Decimal> {
        Ok(dec!(10000))
    }
    fn fee_schedule(&self, _symbol: Option<&Symbol>) -> FeeSchedule {
        FeeSchedule::default()
    }
    async fn list_positions(&self) -> EngineResult<Vec<(Symbol, Position)>> {
        Ok(vec![])
    }
    async fn get_position(&self, _symbol: &Symbol) -> EngineResult<Option<Position>> {
        Ok(self.position_after_close.lock().clone())
    }
    async fn get_realized_funding(&self, _symbol: &Symbol, _since: DateTime<Utc>) -> EngineResult<Decimal> {
        Ok(Decimal::ZERO)
    }
    async fn place_order(&self, req: OrderRequest) -> EngineResult<Order> {
        if self.order_should_fail {
            return Err(EngineError::Domain("mock order rejected".to_string()));
        }
        Ok(Order {
            order_id: "mock-1".to_string(),
            client_order_id: "mock-client-1".to_string(),
            symbol: req.symbol,
            venue: self.venue,
            side: req.side,
            qty: req.qty,
            price: req.price,
            status: OrderStatus::Filled,
            filled_qty: req.qty,
            avg_fill_price: req.price.unwrap_or(dec!(2000)),
            fee: req.qty * dec!(0.0005),
        })
    }
    async fn get_order(&self, symbol: &Symbol, order_id: &str) -> EngineResult<Order> {
        Ok(Order {
            order_id: order_id.to_string(),
            client_order_id: "mock-client-1".to_string(),
            symbol: symbol.clone(),
            venue: self.venue,
            side: Side::Buy,
            qty: dec!(0),
            price: None,
            status: OrderStatus::Filled,
            filled_qty: dec!(0),
            avg_fill_price: dec!(0),
            fee: dec!(0),
        })
    }
    async fn cancel_order(&self, _symbol: &Symbol, _order_id: &str) -> EngineResult<()> {
        Ok(())
    }
    async fn cancel_all_orders(&self, _symbol: Option<&Symbol>) -> EngineResult<()> {
        Ok(())
    }
    fn venue(&self) -> Venue {
        self.venue
    }
}

pub fn arc_mock(venue: Venue) -> Arc<dyn ExchangePort> {
    Arc::new(MockPort::new(venue))
}
