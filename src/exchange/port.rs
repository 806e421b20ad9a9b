//! Uniform per-venue interface (C1). Concrete adapters translate
//! venue-native shapes into these domain types; higher layers never see a
//! venue-specific struct. Grounded on
//! `original_source/src/funding_bot/ports/exchange.py`'s `ExchangePort` ABC.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;

use crate::domain::{
    FundingRate, MarketInfo, Order, OrderRequest, OrderbookDepthSnapshot, OrderbookSnapshot, Position, Symbol,
};
use crate::errors::EngineResult;

/// Venue REST API maximum for depth requests; every adapter clamps to this
/// in one place so callers never need to know per-venue limits.
pub const MAX_DEPTH_LEVELS: u32 = 200;

pub fn clamp_depth_levels(levels: u32) -> u32 {
    levels.min(MAX_DEPTH_LEVELS)
}

#[derive(Debug, Clone, Copy, Default)]
pub struct FeeSchedule {
    pub maker_bps: Decimal,
    pub taker_bps: Decimal,
}

pub type OrderUpdateCallback = Box<dyn Fn(Order) + Send + Sync>;
pub type PositionUpdateCallback = Box<dyn Fn(Position) + Send + Sync>;
pub type FundingUpdateCallback = Box<dyn Fn(FundingRate) + Send + Sync>;
pub type OrderbookUpdateCallback = Box<dyn Fn(OrderbookSnapshot) + Send + Sync>;

#[async_trait]
pub trait ExchangePort: Send + Sync {
    async fn initialize(&self) -> EngineResult<()>;
    async fn close(&self) -> EngineResult<()>;

    async fn load_markets(&self) -> EngineResult<Vec<MarketInfo>>;
    async fn get_market_info(&self, symbol: &Symbol) -> EngineResult<MarketInfo>;
    async fn get_mark_price(&self, symbol: &Symbol) -> EngineResult<Decimal>;
    async fn get_funding_rate(&self, symbol: &Symbol) -> EngineResult<FundingRate>;
    async fn get_orderbook_l1(&self, symbol: &Symbol) -> EngineResult<OrderbookSnapshot>;
    async fn get_orderbook_depth(&self, symbol: &Symbol, levels: u32) -> EngineResult<OrderbookDepthSnapshot>;

    async fn get_available_balance(&self) -> EngineResult<Decimal>;
    /// Fee schedules are fetched once in `initialize()` and cached; this
    /// accessor never makes a network call.
    fn fee_schedule(&self, symbol: Option<&Symbol>) -> FeeSchedule;

    async fn list_positions(&self) -> EngineResult<Vec<(Symbol, Position)>>;
    async fn get_position(&self, symbol: &Symbol) -> EngineResult<Option<Position>>;
    async fn get_realized_funding(&self, symbol: &Symbol, since: DateTime<Utc>) -> EngineResult<Decimal>;

    async fn place_order(&self, req: OrderRequest) -> EngineResult<Order>;
    async fn get_order(&self, symbol: &Symbol, order_id: &str) -> EngineResult<Order>;
    async fn cancel_order(&self, symbol: &Symbol, order_id: &str) -> EngineResult<()>;
    async fn cancel_all_orders(&self, symbol: Option<&Symbol>) -> EngineResult<()>;
    /// Default implementation: modify is not supported, callers fall back to
    /// cancel+place (mirrors the Python ABC's `modify_order` default False).
    async fn modify_order(
        &self,
        _symbol: &Symbol,
        _order_id: &str,
        _price: Option<Decimal>,
        _qty: Option<Decimal>,
    ) -> EngineResult<Option<Order>> {
        Ok(None)
    }

    /// Streams default to no-ops for adapters that only support polling.
    async fn subscribe_positions(&self, _cb: PositionUpdateCallback) -> EngineResult<()> {
        Ok(())
    }
    async fn subscribe_orders(&self, _cb: OrderUpdateCallback) -> EngineResult<()> {
        Ok(())
    }
    async fn subscribe_funding(&self, _cb: FundingUpdateCallback) -> EngineResult<()> {
        Ok(())
    }
    async fn subscribe_orderbook_l1(&self, _symbols: Option<&[Symbol]>, _cb: OrderbookUpdateCallback) -> EngineResult<()> {
        Ok(())
    }

    fn venue(&self) -> crate::domain::Venue;
}
