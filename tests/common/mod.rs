//! Shared black-box `ExchangePort` double. Positions and realized-funding
//! amounts are injected per test via `with_position`/`with_realized_funding`;
//! everything else answers with a neutral default.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use basis_harvester::domain::{
    FundingRate, MarketInfo, Order, OrderRequest, OrderStatus, OrderbookDepthSnapshot, OrderbookLevel, OrderbookSnapshot,
    Position, Side, Symbol, Venue,
};
use basis_harvester::errors::EngineResult;
use basis_harvester::exchange::{ExchangePort, FeeSchedule};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;

pub struct MockExchange {
    venue: Venue,
    positions: Mutex<HashMap<Symbol, Position>>,
    realized_funding: Mutex<HashMap<Symbol, Decimal>>,
    placed_orders: Mutex<Vec<OrderRequest>>,
}

impl MockExchange {
    pub fn new(venue: Venue) -> Arc<Self> {
        Arc::new(Self {
            venue,
            positions: Mutex::new(HashMap::new()),
            realized_funding: Mutex::new(HashMap::new()),
            placed_orders: Mutex::new(Vec::new()),
        })
    }

    pub fn with_position(&self, symbol: &str, qty: Decimal) {
        self.positions.lock().insert(
            symbol.to_string(),
            Position { venue: self.venue, side: Side::Buy, qty, entry_price: dec!(2000), mark_price: dec!(2000), liquidation_price: None },
        );
    }

    pub fn with_realized_funding(&self, symbol: &str, amount: Decimal) {
        self.realized_funding.lock().insert(symbol.to_string(), amount);
    }

    pub fn placed_order_count(&self) -> usize {
        self.placed_orders.lock().len()
    }
}

#[async_trait]
impl ExchangePort for MockExchange {
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
        Ok(FundingRate { symbol: symbol.clone(), venue: self.venue, hourly_rate: dec!(0.00005), next_funding_time: Utc::now() })
    }
    async fn get_orderbook_l1(&self, symbol: &Symbol) -> EngineResult<OrderbookSnapshot> {
        Ok(OrderbookSnapshot {
            symbol: symbol.clone(),
            venue: self.venue,
            best_bid: Some(OrderbookLevel { price: dec!(1999), qty: dec!(5) }),
            best_ask: Some(OrderbookLevel { price: dec!(2001), qty: dec!(5) }),
            updated_at: Utc::now(),
        })
    }
    async fn get_orderbook_depth(&self, symbol: &Symbol, _levels: u32) -> EngineResult<OrderbookDepthSnapshot> {
        Ok(OrderbookDepthSnapshot { symbol: symbol.clone(), venue: self.venue, bids: vec![], asks: vec![], updated_at: Utc::now() })
    }
    async fn get_available_balance(&self) -> EngineResult<Decimal> {
        Ok(dec!(10000))
    }
    fn fee_schedule(&self, _symbol: Option<&Symbol>) -> FeeSchedule {
        FeeSchedule::default()
    }
    async fn list_positions(&self) -> EngineResult<Vec<(Symbol, Position)>> {
        Ok(self.positions.lock().iter().map(|(s, p)| (s.clone(), *p)).collect())
    }
    async fn get_position(&self, symbol: &Symbol) -> EngineResult<Option<Position>> {
        Ok(self.positions.lock().get(symbol).copied())
    }
    async fn get_realized_funding(&self, symbol: &Symbol, _since: DateTime<Utc>) -> EngineResult<Decimal> {
        Ok(self.realized_funding.lock().get(symbol).copied().unwrap_or(Decimal::ZERO))
    }
    async fn place_order(&self, req: OrderRequest) -> EngineResult<Order> {
        let order = Order {
            order_id: format!("mock-{}", self.placed_orders.lock().len() + 1),
            client_order_id: "mock-client".to_string(),
            symbol: req.symbol.clone(),
            venue: self.venue,
            side: req.side,
            qty: req.qty,
            price: req.price,
            status: OrderStatus::Filled,
            filled_qty: req.qty,
            avg_fill_price: req.price.unwrap_or(dec!(2000)),
            fee: req.qty * dec!(0.0005),
        };
        self.placed_orders.lock().push(req);
        Ok(order)
    }
    async fn get_order(&self, symbol: &Symbol, order_id: &str) -> EngineResult<Order> {
        Ok(Order {
            order_id: order_id.to_string(),
            client_order_id: "mock-client".to_string(),
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
