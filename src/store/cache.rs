//! In-memory trade cache plus the optional TTL-memoized `listOpenTrades`
//! snapshot (§4.6: "optionally TTL-cached to keep heartbeat cheap;
//! invalidated on any write that touches status").

use std::collections::HashMap;
use std::time::{Duration, Instant};

use parking_lot::RwLock;

use crate::domain::{Trade, TradeStatus};

pub struct TradeCache {
    trades: RwLock<HashMap<String, Trade>>,
    open_snapshot: RwLock<Option<(Instant, Vec<Trade>)>>,
    ttl: Duration,
}

impl TradeCache {
    pub fn new(ttl: Duration) -> Self {
        Self { trades: RwLock::new(HashMap::new()), open_snapshot: RwLock::new(None), ttl }
    }

    pub fn insert(&self, trade: Trade) {
        self.trades.write().insert(trade.id.clone(), trade);
        self.invalidate_open_snapshot();
    }

    pub fn get(&self, trade_id: &str) -> Option<Trade> {
        self.trades.read().get(trade_id).cloned()
    }

    /// Read-modify-write under one lock so concurrent mutators can't race a
    /// stale read against another's write.
    pub fn mutate<F, R>(&self, trade_id: &str, f: F) -> Option<R>
    where
        F: FnOnce(&mut Trade) -> R,
    {
        let mut trades = self.trades.write();
        let result = trades.get_mut(trade_id).map(f);
        drop(trades);
        self.invalidate_open_snapshot();
        result
    }

    pub fn invalidate_open_snapshot(&self) {
        *self.open_snapshot.write() = None;
    }

    /// Every trade not in a terminal status, served from the TTL-memoized
    /// snapshot when fresh.
    pub fn list_open(&self) -> Vec<Trade> {
        if let Some((at, snapshot)) = self.open_snapshot.read().as_ref() {
            if at.elapsed() < self.ttl {
                return snapshot.clone();
            }
        }
        let snapshot: Vec<Trade> = self
            .trades
            .read()
            .values()
            .filter(|t| !matches!(t.status, TradeStatus::Closed | TradeStatus::Rejected | TradeStatus::Failed))
            .cloned()
            .collect();
        *self.open_snapshot.write() = Some((Instant::now(), snapshot.clone()));
        snapshot
    }

    /// §3 invariant: exactly one open trade per symbol.
    pub fn open_trade_for_symbol(&self, symbol: &str) -> Option<Trade> {
        self.list_open().into_iter().find(|t| t.symbol == symbol)
    }

    pub fn load_all(&self, trades: Vec<Trade>) {
        let mut map = self.trades.write();
        for trade in trades {
            map.insert(trade.id.clone(), trade);
        }
        drop(map);
        self.invalidate_open_snapshot();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{ExecutionState, Side, TradeLeg, Venue};
    use rust_decimal::Decimal;

    fn sample_trade(id: &str, symbol: &str, status: TradeStatus) -> Trade {
        Trade {
            id: id.to_string(),
            symbol: symbol.to_string(),
            leg_l: TradeLeg::new(Venue::Lighter, Side::Buy, Decimal::ONE),
            leg_x: TradeLeg::new(Venue::X10, Side::Sell, Decimal::ONE),
            target_qty: Decimal::ONE,
            target_notional: Decimal::ONE,
            entry_apy: Decimal::ZERO,
            entry_spread: Decimal::ZERO,
            status,
            execution_state: ExecutionState::Pending,
            funding_collected: Decimal::ZERO,
            last_funding_update: None,
            realized_pnl: Decimal::ZERO,
            unrealized_pnl: Decimal::ZERO,
            high_water_mark: Decimal::ZERO,
            close_reason: None,
            created_at: chrono::Utc::now(),
            opened_at: None,
            closed_at: None,
            events: vec![],
            net_funding_migrated: false,
        }
    }

    #[test]
    fn list_open_excludes_terminal_statuses() {
        let cache = TradeCache::new(Duration::from_secs(5));
        cache.insert(sample_trade("1", "ETH", TradeStatus::Open));
        cache.insert(sample_trade("2", "BTC", TradeStatus::Closed));
        let open = cache.list_open();
        assert_eq!(open.len(), 1);
        assert_eq!(open[0].id, "1");
    }

    #[test]
    fn insert_invalidates_stale_snapshot() {
        let cache = TradeCache::new(Duration::from_secs(60));
        cache.insert(sample_trade("1", "ETH", TradeStatus::Open));
        assert_eq!(cache.list_open().len(), 1);
        cache.insert(sample_trade("2", "BTC", TradeStatus::Opening));
        assert_eq!(cache.list_open().len(), 2);
    }

    #[test]
    fn one_open_trade_per_symbol_lookup() {
        let cache = TradeCache::new(Duration::from_secs(5));
        cache.insert(sample_trade("1", "ETH", TradeStatus::Open));
        assert!(cache.open_trade_for_symbol("ETH").is_some());
        assert!(cache.open_trade_for_symbol("BTC").is_none());
    }
}
