//! Per-(symbol, venue) local orderbook kept in sync from a venue's public
//! snapshot+incremental WS stream (C2). Directly grounded on
//! `original_source/src/funding_bot/adapters/exchanges/lighter/orderbook.py`;
//! semantics are unchanged, but `BTreeMap` keeps each side sorted by
//! construction instead of sorting on every read.

use std::collections::BTreeMap;
use std::time::{Duration, Instant};

use rust_decimal::Decimal;
use tracing::{debug, info, warn};

use crate::domain::{OrderbookLevel, Symbol};

/// Tolerance window for nonce gaps right after a fresh WS connection — the
/// first message commonly arrives without a preceding snapshot.
const INITIAL_SYNC_TOLERANCE: Duration = Duration::from_secs(10);
const MAX_LEVELS_PER_SIDE: usize = 200;
const CROSSED_BOOK_EPSILON: Decimal = Decimal::from_parts(1, 0, 0, false, 7);

#[derive(Debug, Clone, Copy, Default)]
pub struct EffectiveL1 {
    pub best_bid: Decimal,
    pub best_ask: Decimal,
    pub bid_qty: Decimal,
    pub ask_qty: Decimal,
}

#[derive(Debug)]
pub struct RawLevelUpdate {
    pub price: Decimal,
    pub size: Decimal,
}

#[derive(Debug)]
pub struct SnapshotMessage {
    pub nonce: Option<i64>,
    pub offset: Option<i64>,
    pub bids: Vec<RawLevelUpdate>,
    pub asks: Vec<RawLevelUpdate>,
}

#[derive(Debug)]
pub struct UpdateMessage {
    pub nonce: Option<i64>,
    pub begin_nonce: Option<i64>,
    pub offset: Option<i64>,
    pub bids: Vec<RawLevelUpdate>,
    pub asks: Vec<RawLevelUpdate>,
}

pub struct LocalOrderbook {
    pub symbol: Symbol,
    bids: BTreeMap<Decimal, Decimal>,
    asks: BTreeMap<Decimal, Decimal>,
    last_nonce: Option<i64>,
    last_offset: Option<i64>,
    snapshot_loaded: bool,
    connection_start: Instant,
    initial_nonce_gap_logged: bool,
}

impl LocalOrderbook {
    pub fn new(symbol: Symbol) -> Self {
        Self {
            symbol,
            bids: BTreeMap::new(),
            asks: BTreeMap::new(),
            last_nonce: None,
            last_offset: None,
            snapshot_loaded: false,
            connection_start: Instant::now(),
            initial_nonce_gap_logged: false,
        }
    }

    pub fn is_synced(&self) -> bool {
        self.snapshot_loaded
    }

    pub fn apply_snapshot(&mut self, msg: SnapshotMessage) {
        self.bids.clear();
        self.asks.clear();
        self.last_nonce = msg.nonce;
        self.last_offset = msg.offset;
        apply_batch(&mut self.bids, msg.bids);
        apply_batch(&mut self.asks, msg.asks);
        self.snapshot_loaded = true;
        self.connection_start = Instant::now();
        self.initial_nonce_gap_logged = false;
        debug!(
            symbol = %self.symbol,
            bids = self.bids.len(),
            asks = self.asks.len(),
            nonce = ?self.last_nonce,
            "orderbook snapshot applied"
        );
    }

    pub fn apply_update(&mut self, msg: UpdateMessage) {
        if !self.snapshot_loaded {
            return;
        }

        if let (Some(last), Some(begin)) = (self.last_nonce, msg.begin_nonce) {
            if begin != last {
                let connection_age = self.connection_start.elapsed();
                if connection_age <= INITIAL_SYNC_TOLERANCE {
                    if !self.initial_nonce_gap_logged {
                        info!(
                            symbol = %self.symbol,
                            begin_nonce = begin,
                            last_nonce = last,
                            "initial nonce gap (expected during sync), resetting nonce chain"
                        );
                        self.initial_nonce_gap_logged = true;
                    }
                    self.last_nonce = Some(begin);
                } else {
                    warn!(
                        symbol = %self.symbol,
                        begin_nonce = begin,
                        last_nonce = last,
                        "orderbook nonce gap, resynchronizing"
                    );
                    self.snapshot_loaded = false;
                    return;
                }
            }
        }

        if let (Some(last), Some(new)) = (self.last_offset, msg.offset) {
            if new <= last {
                debug!(symbol = %self.symbol, offset = new, last_offset = last, "ignoring old/duplicate offset");
                return;
            } else if new > last + 1 {
                debug!(symbol = %self.symbol, offset = new, last_offset = last, "non-fatal orderbook offset jump");
            }
        }

        apply_batch(&mut self.bids, msg.bids);
        apply_batch(&mut self.asks, msg.asks);

        if let Some(n) = msg.nonce {
            self.last_nonce = Some(n);
        }
        if let Some(o) = msg.offset {
            self.last_offset = Some(o);
        }

        self.cleanup_levels(MAX_LEVELS_PER_SIDE);
        self.check_integrity();
    }

    fn check_integrity(&mut self) {
        let (Some((&best_bid, _)), Some((&best_ask, _))) = (self.bids.iter().next_back(), self.asks.iter().next())
        else {
            return;
        };
        if best_bid > best_ask + CROSSED_BOOK_EPSILON {
            warn!(symbol = %self.symbol, best_bid = %best_bid, best_ask = %best_ask, "crossed orderbook detected, resynchronizing");
            self.snapshot_loaded = false;
        }
    }

    fn cleanup_levels(&mut self, max_levels: usize) {
        if self.bids.len() > max_levels {
            while self.bids.len() > max_levels {
                let worst = *self.bids.keys().next().unwrap();
                self.bids.remove(&worst);
            }
        }
        if self.asks.len() > max_levels {
            while self.asks.len() > max_levels {
                let worst = *self.asks.keys().next_back().unwrap();
                self.asks.remove(&worst);
            }
        }
    }

    /// Raw top of book, no dust filter.
    pub fn get_l1(&self) -> EffectiveL1 {
        self.get_effective_l1(Decimal::ZERO)
    }

    /// "Smart" best bid/ask ignoring levels below `min_notional`, falling
    /// back to the raw top if every level is dust.
    pub fn get_effective_l1(&self, min_notional: Decimal) -> EffectiveL1 {
        let mut result = EffectiveL1::default();

        if let Some((price, qty)) = self
            .bids
            .iter()
            .rev()
            .find(|(p, q)| **p * **q >= min_notional)
        {
            result.best_bid = *price;
            result.bid_qty = *qty;
        } else if let Some((price, qty)) = self.bids.iter().next_back() {
            result.best_bid = *price;
            result.bid_qty = *qty;
        }

        if let Some((price, qty)) = self.asks.iter().find(|(p, q)| **p * **q >= min_notional) {
            result.best_ask = *price;
            result.ask_qty = *qty;
        } else if let Some((price, qty)) = self.asks.iter().next() {
            result.best_ask = *price;
            result.ask_qty = *qty;
        }

        result
    }

    pub fn get_depth(&self, limit: usize) -> (Vec<OrderbookLevel>, Vec<OrderbookLevel>) {
        let bids = self
            .bids
            .iter()
            .rev()
            .take(limit)
            .map(|(p, q)| OrderbookLevel { price: *p, qty: *q })
            .collect();
        let asks = self
            .asks
            .iter()
            .take(limit)
            .map(|(p, q)| OrderbookLevel { price: *p, qty: *q })
            .collect();
        (bids, asks)
    }
}

fn apply_batch(side: &mut BTreeMap<Decimal, Decimal>, updates: Vec<RawLevelUpdate>) {
    for u in updates {
        if u.size.is_zero() {
            side.remove(&u.price);
        } else {
            side.insert(u.price, u.size);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn level(price: Decimal, size: Decimal) -> RawLevelUpdate {
        RawLevelUpdate { price, size }
    }

    #[test]
    fn snapshot_then_chained_updates_match_fresh_snapshot() {
        let mut book = LocalOrderbook::new("ETH".to_string());
        book.apply_snapshot(SnapshotMessage {
            nonce: Some(1),
            offset: Some(100),
            bids: vec![level(dec!(2000), dec!(1))],
            asks: vec![level(dec!(2001), dec!(1))],
        });
        book.apply_update(UpdateMessage {
            nonce: Some(2),
            begin_nonce: Some(1),
            offset: Some(101),
            bids: vec![level(dec!(2000), dec!(2))],
            asks: vec![],
        });

        let mut fresh = LocalOrderbook::new("ETH".to_string());
        fresh.apply_snapshot(SnapshotMessage {
            nonce: Some(2),
            offset: Some(101),
            bids: vec![level(dec!(2000), dec!(2))],
            asks: vec![level(dec!(2001), dec!(1))],
        });

        assert_eq!(book.get_l1().best_bid, fresh.get_l1().best_bid);
        assert_eq!(book.get_l1().bid_qty, fresh.get_l1().bid_qty);
    }

    #[test]
    fn nonce_gap_after_sync_triggers_resync() {
        let mut book = LocalOrderbook::new("ETH".to_string());
        book.apply_snapshot(SnapshotMessage {
            nonce: Some(1),
            offset: Some(1),
            bids: vec![],
            asks: vec![],
        });
        book.connection_start = Instant::now() - Duration::from_secs(20);
        book.apply_update(UpdateMessage {
            nonce: Some(5),
            begin_nonce: Some(99),
            offset: Some(2),
            bids: vec![],
            asks: vec![],
        });
        assert!(!book.is_synced());
    }

    #[test]
    fn duplicate_offset_is_discarded() {
        let mut book = LocalOrderbook::new("ETH".to_string());
        book.apply_snapshot(SnapshotMessage {
            nonce: Some(1),
            offset: Some(10),
            bids: vec![level(dec!(2000), dec!(1))],
            asks: vec![],
        });
        book.apply_update(UpdateMessage {
            nonce: Some(2),
            begin_nonce: Some(1),
            offset: Some(10),
            bids: vec![level(dec!(2000), dec!(99))],
            asks: vec![],
        });
        assert_eq!(book.get_l1().bid_qty, dec!(1));
    }

    #[test]
    fn effective_l1_filters_dust() {
        let mut book = LocalOrderbook::new("ETH".to_string());
        book.apply_snapshot(SnapshotMessage {
            nonce: Some(1),
            offset: Some(1),
            bids: vec![level(dec!(2000.5), dec!(0.0001)), level(dec!(2000), dec!(5))],
            asks: vec![],
        });
        let l1 = book.get_effective_l1(dec!(10));
        assert_eq!(l1.best_bid, dec!(2000));
    }

    #[test]
    fn effective_l1_falls_back_to_raw_top_when_all_dust() {
        let mut book = LocalOrderbook::new("ETH".to_string());
        book.apply_snapshot(SnapshotMessage {
            nonce: Some(1),
            offset: Some(1),
            bids: vec![level(dec!(2000), dec!(0.0001))],
            asks: vec![],
        });
        let l1 = book.get_effective_l1(dec!(10000));
        assert_eq!(l1.best_bid, dec!(2000));
    }

    #[test]
    fn level_cap_evicts_worst_price() {
        let mut book = LocalOrderbook::new("ETH".to_string());
        let bids: Vec<_> = (0..250)
            .map(|i| level(Decimal::from(1000 + i), dec!(1)))
            .collect();
        book.apply_snapshot(SnapshotMessage {
            nonce: Some(1),
            offset: Some(1),
            bids,
            asks: vec![],
        });
        // Cleanup now runs on every update, not just periodically.
        book.apply_update(UpdateMessage { nonce: Some(2), begin_nonce: Some(1), offset: Some(2), bids: vec![], asks: vec![] });
        assert!(book.bids.len() <= MAX_LEVELS_PER_SIDE);
        assert!(book.bids.contains_key(&Decimal::from(1249)));
    }
}
