//! C3: unifies both venues' prices, funding rates, and orderbook state
//! behind one batch-refresh cache with freshness tracking. Grounded on the
//! teacher's pattern of a single service owning per-symbol caches refreshed
//! on a timer (`scrapers/` modules poll and publish into a shared map);
//! generalized here to two venues and an explicit staleness threshold
//! instead of a fixed poll interval.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use rust_decimal::Decimal;
use tracing::{debug, warn};

use crate::domain::{FundingRate, OrderbookDepthSnapshot, OrderbookSnapshot, PriceSnapshot, Symbol, Venue};
use crate::errors::EngineResult;
use crate::exchange::ExchangePort;

#[derive(Debug, Clone)]
struct Cached<T> {
    value: T,
    at: chrono::DateTime<Utc>,
}

#[derive(Default)]
struct VenueCache {
    prices: HashMap<Symbol, Cached<PriceSnapshot>>,
    funding: HashMap<Symbol, Cached<FundingRate>>,
    l1: HashMap<Symbol, Cached<OrderbookSnapshot>>,
    depth: HashMap<Symbol, Cached<OrderbookDepthSnapshot>>,
}

/// Unifies both venues' market data behind one batch-refresh cache. Every
/// read is served from the cache; `get_fresh_*` forces a refresh first when
/// the cached entry is older than `staleness_threshold`.
pub struct MarketDataService {
    lighter: Arc<dyn ExchangePort>,
    x10: Arc<dyn ExchangePort>,
    staleness_threshold: Duration,
    cache: parking_lot::RwLock<HashMap<Venue, VenueCache>>,
}

impl MarketDataService {
    pub fn new(lighter: Arc<dyn ExchangePort>, x10: Arc<dyn ExchangePort>, staleness_threshold: Duration) -> Self {
        let mut cache = HashMap::new();
        cache.insert(Venue::Lighter, VenueCache::default());
        cache.insert(Venue::X10, VenueCache::default());
        Self { lighter, x10, staleness_threshold, cache: parking_lot::RwLock::new(cache) }
    }

    fn port(&self, venue: Venue) -> &Arc<dyn ExchangePort> {
        match venue {
            Venue::Lighter => &self.lighter,
            Venue::X10 => &self.x10,
        }
    }

    /// §4.4 "for each common symbol with fresh data on both venues": refresh
    /// mark price, funding rate, and L1 for one symbol on one venue.
    pub async fn refresh_symbol(&self, venue: Venue, symbol: &Symbol) -> EngineResult<()> {
        let port = self.port(venue);
        let (mark, funding, l1) = tokio::try_join!(
            port.get_mark_price(symbol),
            port.get_funding_rate(symbol),
            port.get_orderbook_l1(symbol),
        )?;
        let now = Utc::now();
        let mut cache = self.cache.write();
        let venue_cache = cache.entry(venue).or_default();
        venue_cache.prices.insert(
            symbol.clone(),
            Cached { value: PriceSnapshot { symbol: symbol.clone(), venue, mark_price: mark, updated_at: now }, at: now },
        );
        venue_cache.funding.insert(symbol.clone(), Cached { value: funding, at: now });
        venue_cache.l1.insert(symbol.clone(), Cached { value: l1, at: now });
        Ok(())
    }

    /// Batch-refresh every symbol on both venues; failures on individual
    /// symbols are logged and skipped rather than aborting the whole batch
    /// (one stale/delisted symbol must not stall the scan loop).
    pub async fn refresh_all(&self, symbols: &[Symbol]) {
        for venue in [Venue::Lighter, Venue::X10] {
            for symbol in symbols {
                if let Err(e) = self.refresh_symbol(venue, symbol).await {
                    warn!(%venue, %symbol, error = %e, "market data refresh failed");
                }
            }
        }
    }

    fn is_fresh(&self, at: chrono::DateTime<Utc>) -> bool {
        let age = Utc::now().signed_duration_since(at);
        age.num_milliseconds() >= 0 && (age.to_std().unwrap_or(Duration::MAX) <= self.staleness_threshold)
    }

    pub fn get_price(&self, venue: Venue, symbol: &Symbol) -> Option<PriceSnapshot> {
        self.cache.read().get(&venue)?.prices.get(symbol).map(|c| c.value.clone())
    }

    pub fn get_funding(&self, venue: Venue, symbol: &Symbol) -> Option<FundingRate> {
        self.cache.read().get(&venue)?.funding.get(symbol).map(|c| c.value.clone())
    }

    pub fn get_l1(&self, venue: Venue, symbol: &Symbol) -> Option<OrderbookSnapshot> {
        self.cache.read().get(&venue)?.l1.get(symbol).map(|c| c.value.clone())
    }

    /// Pushed by a venue's `subscribe_orderbook_l1` WS callback (C2) between
    /// `refresh_symbol` polls, so the cache reflects the locally-maintained
    /// book instead of only the last REST snapshot.
    pub fn ingest_l1(&self, venue: Venue, snapshot: OrderbookSnapshot) {
        let now = Utc::now();
        let mut cache = self.cache.write();
        let venue_cache = cache.entry(venue).or_default();
        venue_cache.l1.insert(snapshot.symbol.clone(), Cached { value: snapshot, at: now });
    }

    pub fn get_depth(&self, venue: Venue, symbol: &Symbol) -> Option<OrderbookDepthSnapshot> {
        self.cache.read().get(&venue)?.depth.get(symbol).map(|c| c.value.clone())
    }

    /// §4.3 preflight property 1 "freshness": true only if both venues have
    /// L1 data no older than the configured staleness threshold.
    pub fn is_symbol_fresh(&self, symbol: &Symbol) -> bool {
        let cache = self.cache.read();
        [Venue::Lighter, Venue::X10].iter().all(|venue| {
            cache
                .get(venue)
                .and_then(|v| v.l1.get(symbol))
                .map(|c| self.is_fresh(c.at))
                .unwrap_or(false)
        })
    }

    /// Forces a refresh when the cached L1 for `symbol`/`venue` is stale or
    /// missing, then returns the (now-fresh) snapshot.
    pub async fn get_fresh_l1(&self, venue: Venue, symbol: &Symbol) -> EngineResult<OrderbookSnapshot> {
        let needs_refresh = self
            .cache
            .read()
            .get(&venue)
            .and_then(|v| v.l1.get(symbol))
            .map(|c| !self.is_fresh(c.at))
            .unwrap_or(true);
        if needs_refresh {
            debug!(%venue, %symbol, "forcing fresh L1 refresh");
            self.refresh_symbol(venue, symbol).await?;
        }
        self.port(venue).get_orderbook_l1(symbol).await
    }

    /// Forces a fresh depth fetch (never served from the batch cache, since
    /// depth requests are heavier and only needed at decision time).
    pub async fn get_fresh_depth(&self, venue: Venue, symbol: &Symbol, levels: u32) -> EngineResult<OrderbookDepthSnapshot> {
        let snapshot = self.port(venue).get_orderbook_depth(symbol, levels).await?;
        let now = Utc::now();
        self.cache
            .write()
            .entry(venue)
            .or_default()
            .depth
            .insert(symbol.clone(), Cached { value: snapshot.clone(), at: now });
        Ok(snapshot)
    }

    /// Mid price across both venues' cached L1, or `None` if either side is
    /// missing a best bid/ask.
    pub fn mid_price(&self, venue: Venue, symbol: &Symbol) -> Option<Decimal> {
        let l1 = self.get_l1(venue, symbol)?;
        let bid = l1.best_bid?.price;
        let ask = l1.best_ask?.price;
        Some((bid + ask) / Decimal::TWO)
    }

    pub fn common_symbols(&self, lighter_symbols: &[Symbol], x10_symbols: &[Symbol]) -> Vec<Symbol> {
        let x10_set: std::collections::HashSet<&Symbol> = x10_symbols.iter().collect();
        lighter_symbols.iter().filter(|s| x10_set.contains(s)).cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::OrderbookLevel;
    use async_trait::async_trait;
    use rust_decimal_macros::dec;

    struct StubPort {
        venue: Venue,
        bid: Decimal,
        ask: Decimal,
    }

    #[async_trait]
    impl ExchangePort for StubPort {
        async fn initialize(&self) -> EngineResult<()> {
            Ok(())
        }
        async fn close(&self) -> EngineResult<()> {
            Ok(())
        }
        async fn load_markets(&self) -> EngineResult<Vec<crate::domain::MarketInfo>> {
            Ok(vec![])
        }
        async fn get_market_info(&self, _symbol: &Symbol) -> EngineResult<crate::domain::MarketInfo> {
            unimplemented!()
        }
        async fn get_mark_price(&self, _symbol: &Symbol) -> EngineResult<Decimal> {
            Ok((self.bid + self.ask) / Decimal::TWO)
        }
        async fn get_funding_rate(&self, symbol: &Symbol) -> EngineResult<FundingRate> {
            Ok(FundingRate { symbol: symbol.clone(), venue: self.venue, hourly_rate: dec!(0.0001), next_funding_time: Utc::now() })
        }
        async fn get_orderbook_l1(&self, symbol: &Symbol) -> EngineResult<OrderbookSnapshot> {
            Ok(OrderbookSnapshot {
                symbol: symbol.clone(),
                venue: self.venue,
                best_bid: Some(OrderbookLevel { price: self.bid, qty: dec!(1) }),
                best_ask: Some(OrderbookLevel { price: self.ask, qty: dec!(1) }),
                updated_at: Utc::now(),
            })
        }
        async fn get_orderbook_depth(&self, symbol: &Symbol, _levels: u32) -> EngineResult<OrderbookDepthSnapshot> {
            Ok(OrderbookDepthSnapshot { symbol: symbol.clone(), venue: self.venue, bids: vec![], asks: vec![], updated_at: Utc::now() })
        }
        async fn get_available_balance(&self) -> EngineResult<Decimal> {
            Ok(Decimal::ZERO)
        }
        fn fee_schedule(&self, _symbol: Option<&Symbol>) -> crate::exchange::FeeSchedule {
            crate::exchange::FeeSchedule::default()
        }
        async fn list_positions(&self) -> EngineResult<Vec<(Symbol, crate::domain::Position)>> {
            Ok(vec![])
        }
        async fn get_position(&self, _symbol: &Symbol) -> EngineResult<Option<crate::domain::Position>> {
            Ok(None)
        }
        async fn get_realized_funding(&self, _symbol: &Symbol, _since: chrono::DateTime<Utc>) -> EngineResult<Decimal> {
            Ok(Decimal::ZERO)
        }
        async fn place_order(&self, _req: crate::domain::OrderRequest) -> EngineResult<crate::domain::Order> {
            unimplemented!()
        }
        async fn get_order(&self, _symbol: &Symbol, _order_id: &str) -> EngineResult<crate::domain::Order> {
            unimplemented!()
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

    #[tokio::test]
    async fn refresh_then_read_populates_cache() {
        let lighter = Arc::new(StubPort { venue: Venue::Lighter, bid: dec!(1999), ask: dec!(2001) });
        let x10 = Arc::new(StubPort { venue: Venue::X10, bid: dec!(1998), ask: dec!(2002) });
        let svc = MarketDataService::new(lighter, x10, Duration::from_secs(5));
        svc.refresh_all(&["ETH".to_string()]).await;

        assert!(svc.is_symbol_fresh(&"ETH".to_string()));
        let mid = svc.mid_price(Venue::Lighter, &"ETH".to_string()).unwrap();
        assert_eq!(mid, dec!(2000));
    }

    #[tokio::test]
    async fn unrefreshed_symbol_is_not_fresh() {
        let lighter = Arc::new(StubPort { venue: Venue::Lighter, bid: dec!(1), ask: dec!(2) });
        let x10 = Arc::new(StubPort { venue: Venue::X10, bid: dec!(1), ask: dec!(2) });
        let svc = MarketDataService::new(lighter, x10, Duration::from_secs(5));
        assert!(!svc.is_symbol_fresh(&"BTC".to_string()));
    }

    #[test]
    fn common_symbols_intersects() {
        let lighter = Arc::new(StubPort { venue: Venue::Lighter, bid: dec!(1), ask: dec!(2) });
        let x10 = Arc::new(StubPort { venue: Venue::X10, bid: dec!(1), ask: dec!(2) });
        let svc = MarketDataService::new(lighter, x10, Duration::from_secs(5));
        let common = svc.common_symbols(
            &["ETH".to_string(), "BTC".to_string()],
            &["BTC".to_string(), "SOL".to_string()],
        );
        assert_eq!(common, vec!["BTC".to_string()]);
    }
}
