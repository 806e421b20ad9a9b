//! Shared WS-fed local-orderbook wiring for C2. Both venue adapters hand
//! this module a venue-specific subscribe payload and message parser; the
//! reconnect loop, book bookkeeping, and REST-fallback read path are
//! otherwise identical, so they live here once instead of twice. The
//! reconnect loop itself follows the teacher's
//! `scrapers/binance_book_ticker.rs::run_loop`/`connect_and_stream` split,
//! swapping its fixed reconnect-delay doubling for the shared
//! `ws_session::BackoffCalculator`/`HostCircuitBreaker` pair so both venues
//! get the same jittered backoff and per-host breaker §4.1 already defines.

use std::collections::HashMap;
use std::sync::Arc;

use futures_util::{SinkExt, StreamExt};
use parking_lot::Mutex;
use rust_decimal::Decimal;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, warn};

use crate::config::VenueSettings;
use crate::domain::{OrderbookLevel, OrderbookSnapshot, Symbol, Venue};
use crate::exchange::orderbook::{EffectiveL1, LocalOrderbook, SnapshotMessage, UpdateMessage};
use crate::exchange::port::OrderbookUpdateCallback;
use crate::exchange::ws_session::{BackoffCalculator, HostCircuitBreaker, SessionConfig};

/// Derives a WS endpoint from `VenueSettings`: an explicit `ws_url` wins,
/// otherwise the adapter's REST `base_url` with its scheme swapped
/// (http(s) -> ws(s)), since every venue here serves both over the same host.
pub fn derive_ws_url(settings: &VenueSettings) -> String {
    if !settings.ws_url.is_empty() {
        return settings.ws_url.clone();
    }
    settings
        .base_url
        .replacen("https://", "wss://", 1)
        .replacen("http://", "ws://", 1)
}

/// One parsed WS book message, venue-agnostic once the adapter's own parser
/// has pulled the symbol and snapshot/diff payload out of its wire shape.
pub enum BookWsMessage {
    Snapshot { symbol: Symbol, msg: SnapshotMessage },
    Update { symbol: Symbol, msg: UpdateMessage },
}

/// Per-venue map of symbol -> locally maintained book, shared between the WS
/// ingest loop and the adapter's REST-fallback read path.
#[derive(Default)]
pub struct OrderbookHub {
    books: Mutex<HashMap<Symbol, LocalOrderbook>>,
}

impl OrderbookHub {
    pub fn new() -> Self {
        Self::default()
    }

    /// Synced top-of-book, or `None` if the book hasn't loaded a snapshot yet
    /// (callers fall back to REST in that case).
    pub fn l1(&self, symbol: &Symbol) -> Option<EffectiveL1> {
        let books = self.books.lock();
        let book = books.get(symbol)?;
        book.is_synced().then(|| book.get_l1())
    }

    pub fn depth(&self, symbol: &Symbol, limit: usize) -> Option<(Vec<OrderbookLevel>, Vec<OrderbookLevel>)> {
        let books = self.books.lock();
        let book = books.get(symbol)?;
        book.is_synced().then(|| book.get_depth(limit))
    }
}

fn effective_l1_to_snapshot(symbol: Symbol, venue: Venue, l1: EffectiveL1) -> OrderbookSnapshot {
    OrderbookSnapshot {
        symbol,
        venue,
        best_bid: (l1.best_bid > Decimal::ZERO).then(|| OrderbookLevel { price: l1.best_bid, qty: l1.bid_qty }),
        best_ask: (l1.best_ask > Decimal::ZERO).then(|| OrderbookLevel { price: l1.best_ask, qty: l1.ask_qty }),
        updated_at: chrono::Utc::now(),
    }
}

/// Drives `hub` from `ws_url` for the lifetime of the process: connects,
/// sends the subscribe payload, decodes every text frame with `parse`,
/// applies it to the per-symbol book, and invokes `cb` with the refreshed L1
/// whenever that book is synced. Reconnects with jittered backoff behind a
/// per-host circuit breaker; never returns on its own, so callers spawn it.
pub async fn run_forever(
    venue: Venue,
    venue_label: &'static str,
    ws_url: String,
    symbols: Vec<Symbol>,
    subscribe_payload: impl Fn(&[Symbol]) -> Message + Send + Sync + 'static,
    parse: impl Fn(&serde_json::Value) -> Option<BookWsMessage> + Send + Sync + 'static,
    hub: Arc<OrderbookHub>,
    cb: OrderbookUpdateCallback,
) {
    let mut backoff = BackoffCalculator::new(SessionConfig::default());
    let mut breaker = HostCircuitBreaker::new(ws_url.clone(), SessionConfig::default());

    loop {
        if breaker.is_open() {
            tokio::time::sleep(backoff.next_backoff()).await;
            continue;
        }
        match connect_and_stream(venue, &ws_url, &symbols, &subscribe_payload, &parse, &hub, &cb).await {
            Ok(()) => {
                warn!(venue = venue_label, "orderbook stream closed, reconnecting");
                breaker.record_success();
                backoff.reset();
            }
            Err(e) => {
                warn!(venue = venue_label, error = %e, "orderbook stream error, reconnecting");
                breaker.record_failure();
            }
        }
        tokio::time::sleep(backoff.next_backoff()).await;
    }
}

async fn connect_and_stream(
    venue: Venue,
    ws_url: &str,
    symbols: &[Symbol],
    subscribe_payload: &(impl Fn(&[Symbol]) -> Message + Send + Sync),
    parse: &(impl Fn(&serde_json::Value) -> Option<BookWsMessage> + Send + Sync),
    hub: &Arc<OrderbookHub>,
    cb: &OrderbookUpdateCallback,
) -> Result<(), tokio_tungstenite::tungstenite::Error> {
    let (ws_stream, _) = tokio_tungstenite::connect_async(ws_url).await?;
    let (mut write, mut read) = ws_stream.split();
    write.send(subscribe_payload(symbols)).await?;
    debug!(venue = %venue, url = ws_url, symbols = symbols.len(), "orderbook stream connected");

    while let Some(frame) = read.next().await {
        let frame = frame?;
        let Message::Text(text) = frame else { continue };
        let Ok(value) = serde_json::from_str::<serde_json::Value>(&text) else {
            debug!(venue = %venue, "unparseable orderbook frame, ignoring");
            continue;
        };
        let Some(parsed) = parse(&value) else { continue };

        let (symbol, l1) = {
            let mut books = hub.books.lock();
            match parsed {
                BookWsMessage::Snapshot { symbol, msg } => {
                    let book = books.entry(symbol.clone()).or_insert_with(|| LocalOrderbook::new(symbol.clone()));
                    book.apply_snapshot(msg);
                    (symbol, book.is_synced().then(|| book.get_l1()))
                }
                BookWsMessage::Update { symbol, msg } => {
                    let book = books.entry(symbol.clone()).or_insert_with(|| LocalOrderbook::new(symbol.clone()));
                    book.apply_update(msg);
                    (symbol, book.is_synced().then(|| book.get_l1()))
                }
            }
        };

        if let Some(l1) = l1 {
            cb(effective_l1_to_snapshot(symbol, venue, l1));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn explicit_ws_url_wins_over_derivation() {
        let settings = VenueSettings { ws_url: "wss://explicit.example".into(), base_url: "https://rest.example".into(), ..Default::default() };
        assert_eq!(derive_ws_url(&settings), "wss://explicit.example");
    }

    #[test]
    fn ws_url_derived_from_base_url_scheme() {
        let settings = VenueSettings { ws_url: String::new(), base_url: "https://api.lighter.xyz".into(), ..Default::default() };
        assert_eq!(derive_ws_url(&settings), "wss://api.lighter.xyz");
    }

    #[test]
    fn hub_reports_unsynced_symbol_as_none() {
        let hub = OrderbookHub::new();
        assert!(hub.l1(&"ETH".to_string()).is_none());
        assert!(hub.depth(&"ETH".to_string(), 5).is_none());
    }
}
