//! Lighter venue adapter. REST signing follows the teacher's
//! `vault::execution::PolymarketClobAdapter` HMAC pattern (timestamp +
//! method + path + body, base64-decoded secret, HMAC-SHA256), generalized
//! to Lighter's documented scheme. `subscribe_orderbook_l1` drives the C2
//! local book from a real WS stream (see `exchange::ws_orderbook`); REST
//! reads fall back to polling only while that book hasn't synced yet.

use std::sync::{Arc, OnceLock};

use async_trait::async_trait;
use base64::engine::general_purpose::URL_SAFE;
use base64::Engine;
use chrono::{DateTime, Utc};
use hmac::{Hmac, Mac};
use parking_lot::Mutex;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use sha2::Sha256;
use tokio_tungstenite::tungstenite::Message;
use tracing::debug;

use crate::config::VenueSettings;
use crate::decimal_utils::{clamp_funding_rate, safe_decimal_str, LIGHTER_FUNDING_RATE_CAP};
use crate::domain::{
    FundingRate, MarketInfo, Order, OrderRequest, OrderStatus, OrderbookDepthSnapshot, OrderbookLevel,
    OrderbookSnapshot, Position, Side, Symbol, Venue,
};
use crate::errors::{EngineError, EngineResult};
use crate::exchange::orderbook::{RawLevelUpdate, SnapshotMessage, UpdateMessage};
use crate::exchange::port::{clamp_depth_levels, ExchangePort, FeeSchedule, OrderbookUpdateCallback};
use crate::exchange::rate_limit::{HostRateLimitConfig, HostRateLimiter};
use crate::exchange::ws_orderbook::{derive_ws_url, run_forever, BookWsMessage, OrderbookHub};
use crate::exchange::ws_session::{HostCircuitBreaker, SessionConfig};

type HmacSha256 = Hmac<Sha256>;

pub struct LighterPort {
    client: reqwest::Client,
    base_url: String,
    settings: VenueSettings,
    fee_schedule: OnceLock<FeeSchedule>,
    circuit_breaker: Mutex<HostCircuitBreaker>,
    rate_limiter: HostRateLimiter,
    orderbook_hub: Arc<OrderbookHub>,
}

impl LighterPort {
    pub fn new(settings: VenueSettings) -> Self {
        let host = settings.base_url.clone();
        Self {
            client: reqwest::Client::new(),
            base_url: settings.base_url.clone(),
            settings,
            fee_schedule: OnceLock::new(),
            circuit_breaker: Mutex::new(HostCircuitBreaker::new(host, SessionConfig::default())),
            rate_limiter: HostRateLimiter::new(HostRateLimitConfig::default()),
            orderbook_hub: Arc::new(OrderbookHub::new()),
        }
    }

    fn sign_request(&self, method: &str, path: &str, body: &str, timestamp: i64) -> EngineResult<String> {
        let message = format!("{timestamp}{method}{path}{body}");
        let secret_bytes = URL_SAFE
            .decode(self.settings.private_key.as_bytes())
            .map_err(|e| EngineError::Configuration(format!("invalid lighter private key: {e}")))?;
        let mut mac = HmacSha256::new_from_slice(&secret_bytes)
            .map_err(|e| EngineError::Configuration(format!("lighter HMAC key error: {e}")))?;
        mac.update(message.as_bytes());
        Ok(URL_SAFE.encode(mac.finalize().into_bytes()))
    }

    fn auth_headers(&self, method: &str, path: &str, body: &str) -> EngineResult<Vec<(String, String)>> {
        let timestamp = Utc::now().timestamp();
        let signature = self.sign_request(method, path, body, timestamp)?;
        Ok(vec![
            ("L-ACCOUNT-INDEX".to_string(), self.settings.account_index.unwrap_or(0).to_string()),
            ("L-SIGNATURE".to_string(), signature),
            ("L-TIMESTAMP".to_string(), timestamp.to_string()),
        ])
    }

    async fn guarded_get(&self, path: &str) -> EngineResult<serde_json::Value> {
        use crate::exchange::rate_limit::RateLimitDecision;
        match self.rate_limiter.check(&self.base_url) {
            RateLimitDecision::Backoff { wait } => return Err(EngineError::RateLimit { retry_after: Some(wait) }),
            RateLimitDecision::Warn | RateLimitDecision::Proceed => {}
        }
        if self.circuit_breaker.lock().is_open() {
            return Err(EngineError::Exchange { venue: "lighter".into(), message: "circuit open".into() });
        }

        let url = format!("{}{}", self.base_url, path);
        let headers = self.auth_headers("GET", path, "")?;
        let mut req = self.client.get(&url);
        for (k, v) in headers {
            req = req.header(k, v);
        }
        match req.send().await {
            Ok(resp) if resp.status().is_success() => {
                self.circuit_breaker.lock().record_success();
                resp.json::<serde_json::Value>()
                    .await
                    .map_err(|e| EngineError::Exchange { venue: "lighter".into(), message: e.to_string() })
            }
            Ok(resp) if resp.status().as_u16() == 429 || resp.status().as_u16() == 503 => {
                let retry_after = resp
                    .headers()
                    .get("Retry-After")
                    .and_then(|v| v.to_str().ok())
                    .and_then(|v| v.parse::<u64>().ok())
                    .map(std::time::Duration::from_secs);
                if let Some(d) = retry_after {
                    self.rate_limiter.record_retry_after(&self.base_url, d);
                }
                Err(EngineError::RateLimit { retry_after })
            }
            Ok(resp) => {
                self.circuit_breaker.lock().record_failure();
                Err(EngineError::Exchange { venue: "lighter".into(), message: format!("http {}", resp.status()) })
            }
            Err(e) => {
                self.circuit_breaker.lock().record_failure();
                Err(EngineError::Exchange { venue: "lighter".into(), message: e.to_string() })
            }
        }
    }
}

/// Lighter's orderbook channel frames as `{"type": "snapshot"|"update", "symbol", "nonce",
/// "begin_nonce" (update only), "offset", "bids": [[price, qty], ...], "asks": [...]}`.
/// No literal wire format for this stream exists anywhere in the corpus; this shape mirrors
/// the nonce/offset fields `LocalOrderbook` already expects (see `orderbook.rs`).
fn parse_lighter_book_message(value: &serde_json::Value) -> Option<BookWsMessage> {
    let symbol = value.get("symbol")?.as_str()?.to_string();
    let levels = |key: &str| -> Vec<RawLevelUpdate> {
        value
            .get(key)
            .and_then(|a| a.as_array())
            .cloned()
            .unwrap_or_default()
            .iter()
            .filter_map(|lvl| {
                let price = safe_decimal_str(lvl.get(0)?.as_str().unwrap_or("0"), dec!(0));
                let size = safe_decimal_str(lvl.get(1)?.as_str().unwrap_or("0"), dec!(0));
                Some(RawLevelUpdate { price, size })
            })
            .collect()
    };
    let nonce = value.get("nonce").and_then(|v| v.as_i64());
    let offset = value.get("offset").and_then(|v| v.as_i64());
    match value.get("type").and_then(|v| v.as_str())? {
        "snapshot" => Some(BookWsMessage::Snapshot {
            symbol,
            msg: SnapshotMessage { nonce, offset, bids: levels("bids"), asks: levels("asks") },
        }),
        "update" => {
            let begin_nonce = value.get("begin_nonce").and_then(|v| v.as_i64());
            Some(BookWsMessage::Update {
                symbol,
                msg: UpdateMessage { nonce, begin_nonce, offset, bids: levels("bids"), asks: levels("asks") },
            })
        }
        _ => None,
    }
}

fn lighter_subscribe_payload(symbols: &[Symbol]) -> Message {
    Message::Text(
        serde_json::json!({
            "type": "subscribe",
            "channel": "orderbook",
            "symbols": symbols,
        })
        .to_string(),
    )
}

#[async_trait]
impl ExchangePort for LighterPort {
    async fn initialize(&self) -> EngineResult<()> {
        let schedule = FeeSchedule { maker_bps: dec!(2.0), taker_bps: dec!(5.0) };
        let _ = self.fee_schedule.set(schedule);
        debug!(venue = "lighter", "initialized");
        Ok(())
    }

    async fn close(&self) -> EngineResult<()> {
        Ok(())
    }

    async fn load_markets(&self) -> EngineResult<Vec<MarketInfo>> {
        let body = self.guarded_get("/api/v1/markets").await?;
        let markets = body
            .get("markets")
            .and_then(|m| m.as_array())
            .cloned()
            .unwrap_or_default();
        Ok(markets
            .iter()
            .filter_map(|m| {
                Some(MarketInfo {
                    symbol: m.get("symbol")?.as_str()?.to_string(),
                    venue: Venue::Lighter,
                    base_asset: m.get("base_asset").and_then(|v| v.as_str()).unwrap_or_default().to_string(),
                    quote_asset: "USD".to_string(),
                    tick_size: safe_decimal_str(m.get("tick_size")?.as_str().unwrap_or("0.01"), dec!(0.01)),
                    step_size: safe_decimal_str(m.get("step_size")?.as_str().unwrap_or("0.001"), dec!(0.001)),
                    min_order_size: safe_decimal_str(m.get("min_order_size")?.as_str().unwrap_or("0"), dec!(0)),
                    max_leverage: safe_decimal_str(m.get("max_leverage")?.as_str().unwrap_or("10"), dec!(10)),
                })
            })
            .collect())
    }

    async fn get_market_info(&self, symbol: &Symbol) -> EngineResult<MarketInfo> {
        self.load_markets()
            .await?
            .into_iter()
            .find(|m| &m.symbol == symbol)
            .ok_or_else(|| EngineError::Domain(format!("unknown lighter market {symbol}")))
    }

    async fn get_mark_price(&self, symbol: &Symbol) -> EngineResult<Decimal> {
        let body = self.guarded_get(&format!("/api/v1/markPrice?symbol={symbol}")).await?;
        Ok(safe_decimal_str(body.get("mark_price").and_then(|v| v.as_str()).unwrap_or("0"), dec!(0)))
    }

    async fn get_funding_rate(&self, symbol: &Symbol) -> EngineResult<FundingRate> {
        let body = self.guarded_get(&format!("/api/v1/funding?symbol={symbol}")).await?;
        let raw = safe_decimal_str(body.get("hourly_rate").and_then(|v| v.as_str()).unwrap_or("0"), dec!(0));
        let rate = clamp_funding_rate(raw, LIGHTER_FUNDING_RATE_CAP, Some(symbol), Some("lighter"));
        Ok(FundingRate { symbol: symbol.clone(), venue: Venue::Lighter, hourly_rate: rate, next_funding_time: Utc::now() })
    }

    async fn get_orderbook_l1(&self, symbol: &Symbol) -> EngineResult<OrderbookSnapshot> {
        if let Some(l1) = self.orderbook_hub.l1(symbol) {
            return Ok(OrderbookSnapshot {
                symbol: symbol.clone(),
                venue: Venue::Lighter,
                best_bid: (l1.best_bid > Decimal::ZERO).then(|| OrderbookLevel { price: l1.best_bid, qty: l1.bid_qty }),
                best_ask: (l1.best_ask > Decimal::ZERO).then(|| OrderbookLevel { price: l1.best_ask, qty: l1.ask_qty }),
                updated_at: Utc::now(),
            });
        }
        let depth = self.get_orderbook_depth(symbol, 1).await?;
        Ok(OrderbookSnapshot {
            symbol: symbol.clone(),
            venue: Venue::Lighter,
            best_bid: depth.bids.first().cloned(),
            best_ask: depth.asks.first().cloned(),
            updated_at: depth.updated_at,
        })
    }

    async fn get_orderbook_depth(&self, symbol: &Symbol, levels: u32) -> EngineResult<OrderbookDepthSnapshot> {
        let levels = clamp_depth_levels(levels);
        if let Some((bids, asks)) = self.orderbook_hub.depth(symbol, levels as usize) {
            return Ok(OrderbookDepthSnapshot { symbol: symbol.clone(), venue: Venue::Lighter, bids, asks, updated_at: Utc::now() });
        }
        let body = self.guarded_get(&format!("/api/v1/orderbook?symbol={symbol}&levels={levels}")).await?;
        let parse = |key: &str| -> Vec<OrderbookLevel> {
            body.get(key)
                .and_then(|a| a.as_array())
                .cloned()
                .unwrap_or_default()
                .iter()
                .filter_map(|level| {
                    let price = safe_decimal_str(level.get(0)?.as_str().unwrap_or("0"), dec!(0));
                    let qty = safe_decimal_str(level.get(1)?.as_str().unwrap_or("0"), dec!(0));
                    Some(OrderbookLevel { price, qty })
                })
                .collect()
        };
        Ok(OrderbookDepthSnapshot {
            symbol: symbol.clone(),
            venue: Venue::Lighter,
            bids: parse("bids"),
            asks: parse("asks"),
            updated_at: Utc::now(),
        })
    }

    async fn get_available_balance(&self) -> EngineResult<Decimal> {
        let body = self.guarded_get("/api/v1/account").await?;
        Ok(safe_decimal_str(body.get("available_balance").and_then(|v| v.as_str()).unwrap_or("0"), dec!(0)))
    }

    fn fee_schedule(&self, _symbol: Option<&Symbol>) -> FeeSchedule {
        self.fee_schedule.get().copied().unwrap_or_default()
    }

    async fn list_positions(&self) -> EngineResult<Vec<(Symbol, Position)>> {
        let body = self.guarded_get("/api/v1/positions").await?;
        let tolerance = dec!(0.0000001);
        let positions = body.get("positions").and_then(|a| a.as_array()).cloned().unwrap_or_default();
        Ok(positions
            .iter()
            .filter_map(|p| {
                let qty = safe_decimal_str(p.get("qty")?.as_str().unwrap_or("0"), dec!(0));
                if qty.abs() <= tolerance {
                    return None;
                }
                let symbol = p.get("symbol")?.as_str()?.to_string();
                let side = if qty >= Decimal::ZERO { Side::Buy } else { Side::Sell };
                Some((
                    symbol,
                    Position {
                        venue: Venue::Lighter,
                        side,
                        qty: qty.abs(),
                        entry_price: safe_decimal_str(p.get("entry_price").and_then(|v| v.as_str()).unwrap_or("0"), dec!(0)),
                        mark_price: safe_decimal_str(p.get("mark_price").and_then(|v| v.as_str()).unwrap_or("0"), dec!(0)),
                        liquidation_price: p
                            .get("liquidation_price")
                            .and_then(|v| v.as_str())
                            .map(|v| safe_decimal_str(v, dec!(0))),
                    },
                ))
            })
            .collect())
    }

    async fn get_position(&self, symbol: &Symbol) -> EngineResult<Option<Position>> {
        Ok(self.list_positions().await?.into_iter().find(|(s, _)| s == symbol).map(|(_, p)| p))
    }

    async fn get_realized_funding(&self, symbol: &Symbol, since: DateTime<Utc>) -> EngineResult<Decimal> {
        let body = self
            .guarded_get(&format!("/api/v1/funding/realized?symbol={symbol}&since={}", since.timestamp()))
            .await?;
        Ok(safe_decimal_str(body.get("realized").and_then(|v| v.as_str()).unwrap_or("0"), dec!(0)))
    }

    async fn place_order(&self, req: OrderRequest) -> EngineResult<Order> {
        let path = "/api/v1/orders";
        let payload = serde_json::json!({
            "symbol": req.symbol,
            "side": matches!(req.side, Side::Buy),
            "qty": req.qty.to_string(),
            "price": req.price.map(|p| p.to_string()),
            "tif": format!("{:?}", req.tif),
            "reduce_only": req.reduce_only,
        });
        let body_str = payload.to_string();
        let headers = self.auth_headers("POST", path, &body_str)?;
        let mut http_req = self.client.post(format!("{}{}", self.base_url, path)).body(body_str);
        for (k, v) in headers {
            http_req = http_req.header(k, v);
        }
        let resp = http_req
            .send()
            .await
            .map_err(|e| EngineError::Exchange { venue: "lighter".into(), message: e.to_string() })?;
        if resp.status().as_u16() == 400 {
            return Err(EngineError::OrderRejected(resp.text().await.unwrap_or_default()));
        }
        let body: serde_json::Value = resp
            .json()
            .await
            .map_err(|e| EngineError::Exchange { venue: "lighter".into(), message: e.to_string() })?;
        Ok(Order {
            order_id: body.get("order_id").and_then(|v| v.as_str()).unwrap_or("pending").to_string(),
            client_order_id: uuid::Uuid::new_v4().to_string(),
            symbol: req.symbol,
            venue: Venue::Lighter,
            side: req.side,
            qty: req.qty,
            price: req.price,
            status: OrderStatus::Pending,
            filled_qty: Decimal::ZERO,
            avg_fill_price: Decimal::ZERO,
            fee: Decimal::ZERO,
        })
    }

    async fn get_order(&self, symbol: &Symbol, order_id: &str) -> EngineResult<Order> {
        let body = self.guarded_get(&format!("/api/v1/orders/{order_id}?symbol={symbol}")).await?;
        let status = match body.get("status").and_then(|v| v.as_str()).unwrap_or("open") {
            "filled" => OrderStatus::Filled,
            "partially_filled" => OrderStatus::PartiallyFilled,
            "cancelled" => OrderStatus::Cancelled,
            "rejected" => OrderStatus::Rejected,
            "expired" => OrderStatus::Expired,
            _ => OrderStatus::Open,
        };
        Ok(Order {
            order_id: order_id.to_string(),
            client_order_id: String::new(),
            symbol: symbol.clone(),
            venue: Venue::Lighter,
            side: if body.get("side").and_then(|v| v.as_bool()).unwrap_or(true) { Side::Buy } else { Side::Sell },
            qty: safe_decimal_str(body.get("qty").and_then(|v| v.as_str()).unwrap_or("0"), dec!(0)),
            price: body.get("price").and_then(|v| v.as_str()).map(|v| safe_decimal_str(v, dec!(0))),
            status,
            filled_qty: safe_decimal_str(body.get("filled_qty").and_then(|v| v.as_str()).unwrap_or("0"), dec!(0)),
            avg_fill_price: safe_decimal_str(body.get("avg_fill_price").and_then(|v| v.as_str()).unwrap_or("0"), dec!(0)),
            fee: safe_decimal_str(body.get("fee").and_then(|v| v.as_str()).unwrap_or("0"), dec!(0)),
        })
    }

    async fn cancel_order(&self, symbol: &Symbol, order_id: &str) -> EngineResult<()> {
        let path = format!("/api/v1/orders/{order_id}?symbol={symbol}");
        let headers = self.auth_headers("DELETE", &path, "")?;
        let mut req = self.client.delete(format!("{}{}", self.base_url, path));
        for (k, v) in headers {
            req = req.header(k, v);
        }
        req.send()
            .await
            .map_err(|e| EngineError::Exchange { venue: "lighter".into(), message: e.to_string() })?;
        Ok(())
    }

    async fn cancel_all_orders(&self, symbol: Option<&Symbol>) -> EngineResult<()> {
        let path = match symbol {
            Some(s) => format!("/api/v1/orders?symbol={s}"),
            None => "/api/v1/orders".to_string(),
        };
        let headers = self.auth_headers("DELETE", &path, "")?;
        let mut req = self.client.delete(format!("{}{}", self.base_url, path));
        for (k, v) in headers {
            req = req.header(k, v);
        }
        req.send()
            .await
            .map_err(|e| EngineError::Exchange { venue: "lighter".into(), message: e.to_string() })?;
        Ok(())
    }

    async fn subscribe_orderbook_l1(&self, symbols: Option<&[Symbol]>, cb: OrderbookUpdateCallback) -> EngineResult<()> {
        let symbols: Vec<Symbol> = symbols.map(<[Symbol]>::to_vec).unwrap_or_default();
        let ws_url = derive_ws_url(&self.settings);
        let hub = self.orderbook_hub.clone();
        tokio::spawn(run_forever(
            Venue::Lighter,
            "lighter",
            ws_url,
            symbols,
            lighter_subscribe_payload,
            parse_lighter_book_message,
            hub,
            cb,
        ));
        Ok(())
    }

    fn venue(&self) -> Venue {
        Venue::Lighter
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_snapshot_frame() {
        let frame = serde_json::json!({
            "type": "snapshot",
            "symbol": "ETH",
            "nonce": 1,
            "offset": 100,
            "bids": [["2000", "1"]],
            "asks": [["2001", "1"]],
        });
        match parse_lighter_book_message(&frame) {
            Some(BookWsMessage::Snapshot { symbol, msg }) => {
                assert_eq!(symbol, "ETH");
                assert_eq!(msg.nonce, Some(1));
                assert_eq!(msg.bids.len(), 1);
            }
            _ => panic!("expected a snapshot message"),
        }
    }

    #[test]
    fn parses_update_frame() {
        let frame = serde_json::json!({
            "type": "update",
            "symbol": "ETH",
            "nonce": 2,
            "begin_nonce": 1,
            "offset": 101,
            "bids": [],
            "asks": [["2001", "0"]],
        });
        match parse_lighter_book_message(&frame) {
            Some(BookWsMessage::Update { msg, .. }) => {
                assert_eq!(msg.begin_nonce, Some(1));
                assert_eq!(msg.asks.len(), 1);
            }
            _ => panic!("expected an update message"),
        }
    }

    #[test]
    fn unknown_frame_type_is_ignored() {
        let frame = serde_json::json!({"type": "heartbeat"});
        assert!(parse_lighter_book_message(&frame).is_none());
    }
}
