//! C4 TradeStore: in-memory cache of active trades plus a durable append
//! log, backed by a bounded write-behind queue and a single writer task.
//! `create_trade_sync` is the one exception (§4.3, §4.6): trade creation
//! commits synchronously before `ExecutionEngine` places the first order.

pub mod cache;
pub mod schema;
pub mod writer;

use std::str::FromStr;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::Mutex as SyncMutex;
use rusqlite::Connection;
use rust_decimal::Decimal;
use tokio::sync::mpsc::{self, Sender};
use tracing::{error, warn};

use crate::domain::{
    ExecutionAttempt, ExecutionState, FundingCandle, FundingCrashEvent, FundingEvent, Side, Trade, TradeEvent,
    TradeLeg, TradeStatus, Venue, VolatilityProfile,
};
use crate::errors::{EngineError, EngineResult};
use cache::TradeCache;
use writer::WriteOp;

/// Non-short: §4.6 requires "wait for drain without a short timeout" before
/// falling back to a manual flush.
const SHUTDOWN_DRAIN_TIMEOUT: std::time::Duration = std::time::Duration::from_secs(30);

pub struct TradeStore {
    cache: TradeCache,
    sync_conn: Arc<SyncMutex<Connection>>,
    write_tx: Sender<WriteOp>,
    writer_handle: SyncMutex<Option<tokio::task::JoinHandle<()>>>,
}

fn parse_venue(s: &str) -> Venue {
    if s == "lighter" {
        Venue::Lighter
    } else {
        Venue::X10
    }
}

fn parse_side(s: &str) -> Side {
    if s == "buy" {
        Side::Buy
    } else {
        Side::Sell
    }
}

fn parse_status(s: &str) -> TradeStatus {
    use TradeStatus::*;
    match s {
        "pending" => Pending,
        "opening" => Opening,
        "open" => Open,
        "closing" => Closing,
        "rollback" => Rollback,
        "failed" => Failed,
        "closed" => Closed,
        _ => Rejected,
    }
}

fn parse_exec_state(s: &str) -> ExecutionState {
    use ExecutionState::*;
    match s {
        "pending" => Pending,
        "leg_one_in_progress" => LegOneInProgress,
        "leg_one_filled" => LegOneFilled,
        "leg_two_in_progress" => LegTwoInProgress,
        "opened" => Opened,
        "aborted" => Aborted,
        "rollback_queued" => RollbackQueued,
        "rollback_in_progress" => RollbackInProgress,
        "rollback_done" => RollbackDone,
        _ => Failed,
    }
}

fn dec(s: &str) -> Decimal {
    Decimal::from_str(s).unwrap_or_default()
}

fn row_to_trade(row: &rusqlite::Row) -> rusqlite::Result<Trade> {
    let parse_dt = |s: Option<String>| s.and_then(|s| DateTime::parse_from_rfc3339(&s).ok()).map(|t| t.with_timezone(&Utc));

    Ok(Trade {
        id: row.get("trade_id")?,
        symbol: row.get("symbol")?,
        leg_l: TradeLeg {
            venue: parse_venue(&row.get::<_, String>("leg_l_venue")?),
            side: parse_side(&row.get::<_, String>("leg_l_side")?),
            order_id: row.get("leg_l_order_id")?,
            qty: dec(&row.get::<_, String>("leg_l_qty")?),
            filled_qty: dec(&row.get::<_, String>("leg_l_filled_qty")?),
            entry_price: dec(&row.get::<_, String>("leg_l_entry_price")?),
            exit_price: row.get::<_, Option<String>>("leg_l_exit_price")?.map(|s| dec(&s)),
            fees: dec(&row.get::<_, String>("leg_l_fees")?),
            qty_seen: dec(&row.get::<_, String>("leg_l_filled_qty")?),
            fee_seen: dec(&row.get::<_, String>("leg_l_fees")?),
        },
        leg_x: TradeLeg {
            venue: parse_venue(&row.get::<_, String>("leg_x_venue")?),
            side: parse_side(&row.get::<_, String>("leg_x_side")?),
            order_id: row.get("leg_x_order_id")?,
            qty: dec(&row.get::<_, String>("leg_x_qty")?),
            filled_qty: dec(&row.get::<_, String>("leg_x_filled_qty")?),
            entry_price: dec(&row.get::<_, String>("leg_x_entry_price")?),
            exit_price: row.get::<_, Option<String>>("leg_x_exit_price")?.map(|s| dec(&s)),
            fees: dec(&row.get::<_, String>("leg_x_fees")?),
            qty_seen: dec(&row.get::<_, String>("leg_x_filled_qty")?),
            fee_seen: dec(&row.get::<_, String>("leg_x_fees")?),
        },
        target_qty: dec(&row.get::<_, String>("target_qty")?),
        target_notional: dec(&row.get::<_, String>("target_notional")?),
        entry_apy: dec(&row.get::<_, String>("entry_apy")?),
        entry_spread: dec(&row.get::<_, String>("entry_spread")?),
        status: parse_status(&row.get::<_, String>("status")?),
        execution_state: parse_exec_state(&row.get::<_, String>("execution_state")?),
        funding_collected: dec(&row.get::<_, String>("funding_collected")?),
        last_funding_update: parse_dt(row.get("last_funding_update")?),
        realized_pnl: dec(&row.get::<_, String>("realized_pnl")?),
        unrealized_pnl: dec(&row.get::<_, String>("unrealized_pnl")?),
        high_water_mark: dec(&row.get::<_, String>("high_water_mark")?),
        close_reason: row.get("close_reason")?,
        created_at: parse_dt(row.get("created_at")?).unwrap_or_else(Utc::now),
        opened_at: parse_dt(row.get("opened_at")?),
        closed_at: parse_dt(row.get("closed_at")?),
        events: Vec::new(),
        net_funding_migrated: row.get::<_, i64>("net_funding_migrated")? != 0,
    })
}

impl TradeStore {
    pub async fn open(path: String, write_queue_max_size: usize, write_batch_size: usize, open_trades_cache_ttl: std::time::Duration) -> EngineResult<Self> {
        let conn = tokio::task::spawn_blocking(move || -> anyhow::Result<Connection> {
            let conn = Connection::open(&path)?;
            schema::init_schema(&conn)?;
            Ok(conn)
        })
        .await
        .map_err(|e| EngineError::Other(e.into()))?
        .map_err(EngineError::Other)?;

        let sync_conn = Arc::new(SyncMutex::new(conn));
        let (tx, rx) = mpsc::channel(write_queue_max_size);

        let writer_conn = sync_conn.clone();
        let writer_handle = tokio::spawn(writer::run_writer_loop(writer_conn, rx, write_batch_size));

        let cache = TradeCache::new(open_trades_cache_ttl);
        let store = Self { cache, sync_conn, write_tx: tx, writer_handle: SyncMutex::new(Some(writer_handle)) };
        store.load_from_db()?;
        Ok(store)
    }

    fn load_from_db(&self) -> EngineResult<()> {
        let conn = self.sync_conn.lock();
        let mut stmt = conn
            .prepare("SELECT * FROM trades WHERE status NOT IN ('closed', 'rejected', 'failed')")
            .map_err(|e| EngineError::Other(e.into()))?;
        let trades: Vec<Trade> = stmt
            .query_map([], row_to_trade)
            .map_err(|e| EngineError::Other(e.into()))?
            .filter_map(|r| r.ok())
            .collect();
        drop(stmt);
        drop(conn);
        let count = trades.len();
        self.cache.load_all(trades);
        if count > 0 {
            warn!(count, "restored open trades from durable store at startup");
        }
        Ok(())
    }

    /// §4.3/§4.6: bypasses the write-behind channel entirely; commits on the
    /// calling task via `spawn_blocking` before `ExecutionEngine` places the
    /// first leg-1 order.
    pub async fn create_trade_sync(&self, trade: Trade) -> EngineResult<()> {
        let conn = self.sync_conn.clone();
        let trade_for_db = trade.clone();
        tokio::task::spawn_blocking(move || {
            let conn = conn.lock();
            writer::upsert_trade_row(&conn, &trade_for_db)
        })
        .await
        .map_err(|e| EngineError::Other(e.into()))?
        .map_err(|e| EngineError::Other(e.into()))?;
        self.cache.insert(trade);
        Ok(())
    }

    pub fn get_trade(&self, trade_id: &str) -> Option<Trade> {
        self.cache.get(trade_id)
    }

    pub fn list_open_trades(&self) -> Vec<Trade> {
        self.cache.list_open()
    }

    pub fn open_trade_for_symbol(&self, symbol: &str) -> Option<Trade> {
        self.cache.open_trade_for_symbol(symbol)
    }

    /// Items currently queued for the writer task, derived from the bounded
    /// channel's remaining free capacity. Used for the status snapshot only.
    pub fn write_queue_depth(&self) -> usize {
        self.write_tx.max_capacity() - self.write_tx.capacity()
    }

    /// Read-modify-write under the cache lock, then enqueue the durable
    /// upsert. Producers block on a full queue — true backpressure.
    pub async fn mutate_trade<F>(&self, trade_id: &str, f: F) -> EngineResult<()>
    where
        F: FnOnce(&mut Trade),
    {
        let updated = self.cache.mutate(trade_id, |t| {
            f(t);
            t.clone()
        });
        match updated {
            Some(trade) => self.enqueue(WriteOp::UpsertTrade(Box::new(trade))).await,
            None => Err(EngineError::Domain(format!("unknown trade {trade_id}"))),
        }
    }

    pub async fn append_event(&self, trade_id: &str, event: TradeEvent) -> EngineResult<()> {
        self.enqueue(WriteOp::AppendEvent { trade_id: trade_id.to_string(), event }).await
    }

    pub async fn record_funding(&self, trade_id: &str, event: FundingEvent) -> EngineResult<()> {
        self.enqueue(WriteOp::RecordFunding { trade_id: trade_id.to_string(), event, at: Utc::now() }).await
    }

    pub async fn replace_funding_events(&self, trade_id: &str, events: Vec<FundingEvent>) -> EngineResult<()> {
        let now = Utc::now();
        self.enqueue(WriteOp::ReplaceFundingEvents {
            trade_id: trade_id.to_string(),
            events: events.into_iter().map(|e| (e, now)).collect(),
        })
        .await
    }

    pub async fn save_pnl_snapshot(&self, trade_id: &str, realized: Decimal, unrealized: Decimal, funding: Decimal, fees: Decimal) -> EngineResult<()> {
        self.enqueue(WriteOp::SaveSnapshot {
            trade_id: trade_id.to_string(),
            realized_pnl: realized.to_string(),
            unrealized_pnl: unrealized.to_string(),
            funding: funding.to_string(),
            fees: fees.to_string(),
            at: Utc::now(),
        })
        .await
    }

    pub async fn record_funding_history(&self, symbol: String, venue: Venue, rate_hourly: Decimal, rate_apy: Option<Decimal>, next_funding_time: Option<DateTime<Utc>>) -> EngineResult<()> {
        self.enqueue(WriteOp::RecordFundingHistory {
            symbol,
            venue,
            rate_hourly: rate_hourly.to_string(),
            rate_apy: rate_apy.map(|d| d.to_string()),
            at: Utc::now(),
            next_funding_time,
        })
        .await
    }

    pub async fn insert_funding_candles(&self, candles: Vec<FundingCandle>) -> EngineResult<()> {
        self.enqueue(WriteOp::InsertFundingCandles(candles)).await
    }

    pub async fn record_crash_event(&self, event: FundingCrashEvent) -> EngineResult<()> {
        self.enqueue(WriteOp::RecordCrashEvent(event)).await
    }

    pub async fn update_volatility_profile(&self, profile: VolatilityProfile) -> EngineResult<()> {
        self.enqueue(WriteOp::UpdateVolatilityProfile(profile)).await
    }

    pub async fn record_execution_attempt(&self, attempt: &ExecutionAttempt) -> EngineResult<()> {
        let conn = self.sync_conn.clone();
        let attempt = attempt.clone();
        tokio::task::spawn_blocking(move || -> rusqlite::Result<()> {
            let conn = conn.lock();
            let kpis_json = serde_json::json!({
                "entry_spread": attempt.kpis.entry_spread.map(|d| d.to_string()),
                "slippage_bps": attempt.kpis.slippage_bps.map(|d| d.to_string()),
                "fill_seconds": attempt.kpis.fill_seconds,
                "hedge_latency_submit_ms": attempt.kpis.hedge_latency_submit_ms,
                "hedge_latency_ack_ms": attempt.kpis.hedge_latency_ack_ms,
                "expected_value_usd": attempt.kpis.expected_value_usd.map(|d| d.to_string()),
                "breakeven_hours": attempt.kpis.breakeven_hours.map(|d| d.to_string()),
            })
            .to_string();
            conn.execute(
                "INSERT INTO execution_attempts (attempt_id, trade_id, symbol, mode, status, stage, reason, kpis_json, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)
                 ON CONFLICT(attempt_id) DO UPDATE SET status=excluded.status, stage=excluded.stage, reason=excluded.reason, kpis_json=excluded.kpis_json, updated_at=excluded.updated_at",
                rusqlite::params![
                    attempt.attempt_id, attempt.trade_id, attempt.symbol,
                    format!("{:?}", attempt.mode), format!("{:?}", attempt.status), attempt.stage, attempt.reason,
                    kpis_json, attempt.created_at.to_rfc3339(), attempt.updated_at.to_rfc3339(),
                ],
            )?;
            Ok(())
        })
        .await
        .map_err(|e| EngineError::Other(e.into()))?
        .map_err(|e| EngineError::Other(e.into()))
    }

    async fn enqueue(&self, op: WriteOp) -> EngineResult<()> {
        self.write_tx.send(op).await.map_err(|_| EngineError::Domain("write-behind queue closed".to_string()))
    }

    /// Enqueues the shutdown sentinel and waits for the writer task to
    /// actually drain and exit — a bare channel `send` only guarantees the
    /// sentinel was enqueued, not that it (or anything queued ahead of it)
    /// was processed. On a true kill-timeout (the writer task is wedged,
    /// not just slow) this falls back to a manual synchronous checkpoint of
    /// the connection so whatever the writer already committed is durable
    /// on disk, then gives up on the handle (§8 testable property 7 —
    /// losing queued writes is a defect, but a wedged writer thread cannot
    /// be waited on forever).
    pub async fn shutdown(&self) -> EngineResult<()> {
        if self.write_tx.send(WriteOp::Shutdown).await.is_err() {
            error!("write-behind queue already closed at shutdown");
        }

        let handle = self.writer_handle.lock().take();
        let Some(handle) = handle else {
            return Ok(());
        };

        match tokio::time::timeout(SHUTDOWN_DRAIN_TIMEOUT, handle).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => {
                error!(error = %e, "write-behind task panicked during shutdown drain");
                Ok(())
            }
            Err(_) => {
                error!("write-behind task did not drain within the shutdown timeout, forcing a manual checkpoint");
                let conn = self.sync_conn.clone();
                let _ = tokio::task::spawn_blocking(move || {
                    let conn = conn.lock();
                    conn.execute_batch("PRAGMA wal_checkpoint(TRUNCATE);")
                })
                .await;
                Ok(())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{ExecutionState, Side, TradeLeg};
    use rust_decimal_macros::dec;
    use std::time::Duration;

    async fn open_store() -> TradeStore {
        let path = tempfile::NamedTempFile::new().unwrap().into_temp_path();
        let path_str = path.to_str().unwrap().to_string();
        // Leak the path so the backing file outlives the TradeStore's writer task.
        std::mem::forget(path);
        TradeStore::open(path_str, 64, 16, Duration::from_secs(60)).await.unwrap()
    }

    fn new_trade(symbol: &str) -> Trade {
        Trade {
            id: uuid::Uuid::new_v4().to_string(),
            symbol: symbol.to_string(),
            leg_l: TradeLeg::new(Venue::Lighter, Side::Buy, dec!(0.2)),
            leg_x: TradeLeg::new(Venue::X10, Side::Sell, dec!(0.2)),
            target_qty: dec!(0.2),
            target_notional: dec!(400),
            entry_apy: dec!(0.5),
            entry_spread: dec!(0.001),
            status: TradeStatus::Open,
            execution_state: ExecutionState::Opened,
            funding_collected: Decimal::ZERO,
            last_funding_update: None,
            realized_pnl: Decimal::ZERO,
            unrealized_pnl: Decimal::ZERO,
            high_water_mark: Decimal::ZERO,
            close_reason: None,
            created_at: Utc::now(),
            opened_at: Some(Utc::now()),
            closed_at: None,
            events: Vec::new(),
            net_funding_migrated: false,
        }
    }

    #[tokio::test]
    async fn create_then_list_open_trades_round_trips() {
        let store = open_store().await;
        let trade = new_trade("ETH");
        let id = trade.id.clone();
        store.create_trade_sync(trade).await.unwrap();

        let open = store.list_open_trades();
        assert_eq!(open.len(), 1);
        assert_eq!(open[0].id, id);
        assert_eq!(store.open_trade_for_symbol("ETH").map(|t| t.id), Some(id));
    }

    #[tokio::test]
    async fn mutate_trade_updates_cache() {
        let store = open_store().await;
        let trade = new_trade("ETH");
        let id = trade.id.clone();
        store.create_trade_sync(trade).await.unwrap();

        store.mutate_trade(&id, |t| t.funding_collected = dec!(1.5)).await.unwrap();
        let updated = store.get_trade(&id).unwrap();
        assert_eq!(updated.funding_collected, dec!(1.5));
    }

    #[tokio::test]
    async fn record_funding_and_snapshot_do_not_error() {
        let store = open_store().await;
        let trade = new_trade("ETH");
        let id = trade.id.clone();
        store.create_trade_sync(trade).await.unwrap();

        store
            .record_funding(&id, FundingEvent { trade_id_hash: 42, venue: Venue::Lighter, amount: dec!(0.01) })
            .await
            .unwrap();
        store.save_pnl_snapshot(&id, dec!(0), dec!(0), dec!(0.01), dec!(0)).await.unwrap();
        store.shutdown().await.unwrap();
    }
}
