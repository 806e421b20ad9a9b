//! Table DDL and additive migrations, keyed by a `schema_version` row.
//! Grounded on the teacher's `vault_db.rs` (`CREATE TABLE IF NOT EXISTS` +
//! indexes issued at connection open) and table names from
//! `original_source/.../sqlite/write_queue.py`.

use anyhow::{Context, Result};
use rusqlite::Connection;

pub const CURRENT_SCHEMA_VERSION: i64 = 1;

pub fn init_schema(conn: &Connection) -> Result<()> {
    conn.pragma_update(None, "journal_mode", "WAL").context("enable WAL")?;
    conn.pragma_update(None, "synchronous", "NORMAL").ok();

    conn.execute_batch(
        "
        CREATE TABLE IF NOT EXISTS schema_meta (
            id INTEGER PRIMARY KEY CHECK (id = 1),
            version INTEGER NOT NULL
        );

        CREATE TABLE IF NOT EXISTS trades (
            trade_id TEXT PRIMARY KEY,
            symbol TEXT NOT NULL,
            leg_l_venue TEXT NOT NULL,
            leg_l_side TEXT NOT NULL,
            leg_l_order_id TEXT,
            leg_l_qty TEXT NOT NULL,
            leg_l_filled_qty TEXT NOT NULL,
            leg_l_entry_price TEXT NOT NULL,
            leg_l_exit_price TEXT,
            leg_l_fees TEXT NOT NULL,
            leg_x_venue TEXT NOT NULL,
            leg_x_side TEXT NOT NULL,
            leg_x_order_id TEXT,
            leg_x_qty TEXT NOT NULL,
            leg_x_filled_qty TEXT NOT NULL,
            leg_x_entry_price TEXT NOT NULL,
            leg_x_exit_price TEXT,
            leg_x_fees TEXT NOT NULL,
            target_qty TEXT NOT NULL,
            target_notional TEXT NOT NULL,
            entry_apy TEXT NOT NULL,
            entry_spread TEXT NOT NULL,
            status TEXT NOT NULL,
            execution_state TEXT NOT NULL,
            funding_collected TEXT NOT NULL,
            last_funding_update TEXT,
            realized_pnl TEXT NOT NULL,
            unrealized_pnl TEXT NOT NULL,
            high_water_mark TEXT NOT NULL,
            close_reason TEXT,
            created_at TEXT NOT NULL,
            opened_at TEXT,
            closed_at TEXT,
            net_funding_migrated INTEGER NOT NULL DEFAULT 0
        );
        CREATE INDEX IF NOT EXISTS idx_trades_symbol_status ON trades(symbol, status);

        CREATE TABLE IF NOT EXISTS trade_events (
            event_id TEXT PRIMARY KEY,
            trade_id TEXT NOT NULL,
            event_type TEXT NOT NULL,
            timestamp TEXT NOT NULL,
            payload TEXT NOT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_trade_events_trade ON trade_events(trade_id, timestamp);

        CREATE TABLE IF NOT EXISTS funding_events (
            trade_id TEXT NOT NULL,
            venue TEXT NOT NULL,
            amount TEXT NOT NULL,
            timestamp TEXT NOT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_funding_events_trade ON funding_events(trade_id, venue);

        CREATE TABLE IF NOT EXISTS pnl_snapshots (
            trade_id TEXT NOT NULL,
            realized_pnl TEXT NOT NULL,
            unrealized_pnl TEXT NOT NULL,
            funding TEXT NOT NULL,
            fees TEXT NOT NULL,
            timestamp TEXT NOT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_pnl_snapshots_trade ON pnl_snapshots(trade_id, timestamp);

        CREATE TABLE IF NOT EXISTS funding_history (
            timestamp TEXT NOT NULL,
            symbol TEXT NOT NULL,
            venue TEXT NOT NULL,
            rate_hourly TEXT NOT NULL,
            rate_apy TEXT,
            next_funding_time TEXT,
            created_at TEXT NOT NULL,
            PRIMARY KEY (timestamp, symbol, venue)
        );

        CREATE TABLE IF NOT EXISTS funding_candles_minute (
            timestamp TEXT NOT NULL,
            symbol TEXT NOT NULL,
            venue TEXT NOT NULL,
            mark_price TEXT,
            index_price TEXT,
            spread_bps TEXT,
            funding_rate_hourly TEXT NOT NULL,
            funding_apy TEXT,
            fetched_at TEXT NOT NULL,
            data_source TEXT NOT NULL,
            PRIMARY KEY (timestamp, symbol, venue)
        );

        CREATE TABLE IF NOT EXISTS funding_crash_events (
            symbol TEXT NOT NULL,
            crash_start_time TEXT NOT NULL,
            crash_end_time TEXT,
            crash_duration_minutes REAL,
            pre_crash_apy TEXT NOT NULL,
            crash_min_apy TEXT NOT NULL,
            crash_depth_pct TEXT NOT NULL,
            recovery_time_minutes REAL,
            detected_at TEXT NOT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_crash_events_symbol ON funding_crash_events(symbol, detected_at);

        CREATE TABLE IF NOT EXISTS funding_volatility_metrics (
            symbol TEXT NOT NULL,
            period_days INTEGER NOT NULL,
            calculated_at TEXT NOT NULL,
            hourly_std_dev TEXT NOT NULL,
            hourly_range_avg TEXT NOT NULL,
            crash_frequency TEXT NOT NULL,
            avg_crash_duration_minutes TEXT NOT NULL,
            avg_recovery_time_minutes TEXT NOT NULL,
            p25_apy TEXT NOT NULL,
            p50_apy TEXT NOT NULL,
            p75_apy TEXT NOT NULL,
            p90_apy TEXT NOT NULL,
            p95_apy TEXT NOT NULL,
            PRIMARY KEY (symbol, period_days, calculated_at)
        );

        CREATE TABLE IF NOT EXISTS execution_attempts (
            attempt_id TEXT PRIMARY KEY,
            trade_id TEXT,
            symbol TEXT NOT NULL,
            mode TEXT NOT NULL,
            status TEXT NOT NULL,
            stage TEXT NOT NULL,
            reason TEXT,
            kpis_json TEXT NOT NULL,
            created_at TEXT NOT NULL,
            updated_at TEXT NOT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_execution_attempts_symbol ON execution_attempts(symbol, created_at);
        ",
    )
    .context("create schema")?;

    let version: Option<i64> = conn
        .query_row("SELECT version FROM schema_meta WHERE id = 1", [], |row| row.get(0))
        .ok();
    match version {
        None => {
            conn.execute("INSERT INTO schema_meta (id, version) VALUES (1, ?1)", [CURRENT_SCHEMA_VERSION])?;
        }
        Some(v) if v < CURRENT_SCHEMA_VERSION => {
            // Additive migrations land here as `v == N => ALTER TABLE ...` arms.
            conn.execute("UPDATE schema_meta SET version = ?1 WHERE id = 1", [CURRENT_SCHEMA_VERSION])?;
        }
        _ => {}
    }

    Ok(())
}
