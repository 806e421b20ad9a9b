//! Process entry point: wires C1–C10 together and runs the engine loop.
//! Config loading follows the teacher's `dotenv` + env-overlay pattern
//! (`Settings::load`); CLI flags are kept minimal, in the style of the
//! pack's single-binary trading bots (`--config`, `--dry-run`).

use std::sync::Arc;
use std::time::Duration;

use basis_harvester::config::Settings;
use basis_harvester::domain::Venue;
use basis_harvester::events::{DomainEvent, EventBus, EventBusPort};
use basis_harvester::exchange::lighter::LighterPort;
use basis_harvester::exchange::x10::X10Port;
use basis_harvester::exchange::ExchangePort;
use basis_harvester::execution::ExecutionEngine;
use basis_harvester::funding_tracker::FundingTracker;
use basis_harvester::market_data::MarketDataService;
use basis_harvester::observability::{init_tracing, PnlSnapshot, PositionSnapshot, PositionsSnapshot, StatusSnapshot};
use basis_harvester::control;
use basis_harvester::opportunity;
use basis_harvester::position::PositionManager;
use basis_harvester::reconciler::Reconciler;
use basis_harvester::store::TradeStore;
use basis_harvester::supervisor::Supervisor;

use chrono::Utc;
use clap::Parser;
use dotenv::dotenv;
use rust_decimal::Decimal;
use tokio::task::JoinSet;
use tracing::{info, warn};

const SCAN_INTERVAL_SECONDS: u64 = 15;
const POSITION_TICK_SECONDS: u64 = 5;
const FUNDING_RECONCILE_SECONDS: u64 = 300;
const RECONCILER_TICK_SECONDS: u64 = 60;

/// Cross-exchange funding-rate arbitrage engine.
#[derive(Parser, Debug)]
#[command(name = "basis-harvester")]
#[command(about = "Harvests cross-exchange funding-rate basis between Lighter and X10")]
struct Args {
    /// Path to the TOML config file.
    #[arg(long, default_value = "config.toml")]
    config: String,

    /// Force paper mode regardless of config/env (never places live orders).
    #[arg(long)]
    dry_run: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let _ = dotenv();
    init_tracing();

    let args = Args::parse();
    let mut settings = Settings::load(&args.config)?;
    if args.dry_run {
        settings.live_trading = false;
    }
    info!(live_trading = settings.live_trading, config = %args.config, "starting basis-harvester");

    let lighter: Arc<dyn ExchangePort> = Arc::new(LighterPort::new(settings.lighter.clone()));
    let x10: Arc<dyn ExchangePort> = Arc::new(X10Port::new(settings.x10.clone()));
    lighter.initialize().await?;
    x10.initialize().await?;

    let lighter_markets = lighter.load_markets().await?;
    let x10_markets = x10.load_markets().await?;
    let lighter_symbols: Vec<_> = lighter_markets.iter().map(|m| m.symbol.clone()).collect();
    let x10_symbols: Vec<_> = x10_markets.iter().map(|m| m.symbol.clone()).collect();

    let market_data = Arc::new(MarketDataService::new(
        lighter.clone(),
        x10.clone(),
        Duration::from_secs(settings.execution.staleness_threshold_seconds.max(1) as u64),
    ));
    let universe = market_data.common_symbols(&lighter_symbols, &x10_symbols);
    info!(symbols = universe.len(), "trading universe resolved");
    market_data.refresh_all(&universe).await;

    {
        let md = market_data.clone();
        lighter
            .subscribe_orderbook_l1(Some(&universe), Box::new(move |snap| md.ingest_l1(Venue::Lighter, snap)))
            .await?;
        let md = market_data.clone();
        x10.subscribe_orderbook_l1(Some(&universe), Box::new(move |snap| md.ingest_l1(Venue::X10, snap)))
            .await?;
    }

    let store = Arc::new(
        TradeStore::open(
            settings.database.path.clone(),
            settings.database.write_queue_max_size,
            settings.database.write_batch_size,
            Duration::from_secs(settings.database.open_trades_cache_ttl_seconds),
        )
        .await?,
    );
    let events: Arc<dyn EventBusPort> = Arc::new(EventBus::new(1024));

    let execution = Arc::new(ExecutionEngine::new(
        lighter.clone(),
        x10.clone(),
        market_data.clone(),
        store.clone(),
        events.clone(),
        settings.clone(),
    ));
    let position_manager = Arc::new(PositionManager::new(
        lighter.clone(),
        x10.clone(),
        market_data.clone(),
        store.clone(),
        events.clone(),
        settings.trading.clone(),
    ));
    position_manager.set_universe(universe.clone());
    let funding_tracker = Arc::new(FundingTracker::new(lighter.clone(), x10.clone(), store.clone()));
    let reconciler = Arc::new(Reconciler::new(lighter.clone(), x10.clone(), store.clone(), events.clone(), settings.reconciler.clone()));

    let initial_balance = lighter.get_available_balance().await.unwrap_or(Decimal::ZERO) + x10.get_available_balance().await.unwrap_or(Decimal::ZERO);
    let supervisor = Arc::new(Supervisor::new(lighter.clone(), x10.clone(), store.clone(), events.clone(), settings.risk.clone(), initial_balance));

    let (control_publisher, _control_handle) = control::channel(
        StatusSnapshot { live_trading: settings.live_trading, paused: false, pause_reason: None, open_trade_count: 0, write_queue_depth: 0, as_of: Utc::now() },
        PositionsSnapshot { positions: vec![], as_of: Utc::now() },
        PnlSnapshot { realized_total: Decimal::ZERO, unrealized_total: Decimal::ZERO, funding_collected_total: Decimal::ZERO, as_of: Utc::now() },
    );

    let mut tasks = JoinSet::new();

    {
        let supervisor = supervisor.clone();
        tasks.spawn(async move { supervisor.run_event_loop().await });
    }

    {
        let market_data = market_data.clone();
        let execution = execution.clone();
        let supervisor = supervisor.clone();
        let store = store.clone();
        let events = events.clone();
        let trading = settings.trading.clone();
        let blacklist: std::collections::HashSet<_> = settings.trading.blacklist_symbols.iter().cloned().collect();
        let universe = universe.clone();
        tasks.spawn(async move {
            let mut ticker = tokio::time::interval(Duration::from_secs(SCAN_INTERVAL_SECONDS));
            loop {
                ticker.tick().await;
                market_data.refresh_all(&universe).await;
                if !supervisor.can_open() {
                    continue;
                }
                let already_open: std::collections::HashSet<_> =
                    store.list_open_trades().into_iter().map(|t| t.symbol).collect();
                let opportunities = opportunity::rank(&universe, &market_data, &blacklist, &already_open, &trading, trading.exit_ev_horizon_hours);
                let Some(best) = opportunities.into_iter().next() else { continue };
                info!(symbol = %best.symbol, apy = %best.apy, "opening opportunity");
                match execution.open(&best).await {
                    Ok(trade) => {
                        supervisor.on_execution_result(true);
                        events.publish(DomainEvent::TradeOpened { trade_id: trade.id, symbol: trade.symbol });
                    }
                    Err(e) => {
                        supervisor.on_execution_result(false);
                        warn!(symbol = %best.symbol, error = %e, "execution attempt failed");
                    }
                }
            }
        });
    }

    {
        let position_manager = position_manager.clone();
        tasks.spawn(async move {
            let mut ticker = tokio::time::interval(Duration::from_secs(POSITION_TICK_SECONDS));
            loop {
                ticker.tick().await;
                position_manager.evaluate_tick().await;
            }
        });
    }

    {
        let funding_tracker = funding_tracker.clone();
        tasks.spawn(async move {
            let mut ticker = tokio::time::interval(Duration::from_secs(FUNDING_RECONCILE_SECONDS));
            loop {
                ticker.tick().await;
                funding_tracker.reconcile_tick().await;
            }
        });
    }

    {
        let reconciler = reconciler.clone();
        tasks.spawn(async move {
            let mut ticker = tokio::time::interval(Duration::from_secs(RECONCILER_TICK_SECONDS));
            loop {
                ticker.tick().await;
                reconciler.reconcile_once().await;
            }
        });
    }

    {
        let supervisor = supervisor.clone();
        let lighter = lighter.clone();
        let x10 = x10.clone();
        tasks.spawn(async move {
            let mut ticker = tokio::time::interval(Duration::from_secs(30));
            loop {
                ticker.tick().await;
                let (lighter_bal, x10_bal) = tokio::join!(lighter.get_available_balance(), x10.get_available_balance());
                let available = lighter_bal.unwrap_or(Decimal::ZERO) + x10_bal.unwrap_or(Decimal::ZERO);
                supervisor.update_account_guards(available, available);
            }
        });
    }

    let live_trading = settings.live_trading;
    {
        let store = store.clone();
        let control_publisher = Arc::new(control_publisher);
        let supervisor = supervisor.clone();
        tasks.spawn(async move {
            let mut ticker = tokio::time::interval(Duration::from_secs(2));
            loop {
                ticker.tick().await;
                let open_trades = store.list_open_trades();
                let (paused, reason) = supervisor.pause_status();
                let now = Utc::now();
                control_publisher.publish_status(StatusSnapshot {
                    live_trading,
                    paused,
                    pause_reason: reason,
                    open_trade_count: open_trades.len(),
                    write_queue_depth: store.write_queue_depth(),
                    as_of: now,
                });

                let (realized_total, unrealized_total, funding_collected_total) = open_trades.iter().fold(
                    (Decimal::ZERO, Decimal::ZERO, Decimal::ZERO),
                    |(r, u, f), t| (r + t.realized_pnl, u + t.unrealized_pnl, f + t.funding_collected),
                );
                control_publisher.publish_pnl(PnlSnapshot { realized_total, unrealized_total, funding_collected_total, as_of: now });

                let positions = open_trades
                    .iter()
                    .map(|t| PositionSnapshot {
                        symbol: t.symbol.clone(),
                        status: t.status,
                        unrealized_pnl: t.unrealized_pnl,
                        age_seconds: (now - t.created_at).num_seconds(),
                    })
                    .collect();
                control_publisher.publish_positions(PositionsSnapshot { positions, as_of: now });
            }
        });
    }

    tokio::signal::ctrl_c().await?;
    info!("shutdown signal received");
    tasks.abort_all();
    supervisor.shutdown(true).await;

    Ok(())
}
