//! C6 ExecutionEngine: opens a two-leg delta-neutral position per §4.3's
//! state machine, orchestrating preflight, per-symbol locking, leg-1's
//! maker loop, leg-2's IOC hedge, post-entry verification, and rollback.

pub mod leg1;
pub mod leg2;
pub mod post_entry;
pub mod preflight;
pub mod rollback;
pub mod symbol_lock;
#[cfg(test)]
pub(crate) mod test_support;

use std::sync::Arc;

use rust_decimal::Decimal;
use tracing::{error, info, warn};

use crate::config::Settings;
use crate::domain::{AttemptKpis, AttemptMode, AttemptStatus, ExecutionAttempt, ExecutionState, Opportunity, Side, Trade, TradeLeg, TradeStatus, Venue};
use crate::errors::{EngineError, EngineResult};
use crate::events::{DomainEvent, EventBusPort};
use crate::exchange::ExchangePort;
use crate::market_data::MarketDataService;
use crate::store::TradeStore;
use symbol_lock::SymbolLockRegistry;

pub struct ExecutionEngine {
    lighter: Arc<dyn ExchangePort>,
    x10: Arc<dyn ExchangePort>,
    market_data: Arc<MarketDataService>,
    store: Arc<TradeStore>,
    events: Arc<dyn EventBusPort>,
    locks: SymbolLockRegistry,
    settings: Settings,
}

fn port_for(lighter: &Arc<dyn ExchangePort>, x10: &Arc<dyn ExchangePort>, venue: Venue) -> Arc<dyn ExchangePort> {
    match venue {
        Venue::Lighter => lighter.clone(),
        Venue::X10 => x10.clone(),
    }
}

fn new_attempt(symbol: &str, mode: AttemptMode) -> ExecutionAttempt {
    let now = chrono::Utc::now();
    ExecutionAttempt {
        attempt_id: uuid::Uuid::new_v4().to_string(),
        trade_id: None,
        symbol: symbol.to_string(),
        mode,
        status: AttemptStatus::Started,
        stage: "preflight".to_string(),
        reason: None,
        kpis: AttemptKpis::default(),
        created_at: now,
        updated_at: now,
    }
}

impl ExecutionEngine {
    pub fn new(
        lighter: Arc<dyn ExchangePort>,
        x10: Arc<dyn ExchangePort>,
        market_data: Arc<MarketDataService>,
        store: Arc<TradeStore>,
        events: Arc<dyn EventBusPort>,
        settings: Settings,
    ) -> Self {
        Self { lighter, x10, market_data, store, events, locks: SymbolLockRegistry::new(), settings }
    }

    /// §4.3 full state machine. Returns the opened `Trade` or an error; a
    /// preflight rejection or a leg-1 failure with no fill yields `Err`
    /// without ever creating a `Trade` row, per the persistence boundary.
    pub async fn open(&self, opp: &Opportunity) -> EngineResult<Trade> {
        let mode = if self.settings.live_trading { AttemptMode::Live } else { AttemptMode::Paper };
        let mut attempt = new_attempt(&opp.symbol, mode);
        attempt.kpis.entry_spread = Some(opp.spread);
        attempt.kpis.expected_value_usd = Some(opp.expected_value_usd);
        attempt.kpis.breakeven_hours = Some(opp.breakeven_hours);

        let preflight = match preflight::run(
            opp,
            &self.market_data,
            &self.lighter,
            &self.x10,
            &self.settings.trading,
            &self.settings.execution,
        )
        .await
        {
            Ok(outcome) => outcome,
            Err(failure) => {
                attempt.status = AttemptStatus::Rejected;
                attempt.stage = failure.stage.to_string();
                attempt.reason = Some(failure.reason.clone());
                self.store.record_execution_attempt(&attempt).await.ok();
                return Err(EngineError::Domain(format!("preflight failed at {}: {}", failure.stage, failure.reason)));
            }
        };

        let _guard = self.locks.lock(&opp.symbol).await;

        let leg1_port = port_for(&self.lighter, &self.x10, preflight.leg1_venue);
        let leg2_port = port_for(&self.lighter, &self.x10, preflight.leg2_venue);
        let leg1_side = if preflight.leg1_venue == opp.long_venue { Side::Buy } else { Side::Sell };
        let leg2_side = leg1_side.opposite();

        let mut leg1 = TradeLeg::new(preflight.leg1_venue, leg1_side, preflight.qty);
        let mut leg2 = TradeLeg::new(preflight.leg2_venue, leg2_side, preflight.qty);

        let market_info = match leg1_port.get_market_info(&opp.symbol).await {
            Ok(m) => m,
            Err(e) => {
                attempt.status = AttemptStatus::Rejected;
                attempt.stage = "sizing".to_string();
                attempt.reason = Some(e.to_string());
                self.store.record_execution_attempt(&attempt).await.ok();
                return Err(e);
            }
        };

        // Trade persistence boundary: synchronous INSERT, immediately before
        // the first leg-1 order is placed.
        let mut trade = Trade {
            id: uuid::Uuid::new_v4().to_string(),
            symbol: opp.symbol.clone(),
            leg_l: if preflight.leg1_venue == Venue::Lighter { leg1.clone() } else { leg2.clone() },
            leg_x: if preflight.leg1_venue == Venue::X10 { leg1.clone() } else { leg2.clone() },
            target_qty: preflight.qty,
            target_notional: opp.suggested_notional,
            entry_apy: opp.apy,
            entry_spread: opp.spread,
            status: TradeStatus::Pending,
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
            events: Vec::new(),
            net_funding_migrated: false,
        };
        trade.transition(TradeStatus::Opening).map_err(|e| EngineError::Domain(e.to_string()))?;
        trade.execution_state = ExecutionState::LegOneInProgress;
        self.store.create_trade_sync(trade.clone()).await?;
        attempt.trade_id = Some(trade.id.clone());

        let hedge_side = leg2_side;
        let leg1_result = leg1::run(&leg1_port, &leg2_port, &opp.symbol, hedge_side, &mut leg1, &market_info, &self.settings.execution).await;

        self.sync_leg(&mut trade, preflight.leg1_venue, &leg1);

        match leg1_result {
            Ok(()) if leg1.filled_qty > Decimal::ZERO => {}
            Ok(()) => {
                attempt.status = AttemptStatus::Failed;
                attempt.stage = "leg1".to_string();
                attempt.reason = Some("leg-1 unfilled".to_string());
                self.store.record_execution_attempt(&attempt).await.ok();
                return Err(EngineError::Domain(format!("{} leg-1 unfilled", opp.symbol)));
            }
            Err(leg1::Leg1Error::InsufficientBalance(m)) => {
                trade.execution_state = ExecutionState::Aborted;
                self.store.mutate_trade(&trade.id, |t| t.execution_state = ExecutionState::Aborted).await.ok();
                attempt.status = AttemptStatus::Failed;
                attempt.stage = "leg1".to_string();
                attempt.reason = Some(m.clone());
                self.store.record_execution_attempt(&attempt).await.ok();
                return Err(EngineError::InsufficientBalance(m));
            }
            Err(leg1::Leg1Error::HedgeEvaporated(m)) => {
                if leg1.filled_qty > Decimal::ZERO {
                    warn!(trade_id = %trade.id, "hedge evaporated with partial leg-1 fill, rolling back");
                    return self.fail_with_rollback(&mut trade, &mut attempt, "leg1_hedge_evaporated", &m).await;
                }
                attempt.status = AttemptStatus::Failed;
                attempt.stage = "leg1".to_string();
                attempt.reason = Some(m.clone());
                self.store.record_execution_attempt(&attempt).await.ok();
                return Err(EngineError::Leg1HedgeEvaporated(m));
            }
            Err(leg1::Leg1Error::Failed(m)) => {
                attempt.status = AttemptStatus::Failed;
                attempt.stage = "leg1".to_string();
                attempt.reason = Some(m.clone());
                self.store.record_execution_attempt(&attempt).await.ok();
                return Err(EngineError::Domain(m));
            }
        }

        trade.execution_state = ExecutionState::LegOneFilled;
        self.store.mutate_trade(&trade.id, |t| t.execution_state = ExecutionState::LegOneFilled).await.ok();

        // Leg-1's fill may be short of target if it exhausted its attempts
        // partially filled; size leg-2 to what actually needs hedging.
        leg2.qty = leg1.filled_qty;
        trade.execution_state = ExecutionState::LegTwoInProgress;
        self.store.mutate_trade(&trade.id, |t| t.execution_state = ExecutionState::LegTwoInProgress).await.ok();

        let leg2_timing = leg2::run(&leg2_port, &opp.symbol, &mut leg2, &self.settings.execution).await;
        self.sync_leg(&mut trade, preflight.leg2_venue, &leg2);

        match leg2_timing {
            Ok(timing) => {
                attempt.kpis.hedge_latency_submit_ms = Some(timing.submit_ms);
                attempt.kpis.hedge_latency_ack_ms = Some(timing.ack_ms);
            }
            Err(m) => {
                warn!(trade_id = %trade.id, error = %m, "leg-2 failed, rolling back");
                return self.fail_with_rollback(&mut trade, &mut attempt, "leg2_failed", &m).await;
            }
        }

        if leg2.filled_qty.is_zero() {
            return self.fail_with_rollback(&mut trade, &mut attempt, "leg2_unfilled", "leg-2 IOC unfilled").await;
        }

        if !post_entry::verify(&self.lighter, &self.x10, &trade).await {
            self.events.publish(DomainEvent::BrokenHedgeDetected {
                trade_id: trade.id.clone(),
                symbol: trade.symbol.clone(),
                detail: "post-entry position check did not confirm both legs".to_string(),
            });
            post_entry::emergency_close_remaining_leg(&self.lighter, &self.x10, &trade).await;
            self.store
                .mutate_trade(&trade.id, |t| {
                    t.close_reason = Some("post_entry_broken_hedge".to_string());
                    let _ = t.transition(TradeStatus::Closing);
                })
                .await
                .ok();
            attempt.status = AttemptStatus::Failed;
            attempt.stage = "post_entry".to_string();
            attempt.reason = Some("broken hedge".to_string());
            self.store.record_execution_attempt(&attempt).await.ok();
            return Err(EngineError::Domain(format!("{} post-entry verification failed, hedge broken", opp.symbol)));
        }

        trade.execution_state = ExecutionState::Opened;
        self.store
            .mutate_trade(&trade.id, |t| {
                t.execution_state = ExecutionState::Opened;
                t.opened_at = Some(chrono::Utc::now());
                let _ = t.transition(TradeStatus::Open);
            })
            .await?;

        attempt.status = AttemptStatus::Opened;
        attempt.stage = "opened".to_string();
        self.store.record_execution_attempt(&attempt).await.ok();
        self.events.publish(DomainEvent::TradeOpened { trade_id: trade.id.clone(), symbol: trade.symbol.clone() });
        info!(trade_id = %trade.id, symbol = %opp.symbol, "trade opened");

        trade.status = TradeStatus::Open;
        Ok(trade)
    }

    fn sync_leg(&self, trade: &mut Trade, venue: Venue, leg: &TradeLeg) {
        *trade.leg_mut(venue) = leg.clone();
    }

    async fn fail_with_rollback(&self, trade: &mut Trade, attempt: &mut ExecutionAttempt, stage: &str, reason: &str) -> EngineResult<Trade> {
        self.store
            .mutate_trade(&trade.id, |t| {
                t.execution_state = ExecutionState::RollbackQueued;
                let _ = t.transition(TradeStatus::Rollback);
            })
            .await
            .ok();
        self.store
            .mutate_trade(&trade.id, |t| t.execution_state = ExecutionState::RollbackInProgress)
            .await
            .ok();
        let outcome = rollback::run(&self.lighter, &self.x10, trade).await;
        let exec_state = if outcome.done {
            ExecutionState::RollbackDone
        } else {
            error!(trade_id = %trade.id, "rollback failed, alerting operator");
            ExecutionState::RollbackFailed
        };
        self.store
            .mutate_trade(&trade.id, |t| {
                t.execution_state = exec_state;
                t.close_reason = Some(reason.to_string());
                let _ = t.transition(TradeStatus::Failed);
            })
            .await
            .ok();
        attempt.status = AttemptStatus::Failed;
        attempt.stage = stage.to_string();
        attempt.reason = Some(reason.to_string());
        self.store.record_execution_attempt(attempt).await.ok();
        Err(EngineError::Domain(format!("{} rollback after {}: {}", trade.symbol, stage, reason)))
    }
}
