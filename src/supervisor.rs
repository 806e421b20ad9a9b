//! C10 Supervisor: process-wide safety state. Grounded on
//! `original_source/src/funding_bot/app/supervisor/guards.py` (pause
//! window, consecutive-failure counter, account guards) and `lifecycle.py`
//! (shutdown ordering), with the peak-equity drawdown tracking pattern
//! adapted from the teacher's `DrawdownMonitor` in `risk.rs`.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use rust_decimal::Decimal;
use tracing::{error, info, warn};

use crate::config::RiskSettings;
use crate::domain::Symbol;
use crate::events::{AlertSeverity, DomainEvent, EventBusPort};
use crate::exchange::ExchangePort;
use crate::store::TradeStore;

struct PauseState {
    paused_until: Option<DateTime<Utc>>,
    paused_indefinitely: bool,
    reason: Option<String>,
}

impl PauseState {
    fn clear() -> Self {
        Self { paused_until: None, paused_indefinitely: false, reason: None }
    }

    fn is_active(&self, now: DateTime<Utc>) -> bool {
        self.paused_indefinitely || self.paused_until.map(|until| now < until).unwrap_or(false)
    }
}

struct EquityTracker {
    peak: Decimal,
}

impl EquityTracker {
    fn drawdown_pct(&mut self, equity: Decimal) -> Decimal {
        if equity > self.peak {
            self.peak = equity;
        }
        if self.peak.is_zero() {
            return Decimal::ZERO;
        }
        ((self.peak - equity) / self.peak).max(Decimal::ZERO)
    }
}

pub struct Supervisor {
    lighter: Arc<dyn ExchangePort>,
    x10: Arc<dyn ExchangePort>,
    store: Arc<TradeStore>,
    events: Arc<dyn EventBusPort>,
    risk: RiskSettings,
    pause: Mutex<PauseState>,
    equity: Mutex<EquityTracker>,
    consecutive_failures: Mutex<u32>,
}

impl Supervisor {
    pub fn new(lighter: Arc<dyn ExchangePort>, x10: Arc<dyn ExchangePort>, store: Arc<TradeStore>, events: Arc<dyn EventBusPort>, risk: RiskSettings, initial_equity: Decimal) -> Self {
        Self {
            lighter,
            x10,
            store,
            events,
            risk,
            pause: Mutex::new(PauseState::clear()),
            equity: Mutex::new(EquityTracker { peak: initial_equity }),
            consecutive_failures: Mutex::new(0),
        }
    }

    /// New opportunities may not be executed while paused; position
    /// management and close paths are unaffected (they don't call this).
    pub fn can_open(&self) -> bool {
        !self.pause.lock().is_active(Utc::now())
    }

    pub fn pause_status(&self) -> (bool, Option<String>) {
        let state = self.pause.lock();
        (state.is_active(Utc::now()), state.reason.clone())
    }

    fn do_pause(&self, reason: String, until: Option<DateTime<Utc>>, indefinite: bool) {
        {
            let mut state = self.pause.lock();
            state.paused_until = until;
            state.paused_indefinitely = indefinite;
            state.reason = Some(reason.clone());
        }
        warn!(reason = %reason, indefinite, "trading paused");
        self.events.publish(DomainEvent::TradingPaused { reason, until });
    }

    fn resume(&self, symbol: Option<Symbol>) {
        *self.pause.lock() = PauseState::clear();
        info!(?symbol, "trading resumed");
        self.events.publish(DomainEvent::TradingResumed { symbol });
    }

    /// Each execution failure increments the counter; N in a row triggers a
    /// timed pause. A success resets it.
    pub fn on_execution_result(&self, succeeded: bool) {
        let mut failures = self.consecutive_failures.lock();
        if succeeded {
            *failures = 0;
            return;
        }
        *failures += 1;
        if *failures >= self.risk.consecutive_failure_pause_threshold {
            let until = Utc::now() + chrono::Duration::seconds(self.risk.consecutive_failure_pause_seconds);
            self.do_pause(format!("{} consecutive execution failures", *failures), Some(until), false);
            *failures = 0;
        }
    }

    /// On each balance refresh: free-margin and drawdown from peak equity.
    pub fn update_account_guards(&self, available_balance: Decimal, equity: Decimal) {
        if !equity.is_zero() {
            let free_margin_pct = available_balance / equity;
            if free_margin_pct < self.risk.min_free_margin_pct {
                let until = Utc::now() + chrono::Duration::seconds(self.risk.free_margin_pause_seconds);
                self.do_pause(format!("free margin {free_margin_pct} below {}", self.risk.min_free_margin_pct), Some(until), false);
            }
        }
        let drawdown = self.equity.lock().drawdown_pct(equity);
        if drawdown >= self.risk.max_drawdown_pct {
            self.do_pause(format!("drawdown {drawdown} reached kill-switch threshold {}", self.risk.max_drawdown_pct), None, true);
            self.events.publish(DomainEvent::Alert {
                severity: AlertSeverity::Critical,
                message: format!("drawdown kill switch triggered at {drawdown}"),
            });
        }
    }

    /// §4.7 "self-healing": pause for a cooldown, then verify the affected
    /// symbol's legs are balanced before resuming on its own — never
    /// requires manual intervention once the books are flat.
    pub async fn handle_broken_hedge(&self, symbol: Symbol) {
        self.do_pause(
            format!("broken hedge on {symbol}"),
            Some(Utc::now() + chrono::Duration::seconds(self.risk.broken_hedge_cooldown_seconds)),
            false,
        );
        tokio::time::sleep(std::time::Duration::from_secs(self.risk.broken_hedge_cooldown_seconds as u64)).await;

        if self.positions_balanced(&symbol).await {
            self.resume(Some(symbol));
        } else {
            warn!(%symbol, "post-cooldown check still unbalanced, extending pause");
            Box::pin(self.handle_broken_hedge(symbol)).await;
        }
    }

    async fn positions_balanced(&self, symbol: &Symbol) -> bool {
        let (lighter_pos, x10_pos) = tokio::join!(self.lighter.get_position(symbol), self.x10.get_position(symbol));
        let tolerance = Decimal::new(1, 6);
        let lighter_qty = lighter_pos.ok().flatten().map(|p| p.qty).unwrap_or(Decimal::ZERO);
        let x10_qty = x10_pos.ok().flatten().map(|p| p.qty).unwrap_or(Decimal::ZERO);
        (lighter_qty - x10_qty).abs() <= tolerance
    }

    /// Runs until the bus closes, reacting to events that require a
    /// supervisor-level response.
    pub async fn run_event_loop(self: Arc<Self>) {
        let mut rx = self.events.subscribe();
        loop {
            match rx.recv().await {
                Ok(DomainEvent::BrokenHedgeDetected { symbol, .. }) => {
                    let this = self.clone();
                    tokio::spawn(async move { this.handle_broken_hedge(symbol).await });
                }
                Ok(_) => {}
                Err(tokio::sync::broadcast::error::RecvError::Lagged(n)) => {
                    warn!(skipped = n, "supervisor event loop lagged");
                }
                Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
            }
        }
    }

    /// §4.7 shutdown ordering: signal stop (handled by the caller dropping
    /// its spawn handles before calling this) → cancel open orders → close
    /// positions reduce-only if requested → verify flat → drain the store.
    pub async fn shutdown(&self, close_positions: bool) {
        info!("supervisor shutdown: cancelling open orders");
        if let Err(e) = self.lighter.cancel_all_orders(None).await {
            error!(error = %e, "failed to cancel lighter orders during shutdown");
        }
        if let Err(e) = self.x10.cancel_all_orders(None).await {
            error!(error = %e, "failed to cancel x10 orders during shutdown");
        }

        if close_positions {
            info!("supervisor shutdown: closing all positions reduce-only");
            for (venue, port) in [(crate::domain::Venue::Lighter, &self.lighter), (crate::domain::Venue::X10, &self.x10)] {
                let Ok(positions) = port.list_positions().await else { continue };
                for (symbol, pos) in positions {
                    if pos.is_flat(Decimal::new(1, 7)) {
                        continue;
                    }
                    let req = crate::domain::OrderRequest {
                        symbol: symbol.clone(),
                        venue,
                        side: pos.side.opposite(),
                        qty: pos.qty,
                        order_type: crate::domain::OrderType::Market,
                        price: None,
                        tif: crate::domain::TimeInForce::Ioc,
                        reduce_only: true,
                    };
                    if let Err(e) = port.place_order(req).await {
                        error!(%symbol, %venue, error = %e, "failed to close position during shutdown");
                    }
                }
            }
        }

        if let Err(e) = self.store.shutdown().await {
            error!(error = %e, "store shutdown did not drain cleanly");
        }
        if let Err(e) = self.lighter.close().await {
            warn!(error = %e, "error closing lighter adapter");
        }
        if let Err(e) = self.x10.close().await {
            warn!(error = %e, "error closing x10 adapter");
        }
        info!("supervisor shutdown complete");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn drawdown_tracks_peak() {
        let mut tracker = EquityTracker { peak: dec!(1000) };
        assert_eq!(tracker.drawdown_pct(dec!(1200)), Decimal::ZERO);
        assert_eq!(tracker.peak, dec!(1200));
        let dd = tracker.drawdown_pct(dec!(900));
        assert_eq!(dd, dec!(0.25));
    }

    #[test]
    fn pause_state_respects_expiry() {
        let active = PauseState { paused_until: Some(Utc::now() - chrono::Duration::seconds(1)), paused_indefinitely: false, reason: None };
        assert!(!active.is_active(Utc::now()));
        let still_active = PauseState { paused_until: Some(Utc::now() + chrono::Duration::seconds(60)), paused_indefinitely: false, reason: None };
        assert!(still_active.is_active(Utc::now()));
    }
}
