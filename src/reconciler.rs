//! C9 Reconciler: compares internal trade/position state against what each
//! venue actually reports and surfaces drift. Grounded on
//! `original_source/src/funding_bot/adapters/store/sqlite/trades.py` (the
//! DB-is-truth-once-persisted boundary) with the orphan/matched-position scan
//! shape adapted from the sibling `reconcile.rs` pattern in the pack (open
//! orders vs. internal positions, safety-first: drift is reported, not
//! silently corrected, except where §4.7 already delegates repair to the
//! Supervisor's self-healing cooldown).

use std::collections::HashMap;
use std::sync::Arc;

use chrono::Utc;
use rust_decimal::Decimal;
use tracing::{info, warn};

use crate::config::ReconcilerSettings;
use crate::domain::{Symbol, TradeStatus, Venue};
use crate::events::{AlertSeverity, DomainEvent, EventBusPort};
use crate::exchange::ExchangePort;
use crate::store::TradeStore;

#[derive(Debug, Clone, Default)]
pub struct ReconcileReport {
    pub trades_checked: usize,
    pub leg_qty_drift: Vec<String>,
    pub broken_hedges: Vec<Symbol>,
    pub orphan_positions: Vec<(Venue, Symbol)>,
    pub stuck_trades: Vec<String>,
}

pub struct Reconciler {
    lighter: Arc<dyn ExchangePort>,
    x10: Arc<dyn ExchangePort>,
    store: Arc<TradeStore>,
    events: Arc<dyn EventBusPort>,
    cfg: ReconcilerSettings,
}

impl Reconciler {
    pub fn new(lighter: Arc<dyn ExchangePort>, x10: Arc<dyn ExchangePort>, store: Arc<TradeStore>, events: Arc<dyn EventBusPort>, cfg: ReconcilerSettings) -> Self {
        Self { lighter, x10, store, events, cfg }
    }

    fn port(&self, venue: Venue) -> &Arc<dyn ExchangePort> {
        match venue {
            Venue::Lighter => &self.lighter,
            Venue::X10 => &self.x10,
        }
    }

    /// One reconciliation pass: position drift per open trade, stuck
    /// transitional trades, and exchange positions with no DB-backed trade.
    pub async fn reconcile_once(&self) -> ReconcileReport {
        let now = Utc::now();
        let open_trades = self.store.list_open_trades();
        let mut report = ReconcileReport { trades_checked: open_trades.len(), ..Default::default() };

        let (lighter_positions, x10_positions) = tokio::join!(self.lighter.list_positions(), self.x10.list_positions());
        let lighter_map: HashMap<Symbol, Decimal> = lighter_positions.unwrap_or_default().into_iter().map(|(s, p)| (s, p.qty)).collect();
        let x10_map: HashMap<Symbol, Decimal> = x10_positions.unwrap_or_default().into_iter().map(|(s, p)| (s, p.qty)).collect();

        let mut claimed_symbols: std::collections::HashSet<Symbol> = std::collections::HashSet::new();

        for trade in &open_trades {
            claimed_symbols.insert(trade.symbol.clone());

            if matches!(trade.status, TradeStatus::Opening | TradeStatus::Closing | TradeStatus::Rollback) {
                if let Some(last) = trade.events.last() {
                    let age = now.signed_duration_since(last.at).num_seconds();
                    if age > self.cfg.stuck_transitional_timeout_seconds {
                        warn!(trade_id = %trade.id, status = ?trade.status, age_seconds = age, "trade stuck in transitional status");
                        report.stuck_trades.push(trade.id.clone());
                        self.events.publish(DomainEvent::Alert {
                            severity: AlertSeverity::Warning,
                            message: format!("trade {} stuck in {:?} for {age}s", trade.id, trade.status),
                        });
                    }
                }
            }

            if trade.status != TradeStatus::Open {
                continue;
            }

            let lighter_qty = lighter_map.get(&trade.symbol).copied().unwrap_or(Decimal::ZERO);
            let x10_qty = x10_map.get(&trade.symbol).copied().unwrap_or(Decimal::ZERO);
            let lighter_missing = lighter_qty.abs() <= self.cfg.qty_drift_tolerance && !trade.leg_l.filled_qty.is_zero();
            let x10_missing = x10_qty.abs() <= self.cfg.qty_drift_tolerance && !trade.leg_x.filled_qty.is_zero();

            if lighter_missing != x10_missing {
                warn!(trade_id = %trade.id, symbol = %trade.symbol, lighter_missing, x10_missing, "broken hedge detected by reconciler");
                report.broken_hedges.push(trade.symbol.clone());
                self.events.publish(DomainEvent::BrokenHedgeDetected {
                    trade_id: trade.id.clone(),
                    symbol: trade.symbol.clone(),
                    detail: "reconciler found exposure on only one venue".to_string(),
                });
                continue;
            }

            let lighter_drift = (lighter_qty.abs() - trade.leg_l.filled_qty.abs()).abs();
            let x10_drift = (x10_qty.abs() - trade.leg_x.filled_qty.abs()).abs();
            if lighter_drift > self.cfg.qty_drift_tolerance || x10_drift > self.cfg.qty_drift_tolerance {
                let note = format!("trade {} qty drift: lighter Δ{lighter_drift} x10 Δ{x10_drift}", trade.id);
                warn!("{note}");
                report.leg_qty_drift.push(note);
            }
        }

        for (venue, map) in [(Venue::Lighter, &lighter_map), (Venue::X10, &x10_map)] {
            for (symbol, qty) in map {
                if qty.abs() <= self.cfg.qty_drift_tolerance {
                    continue;
                }
                if claimed_symbols.contains(symbol) {
                    continue;
                }
                warn!(%venue, %symbol, %qty, "orphan exchange position with no open trade record");
                report.orphan_positions.push((venue, symbol.clone()));
                self.events.publish(DomainEvent::Alert {
                    severity: AlertSeverity::Critical,
                    message: format!("orphan position on {venue} {symbol} qty {qty}, no matching trade"),
                });
                if self.cfg.orphan_position_close_enabled {
                    self.close_orphan(venue, symbol, *qty).await;
                }
            }
        }

        info!(
            trades_checked = report.trades_checked,
            drift = report.leg_qty_drift.len(),
            broken_hedges = report.broken_hedges.len(),
            orphans = report.orphan_positions.len(),
            stuck = report.stuck_trades.len(),
            "reconciliation cycle complete"
        );
        report
    }

    async fn close_orphan(&self, venue: Venue, symbol: &Symbol, qty: Decimal) {
        let side = if qty.is_sign_positive() { crate::domain::Side::Sell } else { crate::domain::Side::Buy };
        let req = crate::domain::OrderRequest {
            symbol: symbol.clone(),
            venue,
            side,
            qty: qty.abs(),
            order_type: crate::domain::OrderType::Market,
            price: None,
            tif: crate::domain::TimeInForce::Ioc,
            reduce_only: true,
        };
        if let Err(e) = self.port(venue).place_order(req).await {
            warn!(%venue, %symbol, error = %e, "orphan position close failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn report_defaults_empty() {
        let report = ReconcileReport::default();
        assert_eq!(report.trades_checked, 0);
        assert!(report.broken_hedges.is_empty());
    }
}
