//! C7 PositionManager: periodic evaluation of open trades against the E1–E14
//! exit rules, dispatching to coordinated close, fast close, or rebalance.

pub mod atr;
pub mod close;
pub mod exit_rules;

use std::sync::Arc;

use parking_lot::RwLock;
use rust_decimal::Decimal;
use tracing::{error, info, warn};

use crate::config::TradingSettings;
use crate::domain::{Symbol, Trade, TradeStatus, Venue};
use crate::errors::EngineResult;
use crate::events::{DomainEvent, EventBusPort};
use crate::exchange::ExchangePort;
use crate::market_data::MarketDataService;
use crate::opportunity::rank;
use crate::store::TradeStore;
use atr::AtrTracker;
use exit_rules::{evaluate_exit, ExitAction, ExitContext};

pub struct PositionManager {
    lighter: Arc<dyn ExchangePort>,
    x10: Arc<dyn ExchangePort>,
    market_data: Arc<MarketDataService>,
    store: Arc<TradeStore>,
    events: Arc<dyn EventBusPort>,
    atr: AtrTracker,
    cfg: TradingSettings,
    universe: RwLock<Vec<Symbol>>,
}

impl PositionManager {
    pub fn new(
        lighter: Arc<dyn ExchangePort>,
        x10: Arc<dyn ExchangePort>,
        market_data: Arc<MarketDataService>,
        store: Arc<TradeStore>,
        events: Arc<dyn EventBusPort>,
        cfg: TradingSettings,
    ) -> Self {
        let atr = AtrTracker::new(cfg.atr_period);
        Self { lighter, x10, market_data, store, events, atr, cfg, universe: RwLock::new(Vec::new()) }
    }

    /// Set by the caller once markets are loaded, so E13's opportunity-cost
    /// check has something to rank against.
    pub fn set_universe(&self, symbols: Vec<Symbol>) {
        *self.universe.write() = symbols;
    }

    fn port(&self, venue: Venue) -> &Arc<dyn ExchangePort> {
        match venue {
            Venue::Lighter => &self.lighter,
            Venue::X10 => &self.x10,
        }
    }

    /// One evaluation tick over every open trade. Returns the number of
    /// trades that transitioned to `Closed` this tick (§ scenario S5: a
    /// rebalance must not count here).
    pub async fn evaluate_tick(&self) -> usize {
        let trades = self.store.list_open_trades();
        let mut closed_count = 0;
        for trade in trades {
            if trade.status != TradeStatus::Open {
                continue; // Closing/Rollback trades are driven by their own orchestration
            }
            match self.evaluate_trade(&trade).await {
                Ok(true) => closed_count += 1,
                Ok(false) => {}
                Err(e) => error!(trade_id = %trade.id, error = %e, "position evaluation failed"),
            }
        }
        closed_count
    }

    /// Returns `Ok(true)` if this trade transitioned to Closed this tick.
    async fn evaluate_trade(&self, trade: &Trade) -> EngineResult<bool> {
        self.market_data.refresh_symbol(Venue::Lighter, &trade.symbol).await.ok();
        self.market_data.refresh_symbol(Venue::X10, &trade.symbol).await.ok();

        let lighter_price = self.market_data.get_price(Venue::Lighter, &trade.symbol);
        let x10_price = self.market_data.get_price(Venue::X10, &trade.symbol);
        let lighter_funding = self.market_data.get_funding(Venue::Lighter, &trade.symbol);
        let x10_funding = self.market_data.get_funding(Venue::X10, &trade.symbol);

        let (Some(lp), Some(xp), Some(lf), Some(xf)) = (lighter_price, x10_price, lighter_funding, x10_funding) else {
            warn!(trade_id = %trade.id, "missing fresh market data, skipping tick");
            return Ok(false);
        };
        self.atr.record(&trade.symbol, lp.mark_price.max(xp.mark_price), lp.mark_price.min(xp.mark_price), lp.mark_price);

        let price_pnl = trade.leg_l.side.sign() * (lp.mark_price - trade.leg_l.entry_price) * trade.leg_l.filled_qty
            + trade.leg_x.side.sign() * (xp.mark_price - trade.leg_x.entry_price) * trade.leg_x.filled_qty;
        let fees_paid = trade.leg_l.fees + trade.leg_x.fees;
        let unrealized_pnl = price_pnl - fees_paid;

        let est_exit_cost = trade.target_notional * (self.cfg.taker_fee_bps * Decimal::from(2)) / Decimal::from(10_000);
        let net_hourly = lf.hourly_rate - xf.hourly_rate;
        let current_spread = (lp.mark_price - xp.mark_price).abs() / ((lp.mark_price + xp.mark_price) / Decimal::TWO);

        let lighter_notional = lp.mark_price * trade.leg_l.filled_qty;
        let x10_notional = xp.mark_price * trade.leg_x.filled_qty;
        let total_notional = lighter_notional + x10_notional;
        let delta_notional_pct = if total_notional.is_zero() {
            Decimal::ZERO
        } else {
            (lighter_notional - x10_notional).abs() / total_notional
        };

        let high_water_mark = trade.high_water_mark.max(unrealized_pnl);
        if high_water_mark != trade.high_water_mark {
            self.store.mutate_trade(&trade.id, |t| t.high_water_mark = high_water_mark).await.ok();
        }

        let ctx = ExitContext {
            trade,
            now: chrono::Utc::now(),
            net_hourly,
            price_pnl,
            unrealized_pnl,
            est_exit_cost,
            leg1_liq_distance_pct: None,
            leg2_liq_distance_pct: None,
            volatility: None,
            atr: self.atr.current(&trade.symbol),
            funding_velocity: None,
            funding_acceleration: None,
            best_alternative_apy: self.best_alternative_apy(&trade.symbol).await,
            current_spread,
            delta_notional_pct,
            cfg: &self.cfg,
        };

        let Some(decision) = evaluate_exit(&ctx) else {
            return Ok(false);
        };

        info!(trade_id = %trade.id, rule = decision.rule, reason = %decision.reason, "exit rule fired");

        match decision.action {
            ExitAction::Rebalance => {
                let excess_venue = if lighter_notional > x10_notional { Venue::Lighter } else { Venue::X10 };
                let delta_qty = (trade.leg_l.filled_qty - trade.leg_x.filled_qty).abs();
                if let Err(e) = close::rebalance(self.port(excess_venue), trade, excess_venue, delta_qty).await {
                    warn!(trade_id = %trade.id, error = %e, "rebalance failed");
                }
                Ok(false)
            }
            ExitAction::Close => {
                self.store
                    .mutate_trade(&trade.id, |t| {
                        t.close_reason = Some(decision.reason.clone());
                        let _ = t.transition(TradeStatus::Closing);
                    })
                    .await?;
                let fast = decision.rule == "E3";
                let outcome = close::coordinated_close(
                    &self.lighter,
                    &self.x10,
                    trade,
                    fast,
                    self.cfg.max_entry_spread,
                    std::time::Duration::from_secs(3),
                )
                .await?;
                if outcome.closed {
                    self.store
                        .mutate_trade(&trade.id, |t| {
                            let _ = t.transition(TradeStatus::Closed);
                            t.closed_at = Some(chrono::Utc::now());
                            t.realized_pnl = unrealized_pnl;
                        })
                        .await?;
                    self.events.publish(DomainEvent::TradeClosed {
                        trade_id: trade.id.clone(),
                        symbol: trade.symbol.clone(),
                        reason: decision.reason,
                    });
                    Ok(true)
                } else {
                    warn!(trade_id = %trade.id, "close incomplete, remaining in Closing for retry");
                    Ok(false)
                }
            }
        }
    }

    async fn best_alternative_apy(&self, exclude: &str) -> Option<Decimal> {
        let symbols = self.universe.read().clone();
        if symbols.is_empty() {
            return None;
        }
        let blacklist = self.cfg.blacklist_symbols.iter().cloned().collect();
        let open: std::collections::HashSet<Symbol> = std::collections::HashSet::from([exclude.to_string()]);
        let opportunities = rank(&symbols, &self.market_data, &blacklist, &open, &self.cfg, Decimal::from(24));
        opportunities.first().map(|o| o.apy)
    }
}
