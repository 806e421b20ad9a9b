//! E1–E14: each rule is a pure function over an `ExitContext`, composed in
//! strict precedence by `evaluate_exit`. `original_source` has no standalone
//! exit-rules implementation file; the per-rule semantics are grounded on
//! its test suite instead — `tests/unit/domain/test_phase1_exits.py`,
//! `tests/unit/domain/test_phase2_basis.py`, and
//! `tests/verification/test_exit_rules_all_current_settings.py` — with the
//! literal table order preserved per §4.5, including Open Question #4's
//! resolution (E4 checked before E6).

use chrono::{DateTime, Utc};
use rust_decimal::prelude::Signed;
use rust_decimal::Decimal;

use crate::config::TradingSettings;
use crate::domain::{Trade, VolatilityProfile};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExitAction {
    Close,
    Rebalance,
}

#[derive(Debug, Clone)]
pub struct ExitDecision {
    pub rule: &'static str,
    pub reason: String,
    pub action: ExitAction,
}

pub struct ExitContext<'a> {
    pub trade: &'a Trade,
    pub now: DateTime<Utc>,
    pub net_hourly: Decimal,
    pub price_pnl: Decimal,
    pub unrealized_pnl: Decimal,
    pub est_exit_cost: Decimal,
    pub leg1_liq_distance_pct: Option<Decimal>,
    pub leg2_liq_distance_pct: Option<Decimal>,
    pub volatility: Option<&'a VolatilityProfile>,
    pub atr: Option<Decimal>,
    pub funding_velocity: Option<Decimal>,
    pub funding_acceleration: Option<Decimal>,
    pub best_alternative_apy: Option<Decimal>,
    pub current_spread: Decimal,
    pub delta_notional_pct: Decimal,
    pub cfg: &'a TradingSettings,
}

impl ExitContext<'_> {
    fn age_seconds(&self) -> i64 {
        let opened = self.trade.opened_at.unwrap_or(self.trade.created_at);
        (self.now - opened).num_seconds().max(0)
    }

    fn current_apy(&self) -> Decimal {
        self.net_hourly.abs() * Decimal::from(24 * 365)
    }
}

pub fn e1_catastrophic_funding_flip(ctx: &ExitContext) -> Option<ExitDecision> {
    if ctx.net_hourly < -ctx.cfg.emergency_funding_threshold {
        return Some(ExitDecision { rule: "E1", reason: "catastrophic funding flip".into(), action: ExitAction::Close });
    }
    None
}

pub fn e2_liquidation_distance(ctx: &ExitContext) -> Option<ExitDecision> {
    let (d1, d2) = (ctx.leg1_liq_distance_pct?, ctx.leg2_liq_distance_pct?);
    if d1.min(d2) < ctx.cfg.liquidation_distance_threshold_pct {
        return Some(ExitDecision { rule: "E2", reason: "liquidation distance breached".into(), action: ExitAction::Close });
    }
    None
}

pub fn e3_early_take_profit(ctx: &ExitContext) -> Option<ExitDecision> {
    let trigger = ctx.cfg.early_take_profit_net_usd
        + (ctx.cfg.early_take_profit_slippage_multiple * ctx.est_exit_cost).max(ctx.cfg.early_take_profit_floor_usd);
    if ctx.price_pnl >= trigger {
        return Some(ExitDecision { rule: "E3", reason: "early take-profit".into(), action: ExitAction::Close });
    }
    None
}

pub fn e4_early_edge_exit(ctx: &ExitContext) -> Option<ExitDecision> {
    if ctx.age_seconds() < ctx.cfg.early_edge_min_age_seconds {
        return None;
    }
    let entry_sign = ctx.trade.entry_apy.signum();
    let flipped = ctx.net_hourly.signum() != entry_sign && !ctx.net_hourly.is_zero();
    if !flipped {
        return None;
    }
    let projected_loss = ctx.net_hourly.abs() * ctx.trade.target_notional * ctx.cfg.exit_ev_horizon_hours;
    if projected_loss > ctx.est_exit_cost {
        return Some(ExitDecision { rule: "E4", reason: "early edge exit: funding flipped".into(), action: ExitAction::Close });
    }
    None
}

pub fn e5_max_hold(ctx: &ExitContext) -> Option<ExitDecision> {
    if ctx.age_seconds() > ctx.cfg.max_hold_hours * 3600 {
        return Some(ExitDecision { rule: "E5", reason: "max hold exceeded".into(), action: ExitAction::Close });
    }
    None
}

pub fn e6_zscore_crash(ctx: &ExitContext) -> Option<ExitDecision> {
    let vol = ctx.volatility?;
    if vol.sample_count < ctx.cfg.zscore_min_samples {
        return None;
    }
    if vol.apy_std.is_zero() {
        return None;
    }
    let z = (ctx.current_apy() - vol.apy_mean) / vol.apy_std;
    if z <= ctx.cfg.zscore_emergency_threshold {
        return Some(ExitDecision { rule: "E6", reason: "z-score emergency crash".into(), action: ExitAction::Close });
    }
    if z <= ctx.cfg.zscore_crash_threshold {
        return Some(ExitDecision { rule: "E6", reason: "z-score crash".into(), action: ExitAction::Close });
    }
    None
}

pub fn e7_yield_vs_cost(ctx: &ExitContext) -> Option<ExitDecision> {
    let apy = ctx.current_apy();
    if apy.is_zero() || ctx.est_exit_cost.is_zero() {
        return if apy <= Decimal::ZERO {
            Some(ExitDecision { rule: "E7", reason: "non-positive apy".into(), action: ExitAction::Close })
        } else {
            None
        };
    }
    let hours_to_cover = ctx.est_exit_cost / (ctx.net_hourly.abs() * ctx.trade.target_notional);
    if hours_to_cover > Decimal::from(24) || apy <= Decimal::ZERO {
        return Some(ExitDecision { rule: "E7", reason: "unholdable: yield cannot cover exit cost".into(), action: ExitAction::Close });
    }
    None
}

pub fn e8_basis_convergence(ctx: &ExitContext) -> Option<ExitDecision> {
    let converged = ctx.current_spread.abs() <= ctx.cfg.basis_convergence_abs_threshold
        || ctx.current_spread.abs() <= ctx.trade.entry_spread.abs() * ctx.cfg.basis_convergence_min_ratio;
    if converged && ctx.unrealized_pnl >= ctx.cfg.basis_convergence_min_profit_usd {
        return Some(ExitDecision { rule: "E8", reason: "basis converged with profit".into(), action: ExitAction::Close });
    }
    None
}

pub fn e9_funding_velocity(ctx: &ExitContext) -> Option<ExitDecision> {
    if !ctx.cfg.funding_velocity_exit_enabled {
        return None;
    }
    let (velocity, acceleration) = (ctx.funding_velocity?, ctx.funding_acceleration?);
    if velocity <= ctx.cfg.velocity_threshold_hourly && acceleration <= ctx.cfg.acceleration_threshold {
        return Some(ExitDecision { rule: "E9", reason: "funding velocity deteriorating".into(), action: ExitAction::Close });
    }
    None
}

pub fn e10_atr_trailing_stop(ctx: &ExitContext) -> Option<ExitDecision> {
    if !ctx.cfg.atr_trailing_enabled {
        return None;
    }
    let atr = ctx.atr?;
    if ctx.trade.high_water_mark < ctx.cfg.atr_min_activation_usd {
        return None;
    }
    let stop = ctx.trade.high_water_mark - ctx.cfg.atr_multiplier * atr;
    if ctx.unrealized_pnl < stop {
        return Some(ExitDecision { rule: "E10", reason: "ATR trailing stop".into(), action: ExitAction::Close });
    }
    None
}

/// Returns `(decision, edge_good)` — `edge_good` suppresses E12/E13 per
/// `exit_ev_enabled` settings, mirroring the source's flag-based skip.
pub fn e11_exit_ev(ctx: &ExitContext) -> (Option<ExitDecision>, bool) {
    if !ctx.cfg.exit_ev_enabled {
        return (None, false);
    }
    let projected_loss = ctx.net_hourly.abs() * ctx.trade.target_notional * ctx.cfg.exit_ev_horizon_hours;
    let threshold = ctx.cfg.exit_ev_exit_cost_multiple * ctx.est_exit_cost;
    if projected_loss > threshold {
        return (Some(ExitDecision { rule: "E11", reason: "negative expected value".into(), action: ExitAction::Close }), false);
    }
    (None, true)
}

pub fn e12_profit_target(ctx: &ExitContext) -> Option<ExitDecision> {
    if ctx.unrealized_pnl >= ctx.cfg.min_profit_exit_usd {
        return Some(ExitDecision { rule: "E12", reason: "profit target reached".into(), action: ExitAction::Close });
    }
    None
}

pub fn e13_opportunity_cost(ctx: &ExitContext) -> Option<ExitDecision> {
    let alt = ctx.best_alternative_apy?;
    if alt - ctx.current_apy() >= ctx.cfg.opportunity_cost_apy_diff {
        return Some(ExitDecision { rule: "E13", reason: "better opportunity available".into(), action: ExitAction::Close });
    }
    None
}

pub fn e14_delta_bound(ctx: &ExitContext) -> Option<ExitDecision> {
    if !ctx.cfg.delta_bound_enabled {
        return None;
    }
    if ctx.delta_notional_pct > ctx.cfg.delta_bound_max_delta_pct {
        return Some(ExitDecision { rule: "E14", reason: "delta bound exceeded".into(), action: ExitAction::Rebalance });
    }
    None
}

/// Strict precedence, exactly the §4.5 table order. E1–E4 bypass the
/// min-hold gate; everything from E5 onward is blocked while
/// `age < min_hold_seconds`.
pub fn evaluate_exit(ctx: &ExitContext) -> Option<ExitDecision> {
    if let Some(d) = e1_catastrophic_funding_flip(ctx) {
        return Some(d);
    }
    if let Some(d) = e2_liquidation_distance(ctx) {
        return Some(d);
    }
    if let Some(d) = e3_early_take_profit(ctx) {
        return Some(d);
    }
    if let Some(d) = e4_early_edge_exit(ctx) {
        return Some(d);
    }

    if ctx.age_seconds() < ctx.cfg.min_hold_seconds {
        return None;
    }

    if let Some(d) = e5_max_hold(ctx) {
        return Some(d);
    }
    if let Some(d) = e6_zscore_crash(ctx) {
        return Some(d);
    }
    if let Some(d) = e7_yield_vs_cost(ctx) {
        return Some(d);
    }
    if let Some(d) = e8_basis_convergence(ctx) {
        return Some(d);
    }
    if let Some(d) = e9_funding_velocity(ctx) {
        return Some(d);
    }
    if let Some(d) = e10_atr_trailing_stop(ctx) {
        return Some(d);
    }

    let (e11_decision, edge_good) = e11_exit_ev(ctx);
    if let Some(d) = e11_decision {
        return Some(d);
    }
    if !edge_good {
        if let Some(d) = e12_profit_target(ctx) {
            return Some(d);
        }
        if let Some(d) = e13_opportunity_cost(ctx) {
            return Some(d);
        }
    }

    e14_delta_bound(ctx)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{ExecutionState, Side, TradeLeg, TradeStatus, Venue};
    use rust_decimal_macros::dec;

    fn base_trade() -> Trade {
        Trade {
            id: "t1".into(),
            symbol: "ETH".into(),
            leg_l: TradeLeg::new(Venue::Lighter, Side::Buy, dec!(1)),
            leg_x: TradeLeg::new(Venue::X10, Side::Sell, dec!(1)),
            target_qty: dec!(1),
            target_notional: dec!(2000),
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
            created_at: Utc::now() - chrono::Duration::hours(2),
            opened_at: Some(Utc::now() - chrono::Duration::hours(2)),
            closed_at: None,
            events: vec![],
            net_funding_migrated: false,
        }
    }

    fn base_ctx<'a>(trade: &'a Trade, cfg: &'a TradingSettings) -> ExitContext<'a> {
        ExitContext {
            trade,
            now: Utc::now(),
            net_hourly: dec!(0.0001),
            price_pnl: Decimal::ZERO,
            unrealized_pnl: Decimal::ZERO,
            est_exit_cost: dec!(5),
            leg1_liq_distance_pct: Some(dec!(0.5)),
            leg2_liq_distance_pct: Some(dec!(0.5)),
            volatility: None,
            atr: None,
            funding_velocity: None,
            funding_acceleration: None,
            best_alternative_apy: None,
            current_spread: dec!(0.0005),
            delta_notional_pct: dec!(0.0),
            cfg,
        }
    }

    #[test]
    fn e1_bypasses_min_hold_gate() {
        let trade = {
            let mut t = base_trade();
            t.created_at = Utc::now();
            t.opened_at = Some(Utc::now());
            t
        };
        let cfg = TradingSettings::default();
        let mut ctx = base_ctx(&trade, &cfg);
        ctx.net_hourly = -dec!(0.05);
        let decision = evaluate_exit(&ctx).expect("E1 should fire despite min-hold");
        assert_eq!(decision.rule, "E1");
    }

    #[test]
    fn min_hold_gate_blocks_e5_onward() {
        let trade = {
            let mut t = base_trade();
            t.created_at = Utc::now();
            t.opened_at = Some(Utc::now());
            t
        };
        let cfg = TradingSettings::default();
        let ctx = base_ctx(&trade, &cfg);
        assert!(evaluate_exit(&ctx).is_none());
    }

    #[test]
    fn rebalance_action_for_delta_bound() {
        let trade = base_trade();
        let cfg = TradingSettings::default();
        let mut ctx = base_ctx(&trade, &cfg);
        ctx.net_hourly = dec!(0.00011);
        ctx.delta_notional_pct = dec!(0.04);
        let decision = evaluate_exit(&ctx).expect("delta bound should fire");
        assert_eq!(decision.action, ExitAction::Rebalance);
    }
}
