//! Layered configuration: a TOML file overlaid with `BASIS_*` environment
//! variables, generalized from the teacher's `dotenv` + manual `env::var`
//! parsing pattern into a single `Settings::load()`.

use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::Deserialize;
use std::path::Path;

use crate::domain::Symbol;
use crate::errors::{EngineError, EngineResult};

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct VenueSettings {
    pub base_url: String,
    /// WS endpoint for orderbook/account streams. Empty means "derive from
    /// `base_url` by swapping the scheme" (`http(s)` → `ws(s)`).
    pub ws_url: String,
    pub funding_rate_interval_hours: u32,
    pub private_key: String,
    pub api_key: String,
    pub account_index: Option<u64>,
    pub vault_id: Option<String>,
}

impl Default for VenueSettings {
    fn default() -> Self {
        Self {
            base_url: String::new(),
            ws_url: String::new(),
            funding_rate_interval_hours: 1,
            private_key: String::new(),
            api_key: String::new(),
            account_index: None,
            vault_id: None,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DatabaseSettings {
    pub path: String,
    pub wal_mode: bool,
    pub write_batch_size: usize,
    pub write_queue_max_size: usize,
    pub open_trades_cache_ttl_seconds: u64,
}

impl Default for DatabaseSettings {
    fn default() -> Self {
        Self {
            path: "basis_harvester.db".to_string(),
            wal_mode: true,
            write_batch_size: 50,
            write_queue_max_size: 1000,
            open_trades_cache_ttl_seconds: 5,
        }
    }
}

#[derive(Debug, Clone, Copy, Deserialize, PartialEq, Eq)]
pub enum DepthGateMode {
    L1,
    Impact,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct TradingSettings {
    pub min_apy_filter: Decimal,
    pub max_entry_spread: Decimal,
    pub min_hold_seconds: i64,
    pub max_hold_hours: i64,
    pub min_profit_exit_usd: Decimal,
    pub early_take_profit_net_usd: Decimal,
    pub early_take_profit_slippage_multiple: Decimal,
    pub early_take_profit_floor_usd: Decimal,
    pub funding_flip_hours_threshold: Decimal,
    pub emergency_funding_threshold: Decimal,
    pub depth_gate_mode: DepthGateMode,
    pub depth_gate_levels: u32,
    pub depth_gate_max_price_impact_percent: Decimal,
    pub max_l1_qty_utilization: Decimal,
    pub delta_bound_enabled: bool,
    pub delta_bound_max_delta_pct: Decimal,
    pub atr_trailing_enabled: bool,
    pub atr_period: usize,
    pub atr_multiplier: Decimal,
    pub atr_min_activation_usd: Decimal,
    pub funding_velocity_exit_enabled: bool,
    pub velocity_threshold_hourly: Decimal,
    pub acceleration_threshold: Decimal,
    pub velocity_lookback_hours: i64,
    pub exit_ev_enabled: bool,
    pub exit_ev_horizon_hours: Decimal,
    pub exit_ev_exit_cost_multiple: Decimal,
    pub opportunity_cost_apy_diff: Decimal,
    pub early_edge_min_age_seconds: i64,
    pub basis_convergence_abs_threshold: Decimal,
    pub basis_convergence_min_ratio: Decimal,
    pub basis_convergence_min_profit_usd: Decimal,
    pub liquidation_distance_threshold_pct: Decimal,
    pub zscore_min_samples: usize,
    pub zscore_crash_threshold: Decimal,
    pub zscore_emergency_threshold: Decimal,
    pub blacklist_symbols: Vec<Symbol>,
    pub taker_fee_bps: Decimal,
    pub maker_fee_bps: Decimal,
}

impl Default for TradingSettings {
    fn default() -> Self {
        Self {
            min_apy_filter: dec!(0.08),
            max_entry_spread: dec!(0.002),
            min_hold_seconds: 900,
            max_hold_hours: 72,
            min_profit_exit_usd: dec!(2.0),
            early_take_profit_net_usd: dec!(15.0),
            early_take_profit_slippage_multiple: dec!(1.5),
            early_take_profit_floor_usd: dec!(5.0),
            funding_flip_hours_threshold: dec!(6),
            emergency_funding_threshold: dec!(0.02),
            depth_gate_mode: DepthGateMode::L1,
            depth_gate_levels: 10,
            depth_gate_max_price_impact_percent: dec!(0.15),
            max_l1_qty_utilization: dec!(0.5),
            delta_bound_enabled: true,
            delta_bound_max_delta_pct: dec!(0.03),
            atr_trailing_enabled: true,
            atr_period: 14,
            atr_multiplier: dec!(2.0),
            atr_min_activation_usd: dec!(10.0),
            funding_velocity_exit_enabled: true,
            velocity_threshold_hourly: dec!(-0.00002),
            acceleration_threshold: dec!(-0.000005),
            velocity_lookback_hours: 6,
            exit_ev_enabled: true,
            exit_ev_horizon_hours: dec!(24),
            exit_ev_exit_cost_multiple: dec!(1.2),
            opportunity_cost_apy_diff: dec!(0.10),
            early_edge_min_age_seconds: 3600,
            basis_convergence_abs_threshold: dec!(0.00002),
            basis_convergence_min_ratio: dec!(0.2),
            basis_convergence_min_profit_usd: dec!(1.0),
            liquidation_distance_threshold_pct: dec!(0.05),
            zscore_min_samples: 30,
            zscore_crash_threshold: dec!(-2.0),
            zscore_emergency_threshold: dec!(-3.0),
            blacklist_symbols: Vec::new(),
            taker_fee_bps: dec!(5.0),
            maker_fee_bps: dec!(2.0),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ExecutionSettings {
    pub ws_fill_wait_enabled: bool,
    pub hedge_depth_preflight_enabled: bool,
    pub hedge_depth_preflight_multiplier: Decimal,
    pub hedge_depth_preflight_checks: u32,
    pub hedge_ioc_fill_timeout_seconds: u64,
    pub x10_close_slippage_pct: Decimal,
    pub leg1_escalate_to_taker_slippage_pct: Decimal,
    pub leg1_max_attempts: u32,
    pub leg1_min_aggressiveness: Decimal,
    pub leg1_max_aggressiveness: Decimal,
    pub leg1_escalate_after_fraction: Decimal,
    pub leg1_attempt_timeout_seconds: u64,
    pub staleness_threshold_seconds: i64,
    pub hedge_integrity_min_size_ratio: Decimal,
}

impl Default for ExecutionSettings {
    fn default() -> Self {
        Self {
            ws_fill_wait_enabled: true,
            hedge_depth_preflight_enabled: true,
            hedge_depth_preflight_multiplier: dec!(1.25),
            hedge_depth_preflight_checks: 2,
            hedge_ioc_fill_timeout_seconds: 5,
            x10_close_slippage_pct: dec!(0.001),
            leg1_escalate_to_taker_slippage_pct: dec!(0.0015),
            leg1_max_attempts: 4,
            leg1_min_aggressiveness: dec!(0.0),
            leg1_max_aggressiveness: dec!(1.0),
            leg1_escalate_after_fraction: dec!(0.6),
            leg1_attempt_timeout_seconds: 8,
            staleness_threshold_seconds: 5,
            hedge_integrity_min_size_ratio: dec!(0.8),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RiskSettings {
    pub max_drawdown_pct: Decimal,
    pub min_free_margin_pct: Decimal,
    pub broken_hedge_cooldown_seconds: i64,
    pub consecutive_failure_pause_threshold: u32,
    pub consecutive_failure_pause_seconds: i64,
    pub free_margin_pause_seconds: i64,
}

impl Default for RiskSettings {
    fn default() -> Self {
        Self {
            max_drawdown_pct: dec!(0.25),
            min_free_margin_pct: dec!(0.15),
            broken_hedge_cooldown_seconds: 900,
            consecutive_failure_pause_threshold: 5,
            consecutive_failure_pause_seconds: 300,
            free_margin_pause_seconds: 120,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ReconcilerSettings {
    pub interval_seconds: u64,
    pub qty_drift_tolerance: Decimal,
    pub stuck_transitional_timeout_seconds: i64,
    pub orphan_position_close_enabled: bool,
}

impl Default for ReconcilerSettings {
    fn default() -> Self {
        Self {
            interval_seconds: 60,
            qty_drift_tolerance: dec!(0.0005),
            stuck_transitional_timeout_seconds: 120,
            orphan_position_close_enabled: false,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub live_trading: bool,
    pub lighter: VenueSettings,
    pub x10: VenueSettings,
    pub database: DatabaseSettings,
    pub trading: TradingSettings,
    pub execution: ExecutionSettings,
    pub risk: RiskSettings,
    pub reconciler: ReconcilerSettings,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            live_trading: false,
            lighter: VenueSettings::default(),
            x10: VenueSettings::default(),
            database: DatabaseSettings::default(),
            trading: TradingSettings::default(),
            execution: ExecutionSettings::default(),
            risk: RiskSettings::default(),
            reconciler: ReconcilerSettings::default(),
        }
    }
}

impl Settings {
    /// Load a TOML file (if present) then overlay `BASIS_*` environment
    /// variables, then validate. Matches the teacher's `dotenv` + manual
    /// `env::var` overlay pattern, collapsed into one entry point.
    pub fn load(path: impl AsRef<Path>) -> EngineResult<Self> {
        let mut settings = match std::fs::read_to_string(path.as_ref()) {
            Ok(contents) => toml::from_str(&contents)
                .map_err(|e| EngineError::Configuration(format!("invalid config file: {e}")))?,
            Err(_) => Settings::default(),
        };

        settings.apply_env_overrides();
        settings.validate()?;
        Ok(settings)
    }

    fn apply_env_overrides(&mut self) {
        if let Ok(v) = std::env::var("BASIS_LIVE_TRADING") {
            self.live_trading = v == "1" || v.eq_ignore_ascii_case("true");
        }
        if let Ok(v) = std::env::var("BASIS_LIGHTER_PRIVATE_KEY") {
            self.lighter.private_key = v;
        }
        if let Ok(v) = std::env::var("BASIS_LIGHTER_BASE_URL") {
            self.lighter.base_url = v;
        }
        if let Ok(v) = std::env::var("BASIS_LIGHTER_WS_URL") {
            self.lighter.ws_url = v;
        }
        if let Ok(v) = std::env::var("BASIS_X10_API_KEY") {
            self.x10.api_key = v;
        }
        if let Ok(v) = std::env::var("BASIS_X10_PRIVATE_KEY") {
            self.x10.private_key = v;
        }
        if let Ok(v) = std::env::var("BASIS_X10_BASE_URL") {
            self.x10.base_url = v;
        }
        if let Ok(v) = std::env::var("BASIS_X10_WS_URL") {
            self.x10.ws_url = v;
        }
        if let Ok(v) = std::env::var("BASIS_DATABASE_PATH") {
            self.database.path = v;
        }
    }

    /// §6: `funding_rate_interval_hours == 1` for both venues is a hard,
    /// fatal `ConfigurationError` at startup.
    pub fn validate(&self) -> EngineResult<()> {
        if self.lighter.funding_rate_interval_hours != 1 {
            return Err(EngineError::Configuration(
                "lighter.funding_rate_interval_hours must be 1".to_string(),
            ));
        }
        if self.x10.funding_rate_interval_hours != 1 {
            return Err(EngineError::Configuration(
                "x10.funding_rate_interval_hours must be 1".to_string(),
            ));
        }
        if self.live_trading && (self.lighter.private_key.is_empty() || self.x10.api_key.is_empty()) {
            return Err(EngineError::Configuration(
                "live_trading requires both venues' credentials to be set".to_string(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_settings_pass_validation() {
        assert!(Settings::default().validate().is_ok());
    }

    #[test]
    fn non_hourly_funding_interval_is_fatal() {
        let mut settings = Settings::default();
        settings.lighter.funding_rate_interval_hours = 8;
        assert!(matches!(settings.validate(), Err(EngineError::Configuration(_))));
    }

    #[test]
    fn live_trading_requires_credentials() {
        let mut settings = Settings::default();
        settings.live_trading = true;
        assert!(settings.validate().is_err());
    }
}
