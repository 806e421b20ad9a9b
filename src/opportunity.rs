//! C5 OpportunityEngine: a pure ranking function over fresh market data.
//! No state of its own — everything it needs is passed in, so it's trivial
//! to unit test without standing up the rest of the engine.

use std::collections::HashSet;

use rust_decimal::Decimal;
use rust_decimal_macros::dec;

use crate::config::TradingSettings;
use crate::domain::{Opportunity, Symbol, Venue};
use crate::market_data::MarketDataService;

const HOURS_PER_YEAR: i64 = 24 * 365;

fn apy_from_hourly(net_hourly: Decimal) -> Decimal {
    net_hourly.abs() * Decimal::from(HOURS_PER_YEAR)
}

/// §4.4: for each common symbol with fresh data on both venues, compute the
/// net funding edge and rank by expected value.
pub fn rank(
    symbols: &[Symbol],
    market_data: &MarketDataService,
    blacklist: &HashSet<Symbol>,
    already_open: &HashSet<Symbol>,
    cfg: &TradingSettings,
    horizon_hours: Decimal,
) -> Vec<Opportunity> {
    let mut opportunities: Vec<Opportunity> = symbols
        .iter()
        .filter(|s| !blacklist.contains(*s) && !already_open.contains(*s))
        .filter(|s| market_data.is_symbol_fresh(s))
        .filter_map(|symbol| evaluate_symbol(symbol, market_data, cfg, horizon_hours))
        .collect();

    opportunities.sort_by(|a, b| b.expected_value_usd.cmp(&a.expected_value_usd));
    opportunities
}

fn evaluate_symbol(symbol: &Symbol, market_data: &MarketDataService, cfg: &TradingSettings, horizon_hours: Decimal) -> Option<Opportunity> {
    let lighter_rate = market_data.get_funding(Venue::Lighter, symbol)?;
    let x10_rate = market_data.get_funding(Venue::X10, symbol)?;
    let lighter_l1 = market_data.get_l1(Venue::Lighter, symbol)?;
    let x10_l1 = market_data.get_l1(Venue::X10, symbol)?;

    let lighter_mid = market_data.mid_price(Venue::Lighter, symbol)?;
    let x10_mid = market_data.mid_price(Venue::X10, symbol)?;
    if lighter_mid.is_zero() || x10_mid.is_zero() {
        return None;
    }

    let net_hourly = lighter_rate.hourly_rate - x10_rate.hourly_rate;
    let apy = apy_from_hourly(net_hourly);
    if apy < cfg.min_apy_filter {
        return None;
    }

    let mid_price = (lighter_mid + x10_mid) / Decimal::TWO;
    let spread = (lighter_mid - x10_mid).abs() / mid_price;
    if spread > cfg.max_entry_spread {
        return None;
    }

    let (long_venue, short_venue) = if net_hourly > Decimal::ZERO {
        // Lighter pays more than x10 charges: go long where we receive funding.
        (Venue::X10, Venue::Lighter)
    } else {
        (Venue::Lighter, Venue::X10)
    };

    let suggested_notional = cfg.min_profit_exit_usd.max(dec!(100));
    let suggested_qty = suggested_notional / mid_price;

    let est_fees = suggested_notional * (cfg.taker_fee_bps + cfg.maker_fee_bps) / dec!(10000);
    let spread_cost = suggested_notional * spread;
    let est_exit_cost = est_fees + spread_cost;

    let expected_value_usd = net_hourly.abs() * suggested_notional * horizon_hours - est_exit_cost;
    if expected_value_usd <= Decimal::ZERO {
        return None;
    }

    let breakeven_hours = if net_hourly.is_zero() {
        Decimal::MAX
    } else {
        est_exit_cost / (net_hourly.abs() * suggested_notional)
    };

    let _ = (lighter_l1, x10_l1); // depth gate is enforced at preflight time, not here

    Some(Opportunity {
        symbol: symbol.clone(),
        long_venue,
        short_venue,
        apy,
        spread,
        suggested_qty,
        suggested_notional,
        mid_price,
        breakeven_hours,
        expected_value_usd,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn apy_matches_scenario_s1() {
        // lighter_rate=+0.00005/h, x10_rate=-0.00005/h -> apy ~= 87.6%
        let net_hourly = dec!(0.00005) - dec!(-0.00005);
        let apy = apy_from_hourly(net_hourly);
        assert!((apy - dec!(0.876)).abs() < dec!(0.001));
    }
}
