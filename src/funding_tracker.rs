//! C8 FundingTracker: periodic realized-funding reconciliation, PnL
//! snapshots, and the slower-cadence volatility-profile computation that
//! feeds E6 (Z-score crash). Grounded on
//! `original_source/src/funding_tracker.py` and the
//! `write_queue.py` upsert shapes for `funding_history`/`volatility_metrics`.

use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::sync::Arc;

use chrono::Utc;
use rust_decimal::Decimal;
use tracing::{debug, warn};

use crate::domain::{FundingCrashEvent, FundingEvent, Symbol, Trade, Venue, VolatilityProfile};
use crate::errors::EngineResult;
use crate::exchange::ExchangePort;
use crate::store::TradeStore;

const HOURS_PER_YEAR: i64 = 24 * 365;

fn hash_id(s: &str) -> u64 {
    let mut hasher = DefaultHasher::new();
    s.hash(&mut hasher);
    hasher.finish()
}

pub struct FundingTracker {
    lighter: Arc<dyn ExchangePort>,
    x10: Arc<dyn ExchangePort>,
    store: Arc<TradeStore>,
}

impl FundingTracker {
    pub fn new(lighter: Arc<dyn ExchangePort>, x10: Arc<dyn ExchangePort>, store: Arc<TradeStore>) -> Self {
        Self { lighter, x10, store }
    }

    fn port(&self, venue: Venue) -> &Arc<dyn ExchangePort> {
        match venue {
            Venue::Lighter => &self.lighter,
            Venue::X10 => &self.x10,
        }
    }

    /// One reconciliation pass over every open trade.
    pub async fn reconcile_tick(&self) {
        for trade in self.store.list_open_trades() {
            if let Err(e) = self.reconcile_trade(&trade).await {
                warn!(trade_id = %trade.id, error = %e, "funding reconciliation failed");
            }
        }
    }

    async fn reconcile_trade(&self, trade: &Trade) -> EngineResult<()> {
        if !trade.net_funding_migrated {
            // §9 OQ3: a trade created under the legacy NET-funding accounting
            // carries its pre-migration total in `funding_collected` already;
            // the one-shot migration just flips the flag so future per-venue
            // events accumulate on top of it instead of replacing it.
            self.store.mutate_trade(&trade.id, |t| t.net_funding_migrated = true).await?;
        }

        let since = trade.last_funding_update.unwrap_or(trade.opened_at.unwrap_or(trade.created_at));
        let (lighter_amount, x10_amount) = tokio::join!(
            self.lighter.get_realized_funding(&trade.symbol, since),
            self.x10.get_realized_funding(&trade.symbol, since),
        );

        let mut total = Decimal::ZERO;
        for (venue, amount) in [(Venue::Lighter, lighter_amount), (Venue::X10, x10_amount)] {
            if let Ok(amount) = amount {
                if !amount.is_zero() {
                    self.store
                        .record_funding(&trade.id, FundingEvent { trade_id_hash: hash_id(&trade.id), venue, amount })
                        .await?;
                    total += amount;
                }
            }
        }

        if !total.is_zero() {
            self.store
                .mutate_trade(&trade.id, |t| {
                    t.funding_collected += total;
                    t.last_funding_update = Some(Utc::now());
                })
                .await?;
        }

        let fees = trade.leg_l.fees + trade.leg_x.fees;
        self.store
            .save_pnl_snapshot(&trade.id, trade.realized_pnl, trade.unrealized_pnl, trade.funding_collected + total, fees)
            .await?;
        Ok(())
    }

    /// Records the current funding-rate snapshot for a symbol on both
    /// venues, feeding `funding_history`/candle aggregation.
    pub async fn record_rate_snapshot(&self, symbol: &Symbol) {
        for venue in [Venue::Lighter, Venue::X10] {
            match self.port(venue).get_funding_rate(symbol).await {
                Ok(rate) => {
                    let apy = rate.hourly_rate.abs() * Decimal::from(HOURS_PER_YEAR);
                    self.store
                        .record_funding_history(symbol.clone(), venue, rate.hourly_rate, Some(apy), Some(rate.next_funding_time))
                        .await
                        .ok();
                }
                Err(e) => debug!(%symbol, %venue, error = %e, "funding rate snapshot skipped"),
            }
        }
    }

    /// §3 addition: recomputes the historical APY distribution for a symbol
    /// from a window of hourly net-rate samples, on a slower cadence than
    /// reconciliation. Also detects a crash (z-score beyond threshold) and
    /// records it for the Reconciler/Supervisor to surface.
    pub async fn compute_volatility_profile(
        &self,
        symbol: &Symbol,
        hourly_net_rate_samples: &[Decimal],
        period_days: u32,
        crash_z_threshold: Decimal,
        emergency_z_threshold: Decimal,
        min_samples: usize,
    ) -> Option<VolatilityProfile> {
        if hourly_net_rate_samples.len() < min_samples {
            return None;
        }
        let apys: Vec<Decimal> = hourly_net_rate_samples.iter().map(|r| r.abs() * Decimal::from(HOURS_PER_YEAR)).collect();
        let n = Decimal::from(apys.len() as i64);
        let mean = apys.iter().copied().sum::<Decimal>() / n;
        let variance = apys.iter().map(|a| (*a - mean) * (*a - mean)).sum::<Decimal>() / n;
        let std_dev = sqrt_decimal(variance);

        let mut sorted = apys.clone();
        sorted.sort();
        let last_idx = sorted.len().saturating_sub(1);
        let percentile = |numerator: u32| -> Decimal {
            let idx = (last_idx * numerator as usize) / 100;
            sorted.get(idx.min(last_idx)).copied().unwrap_or(Decimal::ZERO)
        };

        let hourly_std_dev = sqrt_decimal(
            hourly_net_rate_samples.iter().map(|r| (*r - mean / Decimal::from(HOURS_PER_YEAR)) * (*r - mean / Decimal::from(HOURS_PER_YEAR))).sum::<Decimal>() / n,
        );
        let hourly_range_avg = hourly_net_rate_samples.iter().map(|r| r.abs()).sum::<Decimal>() / n;

        let last_apy = apys.last().copied().unwrap_or(Decimal::ZERO);
        let z = if std_dev.is_zero() { Decimal::ZERO } else { (last_apy - mean) / std_dev };
        let crash_frequency = if z <= (-crash_z_threshold) || z >= crash_z_threshold {
            Decimal::ONE / n
        } else {
            Decimal::ZERO
        };

        if z <= (-emergency_z_threshold) || z <= (-crash_z_threshold) {
            let severity = if z <= (-emergency_z_threshold) {
                crate::domain::CrashSeverity::Emergency
            } else {
                crate::domain::CrashSeverity::Crash
            };
            let event = FundingCrashEvent { symbol: symbol.clone(), detected_at: Utc::now(), z_score: z, severity };
            self.store.record_crash_event(event).await.ok();
        }

        let profile = VolatilityProfile {
            symbol: symbol.clone(),
            period_days,
            calculated_at: Utc::now(),
            sample_count: hourly_net_rate_samples.len(),
            hourly_std_dev,
            hourly_range_avg,
            crash_frequency,
            avg_crash_duration_minutes: Decimal::ZERO,
            avg_recovery_time_minutes: Decimal::ZERO,
            apy_mean: mean,
            apy_std: std_dev,
            p25: percentile(25),
            p50: percentile(50),
            p75: percentile(75),
            p90: percentile(90),
            p95: percentile(95),
        };
        self.store.update_volatility_profile(profile.clone()).await.ok();
        Some(profile)
    }
}

/// `rust_decimal` has no native sqrt; Newton-Raphson to a tight tolerance is
/// more than adequate for a statistics display value, not a pricing input.
fn sqrt_decimal(value: Decimal) -> Decimal {
    if value <= Decimal::ZERO {
        return Decimal::ZERO;
    }
    let mut x = value;
    let two = Decimal::TWO;
    for _ in 0..40 {
        let next = (x + value / x) / two;
        if (next - x).abs() < Decimal::new(1, 12) {
            x = next;
            break;
        }
        x = next;
    }
    x
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn sqrt_matches_known_value() {
        let result = sqrt_decimal(dec!(4));
        assert!((result - dec!(2)).abs() < dec!(0.0001));
    }

    #[test]
    fn hash_id_is_deterministic() {
        assert_eq!(hash_id("trade-1"), hash_id("trade-1"));
    }
}
