//! Rolling ATR accumulator per symbol, feeding E10 (trailing stop).
//! Classic Wilder ATR over mark-price high/low/close bars, kept in a
//! bounded ring rather than a full history.

use std::collections::HashMap;

use parking_lot::Mutex;
use rust_decimal::Decimal;

use crate::domain::Symbol;

struct SymbolAtr {
    period: usize,
    prev_close: Option<Decimal>,
    true_ranges: Vec<Decimal>,
    atr: Option<Decimal>,
}

impl SymbolAtr {
    fn new(period: usize) -> Self {
        Self { period, prev_close: None, true_ranges: Vec::with_capacity(period), atr: None }
    }

    fn push(&mut self, high: Decimal, low: Decimal, close: Decimal) {
        let tr = match self.prev_close {
            Some(prev) => (high - low).max((high - prev).abs()).max((low - prev).abs()),
            None => high - low,
        };
        self.prev_close = Some(close);
        self.true_ranges.push(tr);
        if self.true_ranges.len() > self.period {
            self.true_ranges.remove(0);
        }
        if self.true_ranges.len() == self.period {
            let sum: Decimal = self.true_ranges.iter().copied().sum();
            self.atr = Some(sum / Decimal::from(self.period));
        }
    }
}

pub struct AtrTracker {
    period: usize,
    series: Mutex<HashMap<Symbol, SymbolAtr>>,
}

impl AtrTracker {
    pub fn new(period: usize) -> Self {
        Self { period, series: Mutex::new(HashMap::new()) }
    }

    /// Feed one bar (mark-price sampled as high=low=close between ticks is
    /// fine; callers with real OHLC bars pass those directly).
    pub fn record(&self, symbol: &Symbol, high: Decimal, low: Decimal, close: Decimal) {
        let mut series = self.series.lock();
        let entry = series.entry(symbol.clone()).or_insert_with(|| SymbolAtr::new(self.period));
        entry.push(high, low, close);
    }

    pub fn current(&self, symbol: &Symbol) -> Option<Decimal> {
        self.series.lock().get(symbol).and_then(|s| s.atr)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn atr_populates_after_period_bars() {
        let tracker = AtrTracker::new(3);
        let symbol = "ETH".to_string();
        assert!(tracker.current(&symbol).is_none());
        tracker.record(&symbol, dec!(105), dec!(95), dec!(100));
        tracker.record(&symbol, dec!(108), dec!(98), dec!(103));
        tracker.record(&symbol, dec!(110), dec!(100), dec!(105));
        assert!(tracker.current(&symbol).is_some());
    }
}
