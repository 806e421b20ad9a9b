//! Defensive decimal parsing and funding-rate cap validation (§8 boundary
//! behaviors). Grounded on `original_source/src/funding_bot/utils/decimals.py`
//! as confirmed by `original_source/tests/test_decimals.py` — every case in
//! this module has a literal counterpart there.

use rust_decimal::Decimal;
use serde_json::Value;
use std::str::FromStr;
use tracing::warn;

pub const LIGHTER_FUNDING_RATE_CAP: Decimal = Decimal::from_parts(5, 0, 0, false, 3); // 0.005
pub const X10_FUNDING_RATE_CAP: Decimal = Decimal::from_parts(3, 0, 0, false, 2); // 0.03

/// Parses arbitrary JSON-ish input into a `Decimal`, defaulting to `default`
/// on anything malformed: `null`, `""`, whitespace, `"NaN"`/`"Infinity"`
/// (any case), non-numeric strings, arrays, and objects all fall back.
/// Numbers and numeric strings (including scientific notation) parse
/// through unchanged.
pub fn safe_decimal_json(value: &Value, default: Decimal) -> Decimal {
    match value {
        Value::Null => default,
        Value::Number(n) => safe_decimal_str(&n.to_string(), default),
        Value::String(s) => safe_decimal_str(s, default),
        Value::Array(_) | Value::Object(_) | Value::Bool(_) => default,
    }
}

/// String/str-convertible form of the same parser, used directly by callers
/// that already have a scalar (e.g. a REST response field typed as `&str`).
pub fn safe_decimal_str(raw: &str, default: Decimal) -> Decimal {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return default;
    }
    let lowered = trimmed.to_ascii_lowercase();
    if lowered == "nan" || lowered == "infinity" || lowered == "-infinity" || lowered == "inf" || lowered == "-inf" {
        return default;
    }
    Decimal::from_str(trimmed)
        .or_else(|_| Decimal::from_scientific(trimmed))
        .unwrap_or(default)
}

pub fn safe_decimal(raw: Option<&str>, default: Decimal) -> Decimal {
    match raw {
        Some(s) => safe_decimal_str(s, default),
        None => default,
    }
}

/// Logs a warning when `rate` exceeds `cap` in either direction but always
/// returns the *original* rate — §9 Open Question #1 resolves this as
/// "pass-through, never clamp" (see DESIGN.md). Downstream callers that need
/// a bounded value must clamp explicitly at their own call site.
pub fn clamp_funding_rate(rate: Decimal, cap: Decimal, symbol: Option<&str>, exchange: Option<&str>) -> Decimal {
    if rate.abs() > cap {
        warn!(
            rate = %rate,
            cap = %cap,
            symbol = symbol.unwrap_or("?"),
            exchange = exchange.unwrap_or("?"),
            "funding rate exceeds sanity cap, passing through unclamped"
        );
    }
    rate
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn handles_none_and_empty() {
        assert_eq!(safe_decimal(None, dec!(0)), dec!(0));
        assert_eq!(safe_decimal(None, dec!(1)), dec!(1));
        assert_eq!(safe_decimal_str("", dec!(0)), dec!(0));
        assert_eq!(safe_decimal_str("   ", dec!(0)), dec!(0));
    }

    #[test]
    fn handles_nan_and_infinity() {
        for s in ["NaN", "nan", "Infinity", "-Infinity", "inf"] {
            assert_eq!(safe_decimal_str(s, dec!(0)), dec!(0));
        }
    }

    #[test]
    fn handles_invalid_string() {
        assert_eq!(safe_decimal_str("not_a_number", dec!(0)), dec!(0));
        assert_eq!(safe_decimal_str("abc", dec!(-1)), dec!(-1));
    }

    #[test]
    fn handles_scientific_notation() {
        assert_eq!(safe_decimal_str("1e-5", dec!(0)), dec!(0.00001));
        assert_eq!(safe_decimal_str("5.123e-06", dec!(0)), dec!(0.000005123));
    }

    #[test]
    fn handles_valid_values() {
        assert_eq!(safe_decimal_str("123.456", dec!(0)), dec!(123.456));
        assert_eq!(safe_decimal_str("-5.5", dec!(0)), dec!(-5.5));
        assert_eq!(safe_decimal_str("0", dec!(1)), dec!(0));
    }

    #[test]
    fn json_array_and_object_fall_back() {
        let arr = serde_json::json!([1, 2, 3]);
        let obj = serde_json::json!({"value": 100});
        assert_eq!(safe_decimal_json(&arr, dec!(0)), dec!(0));
        assert_eq!(safe_decimal_json(&obj, dec!(0)), dec!(0));
    }

    #[test]
    fn clamp_never_changes_value() {
        let bogus = dec!(0.50);
        assert_eq!(clamp_funding_rate(bogus, LIGHTER_FUNDING_RATE_CAP, None, None), bogus);
        let bogus_neg = dec!(-0.80);
        assert_eq!(clamp_funding_rate(bogus_neg, LIGHTER_FUNDING_RATE_CAP, None, None), bogus_neg);
        assert_eq!(
            clamp_funding_rate(LIGHTER_FUNDING_RATE_CAP, LIGHTER_FUNDING_RATE_CAP, None, None),
            LIGHTER_FUNDING_RATE_CAP
        );
    }

    #[test]
    fn cap_constants_match_venues() {
        assert_eq!(LIGHTER_FUNDING_RATE_CAP, dec!(0.005));
        assert_eq!(X10_FUNDING_RATE_CAP, dec!(0.03));
    }
}
