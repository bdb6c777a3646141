//! Pip derivation and market-hours checks.

use crate::types::SymbolInfo;
use chrono::{DateTime, Datelike, Timelike, Utc, Weekday};
use tracing::debug;

/// Fallback pip value when the broker reports no usable point size.
fn fallback_pip_value(symbol: &str) -> f64 {
    if symbol.starts_with("BTC") {
        0.1
    } else {
        0.0001
    }
}

/// Price increment representing one pip for a symbol.
///
/// Derived from broker metadata (`point * 10`) when available and positive,
/// otherwise from the symbol family.
pub fn pip_value(info: Option<&SymbolInfo>, symbol: &str) -> f64 {
    match info {
        Some(i) if i.point > 0.0 => i.point * 10.0,
        _ => {
            let fallback = fallback_pip_value(symbol);
            debug!(symbol, fallback, "no usable point size, using symbol-family pip value");
            fallback
        }
    }
}

/// Conservative forex market-hours check.
///
/// Closed all Saturday, Sunday before 22:00 UTC, and from Friday 22:00 UTC.
/// Callers treat any uncertainty as "open".
pub fn is_market_open(now: DateTime<Utc>) -> bool {
    let hour = now.time().hour();
    match now.weekday() {
        Weekday::Sat => false,
        Weekday::Sun => hour >= 22,
        Weekday::Fri => hour < 22,
        _ => true,
    }
}
