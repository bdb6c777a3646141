//! Shared wire types exchanged with the broker.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Trade direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Direction {
    #[serde(rename = "BUY")]
    Buy,
    #[serde(rename = "SELL")]
    Sell,
}

impl Direction {
    pub fn opposite(self) -> Self {
        match self {
            Self::Buy => Self::Sell,
            Self::Sell => Self::Buy,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Buy => "BUY",
            Self::Sell => "SELL",
        }
    }

    /// Decode the numeric order type used by the command channel (0 = BUY, 1 = SELL).
    pub fn from_order_type(order_type: i64) -> Option<Self> {
        match order_type {
            0 => Some(Self::Buy),
            1 => Some(Self::Sell),
            _ => None,
        }
    }
}

impl std::fmt::Display for Direction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Symbol metadata as reported by the broker.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SymbolInfo {
    pub symbol: String,
    /// Smallest price increment. Zero or negative means "unknown".
    pub point: f64,
    pub digits: u32,
    pub volume_min: f64,
    pub volume_step: f64,
}

/// Result of a successful order submission.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct OrderTicket {
    pub ticket: u64,
    /// Actual fill price for market orders; requested price for pendings.
    pub price_open: f64,
}

/// A live position on the broker.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Position {
    pub ticket: u64,
    pub symbol: String,
    pub direction: Direction,
    pub volume: f64,
    pub price_open: f64,
    pub price_current: f64,
    pub sl: f64,
    pub tp: f64,
    /// Floating profit in account currency.
    pub profit: f64,
    pub comment: String,
    pub open_time: DateTime<Utc>,
}

/// A pending stop order resting on the broker.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PendingOrder {
    pub ticket: u64,
    pub symbol: String,
    pub direction: Direction,
    pub volume: f64,
    /// Trigger price of the stop order.
    pub target_price: f64,
    pub sl: f64,
    pub tp: f64,
    pub comment: String,
    pub placed_time: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn direction_round_trip() {
        let json = serde_json::to_string(&Direction::Buy).unwrap();
        assert_eq!(json, "\"BUY\"");
        let back: Direction = serde_json::from_str(&json).unwrap();
        assert_eq!(back, Direction::Buy);
    }

    #[test]
    fn direction_from_order_type() {
        assert_eq!(Direction::from_order_type(0), Some(Direction::Buy));
        assert_eq!(Direction::from_order_type(1), Some(Direction::Sell));
        assert_eq!(Direction::from_order_type(7), None);
    }
}
