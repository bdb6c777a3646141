//! Zone geometry and the direction decision engine.
//!
//! The direction engine is a pure function over the zone and the current
//! price; it only hints, the cycle commits.

use crate::config::ZoneMovementMode;
use broker_core::types::Direction;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Price interval governing direction re-selection and trailing-stop clipping.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ZoneData {
    pub base_price: f64,
    pub upper_boundary: f64,
    pub lower_boundary: f64,
    pub movement_mode: ZoneMovementMode,
    pub last_movement: Option<DateTime<Utc>>,
}

impl ZoneData {
    /// Symmetric zone of width `2 * half_width` around `base`.
    pub fn around(base: f64, half_width: f64, movement_mode: ZoneMovementMode) -> Self {
        Self {
            base_price: base,
            upper_boundary: base + half_width,
            lower_boundary: base - half_width,
            movement_mode,
            last_movement: None,
        }
    }

    pub fn width(&self) -> f64 {
        self.upper_boundary - self.lower_boundary
    }

    pub fn contains(&self, price: f64) -> bool {
        price > self.lower_boundary && price < self.upper_boundary
    }
}

/// One zone migration, kept for the store record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ZoneMovement {
    pub time: DateTime<Utc>,
    pub mode: ZoneMovementMode,
    pub old_upper: f64,
    pub old_lower: f64,
    pub new_upper: f64,
    pub new_lower: f64,
    pub reason: String,
}

/// Decide whether the current price position admits a new initial order.
///
/// `entry_offset` is the absolute price distance treated as "far" beyond the
/// opposite boundary for the restricted movement modes.
pub fn direction_hint(
    zone: &ZoneData,
    mode: ZoneMovementMode,
    price: f64,
    entry_offset: f64,
) -> Option<Direction> {
    let above = price >= zone.upper_boundary;
    let below = price <= zone.lower_boundary;

    match mode {
        ZoneMovementMode::NoMove | ZoneMovementMode::MoveBothSides => {
            if above {
                Some(Direction::Buy)
            } else if below {
                Some(Direction::Sell)
            } else {
                None
            }
        }
        ZoneMovementMode::MoveUpOnly => {
            if above {
                Some(Direction::Buy)
            } else if price <= zone.lower_boundary - entry_offset {
                Some(Direction::Sell)
            } else {
                None
            }
        }
        ZoneMovementMode::MoveDownOnly => {
            if price >= zone.upper_boundary + entry_offset {
                Some(Direction::Buy)
            } else if below {
                Some(Direction::Sell)
            } else {
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn zone() -> ZoneData {
        ZoneData::around(1.10000, 0.03, ZoneMovementMode::NoMove)
    }

    #[test]
    fn symmetric_bounds() {
        let z = zone();
        assert!((z.upper_boundary - 1.13).abs() < 1e-9);
        assert!((z.lower_boundary - 1.07).abs() < 1e-9);
        assert!((z.width() - 0.06).abs() < 1e-9);
        assert!(z.contains(1.10));
        assert!(!z.contains(1.14));
    }

    #[test]
    fn no_move_hints_both_sides() {
        let z = zone();
        assert_eq!(
            direction_hint(&z, ZoneMovementMode::NoMove, 1.1301, 0.001),
            Some(Direction::Buy)
        );
        assert_eq!(
            direction_hint(&z, ZoneMovementMode::NoMove, 1.0699, 0.001),
            Some(Direction::Sell)
        );
        assert_eq!(direction_hint(&z, ZoneMovementMode::NoMove, 1.10, 0.001), None);
    }

    #[test]
    fn move_up_only_requires_distance_for_sell() {
        let z = zone();
        // At the lower boundary: not far enough below.
        assert_eq!(
            direction_hint(&z, ZoneMovementMode::MoveUpOnly, 1.07, 0.001),
            None
        );
        // Beyond boundary + offset: sell admitted.
        assert_eq!(
            direction_hint(&z, ZoneMovementMode::MoveUpOnly, 1.0689, 0.001),
            Some(Direction::Sell)
        );
        assert_eq!(
            direction_hint(&z, ZoneMovementMode::MoveUpOnly, 1.1301, 0.001),
            Some(Direction::Buy)
        );
    }

    #[test]
    fn move_down_only_requires_distance_for_buy() {
        let z = zone();
        assert_eq!(
            direction_hint(&z, ZoneMovementMode::MoveDownOnly, 1.13, 0.001),
            None
        );
        assert_eq!(
            direction_hint(&z, ZoneMovementMode::MoveDownOnly, 1.1311, 0.001),
            Some(Direction::Buy)
        );
        assert_eq!(
            direction_hint(&z, ZoneMovementMode::MoveDownOnly, 1.0699, 0.001),
            Some(Direction::Sell)
        );
    }
}
