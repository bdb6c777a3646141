//! Per-cycle strategy configuration.
//!
//! Every cycle freezes a [`CycleConfig`] at creation time and derives all of
//! its geometry from that snapshot, never from live settings. Cycles created
//! under an old configuration keep their contract when the operator changes
//! values mid-session.

use serde::{Deserialize, Serialize};
use tracing::warn;

/// Policy governing whether and how the zone migrates on trailing-stop
/// triggers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ZoneMovementMode {
    #[serde(rename = "No Move")]
    NoMove,
    #[serde(rename = "Move Up Only")]
    MoveUpOnly,
    #[serde(rename = "Move Down Only")]
    MoveDownOnly,
    #[serde(rename = "Move Both Sides")]
    MoveBothSides,
}

impl Default for ZoneMovementMode {
    fn default() -> Self {
        Self::NoMove
    }
}

/// Frozen strategy parameters for one cycle.
///
/// All `*_pips` values are distances in pips except `cycle_take_profit_pips`,
/// which despite its name is compared against summed broker profit in
/// **account currency** (dollars). The quirk is preserved verbatim from the
/// field's external contract; do not re-interpret it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CycleConfig {
    pub lot_size: f64,
    /// Offset of the level-0/initial entry from the zone boundary.
    pub entry_interval_pips: f64,
    pub subsequent_entry_interval_pips: f64,
    /// Spacing between consecutive grid levels.
    pub grid_interval_pips: f64,
    /// SL distance used when no trailing stop is set yet.
    pub initial_stop_loss_pips: f64,
    pub cycle_stop_loss_pips: f64,
    /// Drawdown (in pips) that activates recovery mode.
    pub recovery_stop_loss_pips: f64,
    /// Spacing between consecutive recovery orders.
    pub recovery_interval_pips: f64,
    /// Take-profit threshold in account currency (see type-level note).
    pub cycle_take_profit_pips: f64,
    /// Zone width in pips.
    pub zone_threshold_pips: f64,
    pub zone_move_step_pips: f64,
    pub zone_movement_mode: ZoneMovementMode,
    pub max_active_cycles: usize,
    pub max_trades_per_cycle: usize,
    pub max_active_trades_per_cycle: usize,
    /// Distance between auto-created cycles.
    pub cycle_interval_pips: f64,
    pub auto_place_cycles: bool,
    pub recovery_enabled: bool,
}

impl Default for CycleConfig {
    fn default() -> Self {
        Self {
            lot_size: 0.01,
            entry_interval_pips: 10.0,
            subsequent_entry_interval_pips: 10.0,
            grid_interval_pips: 50.0,
            initial_stop_loss_pips: 100.0,
            cycle_stop_loss_pips: 300.0,
            recovery_stop_loss_pips: 200.0,
            recovery_interval_pips: 50.0,
            cycle_take_profit_pips: 100.0,
            zone_threshold_pips: 300.0,
            zone_move_step_pips: 50.0,
            zone_movement_mode: ZoneMovementMode::NoMove,
            max_active_cycles: 3,
            max_trades_per_cycle: 20,
            max_active_trades_per_cycle: 10,
            cycle_interval_pips: 100.0,
            auto_place_cycles: false,
            recovery_enabled: false,
        }
    }
}

impl CycleConfig {
    /// Replace out-of-range values with the documented defaults.
    ///
    /// Called on every snapshot taken from external input; each fallback is
    /// logged with the offending field so bad store records are visible.
    pub fn validated(mut self) -> Self {
        let defaults = Self::default();

        fn check(name: &str, value: &mut f64, fallback: f64) {
            if !value.is_finite() || *value <= 0.0 {
                warn!(field = name, value = *value, fallback, "invalid config value, using default");
                *value = fallback;
            }
        }

        check("lot_size", &mut self.lot_size, defaults.lot_size);
        check(
            "entry_interval_pips",
            &mut self.entry_interval_pips,
            defaults.entry_interval_pips,
        );
        check(
            "subsequent_entry_interval_pips",
            &mut self.subsequent_entry_interval_pips,
            defaults.subsequent_entry_interval_pips,
        );
        check(
            "grid_interval_pips",
            &mut self.grid_interval_pips,
            defaults.grid_interval_pips,
        );
        check(
            "initial_stop_loss_pips",
            &mut self.initial_stop_loss_pips,
            defaults.initial_stop_loss_pips,
        );
        check(
            "cycle_stop_loss_pips",
            &mut self.cycle_stop_loss_pips,
            defaults.cycle_stop_loss_pips,
        );
        check(
            "recovery_stop_loss_pips",
            &mut self.recovery_stop_loss_pips,
            defaults.recovery_stop_loss_pips,
        );
        check(
            "recovery_interval_pips",
            &mut self.recovery_interval_pips,
            defaults.recovery_interval_pips,
        );
        check(
            "cycle_take_profit_pips",
            &mut self.cycle_take_profit_pips,
            defaults.cycle_take_profit_pips,
        );
        check(
            "zone_threshold_pips",
            &mut self.zone_threshold_pips,
            defaults.zone_threshold_pips,
        );
        check(
            "zone_move_step_pips",
            &mut self.zone_move_step_pips,
            defaults.zone_move_step_pips,
        );
        check(
            "cycle_interval_pips",
            &mut self.cycle_interval_pips,
            defaults.cycle_interval_pips,
        );

        if self.max_active_cycles == 0 {
            warn!(field = "max_active_cycles", "invalid config value, using default");
            self.max_active_cycles = defaults.max_active_cycles;
        }
        if self.max_trades_per_cycle == 0 {
            warn!(field = "max_trades_per_cycle", "invalid config value, using default");
            self.max_trades_per_cycle = defaults.max_trades_per_cycle;
        }
        if self.max_active_trades_per_cycle == 0 {
            warn!(
                field = "max_active_trades_per_cycle",
                "invalid config value, using default"
            );
            self.max_active_trades_per_cycle = defaults.max_active_trades_per_cycle;
        }

        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn invalid_values_fall_back_to_defaults() {
        let config = CycleConfig {
            lot_size: -1.0,
            zone_threshold_pips: f64::NAN,
            max_active_cycles: 0,
            ..Default::default()
        }
        .validated();

        let defaults = CycleConfig::default();
        assert_eq!(config.lot_size, defaults.lot_size);
        assert_eq!(config.zone_threshold_pips, defaults.zone_threshold_pips);
        assert_eq!(config.max_active_cycles, defaults.max_active_cycles);
    }

    #[test]
    fn movement_mode_serialises_with_spaces() {
        let json = serde_json::to_string(&ZoneMovementMode::MoveBothSides).unwrap();
        assert_eq!(json, "\"Move Both Sides\"");
        let back: ZoneMovementMode = serde_json::from_str("\"Move Up Only\"").unwrap();
        assert_eq!(back, ZoneMovementMode::MoveUpOnly);
    }

    #[test]
    fn partial_json_uses_defaults() {
        let config: CycleConfig =
            serde_json::from_str(r#"{"lot_size": 0.02, "grid_interval_pips": 25.0}"#).unwrap();
        assert_eq!(config.lot_size, 0.02);
        assert_eq!(config.grid_interval_pips, 25.0);
        assert_eq!(config.zone_threshold_pips, CycleConfig::default().zone_threshold_pips);
    }
}
