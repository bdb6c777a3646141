//! Store-ready cycle records.
//!
//! [`CycleSnapshot`] mirrors the cycle data model with serialisable
//! encodings: sets become sorted arrays, the infinite sell-side sentinel
//! becomes a large finite constant, and the frozen config rides along as a
//! JSON blob. Restoring tolerates the store's field soup, where
//! `cycle_config` sometimes arrives as a string containing JSON.

use crate::config::CycleConfig;
use crate::cycle::{ClosingMethod, Cycle, CycleStatus};
use crate::order::CycleOrder;
use crate::zone::{ZoneData, ZoneMovement};
use broker_core::types::Direction;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeSet;
use tracing::{error, warn};

/// Finite stand-in for `f64::INFINITY` at the persistence boundary.
pub const INFINITY_SENTINEL: f64 = 1e12;

fn encode_sentinel(value: f64) -> f64 {
    if value.is_finite() {
        value
    } else {
        INFINITY_SENTINEL
    }
}

fn decode_sentinel(value: f64) -> f64 {
    if value >= INFINITY_SENTINEL {
        f64::INFINITY
    } else {
        value
    }
}

/// Serialised form of a cycle, written to the record store.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CycleSnapshot {
    // Identifiers.
    pub id: String,
    pub cycle_id: String,
    pub bot: String,
    pub account: String,
    pub symbol: String,

    // Lifecycle.
    pub status: CycleStatus,
    pub is_closed: bool,
    pub closing_method: Option<ClosingMethod>,
    pub close_time: Option<DateTime<Utc>>,
    pub close_reason: Option<String>,
    pub created: DateTime<Utc>,
    pub updated: DateTime<Utc>,

    // Geometry.
    pub upper_bound: f64,
    pub lower_bound: f64,
    pub zone_data: ZoneData,
    pub zone_movement_history: Vec<ZoneMovement>,

    // Trading.
    pub direction: Direction,
    pub current_direction: Direction,
    pub entry_price: f64,
    pub lot_size: f64,
    pub magic_number: i64,
    pub pip_value: f64,

    // Orders.
    pub orders: Vec<CycleOrder>,
    pub active_orders: Vec<u64>,
    pub completed_orders: Vec<u64>,
    pub pending_orders: Vec<u64>,
    pub pending_order_levels: Vec<i32>,

    // Trailing.
    pub trailing_stop_loss: f64,
    pub highest_buy_price: f64,
    pub lowest_sell_price: f64,

    // Recovery.
    pub recovery_data: Value,
    pub in_recovery_mode: bool,
    pub recovery_activated: bool,
    pub recovery_direction: Option<Direction>,
    pub initial_order_open_price: f64,
    pub initial_stop_loss_price: f64,
    pub recovery_zone_base_price: f64,

    // Totals.
    pub total_volume: f64,
    pub total_profit: f64,
    pub total_profit_pips: f64,
    pub total_profit_dollars: f64,
    pub total_orders: usize,
    pub profitable_orders: usize,
    pub loss_orders: usize,
    pub duration_minutes: f64,

    /// Frozen configuration, stored as JSON.
    pub cycle_config: Value,
}

impl CycleSnapshot {
    pub fn from_cycle(cycle: &Cycle) -> Self {
        let active: Vec<u64> = cycle.active_orders().map(|o| o.order_id).collect();
        let completed: Vec<u64> = cycle.closed_orders().map(|o| o.order_id).collect();
        let pending: Vec<u64> = cycle.pending_orders().map(|o| o.order_id).collect();
        let levels: Vec<i32> = cycle.pending_order_levels.iter().copied().collect();

        let (upper_bound, lower_bound) = cycle.reported_bounds();
        let recovery_data = serde_json::json!({
            "in_recovery_mode": cycle.in_recovery_mode,
            "recovery_activated": cycle.recovery_activated,
            "recovery_direction": cycle.recovery_direction,
            "initial_order_open_price": cycle.initial_order_open_price,
            "initial_stop_loss_price": cycle.initial_stop_loss_price,
            "recovery_zone_base_price": cycle.recovery_zone_base_price,
        });

        Self {
            id: cycle.cycle_id.clone(),
            cycle_id: cycle.cycle_id.clone(),
            bot: cycle.bot_id.clone(),
            account: cycle.account_id.clone(),
            symbol: cycle.symbol.clone(),
            status: cycle.status,
            is_closed: cycle.is_closed,
            closing_method: cycle.closing_method.clone(),
            close_time: cycle.close_time,
            close_reason: cycle.close_reason.clone(),
            created: cycle.created,
            updated: cycle.updated,
            upper_bound,
            lower_bound,
            zone_data: cycle.zone.clone(),
            zone_movement_history: cycle.zone_movement_history.clone(),
            direction: cycle.direction,
            current_direction: cycle.direction,
            entry_price: cycle.entry_price,
            lot_size: cycle.lot_size,
            magic_number: cycle.magic_number,
            pip_value: cycle.pip,
            orders: cycle.orders.clone(),
            active_orders: active,
            completed_orders: completed,
            pending_orders: pending,
            pending_order_levels: levels,
            trailing_stop_loss: cycle.trailing_stop_loss,
            highest_buy_price: cycle.highest_buy_price,
            lowest_sell_price: encode_sentinel(cycle.lowest_sell_price),
            recovery_data,
            in_recovery_mode: cycle.in_recovery_mode,
            recovery_activated: cycle.recovery_activated,
            recovery_direction: cycle.recovery_direction,
            initial_order_open_price: cycle.initial_order_open_price,
            initial_stop_loss_price: cycle.initial_stop_loss_price,
            recovery_zone_base_price: cycle.recovery_zone_base_price,
            total_volume: cycle.total_volume(),
            total_profit: cycle.total_profit,
            total_profit_pips: cycle.total_profit_pips,
            total_profit_dollars: cycle.total_profit_dollars,
            total_orders: cycle.orders.len(),
            profitable_orders: cycle.profitable_orders(),
            loss_orders: cycle.loss_orders(),
            duration_minutes: cycle.duration_minutes(),
            cycle_config: serde_json::to_value(&cycle.cycle_config).unwrap_or(Value::Null),
        }
    }

    /// Rebuild a live cycle from a stored record.
    pub fn restore(&self) -> Cycle {
        let config = decode_config(&self.cycle_config, &self.cycle_id);
        let mut pending_levels = BTreeSet::new();
        for level in &self.pending_order_levels {
            pending_levels.insert(*level);
        }

        Cycle {
            cycle_id: self.cycle_id.clone(),
            bot_id: self.bot.clone(),
            account_id: self.account.clone(),
            symbol: self.symbol.clone(),
            magic_number: self.magic_number,
            direction: self.current_direction,
            entry_price: self.entry_price,
            lot_size: self.lot_size,
            status: self.status,
            orders: self.orders.clone(),
            pending_order_levels: pending_levels,
            zone: self.zone_data.clone(),
            zone_movement_history: self.zone_movement_history.clone(),
            trailing_stop_loss: self.trailing_stop_loss,
            highest_buy_price: self.highest_buy_price,
            lowest_sell_price: decode_sentinel(self.lowest_sell_price),
            in_recovery_mode: self.in_recovery_mode,
            recovery_activated: self.recovery_activated,
            recovery_direction: self.recovery_direction,
            initial_order_open_price: self.initial_order_open_price,
            initial_stop_loss_price: self.initial_stop_loss_price,
            recovery_zone_base_price: self.recovery_zone_base_price,
            is_closed: self.is_closed,
            closing_method: self.closing_method.clone(),
            close_time: self.close_time,
            close_reason: self.close_reason.clone(),
            total_profit: self.total_profit,
            total_profit_pips: self.total_profit_pips,
            total_profit_dollars: self.total_profit_dollars,
            created: self.created,
            updated: self.updated,
            pip: self.pip_value,
            cycle_config: config,
        }
    }

    /// Every numeric field the store receives must be finite.
    pub fn all_numeric_finite(&self) -> bool {
        [
            self.upper_bound,
            self.lower_bound,
            self.entry_price,
            self.lot_size,
            self.trailing_stop_loss,
            self.highest_buy_price,
            self.lowest_sell_price,
            self.initial_order_open_price,
            self.initial_stop_loss_price,
            self.recovery_zone_base_price,
            self.total_volume,
            self.total_profit,
            self.total_profit_pips,
            self.total_profit_dollars,
            self.duration_minutes,
        ]
        .iter()
        .all(|v| v.is_finite())
    }
}

/// Decode the stored config blob, accepting either a JSON object or a string
/// containing JSON.
fn decode_config(value: &Value, cycle_id: &str) -> CycleConfig {
    match value {
        Value::Object(_) => match serde_json::from_value(value.clone()) {
            Ok(config) => CycleConfig::validated(config),
            Err(err) => {
                error!(%cycle_id, %err, "unreadable cycle_config object, using defaults");
                CycleConfig::default()
            }
        },
        Value::String(raw) => {
            warn!(%cycle_id, "cycle_config stored as string, decoding embedded JSON");
            match serde_json::from_str::<CycleConfig>(raw) {
                Ok(config) => CycleConfig::validated(config),
                Err(err) => {
                    error!(%cycle_id, %err, "unreadable embedded cycle_config, using defaults");
                    CycleConfig::default()
                }
            }
        }
        _ => {
            error!(%cycle_id, "cycle_config missing from record, using defaults");
            CycleConfig::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::order::OrderStatus;

    fn sample_cycle() -> Cycle {
        let mut cycle = Cycle::new(
            "cycle-9".to_string(),
            "bot-1".to_string(),
            "acct-1".to_string(),
            "EURUSD".to_string(),
            777,
            Direction::Buy,
            1.10002,
            0.0001,
            CycleConfig::default(),
        );
        cycle.add_order(CycleOrder::initial(10, Direction::Buy, 1.10002, 0.01, 1.09));
        cycle.add_order(CycleOrder::grid(11, Direction::Buy, 1.13102, 0.01, 1.13002, 1));
        cycle.add_order(CycleOrder::grid(12, Direction::Buy, 1.13602, 0.01, 1.13002, 2));
        cycle.trailing_stop_loss = 1.11;
        cycle.highest_buy_price = 1.14;
        cycle
    }

    #[test]
    fn sentinel_is_finite_in_snapshot() {
        let cycle = sample_cycle();
        assert!(cycle.lowest_sell_price.is_infinite());
        let snapshot = CycleSnapshot::from_cycle(&cycle);
        assert_eq!(snapshot.lowest_sell_price, INFINITY_SENTINEL);
        assert!(snapshot.all_numeric_finite());
    }

    #[test]
    fn snapshot_restore_snapshot_is_a_fixed_point() {
        let cycle = sample_cycle();
        let first = CycleSnapshot::from_cycle(&cycle);
        let restored = first.restore();
        let second = CycleSnapshot::from_cycle(&restored);

        let a = serde_json::to_value(&first).unwrap();
        let b = serde_json::to_value(&second).unwrap();
        // duration_minutes depends on wall clock for open cycles.
        let strip = |mut v: Value| {
            v.as_object_mut().unwrap().remove("duration_minutes");
            v
        };
        assert_eq!(strip(a), strip(b));
        assert!(restored.lowest_sell_price.is_infinite());
    }

    #[test]
    fn order_views_are_partitioned() {
        let mut cycle = sample_cycle();
        cycle.order_by_ticket_mut(11).unwrap().status = OrderStatus::Active;
        cycle.release_level(1);
        let snapshot = CycleSnapshot::from_cycle(&cycle);
        assert_eq!(snapshot.active_orders, vec![10, 11]);
        assert_eq!(snapshot.pending_orders, vec![12]);
        assert_eq!(snapshot.pending_order_levels, vec![2]);
        assert_eq!(snapshot.total_orders, 3);
    }

    #[test]
    fn config_accepted_as_object_or_string() {
        let cycle = sample_cycle();
        let mut snapshot = CycleSnapshot::from_cycle(&cycle);

        // Object form.
        let restored = snapshot.restore();
        assert_eq!(restored.cycle_config, cycle.cycle_config);

        // String-wrapped form.
        snapshot.cycle_config = Value::String(
            serde_json::to_string(&cycle.cycle_config).unwrap(),
        );
        let restored = snapshot.restore();
        assert_eq!(restored.cycle_config, cycle.cycle_config);

        // Missing entirely: defaults with a critical log.
        snapshot.cycle_config = Value::Null;
        let restored = snapshot.restore();
        assert_eq!(restored.cycle_config, CycleConfig::default());
    }
}
