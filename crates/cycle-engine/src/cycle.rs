//! Per-cycle state.
//!
//! A cycle owns its orders, zone, trailing trackers, recovery flags, and a
//! frozen configuration snapshot. All geometry derives from the snapshot and
//! the pip value captured at creation.

use crate::config::CycleConfig;
use crate::order::{CycleOrder, OrderStatus};
use crate::zone::{ZoneData, ZoneMovement};
use broker_core::types::Direction;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use tracing::{debug, warn};

/// Zone migrations kept per cycle before the oldest entries are dropped.
const ZONE_HISTORY_LIMIT: usize = 100;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CycleStatus {
    Active,
    Closed,
}

/// Closure metadata recorded when a cycle ends.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClosingMethod {
    pub kind: String,
    pub user: String,
    pub timestamp: DateTime<Utc>,
    pub final_profit: f64,
    pub total_orders: usize,
    pub duration_minutes: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Cycle {
    pub cycle_id: String,
    pub bot_id: String,
    pub account_id: String,
    pub symbol: String,
    pub magic_number: i64,
    /// Committed trading direction; re-selected when all orders close.
    pub direction: Direction,
    pub entry_price: f64,
    pub lot_size: f64,
    pub status: CycleStatus,

    /// Source-of-truth order list, in placement order.
    pub orders: Vec<CycleOrder>,
    /// Grid levels currently reserved by pending stops.
    pub pending_order_levels: BTreeSet<i32>,

    pub zone: ZoneData,
    pub zone_movement_history: Vec<ZoneMovement>,

    /// 0 means "not set".
    pub trailing_stop_loss: f64,
    pub highest_buy_price: f64,
    /// `f64::INFINITY` until a sell extreme is observed.
    pub lowest_sell_price: f64,

    // Recovery sub-mode.
    pub in_recovery_mode: bool,
    pub recovery_activated: bool,
    pub recovery_direction: Option<Direction>,
    pub initial_order_open_price: f64,
    pub initial_stop_loss_price: f64,
    pub recovery_zone_base_price: f64,

    // Closure fields.
    pub is_closed: bool,
    pub closing_method: Option<ClosingMethod>,
    pub close_time: Option<DateTime<Utc>>,
    pub close_reason: Option<String>,
    pub total_profit: f64,
    pub total_profit_pips: f64,
    pub total_profit_dollars: f64,

    pub created: DateTime<Utc>,
    pub updated: DateTime<Utc>,

    /// Pip value captured at creation; all pip-to-price conversions use it.
    pub pip: f64,
    /// Frozen configuration snapshot.
    pub cycle_config: CycleConfig,
}

impl Cycle {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        cycle_id: String,
        bot_id: String,
        account_id: String,
        symbol: String,
        magic_number: i64,
        direction: Direction,
        entry_price: f64,
        pip: f64,
        config: CycleConfig,
    ) -> Self {
        let half_width = config.zone_threshold_pips * pip;
        let zone = ZoneData::around(entry_price, half_width, config.zone_movement_mode);
        let now = Utc::now();
        Self {
            cycle_id,
            bot_id,
            account_id,
            symbol,
            magic_number,
            direction,
            entry_price,
            lot_size: config.lot_size,
            status: CycleStatus::Active,
            orders: Vec::new(),
            pending_order_levels: BTreeSet::new(),
            zone,
            zone_movement_history: Vec::new(),
            trailing_stop_loss: 0.0,
            highest_buy_price: 0.0,
            lowest_sell_price: f64::INFINITY,
            in_recovery_mode: false,
            recovery_activated: false,
            recovery_direction: None,
            initial_order_open_price: 0.0,
            initial_stop_loss_price: 0.0,
            recovery_zone_base_price: 0.0,
            is_closed: false,
            closing_method: None,
            close_time: None,
            close_reason: None,
            total_profit: 0.0,
            total_profit_pips: 0.0,
            total_profit_dollars: 0.0,
            created: now,
            updated: now,
            pip,
            cycle_config: config,
        }
    }

    // ---- order views -----------------------------------------------------

    pub fn active_orders(&self) -> impl Iterator<Item = &CycleOrder> {
        self.orders.iter().filter(|o| o.status == OrderStatus::Active)
    }

    pub fn pending_orders(&self) -> impl Iterator<Item = &CycleOrder> {
        self.orders.iter().filter(|o| o.status == OrderStatus::Pending)
    }

    pub fn closed_orders(&self) -> impl Iterator<Item = &CycleOrder> {
        self.orders.iter().filter(|o| o.status == OrderStatus::Closed)
    }

    pub fn active_count(&self) -> usize {
        self.active_orders().count()
    }

    pub fn pending_count(&self) -> usize {
        self.pending_orders().count()
    }

    pub fn open_count(&self) -> usize {
        self.orders.iter().filter(|o| o.is_open()).count()
    }

    pub fn order_by_ticket(&self, ticket: u64) -> Option<&CycleOrder> {
        self.orders.iter().find(|o| o.order_id == ticket)
    }

    pub fn order_by_ticket_mut(&mut self, ticket: u64) -> Option<&mut CycleOrder> {
        self.orders.iter_mut().find(|o| o.order_id == ticket)
    }

    /// Highest grid level among active orders, or 0 when none.
    pub fn max_active_level(&self) -> i32 {
        self.active_orders()
            .filter(|o| o.grid_level >= 0)
            .map(|o| o.grid_level)
            .max()
            .unwrap_or(0)
    }

    /// Sorted grid levels (>= 0) of active orders.
    pub fn active_grid_levels(&self) -> Vec<i32> {
        let mut levels: Vec<i32> = self
            .active_orders()
            .filter(|o| o.grid_level >= 0)
            .map(|o| o.grid_level)
            .collect();
        levels.sort_unstable();
        levels.dedup();
        levels
    }

    /// Whether any grid order (level >= 1) is live.
    pub fn has_grid_orders(&self) -> bool {
        self.orders
            .iter()
            .any(|o| o.is_open() && o.grid_level >= 1)
    }

    /// An open order already occupies this grid level.
    pub fn level_open(&self, level: i32) -> bool {
        self.orders
            .iter()
            .any(|o| o.is_open() && o.grid_level == level)
    }

    /// The live initial (level-0) order, if any.
    pub fn initial_order(&self) -> Option<&CycleOrder> {
        self.orders.iter().find(|o| o.is_initial && o.is_open())
    }

    // ---- mutation --------------------------------------------------------

    /// Record a new order, suppressing duplicate grid levels.
    pub fn add_order(&mut self, order: CycleOrder) -> bool {
        if order.grid_level >= 0 && self.level_open(order.grid_level) {
            warn!(
                cycle_id = %self.cycle_id,
                level = order.grid_level,
                ticket = order.order_id,
                "duplicate grid level suppressed"
            );
            return false;
        }
        if order.status == OrderStatus::Pending && order.grid_level >= 1 {
            self.pending_order_levels.insert(order.grid_level);
        }
        debug!(
            cycle_id = %self.cycle_id,
            ticket = order.order_id,
            level = order.grid_level,
            kind = %order.order_type(),
            "order recorded"
        );
        self.orders.push(order);
        self.touch();
        true
    }

    pub fn reserve_level(&mut self, level: i32) -> bool {
        self.pending_order_levels.insert(level)
    }

    pub fn release_level(&mut self, level: i32) {
        self.pending_order_levels.remove(&level);
    }

    pub fn touch(&mut self) {
        self.updated = Utc::now();
    }

    /// Re-anchor the zone and append a history entry.
    pub fn move_zone(&mut self, new_upper: f64, new_lower: f64, reason: &str) {
        let movement = ZoneMovement {
            time: Utc::now(),
            mode: self.cycle_config.zone_movement_mode,
            old_upper: self.zone.upper_boundary,
            old_lower: self.zone.lower_boundary,
            new_upper,
            new_lower,
            reason: reason.to_string(),
        };
        self.zone.upper_boundary = new_upper;
        self.zone.lower_boundary = new_lower;
        self.zone.last_movement = Some(movement.time);
        self.zone_movement_history.push(movement);
        if self.zone_movement_history.len() > ZONE_HISTORY_LIMIT {
            let excess = self.zone_movement_history.len() - ZONE_HISTORY_LIMIT;
            self.zone_movement_history.drain(..excess);
        }
        self.touch();
    }

    /// Track zone bounds per current cycle state.
    ///
    /// With no grid orders the bounds follow the live initial order's price.
    /// Once grid orders exist the working zone holds its ground; it only
    /// migrates on trailing-stop triggers. Feeding the trailing stop back
    /// into the zone it is clipped against would ratchet both upward a full
    /// zone width per tick.
    pub fn refresh_zone_bounds(&mut self) {
        if self.has_grid_orders() {
            return;
        }
        let half_width = self.cycle_config.zone_threshold_pips * self.pip;
        if let Some(base) = self.initial_order().map(|o| o.price) {
            self.zone.base_price = base;
            self.zone.upper_boundary = base + half_width;
            self.zone.lower_boundary = base - half_width;
        }
    }

    /// Bounds reported to the store: once grid orders exist and the
    /// trailing stop is set, the band anchors to the stop (BUY rides above
    /// it, SELL below). A zero stop reports the working bounds unchanged.
    pub fn reported_bounds(&self) -> (f64, f64) {
        if self.has_grid_orders() && self.trailing_stop_loss > 0.0 {
            let half_width = self.cycle_config.zone_threshold_pips * self.pip;
            return match self.direction {
                Direction::Buy => (
                    self.trailing_stop_loss + half_width,
                    self.trailing_stop_loss,
                ),
                Direction::Sell => (
                    self.trailing_stop_loss,
                    self.trailing_stop_loss - half_width,
                ),
            };
        }
        (self.zone.upper_boundary, self.zone.lower_boundary)
    }

    // ---- statistics ------------------------------------------------------

    /// Realised profit over closed orders (stored values, never recomputed).
    pub fn realized_profit(&self) -> f64 {
        self.closed_orders().map(|o| o.profit).sum()
    }

    /// Floating profit over active orders as last observed.
    pub fn floating_profit(&self) -> f64 {
        self.active_orders().map(|o| o.profit).sum()
    }

    pub fn total_volume(&self) -> f64 {
        self.orders
            .iter()
            .filter(|o| o.status != OrderStatus::Cancelled)
            .map(|o| o.lot_size)
            .sum()
    }

    pub fn profitable_orders(&self) -> usize {
        self.closed_orders().filter(|o| o.profit > 0.0).count()
    }

    pub fn loss_orders(&self) -> usize {
        self.closed_orders().filter(|o| o.profit < 0.0).count()
    }

    pub fn duration_minutes(&self) -> f64 {
        let end = self.close_time.unwrap_or_else(Utc::now);
        (end - self.created).num_seconds() as f64 / 60.0
    }

    /// Refresh the cached profit totals from order state.
    pub fn refresh_totals(&mut self) {
        let total = self.realized_profit() + self.floating_profit();
        self.total_profit = total;
        self.total_profit_dollars = total;
        self.total_profit_pips = self
            .orders
            .iter()
            .filter(|o| o.status == OrderStatus::Closed || o.status == OrderStatus::Active)
            .map(|o| o.profit_pips)
            .sum();
    }

    /// Finalise closure fields. Broker-side teardown is the caller's job.
    pub fn finalize_close(&mut self, method: &str, user: &str, reason: &str) {
        self.refresh_totals();
        let now = Utc::now();
        self.is_closed = true;
        self.status = CycleStatus::Closed;
        self.close_time = Some(now);
        self.close_reason = Some(reason.to_string());
        self.closing_method = Some(ClosingMethod {
            kind: method.to_string(),
            user: user.to_string(),
            timestamp: now,
            final_profit: self.total_profit,
            total_orders: self.orders.len(),
            duration_minutes: self.duration_minutes(),
        });
        self.touch();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::order::CycleOrder;

    pub(crate) fn test_cycle(direction: Direction, entry: f64) -> Cycle {
        Cycle::new(
            "cycle-1".to_string(),
            "bot-1".to_string(),
            "acct-1".to_string(),
            "EURUSD".to_string(),
            777,
            direction,
            entry,
            0.0001,
            CycleConfig::default(),
        )
    }

    #[test]
    fn zone_spans_threshold_around_entry() {
        let cycle = test_cycle(Direction::Buy, 1.10002);
        let half = cycle.cycle_config.zone_threshold_pips * cycle.pip;
        assert!((cycle.zone.upper_boundary - (1.10002 + half)).abs() < 1e-7);
        assert!((cycle.zone.lower_boundary - (1.10002 - half)).abs() < 1e-7);
        assert!(cycle.zone.upper_boundary > cycle.zone.lower_boundary);
    }

    #[test]
    fn duplicate_level_suppressed() {
        let mut cycle = test_cycle(Direction::Buy, 1.10);
        assert!(cycle.add_order(CycleOrder::grid(1, Direction::Buy, 1.1041, 0.01, 1.13, 1)));
        assert!(!cycle.add_order(CycleOrder::grid(2, Direction::Buy, 1.1041, 0.01, 1.13, 1)));
        assert_eq!(cycle.orders.len(), 1);
    }

    #[test]
    fn rebuild_after_close_is_allowed() {
        let mut cycle = test_cycle(Direction::Buy, 1.10);
        assert!(cycle.add_order(CycleOrder::grid(1, Direction::Buy, 1.1041, 0.01, 1.13, 1)));
        cycle.order_by_ticket_mut(1).unwrap().mark_closed("test");
        cycle.release_level(1);
        // The level is free again once its order is closed.
        assert!(cycle.add_order(CycleOrder::grid(2, Direction::Buy, 1.1041, 0.01, 1.13, 1)));
    }

    #[test]
    fn zone_follows_initial_without_grid() {
        let mut cycle = test_cycle(Direction::Buy, 1.10);
        cycle.add_order(CycleOrder::initial(1, Direction::Buy, 1.12, 0.01, 1.11));
        cycle.refresh_zone_bounds();
        let half = cycle.cycle_config.zone_threshold_pips * cycle.pip;
        assert!((cycle.zone.upper_boundary - (1.12 + half)).abs() < 1e-9);
        assert!((cycle.zone.lower_boundary - (1.12 - half)).abs() < 1e-9);
    }

    #[test]
    fn working_zone_holds_its_ground_with_grid_orders() {
        let mut cycle = test_cycle(Direction::Buy, 1.10);
        cycle.add_order(CycleOrder::initial(1, Direction::Buy, 1.10, 0.01, 1.09));
        let mut grid = CycleOrder::grid(2, Direction::Buy, 1.1340, 0.01, 1.13, 1);
        grid.status = OrderStatus::Active;
        cycle.orders.push(grid);
        let (upper, lower) = (cycle.zone.upper_boundary, cycle.zone.lower_boundary);
        cycle.trailing_stop_loss = 1.1200;
        cycle.refresh_zone_bounds();
        assert_eq!(cycle.zone.upper_boundary, upper);
        assert_eq!(cycle.zone.lower_boundary, lower);
    }

    #[test]
    fn reported_bounds_anchor_to_trailing_stop() {
        let mut cycle = test_cycle(Direction::Buy, 1.10);
        let mut grid = CycleOrder::grid(2, Direction::Buy, 1.1340, 0.01, 1.13, 1);
        grid.status = OrderStatus::Active;
        cycle.orders.push(grid);
        let half = cycle.cycle_config.zone_threshold_pips * cycle.pip;

        // A zero stop reports the working bounds.
        let (upper, lower) = cycle.reported_bounds();
        assert_eq!(upper, cycle.zone.upper_boundary);
        assert_eq!(lower, cycle.zone.lower_boundary);

        cycle.trailing_stop_loss = 1.1200;
        let (upper, lower) = cycle.reported_bounds();
        assert!((lower - 1.1200).abs() < 1e-9);
        assert!((upper - (1.1200 + half)).abs() < 1e-9);
        assert!((upper - lower - half).abs() < 1e-9);
    }

    #[test]
    fn finalize_close_records_metadata() {
        let mut cycle = test_cycle(Direction::Buy, 1.10);
        let mut order = CycleOrder::initial(1, Direction::Buy, 1.10, 0.01, 1.09);
        order.profit = 12.5;
        order.mark_closed("take_profit");
        cycle.orders.push(order);
        cycle.finalize_close("take_profit", "system", "profit target reached");

        assert!(cycle.is_closed);
        assert_eq!(cycle.status, CycleStatus::Closed);
        let closing = cycle.closing_method.as_ref().unwrap();
        assert_eq!(closing.kind, "take_profit");
        assert!((closing.final_profit - 12.5).abs() < 1e-9);
        assert!((cycle.total_profit_dollars - 12.5).abs() < 1e-9);
    }
}
