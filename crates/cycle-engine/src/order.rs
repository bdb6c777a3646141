//! Orders owned by a cycle.

use broker_core::types::Direction;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Grid level carried by recovery orders, meaning "not a grid order".
pub const RECOVERY_LEVEL: i32 = -2;

/// Local lifecycle of a broker order.
///
/// Transitions: `Pending → Active` on broker fill, `Pending → Cancelled` on
/// our cancel, `Active → Closed` on broker closure or ours. A pending that
/// fills and is immediately stopped out may be observed as `Pending → Closed`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OrderStatus {
    Pending,
    Active,
    Closed,
    Cancelled,
}

/// What role the order plays inside its cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OrderKind {
    /// Level-0 entry order.
    Initial,
    /// Grid stop at level >= 1.
    Grid,
    /// Drawdown-recovery order (level sentinel -2).
    Recovery,
}

/// A single broker order tracked by a cycle.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CycleOrder {
    /// Broker ticket.
    pub order_id: u64,
    pub direction: Direction,
    /// Requested/open price.
    pub price: f64,
    pub lot_size: f64,
    pub status: OrderStatus,
    /// 0 = initial, k >= 1 = grid level, [`RECOVERY_LEVEL`] = recovery.
    pub grid_level: i32,
    pub is_initial: bool,
    pub is_grid: bool,
    pub kind: OrderKind,
    pub sl: f64,
    pub tp: f64,
    pub open_time: DateTime<Utc>,
    /// When a pending stop was observed filled.
    pub triggered_at: Option<DateTime<Utc>>,
    /// Profit in account currency; floating while active, final once closed.
    pub profit: f64,
    pub profit_pips: f64,
    pub closed_at: Option<DateTime<Utc>>,
    pub close_reason: Option<String>,
}

impl CycleOrder {
    /// Level-0 market entry.
    pub fn initial(order_id: u64, direction: Direction, price: f64, lot_size: f64, sl: f64) -> Self {
        Self::build(order_id, direction, price, lot_size, sl, 0, OrderKind::Initial, OrderStatus::Active)
    }

    /// Pending grid stop at `level >= 1`.
    pub fn grid(
        order_id: u64,
        direction: Direction,
        price: f64,
        lot_size: f64,
        sl: f64,
        level: i32,
    ) -> Self {
        debug_assert!(level >= 1, "grid orders start at level 1");
        Self::build(order_id, direction, price, lot_size, sl, level, OrderKind::Grid, OrderStatus::Pending)
    }

    /// Market order placed by recovery mode.
    pub fn recovery(order_id: u64, direction: Direction, price: f64, lot_size: f64, sl: f64) -> Self {
        Self::build(
            order_id,
            direction,
            price,
            lot_size,
            sl,
            RECOVERY_LEVEL,
            OrderKind::Recovery,
            OrderStatus::Active,
        )
    }

    #[allow(clippy::too_many_arguments)]
    fn build(
        order_id: u64,
        direction: Direction,
        price: f64,
        lot_size: f64,
        sl: f64,
        grid_level: i32,
        kind: OrderKind,
        status: OrderStatus,
    ) -> Self {
        Self {
            order_id,
            direction,
            price,
            lot_size,
            status,
            grid_level,
            is_initial: kind == OrderKind::Initial,
            is_grid: kind == OrderKind::Grid,
            kind,
            sl,
            tp: 0.0,
            open_time: Utc::now(),
            triggered_at: None,
            profit: 0.0,
            profit_pips: 0.0,
            closed_at: None,
            close_reason: None,
        }
    }

    /// External order-type label: `grid_0`, `grid_level_3`, `recovery`.
    pub fn order_type(&self) -> String {
        match self.kind {
            OrderKind::Initial => "grid_0".to_string(),
            OrderKind::Grid => format!("grid_level_{}", self.grid_level),
            OrderKind::Recovery => "recovery".to_string(),
        }
    }

    pub fn is_open(&self) -> bool {
        matches!(self.status, OrderStatus::Pending | OrderStatus::Active)
    }

    /// Finalise the order as closed, keeping the last observed profit.
    pub fn mark_closed(&mut self, reason: &str) {
        self.status = OrderStatus::Closed;
        self.closed_at = Some(Utc::now());
        self.close_reason = Some(reason.to_string());
    }

    pub fn mark_cancelled(&mut self, reason: &str) {
        self.status = OrderStatus::Cancelled;
        self.closed_at = Some(Utc::now());
        self.close_reason = Some(reason.to_string());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn initial_is_level_zero() {
        let order = CycleOrder::initial(1, Direction::Buy, 1.1, 0.01, 1.09);
        assert_eq!(order.grid_level, 0);
        assert!(order.is_initial);
        assert!(!order.is_grid);
        assert_eq!(order.order_type(), "grid_0");
    }

    #[test]
    fn grid_labels_carry_level() {
        let order = CycleOrder::grid(2, Direction::Sell, 1.2, 0.01, 1.21, 4);
        assert_eq!(order.order_type(), "grid_level_4");
        assert_eq!(order.status, OrderStatus::Pending);
    }

    #[test]
    fn recovery_uses_sentinel_level() {
        let order = CycleOrder::recovery(3, Direction::Buy, 1.1, 0.01, 1.08);
        assert_eq!(order.grid_level, RECOVERY_LEVEL);
        assert_eq!(order.order_type(), "recovery");
    }

    #[test]
    fn closing_keeps_profit() {
        let mut order = CycleOrder::initial(1, Direction::Buy, 1.1, 0.01, 1.09);
        order.profit = -4.2;
        order.mark_closed("stopped_out");
        assert_eq!(order.status, OrderStatus::Closed);
        assert_eq!(order.profit, -4.2);
        assert_eq!(order.close_reason.as_deref(), Some("stopped_out"));
    }
}
