//! Take-profit evaluation and full-cycle closure.

use crate::cycle::Cycle;
use crate::grid::GridManager;
use anyhow::Result;
use tracing::{debug, info};

/// Sums cycle profit and closes the cycle once the configured threshold is
/// reached.
///
/// The threshold field is `cycle_take_profit_pips`, but the comparison is in
/// account currency: summed broker profit in dollars against the raw config
/// value. That interpretation is part of the external contract.
#[derive(Clone)]
pub struct TakeProfitEngine {
    grid: GridManager,
}

impl TakeProfitEngine {
    pub fn new(grid: GridManager) -> Self {
        Self { grid }
    }

    /// Total cycle profit: stored realised values plus live floating profit
    /// queried from the broker.
    ///
    /// Realised order profit is never recomputed; only floating values are
    /// refreshed here.
    pub async fn total_profit(&self, cycle: &mut Cycle) -> Result<f64> {
        let tickets: Vec<u64> = cycle.active_orders().map(|o| o.order_id).collect();
        for ticket in tickets {
            if let Some(position) = self.grid.broker.position_by_ticket(ticket).await? {
                if let Some(order) = cycle.order_by_ticket_mut(ticket) {
                    order.profit = position.profit;
                }
            }
        }
        cycle.refresh_totals();
        Ok(cycle.total_profit_dollars)
    }

    /// Close the cycle when total profit reaches the threshold.
    ///
    /// Returns true when the cycle was closed; the caller removes it from
    /// the coordinator and forces the snapshot write.
    pub async fn evaluate(&self, cycle: &mut Cycle) -> Result<bool> {
        if cycle.is_closed {
            return Ok(false);
        }
        let total = self.total_profit(cycle).await?;
        let threshold = cycle.cycle_config.cycle_take_profit_pips;
        if total < threshold {
            debug!(
                cycle_id = %cycle.cycle_id,
                total,
                threshold,
                "take-profit threshold not reached"
            );
            return Ok(false);
        }

        info!(
            cycle_id = %cycle.cycle_id,
            total,
            threshold,
            "take-profit threshold reached, closing cycle"
        );
        self.close_cycle(cycle, "take_profit", "system", "profit target reached")
            .await?;
        Ok(true)
    }

    /// Tear the cycle down on the broker and finalise closure fields.
    pub async fn close_cycle(
        &self,
        cycle: &mut Cycle,
        method: &str,
        user: &str,
        reason: &str,
    ) -> Result<()> {
        self.grid.cancel_all_pending(cycle, reason).await?;
        self.grid.close_all_active(cycle, reason).await?;
        cycle.finalize_close(method, user, reason);
        info!(
            cycle_id = %cycle.cycle_id,
            method,
            profit = cycle.total_profit,
            "cycle closed"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CycleConfig;
    use crate::cycle::CycleStatus;
    use crate::order::{CycleOrder, OrderStatus};
    use crate::placer::{PlacerSettings, ResilientPlacer};
    use broker_core::types::Direction;
    use broker_core::{Broker, PaperBroker};
    use std::sync::Arc;
    use std::time::Duration;

    async fn setup() -> (Arc<PaperBroker>, TakeProfitEngine, Cycle) {
        let broker = Arc::new(PaperBroker::new("EURUSD", 0.00001));
        broker.set_quote(1.10000, 1.10002);
        let placer = ResilientPlacer::new(
            Arc::clone(&broker) as Arc<dyn Broker>,
            PlacerSettings {
                backoff: vec![Duration::from_millis(1)],
                drain_interval: Duration::from_millis(10),
                ..Default::default()
            },
        );
        let grid = GridManager::new(Arc::clone(&broker) as Arc<dyn Broker>, placer);
        let engine = TakeProfitEngine::new(grid.clone());
        let mut cycle = Cycle::new(
            "cycle-1".to_string(),
            "bot-1".to_string(),
            "acct-1".to_string(),
            "EURUSD".to_string(),
            777,
            Direction::Buy,
            1.10002,
            0.0001,
            CycleConfig {
                cycle_take_profit_pips: 100.0,
                ..Default::default()
            },
        );
        // Two live orders and the full pending ladder.
        for level in [0i32, 1] {
            let ticket = broker
                .place_market("EURUSD", Direction::Buy, 0.01, 0.0, 0.0, "test")
                .await
                .unwrap()
                .ticket;
            let mut order = if level == 0 {
                CycleOrder::initial(ticket, Direction::Buy, 1.10002, 0.01, 0.0)
            } else {
                CycleOrder::grid(ticket, Direction::Buy, 1.10002, 0.01, 0.0, level)
            };
            order.status = OrderStatus::Active;
            cycle.orders.push(order);
        }
        grid.maintain_pending_orders(&mut cycle).await.unwrap();
        (broker, engine, cycle)
    }

    #[tokio::test]
    async fn below_threshold_keeps_cycle_open() {
        let (broker, engine, mut cycle) = setup().await;
        for order in cycle.orders.clone() {
            if order.status == OrderStatus::Active {
                broker.set_position_profit(order.order_id, 20.0);
            }
        }
        let closed = engine.evaluate(&mut cycle).await.unwrap();
        assert!(!closed);
        assert!(!cycle.is_closed);
        assert!((cycle.total_profit_dollars - 40.0).abs() < 1e-9);
    }

    #[tokio::test]
    async fn threshold_in_dollars_closes_everything() {
        let (broker, engine, mut cycle) = setup().await;
        let actives: Vec<u64> = cycle.active_orders().map(|o| o.order_id).collect();
        broker.set_position_profit(actives[0], 60.0);
        broker.set_position_profit(actives[1], 40.01);

        let closed = engine.evaluate(&mut cycle).await.unwrap();
        assert!(closed);
        assert!(cycle.is_closed);
        assert_eq!(cycle.status, CycleStatus::Closed);
        assert_eq!(cycle.closing_method.as_ref().unwrap().kind, "take_profit");
        assert_eq!(cycle.active_count(), 0);
        assert_eq!(cycle.pending_count(), 0);
        assert_eq!(broker.position_count(), 0);
        assert_eq!(broker.pending_count(), 0);
    }

    #[tokio::test]
    async fn realized_profit_counts_toward_threshold() {
        let (broker, engine, mut cycle) = setup().await;
        // One order already closed with banked profit.
        let ticket = cycle.active_orders().next().unwrap().order_id;
        if let Some(order) = cycle.order_by_ticket_mut(ticket) {
            order.profit = 90.0;
            order.mark_closed("manual");
        }
        broker.force_close(ticket, 1.10002);
        let remaining = cycle.active_orders().next().unwrap().order_id;
        broker.set_position_profit(remaining, 15.0);

        let closed = engine.evaluate(&mut cycle).await.unwrap();
        assert!(closed);
        // Realised value was preserved, not recomputed.
        assert!((cycle.order_by_ticket(ticket).unwrap().profit - 90.0).abs() < 1e-9);
    }
}
