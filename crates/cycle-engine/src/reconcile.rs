//! Broker reconciliation.
//!
//! Each tick the locally tracked orders are verified against broker truth:
//! filled pendings become active, vanished pendings become cancelled, and
//! vanished positions become closed with their last observed profit. The
//! pass is idempotent; running it twice on the same tick changes nothing.

use crate::cycle::Cycle;
use crate::grid::GridManager;
use crate::order::OrderStatus;
use anyhow::Result;
use chrono::Utc;
use tracing::{debug, error, info};

/// Outcome counters for one reconciliation pass.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ReconcileReport {
    pub filled: usize,
    pub cancelled: usize,
    pub closed: usize,
}

impl GridManager {
    /// Reclassify a pending order the broker has filled.
    pub(crate) fn promote_filled_pending(&self, cycle: &mut Cycle, ticket: u64, profit: f64) {
        if let Some(order) = cycle.order_by_ticket_mut(ticket) {
            if order.status != OrderStatus::Pending {
                return;
            }
            order.status = OrderStatus::Active;
            order.triggered_at = Some(Utc::now());
            order.profit = profit;
            let level = order.grid_level;
            cycle.release_level(level);
            cycle.touch();
        }
    }

    /// Verify every tracked order against the broker.
    pub async fn reconcile_orders(&self, cycle: &mut Cycle) -> Result<ReconcileReport> {
        let mut report = ReconcileReport::default();
        let tracked: Vec<(u64, OrderStatus)> = cycle
            .orders
            .iter()
            .filter(|o| o.is_open())
            .map(|o| (o.order_id, o.status))
            .collect();

        for (ticket, status) in tracked {
            match status {
                OrderStatus::Pending => {
                    if self.broker.pending_by_ticket(ticket).await?.is_some() {
                        continue;
                    }
                    match self.broker.position_by_ticket(ticket).await? {
                        Some(position) => {
                            info!(
                                cycle_id = %cycle.cycle_id,
                                ticket,
                                price = position.price_open,
                                "pending filled"
                            );
                            self.promote_filled_pending(cycle, ticket, position.profit);
                            report.filled += 1;
                        }
                        None => {
                            debug!(cycle_id = %cycle.cycle_id, ticket, "pending vanished, marking cancelled");
                            if let Some(order) = cycle.order_by_ticket_mut(ticket) {
                                let level = order.grid_level;
                                order.mark_cancelled("not on broker");
                                cycle.release_level(level);
                            }
                            report.cancelled += 1;
                        }
                    }
                }
                OrderStatus::Active => {
                    let pip = cycle.pip;
                    match self.broker.position_by_ticket(ticket).await? {
                        Some(position) => {
                            // Keep the floating profit current so a later
                            // broker-side closure never loses it.
                            if let Some(order) = cycle.order_by_ticket_mut(ticket) {
                                order.profit = position.profit;
                                order.profit_pips = match order.direction {
                                    broker_core::types::Direction::Buy => {
                                        (position.price_current - order.price) / pip
                                    }
                                    broker_core::types::Direction::Sell => {
                                        (order.price - position.price_current) / pip
                                    }
                                };
                            }
                        }
                        None => {
                            let cycle_id = cycle.cycle_id.clone();
                            if let Some(order) = cycle.order_by_ticket_mut(ticket) {
                                if order.is_initial && order.profit == 0.0 {
                                    error!(
                                        cycle_id = %cycle_id,
                                        ticket,
                                        "initial order closed with no observed profit"
                                    );
                                }
                                info!(
                                    cycle_id = %cycle_id,
                                    ticket,
                                    profit = order.profit,
                                    "position closed by broker"
                                );
                                order.mark_closed("broker_closed");
                            }
                            report.closed += 1;
                        }
                    }
                }
                _ => {}
            }
        }

        if report != ReconcileReport::default() {
            cycle.refresh_totals();
        }
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CycleConfig;
    use crate::placer::{PlacerSettings, ResilientPlacer};
    use broker_core::types::Direction;
    use broker_core::{Broker, PaperBroker};
    use std::sync::Arc;
    use std::time::Duration;

    async fn setup() -> (Arc<PaperBroker>, GridManager, Cycle) {
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
        let manager = GridManager::new(Arc::clone(&broker) as Arc<dyn Broker>, placer);
        let mut cycle = Cycle::new(
            "cycle-1".to_string(),
            "bot-1".to_string(),
            "acct-1".to_string(),
            "EURUSD".to_string(),
            777,
            Direction::Buy,
            1.10002,
            0.0001,
            CycleConfig::default(),
        );
        manager.maintain_pending_orders(&mut cycle).await.unwrap();
        (broker, manager, cycle)
    }

    #[tokio::test]
    async fn fill_promotes_pending_to_active() {
        let (broker, manager, mut cycle) = setup().await;
        // Quote crosses the level-1 trigger (1.13102).
        broker.set_quote(1.13102, 1.13104);
        let report = manager.reconcile_orders(&mut cycle).await.unwrap();
        assert_eq!(report.filled, 1);
        assert_eq!(cycle.active_count(), 1);
        assert!(!cycle.pending_order_levels.contains(&1));
        assert!(cycle.order_by_ticket(cycle.active_orders().next().unwrap().order_id).is_some());
    }

    #[tokio::test]
    async fn reconcile_is_idempotent() {
        let (broker, manager, mut cycle) = setup().await;
        broker.set_quote(1.13102, 1.13104);
        manager.reconcile_orders(&mut cycle).await.unwrap();
        let snapshot: Vec<_> = cycle.orders.iter().map(|o| (o.order_id, o.status)).collect();
        let report = manager.reconcile_orders(&mut cycle).await.unwrap();
        assert_eq!(report, ReconcileReport::default());
        let after: Vec<_> = cycle.orders.iter().map(|o| (o.order_id, o.status)).collect();
        assert_eq!(snapshot, after);
    }

    #[tokio::test]
    async fn vanished_pending_becomes_cancelled() {
        let (broker, manager, mut cycle) = setup().await;
        let ticket = cycle.pending_orders().next().unwrap().order_id;
        // Cancelled on the broker side without our involvement.
        broker.cancel_pending(ticket, "EURUSD").await.unwrap();
        let report = manager.reconcile_orders(&mut cycle).await.unwrap();
        assert_eq!(report.cancelled, 1);
        assert_eq!(
            cycle.order_by_ticket(ticket).unwrap().status,
            OrderStatus::Cancelled
        );
    }

    #[tokio::test]
    async fn broker_closed_position_keeps_last_profit() {
        let (broker, manager, mut cycle) = setup().await;
        broker.set_quote(1.13102, 1.13104);
        manager.reconcile_orders(&mut cycle).await.unwrap();
        let ticket = cycle.active_orders().next().unwrap().order_id;
        broker.set_position_profit(ticket, -7.5);
        manager.reconcile_orders(&mut cycle).await.unwrap();

        broker.force_close(ticket, 1.12000);
        // The paper broker recomputes profit at close; reconcile takes the
        // broker's last word when still queryable, else keeps what we saw.
        let report = manager.reconcile_orders(&mut cycle).await.unwrap();
        assert_eq!(report.closed, 1);
        let order = cycle.order_by_ticket(ticket).unwrap();
        assert_eq!(order.status, OrderStatus::Closed);
        assert!(order.profit != 0.0);
    }
}
