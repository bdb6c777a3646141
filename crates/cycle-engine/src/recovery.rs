//! Drawdown recovery sub-mode.
//!
//! When the cycle's adverse excursion against the initial order exceeds the
//! configured threshold, additional same-direction market orders are placed
//! at a fixed spacing as price keeps moving away. The mode deactivates as
//! soon as the excursion falls back under the threshold.

use crate::cycle::Cycle;
use crate::grid::{submit_stop_loss, GridManager};
use crate::order::{CycleOrder, OrderKind};
use crate::placer::{PlaceKind, PlaceOutcome, PlaceRequest};
use anyhow::Result;
use broker_core::types::Direction;
use tracing::{debug, info, warn};

impl GridManager {
    /// Evaluate recovery activation/deactivation and place spaced recovery
    /// orders while active.
    pub async fn update_recovery(&self, cycle: &mut Cycle, price: f64) -> Result<()> {
        if !cycle.cycle_config.recovery_enabled || cycle.is_closed {
            return Ok(());
        }
        let reference = cycle.initial_order_open_price;
        if reference <= 0.0 || cycle.active_count() == 0 {
            return Ok(());
        }

        let loss_distance = match cycle.direction {
            Direction::Buy => reference - price,
            Direction::Sell => price - reference,
        };
        let threshold = cycle.cycle_config.recovery_stop_loss_pips * cycle.pip;

        if !cycle.in_recovery_mode {
            if loss_distance >= threshold {
                cycle.in_recovery_mode = true;
                cycle.recovery_activated = true;
                cycle.recovery_direction = Some(cycle.direction);
                cycle.recovery_zone_base_price = price;
                cycle.touch();
                info!(
                    cycle_id = %cycle.cycle_id,
                    loss_pips = loss_distance / cycle.pip,
                    "recovery mode activated"
                );
            }
            return Ok(());
        }

        if loss_distance < threshold {
            cycle.in_recovery_mode = false;
            cycle.touch();
            info!(cycle_id = %cycle.cycle_id, "recovery mode deactivated");
            return Ok(());
        }

        if cycle.orders.len() >= cycle.cycle_config.max_trades_per_cycle {
            debug!(cycle_id = %cycle.cycle_id, "max trades reached, no recovery order");
            return Ok(());
        }

        // Space new recovery orders away from the last one (or the
        // activation price when none has been placed yet).
        let last = cycle
            .orders
            .iter()
            .rev()
            .find(|o| o.kind == OrderKind::Recovery)
            .map(|o| o.price)
            .unwrap_or(cycle.recovery_zone_base_price);
        let spacing = cycle.cycle_config.recovery_interval_pips * cycle.pip;
        let moved = match cycle.direction {
            Direction::Buy => last - price,
            Direction::Sell => price - last,
        };
        if moved < spacing {
            return Ok(());
        }

        let direction = cycle.recovery_direction.unwrap_or(cycle.direction);
        let sl = submit_stop_loss(cycle, direction, price);
        let request = PlaceRequest::new(
            Some(cycle.cycle_id.clone()),
            &cycle.symbol,
            direction,
            PlaceKind::Market,
            cycle.cycle_config.lot_size,
            price,
            sl,
            0.0,
            &format!("{}_recovery", cycle.cycle_id),
        );
        match self.placer.place(request).await {
            PlaceOutcome::Placed(ticket) => {
                let order = CycleOrder::recovery(
                    ticket.ticket,
                    direction,
                    ticket.price_open,
                    cycle.cycle_config.lot_size,
                    sl,
                );
                cycle.add_order(order);
                info!(
                    cycle_id = %cycle.cycle_id,
                    ticket = ticket.ticket,
                    price = ticket.price_open,
                    "recovery order placed"
                );
            }
            PlaceOutcome::Queued => {
                debug!(cycle_id = %cycle.cycle_id, "recovery order queued");
            }
            PlaceOutcome::Failed(reason) => {
                warn!(cycle_id = %cycle.cycle_id, %reason, "recovery order failed");
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CycleConfig;
    use crate::order::{OrderStatus, RECOVERY_LEVEL};
    use crate::placer::{PlacerSettings, ResilientPlacer};
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
        let config = CycleConfig {
            recovery_enabled: true,
            recovery_stop_loss_pips: 200.0,
            recovery_interval_pips: 50.0,
            ..Default::default()
        };
        let mut cycle = Cycle::new(
            "cycle-1".to_string(),
            "bot-1".to_string(),
            "acct-1".to_string(),
            "EURUSD".to_string(),
            777,
            Direction::Buy,
            1.10002,
            0.0001,
            config,
        );
        // Live initial order at the entry.
        let ticket = broker
            .place_market("EURUSD", Direction::Buy, 0.01, 0.0, 0.0, "test")
            .await
            .unwrap();
        let mut order = CycleOrder::initial(ticket.ticket, Direction::Buy, 1.10002, 0.01, 0.0);
        order.status = OrderStatus::Active;
        cycle.orders.push(order);
        cycle.initial_order_open_price = 1.10002;
        (broker, manager, cycle)
    }

    #[tokio::test]
    async fn activates_past_threshold_and_deactivates_on_recovery() {
        let (broker, manager, mut cycle) = setup().await;

        // 210 pips under water.
        let down = 1.10002 - 0.0210;
        broker.set_quote(down, down + 0.00002);
        manager.update_recovery(&mut cycle, down).await.unwrap();
        assert!(cycle.in_recovery_mode);
        assert!(cycle.recovery_activated);
        assert_eq!(cycle.recovery_direction, Some(Direction::Buy));

        // Back to 150 pips: deactivated, flag history kept.
        let up = 1.10002 - 0.0150;
        manager.update_recovery(&mut cycle, up).await.unwrap();
        assert!(!cycle.in_recovery_mode);
        assert!(cycle.recovery_activated);
    }

    #[tokio::test]
    async fn places_spaced_recovery_orders() {
        let (broker, manager, mut cycle) = setup().await;

        let down = 1.10002 - 0.0210;
        broker.set_quote(down, down + 0.00002);
        manager.update_recovery(&mut cycle, down).await.unwrap();
        assert!(cycle.in_recovery_mode);
        let count_after_activation = cycle.orders.len();

        // Not yet a full interval below the activation price: no order.
        let nudge = down - 0.0010;
        broker.set_quote(nudge, nudge + 0.00002);
        manager.update_recovery(&mut cycle, nudge).await.unwrap();
        assert_eq!(cycle.orders.len(), count_after_activation);

        // A full 50-pip interval below: one recovery order.
        let deeper = down - 0.0050;
        broker.set_quote(deeper, deeper + 0.00002);
        manager.update_recovery(&mut cycle, deeper).await.unwrap();
        let recovery: Vec<_> = cycle
            .orders
            .iter()
            .filter(|o| o.kind == OrderKind::Recovery)
            .collect();
        assert_eq!(recovery.len(), 1);
        assert_eq!(recovery[0].grid_level, RECOVERY_LEVEL);
        assert_eq!(recovery[0].direction, Direction::Buy);
        assert_eq!(recovery[0].order_type(), "recovery");

        // Same price again: spacing not met against the last recovery order.
        manager.update_recovery(&mut cycle, deeper).await.unwrap();
        assert_eq!(
            cycle
                .orders
                .iter()
                .filter(|o| o.kind == OrderKind::Recovery)
                .count(),
            1
        );
    }
}
