//! Trailing stop computation, propagation, and the cycle-reset trigger.
//!
//! The trailing stop follows the best active order price at a zone-width
//! distance, is clipped by the movement mode, and only ever advances in the
//! profitable direction. A breach does not close the cycle: all active
//! orders are closed, the zone migrates per its mode, and the trackers reset
//! so the cycle can re-acquire an entry.

use crate::config::ZoneMovementMode;
use crate::cycle::Cycle;
use crate::grid::{clip_to_zone, GridManager};
use anyhow::Result;
use broker_core::types::Direction;
use broker_core::BrokerError;
use tracing::{debug, info, warn};

/// Absolute price tolerance for "did the stop actually move".
const PRICE_TOLERANCE: f64 = 1e-5;

impl GridManager {
    /// Advance the trailing stop from active order extremes and push it to
    /// every live position.
    pub async fn update_trailing_stop(&self, cycle: &mut Cycle) -> Result<()> {
        if cycle.is_closed || cycle.active_count() == 0 {
            return Ok(());
        }

        let half_width = cycle.cycle_config.zone_threshold_pips * cycle.pip;
        let mode = cycle.cycle_config.zone_movement_mode;

        let new_tsl = match cycle.direction {
            Direction::Buy => {
                let best = cycle
                    .active_orders()
                    .map(|o| o.price)
                    .fold(f64::NEG_INFINITY, f64::max);
                cycle.highest_buy_price = cycle.highest_buy_price.max(best);
                let raw = cycle.highest_buy_price - half_width;
                let clipped = clip_to_zone(Direction::Buy, mode, raw, &cycle.zone);
                if cycle.trailing_stop_loss > 0.0 {
                    clipped.max(cycle.trailing_stop_loss)
                } else {
                    clipped
                }
            }
            Direction::Sell => {
                let best = cycle
                    .active_orders()
                    .map(|o| o.price)
                    .fold(f64::INFINITY, f64::min);
                cycle.lowest_sell_price = cycle.lowest_sell_price.min(best);
                let raw = cycle.lowest_sell_price + half_width;
                let clipped = clip_to_zone(Direction::Sell, mode, raw, &cycle.zone);
                if cycle.trailing_stop_loss > 0.0 {
                    clipped.min(cycle.trailing_stop_loss)
                } else {
                    clipped
                }
            }
        };

        if (new_tsl - cycle.trailing_stop_loss).abs() <= PRICE_TOLERANCE {
            return Ok(());
        }

        debug!(
            cycle_id = %cycle.cycle_id,
            old = cycle.trailing_stop_loss,
            new = new_tsl,
            "trailing stop advanced"
        );
        cycle.trailing_stop_loss = new_tsl;
        cycle.touch();

        // Push the new SL to every live position. A missing position just
        // means the broker closed it first; reconciliation will finish the
        // bookkeeping.
        let tickets: Vec<u64> = cycle.active_orders().map(|o| o.order_id).collect();
        for ticket in tickets {
            let tp = cycle.order_by_ticket(ticket).map(|o| o.tp).unwrap_or(0.0);
            match self.broker.modify_sl_tp(ticket, new_tsl, tp).await {
                Ok(()) => {
                    if let Some(order) = cycle.order_by_ticket_mut(ticket) {
                        order.sl = new_tsl;
                    }
                }
                Err(BrokerError::NotFound(_)) => {
                    if let Some(order) = cycle.order_by_ticket_mut(ticket) {
                        order.mark_closed("broker_closed");
                    }
                }
                Err(err) => {
                    warn!(cycle_id = %cycle.cycle_id, ticket, error = %err, "SL modify failed");
                }
            }
        }
        Ok(())
    }

    /// Reset the cycle when price breaches the trailing stop.
    ///
    /// The level-0 initial order is exempt: a cycle whose only active order
    /// is the initial one is left alone. Returns true when the reset fired.
    pub async fn check_trailing_trigger(&self, cycle: &mut Cycle, price: f64) -> Result<bool> {
        let tsl = cycle.trailing_stop_loss;
        if cycle.is_closed || tsl <= 0.0 || cycle.active_count() == 0 {
            return Ok(false);
        }

        let breached = match cycle.direction {
            Direction::Buy => price <= tsl,
            Direction::Sell => price >= tsl,
        };
        if !breached {
            return Ok(false);
        }

        let only_initial = cycle.active_count() == 1
            && cycle.active_orders().next().map(|o| o.is_initial).unwrap_or(false);
        if only_initial {
            return Ok(false);
        }

        info!(
            cycle_id = %cycle.cycle_id,
            price,
            tsl,
            direction = %cycle.direction,
            "trailing stop breached, resetting cycle"
        );
        self.close_all_active(cycle, "trailing_stop").await?;

        let half_width = cycle.cycle_config.zone_threshold_pips * cycle.pip;
        let mode = cycle.cycle_config.zone_movement_mode;
        match cycle.direction {
            Direction::Buy => {
                if matches!(mode, ZoneMovementMode::MoveBothSides | ZoneMovementMode::MoveUpOnly) {
                    let upper = cycle.highest_buy_price;
                    cycle.move_zone(upper, upper - half_width, "trailing stop trigger");
                }
            }
            Direction::Sell => {
                if matches!(mode, ZoneMovementMode::MoveBothSides | ZoneMovementMode::MoveDownOnly) {
                    let lower = cycle.lowest_sell_price;
                    cycle.move_zone(lower + half_width, lower, "trailing stop trigger");
                }
            }
        }

        cycle.trailing_stop_loss = 0.0;
        cycle.highest_buy_price = 0.0;
        cycle.lowest_sell_price = f64::INFINITY;
        cycle.touch();
        Ok(true)
    }
}
