//! Grid maintenance: level pricing, the K-ahead pending ladder, and initial
//! order acquisition.
//!
//! [`GridManager`] carries the per-cycle logic; further capability blocks
//! (broker reconciliation, trailing stop, recovery) live in their own
//! modules as additional `impl` blocks.

use crate::config::ZoneMovementMode;
use crate::cycle::Cycle;
use crate::order::CycleOrder;
use crate::placer::{PlaceKind, PlaceOutcome, PlaceRequest, ResilientPlacer};
use crate::zone::{direction_hint, ZoneData};
use anyhow::Result;
use broker_core::types::Direction;
use broker_core::{Broker, BrokerError};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Pending stop orders kept ahead of the active frontier.
pub const GRID_PENDING_TARGET: usize = 5;

/// Attempts per individual pending placement before giving the level up.
const PLACEMENT_RETRIES: u32 = 3;

/// Broker-side safety margin between an order and its SL, in pips.
const MIN_SL_DISTANCE_PIPS: f64 = 1.0;

/// Price of the level-0 entry: offset from the zone boundary away from the
/// zone by `entry_interval_pips`.
pub fn grid_start_price(cycle: &Cycle) -> f64 {
    let offset = cycle.cycle_config.entry_interval_pips * cycle.pip;
    match cycle.direction {
        Direction::Buy => cycle.zone.upper_boundary + offset,
        Direction::Sell => cycle.zone.lower_boundary - offset,
    }
}

/// Target price for a grid level.
///
/// Level 0 is the start price itself; level k >= 1 steps away from it by
/// `(k - 1) * grid_interval_pips`.
pub fn level_price(cycle: &Cycle, level: i32) -> f64 {
    let start = grid_start_price(cycle);
    if level <= 0 {
        return start;
    }
    let step = cycle.cycle_config.grid_interval_pips * cycle.pip;
    match cycle.direction {
        Direction::Buy => start + (level - 1) as f64 * step,
        Direction::Sell => start - (level - 1) as f64 * step,
    }
}

/// Clip a stop-loss against the zone boundary per the movement mode.
///
/// For BUY the zone's upper edge is the floor: frozen modes pin the SL to
/// it, free modes never let the SL fall below it. SELL is symmetric around
/// the lower edge.
pub fn clip_to_zone(direction: Direction, mode: ZoneMovementMode, value: f64, zone: &ZoneData) -> f64 {
    match direction {
        Direction::Buy => match mode {
            ZoneMovementMode::NoMove | ZoneMovementMode::MoveDownOnly => zone.upper_boundary,
            _ => value.max(zone.upper_boundary),
        },
        Direction::Sell => match mode {
            ZoneMovementMode::NoMove | ZoneMovementMode::MoveUpOnly => zone.lower_boundary,
            _ => value.min(zone.lower_boundary),
        },
    }
}

/// Stop-loss used at submission time for an order at `target_price`.
///
/// The cycle's trailing stop wins when set; otherwise the initial SL
/// distance applies, clipped to the zone and kept at least one pip away
/// from the order price.
pub fn submit_stop_loss(cycle: &Cycle, direction: Direction, target_price: f64) -> f64 {
    let pip = cycle.pip;
    let sl = if cycle.trailing_stop_loss > 0.0 {
        cycle.trailing_stop_loss
    } else {
        let distance = cycle.cycle_config.initial_stop_loss_pips * pip;
        let raw = match direction {
            Direction::Buy => target_price - distance,
            Direction::Sell => target_price + distance,
        };
        clip_to_zone(direction, cycle.cycle_config.zone_movement_mode, raw, &cycle.zone)
    };

    let min_distance = MIN_SL_DISTANCE_PIPS * pip;
    match direction {
        Direction::Buy if sl > target_price - min_distance => target_price - min_distance,
        Direction::Sell if sl < target_price + min_distance => target_price + min_distance,
        _ => sl,
    }
}

/// Active grid levels must form a contiguous run; a hole means local state
/// and broker truth have diverged and the pending ladder is out of phase.
pub fn grid_gap_detected(cycle: &Cycle) -> bool {
    let levels = cycle.active_grid_levels();
    levels
        .windows(2)
        .any(|pair| pair[1] - pair[0] > 1)
}

/// Per-cycle grid logic over the broker port and the resilient placer.
#[derive(Clone)]
pub struct GridManager {
    pub(crate) broker: Arc<dyn Broker>,
    pub(crate) placer: Arc<ResilientPlacer>,
}

impl GridManager {
    pub fn new(broker: Arc<dyn Broker>, placer: Arc<ResilientPlacer>) -> Self {
        Self { broker, placer }
    }

    /// Keep exactly [`GRID_PENDING_TARGET`] pending stops ahead of the
    /// active frontier, self-healing phase errors first.
    ///
    /// Returns the number of pendings placed.
    pub async fn maintain_pending_orders(&self, cycle: &mut Cycle) -> Result<usize> {
        if cycle.is_closed {
            return Ok(0);
        }

        // Out-of-phase ladders are rebuilt from scratch.
        if grid_gap_detected(cycle) {
            warn!(cycle_id = %cycle.cycle_id, "grid level gap detected, rebuilding pendings");
            self.cancel_all_pending(cycle, "grid gap").await?;
        }

        // Pendings fighting the committed direction are stale.
        let wrong_direction: Vec<u64> = cycle
            .pending_orders()
            .filter(|o| o.direction != cycle.direction)
            .map(|o| o.order_id)
            .collect();
        for ticket in wrong_direction {
            self.cancel_pending_order(cycle, ticket, "direction change").await?;
        }

        // With no actives the ladder must be a prefix [1..=n].
        if cycle.active_count() == 0 && !self.pending_levels_are_prefix(cycle) {
            warn!(
                cycle_id = %cycle.cycle_id,
                levels = ?cycle.pending_order_levels,
                "pending levels are not a prefix, rebuilding"
            );
            self.cancel_all_pending(cycle, "ladder rebuild").await?;
        }

        if cycle.orders.len() >= cycle.cycle_config.max_trades_per_cycle {
            debug!(cycle_id = %cycle.cycle_id, "max trades per cycle reached");
            return Ok(0);
        }
        if cycle.open_count() >= cycle.cycle_config.max_active_trades_per_cycle + GRID_PENDING_TARGET {
            return Ok(0);
        }

        let needed = GRID_PENDING_TARGET.saturating_sub(cycle.pending_count());
        if needed == 0 {
            return Ok(0);
        }

        let start = cycle.max_active_level().max(0) + 1;
        let mut placed = 0;
        let mut level = start.max(1);
        while placed < needed {
            if !cycle.level_open(level) && !cycle.pending_order_levels.contains(&level) {
                if self.place_grid_pending(cycle, level).await? {
                    placed += 1;
                }
            }
            level += 1;
            // Levels can be skipped on persistent rejection; never spin past
            // the window we are trying to fill.
            if level > start + (needed as i32) + GRID_PENDING_TARGET as i32 {
                break;
            }
        }
        Ok(placed)
    }

    fn pending_levels_are_prefix(&self, cycle: &Cycle) -> bool {
        cycle
            .pending_order_levels
            .iter()
            .enumerate()
            .all(|(i, level)| *level == i as i32 + 1)
    }

    /// Place one pending stop, reserving the level up front and re-quoting
    /// from a fresh bid/ask when the broker rejects the price.
    async fn place_grid_pending(&self, cycle: &mut Cycle, level: i32) -> Result<bool> {
        let mut target = level_price(cycle, level);
        cycle.reserve_level(level);

        for attempt in 0..PLACEMENT_RETRIES {
            let sl = submit_stop_loss(cycle, cycle.direction, target);
            let comment = format!("{}_L{}", cycle.cycle_id, level);
            let result = self
                .broker
                .place_pending(
                    &cycle.symbol,
                    cycle.direction,
                    target,
                    cycle.cycle_config.lot_size,
                    sl,
                    0.0,
                    &comment,
                )
                .await;

            match result {
                Ok(ticket) => {
                    let order = CycleOrder::grid(
                        ticket.ticket,
                        cycle.direction,
                        target,
                        cycle.cycle_config.lot_size,
                        sl,
                        level,
                    );
                    cycle.add_order(order);
                    debug!(
                        cycle_id = %cycle.cycle_id,
                        level,
                        price = target,
                        ticket = ticket.ticket,
                        "pending grid order placed"
                    );
                    return Ok(true);
                }
                Err(BrokerError::InvalidPrice(_)) | Err(BrokerError::Rejected(_)) => {
                    // Target too close to market: re-quote at the minimum
                    // stop distance from a fresh quote.
                    let offset = cycle.cycle_config.entry_interval_pips * cycle.pip;
                    target = match cycle.direction {
                        Direction::Buy => {
                            let ask = self.broker.ask(&cycle.symbol).await?;
                            target.max(ask + offset)
                        }
                        Direction::Sell => {
                            let bid = self.broker.bid(&cycle.symbol).await?;
                            target.min(bid - offset)
                        }
                    };
                    debug!(
                        cycle_id = %cycle.cycle_id,
                        level,
                        attempt = attempt + 1,
                        requote = target,
                        "pending placement rejected, re-quoting"
                    );
                }
                Err(err) => {
                    warn!(
                        cycle_id = %cycle.cycle_id,
                        level,
                        attempt = attempt + 1,
                        error = %err,
                        "pending placement failed"
                    );
                }
            }
        }

        cycle.release_level(level);
        Ok(false)
    }

    /// Cancel a single pending, reclassifying to active when the cancel
    /// raced a fill.
    pub async fn cancel_pending_order(&self, cycle: &mut Cycle, ticket: u64, reason: &str) -> Result<()> {
        match self.broker.cancel_pending(ticket, &cycle.symbol).await {
            Ok(()) => {
                if let Some(order) = cycle.order_by_ticket_mut(ticket) {
                    let level = order.grid_level;
                    order.mark_cancelled(reason);
                    cycle.release_level(level);
                }
            }
            Err(BrokerError::NotFound(_)) => {
                if let Some(order) = cycle.order_by_ticket_mut(ticket) {
                    let level = order.grid_level;
                    order.mark_cancelled("already gone");
                    cycle.release_level(level);
                }
            }
            Err(err) => {
                // The pending may have become a live position in the meantime.
                if let Some(position) = self.broker.position_by_ticket(ticket).await? {
                    info!(
                        cycle_id = %cycle.cycle_id,
                        ticket,
                        "cancel raced a fill, reclassifying as active"
                    );
                    self.promote_filled_pending(cycle, ticket, position.profit);
                } else {
                    warn!(cycle_id = %cycle.cycle_id, ticket, error = %err, "cancel failed");
                }
            }
        }
        Ok(())
    }

    /// Cancel every pending order of the cycle.
    pub async fn cancel_all_pending(&self, cycle: &mut Cycle, reason: &str) -> Result<()> {
        let tickets: Vec<u64> = cycle.pending_orders().map(|o| o.order_id).collect();
        for ticket in tickets {
            self.cancel_pending_order(cycle, ticket, reason).await?;
        }
        Ok(())
    }

    /// When no order is open and price has left the zone, commit the hinted
    /// direction and re-enter with a market order.
    ///
    /// Returns true when a new initial order was recorded, which callers use
    /// to force an immediate snapshot write.
    pub async fn acquire_initial_order(&self, cycle: &mut Cycle, price: f64) -> Result<bool> {
        if cycle.is_closed || cycle.active_count() > 0 {
            return Ok(false);
        }

        let offset = cycle.cycle_config.entry_interval_pips * cycle.pip;
        let hint = direction_hint(
            &cycle.zone,
            cycle.cycle_config.zone_movement_mode,
            price,
            offset,
        );
        let Some(direction) = hint else {
            return Ok(false);
        };

        if direction != cycle.direction {
            info!(
                cycle_id = %cycle.cycle_id,
                old = %cycle.direction,
                new = %direction,
                "direction re-selected"
            );
            cycle.direction = direction;
        }

        // Opposite-direction pendings fight the new commitment.
        let opposite: Vec<u64> = cycle
            .pending_orders()
            .filter(|o| o.direction != direction)
            .map(|o| o.order_id)
            .collect();
        for ticket in opposite {
            self.cancel_pending_order(cycle, ticket, "direction change").await?;
        }

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
            &format!("{}_L0", cycle.cycle_id),
        );

        match self.placer.place(request).await {
            PlaceOutcome::Placed(ticket) => {
                let order = CycleOrder::initial(
                    ticket.ticket,
                    direction,
                    ticket.price_open,
                    cycle.cycle_config.lot_size,
                    sl,
                );
                cycle.initial_order_open_price = ticket.price_open;
                cycle.initial_stop_loss_price = sl;
                cycle.add_order(order);
                cycle.refresh_zone_bounds();
                info!(
                    cycle_id = %cycle.cycle_id,
                    ticket = ticket.ticket,
                    price = ticket.price_open,
                    direction = %direction,
                    "initial order acquired"
                );
                Ok(true)
            }
            PlaceOutcome::Queued => {
                debug!(cycle_id = %cycle.cycle_id, "initial order queued for background placement");
                Ok(false)
            }
            PlaceOutcome::Failed(reason) => {
                warn!(cycle_id = %cycle.cycle_id, %reason, "initial order placement failed");
                Ok(false)
            }
        }
    }

    /// Close every active position of the cycle at market.
    pub async fn close_all_active(&self, cycle: &mut Cycle, reason: &str) -> Result<()> {
        let tickets: Vec<u64> = cycle.active_orders().map(|o| o.order_id).collect();
        for ticket in tickets {
            // Capture the final profit before the position disappears.
            let profit = match self.broker.position_by_ticket(ticket).await? {
                Some(position) => Some(position.profit),
                None => None,
            };
            match self.broker.close_position(ticket).await {
                Ok(()) | Err(BrokerError::NotFound(_)) => {
                    if let Some(order) = cycle.order_by_ticket_mut(ticket) {
                        if let Some(p) = profit {
                            order.profit = p;
                        }
                        order.mark_closed(reason);
                    }
                }
                Err(err) => {
                    warn!(cycle_id = %cycle.cycle_id, ticket, error = %err, "close failed");
                }
            }
        }
        cycle.touch();
        Ok(())
    }
}
