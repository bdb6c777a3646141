//! Multi-cycle coordination.
//!
//! Indexes the live cycles by id, zone bucket, and direction; vetoes
//! duplicates at the same entry level; bounds the number of concurrent
//! cycles; and drives interval-based auto-creation around the last created
//! level.

use crate::cycle::Cycle;
use broker_core::types::Direction;
use dashmap::DashMap;
use serde::Serialize;
use std::collections::HashSet;
use std::sync::{Mutex, Arc};
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::sync::Mutex as AsyncMutex;
use tracing::{debug, info, warn};

/// Entry prices match when within this absolute tolerance.
const PRICE_TOLERANCE: f64 = 1e-5;

/// Zone buckets are this many pips wide.
const ZONE_BUCKET_PIPS: f64 = 50.0;

pub type SharedCycle = Arc<AsyncMutex<Cycle>>;

#[derive(Error, Debug)]
pub enum CoordinatorError {
    #[error("cycle {0} already registered")]
    DuplicateId(String),

    #[error("a {direction} cycle already exists at {price}")]
    DuplicateLevel { direction: Direction, price: f64 },

    #[error("maximum active cycles ({0}) reached")]
    CapacityReached(usize),
}

#[derive(Debug, Clone)]
pub struct CoordinatorSettings {
    pub max_active_cycles: usize,
    /// Minimum spacing between cycle creations.
    pub min_creation_interval: Duration,
    /// How long closed cycles linger before garbage collection.
    pub grace_period: Duration,
    /// Spacing between sweep passes.
    pub cleanup_interval: Duration,
}

impl Default for CoordinatorSettings {
    fn default() -> Self {
        Self {
            max_active_cycles: 3,
            min_creation_interval: Duration::from_secs(60),
            grace_period: Duration::from_secs(3600),
            cleanup_interval: Duration::from_secs(300),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct CoordinatorStats {
    pub total_cycles: usize,
    pub open_cycles: usize,
    pub closed_cycles: usize,
    pub zones_active: usize,
    pub buy_cycles: usize,
    pub sell_cycles: usize,
    pub max_cycles_limit: usize,
    pub oldest_cycle_age_secs: u64,
    pub newest_cycle_age_secs: u64,
}

struct AutoCreateState {
    last_cycle_price: Option<f64>,
    last_creation: Option<Instant>,
    active_cycle_levels: HashSet<i64>,
    last_cleanup: Instant,
}

/// Owner of the live cycle set.
pub struct CycleCoordinator {
    settings: CoordinatorSettings,
    pip: f64,
    cycles: DashMap<String, SharedCycle>,
    zone_index: DashMap<String, Vec<String>>,
    direction_index: DashMap<String, Vec<String>>,
    /// (direction, entry_price) per cycle for the duplicate-level veto.
    entries: DashMap<String, (Direction, f64)>,
    creation_times: DashMap<String, Instant>,
    /// Cycles flagged closed, pending grace-period cleanup.
    closed: DashMap<String, Instant>,
    creation_lock: AsyncMutex<()>,
    auto: Mutex<AutoCreateState>,
}

impl CycleCoordinator {
    pub fn new(pip: f64, settings: CoordinatorSettings) -> Self {
        Self {
            settings,
            pip,
            cycles: DashMap::new(),
            zone_index: DashMap::new(),
            direction_index: DashMap::new(),
            entries: DashMap::new(),
            creation_times: DashMap::new(),
            closed: DashMap::new(),
            creation_lock: AsyncMutex::new(()),
            auto: Mutex::new(AutoCreateState {
                last_cycle_price: None,
                last_creation: None,
                active_cycle_levels: HashSet::new(),
                last_cleanup: Instant::now(),
            }),
        }
    }

    fn level_key(&self, price: f64) -> i64 {
        (price / PRICE_TOLERANCE).round() as i64
    }

    fn zone_key(&self, direction: Direction, entry_price: f64) -> String {
        let bucket_width = ZONE_BUCKET_PIPS * self.pip;
        let bucket = (entry_price / bucket_width).round() as i64;
        format!("{}_{}", direction, bucket)
    }

    /// Apply the duplicate-level and capacity rules without registering
    /// anything. Used before placing the entry order a new cycle would own.
    pub async fn precheck(&self, direction: Direction, entry_price: f64) -> Result<(), CoordinatorError> {
        let _guard = self.creation_lock.lock().await;
        self.check_level_and_capacity(direction, entry_price)
    }

    fn check_level_and_capacity(
        &self,
        direction: Direction,
        entry_price: f64,
    ) -> Result<(), CoordinatorError> {
        for entry in self.entries.iter() {
            let (existing_direction, price) = *entry.value();
            if existing_direction == direction && (price - entry_price).abs() < PRICE_TOLERANCE {
                return Err(CoordinatorError::DuplicateLevel {
                    direction: existing_direction,
                    price,
                });
            }
        }
        if self.active_count() >= self.settings.max_active_cycles {
            self.evict_oldest_closed();
            if self.active_count() >= self.settings.max_active_cycles {
                return Err(CoordinatorError::CapacityReached(
                    self.settings.max_active_cycles,
                ));
            }
        }
        Ok(())
    }

    /// Register a new cycle, enforcing duplicate and capacity rules.
    pub async fn add_cycle(&self, cycle: Cycle) -> Result<SharedCycle, CoordinatorError> {
        let _guard = self.creation_lock.lock().await;

        let cycle_id = cycle.cycle_id.clone();
        if self.cycles.contains_key(&cycle_id) {
            warn!(%cycle_id, "cycle already registered");
            return Err(CoordinatorError::DuplicateId(cycle_id));
        }

        if let Err(err) = self.check_level_and_capacity(cycle.direction, cycle.entry_price) {
            warn!(%cycle_id, %err, "cycle rejected");
            return Err(err);
        }

        let zone_key = self.zone_key(cycle.direction, cycle.entry_price);
        let direction_key = cycle.direction.as_str().to_string();
        let entry_price = cycle.entry_price;
        let direction = cycle.direction;

        let shared: SharedCycle = Arc::new(AsyncMutex::new(cycle));
        self.cycles.insert(cycle_id.clone(), Arc::clone(&shared));
        self.zone_index
            .entry(zone_key)
            .or_default()
            .push(cycle_id.clone());
        self.direction_index
            .entry(direction_key)
            .or_default()
            .push(cycle_id.clone());
        self.entries.insert(cycle_id.clone(), (direction, entry_price));
        self.creation_times.insert(cycle_id.clone(), Instant::now());

        {
            let mut auto = self.auto.lock().unwrap();
            auto.active_cycle_levels.insert(self.level_key(entry_price));
            auto.last_cycle_price = Some(entry_price);
            auto.last_creation = Some(Instant::now());
        }

        info!(
            %cycle_id,
            %direction,
            entry_price,
            total = self.cycles.len(),
            "cycle added"
        );
        Ok(shared)
    }

    /// Flag a cycle as closed; it stays indexed until removed or swept.
    pub fn mark_closed(&self, cycle_id: &str) {
        self.closed.insert(cycle_id.to_string(), Instant::now());
    }

    /// Delete a cycle from every index and free its entry level.
    ///
    /// No broker calls happen here; teardown belongs to the closing path.
    pub fn remove_cycle(&self, cycle_id: &str) -> bool {
        let Some((_, shared)) = self.cycles.remove(cycle_id) else {
            warn!(%cycle_id, "cycle not found for removal");
            return false;
        };
        drop(shared);

        if let Some((_, (direction, entry_price))) = self.entries.remove(cycle_id) {
            let zone_key = self.zone_key(direction, entry_price);
            if let Some(mut ids) = self.zone_index.get_mut(&zone_key) {
                ids.retain(|id| id != cycle_id);
            }
            self.zone_index.retain(|_, ids| !ids.is_empty());
            if let Some(mut ids) = self.direction_index.get_mut(direction.as_str()) {
                ids.retain(|id| id != cycle_id);
            }

            let mut auto = self.auto.lock().unwrap();
            auto.active_cycle_levels.remove(&self.level_key(entry_price));
        }
        self.creation_times.remove(cycle_id);
        self.closed.remove(cycle_id);

        info!(%cycle_id, remaining = self.cycles.len(), "cycle removed");
        true
    }

    pub fn get(&self, cycle_id: &str) -> Option<SharedCycle> {
        self.cycles.get(cycle_id).map(|e| Arc::clone(e.value()))
    }

    /// Copy of the live cycle list for tick-loop iteration.
    pub fn snapshot(&self) -> Vec<(String, SharedCycle)> {
        self.cycles
            .iter()
            .map(|e| (e.key().clone(), Arc::clone(e.value())))
            .collect()
    }

    pub fn cycles_in_zone(&self, direction: Direction, price: f64) -> Vec<SharedCycle> {
        let key = self.zone_key(direction, price);
        self.zone_index
            .get(&key)
            .map(|ids| ids.iter().filter_map(|id| self.get(id)).collect())
            .unwrap_or_default()
    }

    pub fn active_count(&self) -> usize {
        self.cycles.len().saturating_sub(self.closed.len())
    }

    fn evict_oldest_closed(&self) {
        let oldest = self
            .closed
            .iter()
            .filter(|e| e.value().elapsed() >= self.settings.grace_period)
            .min_by_key(|e| *e.value())
            .map(|e| e.key().clone());
        if let Some(cycle_id) = oldest {
            info!(%cycle_id, "evicting oldest closed cycle");
            self.remove_cycle(&cycle_id);
        }
    }

    /// Sweep closed cycles past their grace period. Rate-limited by the
    /// configured cleanup interval; returns the number removed.
    pub fn cleanup_closed_cycles(&self) -> usize {
        {
            let mut auto = self.auto.lock().unwrap();
            if auto.last_cleanup.elapsed() < self.settings.cleanup_interval {
                return 0;
            }
            auto.last_cleanup = Instant::now();
        }

        let expired: Vec<String> = self
            .closed
            .iter()
            .filter(|e| e.value().elapsed() >= self.settings.grace_period)
            .map(|e| e.key().clone())
            .collect();
        let mut removed = 0;
        for cycle_id in expired {
            if self.remove_cycle(&cycle_id) {
                removed += 1;
            }
        }
        if removed > 0 {
            info!(removed, "cleaned up closed cycles");
        }
        removed
    }

    /// Interval auto-creation: has price crossed one step away from the last
    /// created level?
    ///
    /// Returns the crossed level and its direction; the caller builds the
    /// cycle and [`Self::add_cycle`] applies the duplicate/capacity rules.
    pub fn auto_create_level(&self, price: f64, interval_pips: f64) -> Option<(Direction, f64)> {
        let mut auto = self.auto.lock().unwrap();

        if let Some(last) = auto.last_creation {
            if last.elapsed() < self.settings.min_creation_interval {
                return None;
            }
        }

        let Some(last_price) = auto.last_cycle_price else {
            // First observation seeds the reference.
            auto.last_cycle_price = Some(price);
            return None;
        };

        let step = interval_pips * self.pip;
        let next_up = last_price + step;
        let next_down = last_price - step;
        if price >= next_up {
            debug!(price, level = next_up, "upward cycle level crossed");
            Some((Direction::Buy, next_up))
        } else if price <= next_down {
            debug!(price, level = next_down, "downward cycle level crossed");
            Some((Direction::Sell, next_down))
        } else {
            None
        }
    }

    pub fn statistics(&self) -> CoordinatorStats {
        let total = self.cycles.len();
        let closed = self.closed.len();
        let buy = self
            .direction_index
            .get(Direction::Buy.as_str())
            .map(|ids| ids.len())
            .unwrap_or(0);
        let sell = self
            .direction_index
            .get(Direction::Sell.as_str())
            .map(|ids| ids.len())
            .unwrap_or(0);
        let ages: Vec<u64> = self
            .creation_times
            .iter()
            .map(|e| e.value().elapsed().as_secs())
            .collect();
        CoordinatorStats {
            total_cycles: total,
            open_cycles: total.saturating_sub(closed),
            closed_cycles: closed,
            zones_active: self.zone_index.len(),
            buy_cycles: buy,
            sell_cycles: sell,
            max_cycles_limit: self.settings.max_active_cycles,
            oldest_cycle_age_secs: ages.iter().copied().max().unwrap_or(0),
            newest_cycle_age_secs: ages.iter().copied().min().unwrap_or(0),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CycleConfig;

    fn cycle(id: &str, direction: Direction, entry: f64) -> Cycle {
        Cycle::new(
            id.to_string(),
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

    fn coordinator(max: usize) -> CycleCoordinator {
        CycleCoordinator::new(
            0.0001,
            CoordinatorSettings {
                max_active_cycles: max,
                min_creation_interval: Duration::ZERO,
                grace_period: Duration::ZERO,
                cleanup_interval: Duration::ZERO,
            },
        )
    }

    #[tokio::test]
    async fn duplicate_id_rejected() {
        let coordinator = coordinator(5);
        coordinator
            .add_cycle(cycle("c1", Direction::Buy, 1.10))
            .await
            .unwrap();
        let err = coordinator
            .add_cycle(cycle("c1", Direction::Sell, 1.20))
            .await
            .unwrap_err();
        assert!(matches!(err, CoordinatorError::DuplicateId(_)));
    }

    #[tokio::test]
    async fn duplicate_level_vetoed_within_tolerance() {
        let coordinator = coordinator(5);
        coordinator
            .add_cycle(cycle("c1", Direction::Buy, 1.10000))
            .await
            .unwrap();

        // Same direction and effectively the same price: vetoed.
        let err = coordinator
            .add_cycle(cycle("c2", Direction::Buy, 1.10000_4))
            .await
            .unwrap_err();
        assert!(matches!(err, CoordinatorError::DuplicateLevel { .. }));

        // 50 pips away: allowed.
        coordinator
            .add_cycle(cycle("c3", Direction::Buy, 1.10050))
            .await
            .unwrap();
        // Opposite direction at the same price: allowed.
        coordinator
            .add_cycle(cycle("c4", Direction::Sell, 1.10000))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn capacity_enforced_with_closed_eviction() {
        let coordinator = coordinator(2);
        coordinator
            .add_cycle(cycle("c1", Direction::Buy, 1.10))
            .await
            .unwrap();
        coordinator
            .add_cycle(cycle("c2", Direction::Buy, 1.11))
            .await
            .unwrap();

        let err = coordinator
            .add_cycle(cycle("c3", Direction::Buy, 1.12))
            .await
            .unwrap_err();
        assert!(matches!(err, CoordinatorError::CapacityReached(2)));

        // Closing one frees a slot (zero grace period in tests).
        coordinator.mark_closed("c1");
        coordinator
            .add_cycle(cycle("c3", Direction::Buy, 1.12))
            .await
            .unwrap();
        assert_eq!(coordinator.active_count(), 2);

        // The closed cycle is swept once past its grace period.
        assert_eq!(coordinator.cleanup_closed_cycles(), 1);
        assert!(coordinator.get("c1").is_none());
    }

    #[tokio::test]
    async fn remove_frees_level_and_indexes() {
        let coordinator = coordinator(5);
        coordinator
            .add_cycle(cycle("c1", Direction::Buy, 1.10))
            .await
            .unwrap();
        assert_eq!(coordinator.cycles_in_zone(Direction::Buy, 1.10).len(), 1);

        assert!(coordinator.remove_cycle("c1"));
        assert!(coordinator.get("c1").is_none());
        assert!(coordinator.cycles_in_zone(Direction::Buy, 1.10).is_empty());
        // The level is free again.
        coordinator
            .add_cycle(cycle("c2", Direction::Buy, 1.10))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn auto_create_levels_follow_crossings() {
        let coordinator = coordinator(5);
        // Seeds the reference price, proposes nothing.
        assert_eq!(coordinator.auto_create_level(1.10000, 100.0), None);
        // Inside the interval: nothing.
        assert_eq!(coordinator.auto_create_level(1.10500, 100.0), None);
        // Crossed one full interval up.
        let (direction, level) = coordinator.auto_create_level(1.11000, 100.0).unwrap();
        assert_eq!(direction, Direction::Buy);
        assert!((level - 1.11000).abs() < 1e-9);

        coordinator
            .add_cycle(cycle("c1", Direction::Buy, level))
            .await
            .unwrap();
        // The reference moved to the created level.
        let (direction, level) = coordinator.auto_create_level(1.10000, 100.0).unwrap();
        assert_eq!(direction, Direction::Sell);
        assert!((level - 1.10000).abs() < 1e-9);
    }

    #[tokio::test]
    async fn creation_interval_throttles_auto_create() {
        let coordinator = CycleCoordinator::new(
            0.0001,
            CoordinatorSettings {
                min_creation_interval: Duration::from_secs(60),
                ..Default::default()
            },
        );
        coordinator
            .add_cycle(cycle("c1", Direction::Buy, 1.10))
            .await
            .unwrap();
        // A fresh creation blocks proposals for the interval.
        assert_eq!(coordinator.auto_create_level(1.2000, 100.0), None);
    }

    #[tokio::test]
    async fn statistics_report_counts() {
        let coordinator = coordinator(5);
        coordinator
            .add_cycle(cycle("c1", Direction::Buy, 1.10))
            .await
            .unwrap();
        coordinator
            .add_cycle(cycle("c2", Direction::Sell, 1.20))
            .await
            .unwrap();
        coordinator.mark_closed("c2");

        let stats = coordinator.statistics();
        assert_eq!(stats.total_cycles, 2);
        assert_eq!(stats.open_cycles, 1);
        assert_eq!(stats.closed_cycles, 1);
        assert_eq!(stats.buy_cycles, 1);
        assert_eq!(stats.sell_cycles, 1);
        assert_eq!(stats.max_cycles_limit, 5);
    }
}
