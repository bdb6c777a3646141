//! Record store port and write batching.
//!
//! The store itself is opaque: the engine only needs to persist cycle
//! snapshots and emit response events. [`SnapshotBatcher`] throttles
//! per-cycle writes, coalesces interim updates, and lets closure writes
//! bypass both.

use crate::snapshot::CycleSnapshot;
use anyhow::Result;
use async_trait::async_trait;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info};

/// Persistence port for cycle records and outbound events.
#[async_trait]
pub trait RecordStore: Send + Sync {
    async fn save_cycle(&self, snapshot: &CycleSnapshot) -> Result<()>;

    async fn save_event(&self, event: &Value) -> Result<()>;
}

/// In-memory store used by tests and paper mode.
#[derive(Default)]
pub struct MemoryStore {
    cycles: Mutex<HashMap<String, CycleSnapshot>>,
    events: Mutex<Vec<Value>>,
    writes: AtomicUsize,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cycle(&self, cycle_id: &str) -> Option<CycleSnapshot> {
        self.cycles.lock().unwrap().get(cycle_id).cloned()
    }

    pub fn events(&self) -> Vec<Value> {
        self.events.lock().unwrap().clone()
    }

    pub fn write_count(&self) -> usize {
        self.writes.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl RecordStore for MemoryStore {
    async fn save_cycle(&self, snapshot: &CycleSnapshot) -> Result<()> {
        self.writes.fetch_add(1, Ordering::SeqCst);
        self.cycles
            .lock()
            .unwrap()
            .insert(snapshot.cycle_id.clone(), snapshot.clone());
        Ok(())
    }

    async fn save_event(&self, event: &Value) -> Result<()> {
        self.events.lock().unwrap().push(event.clone());
        Ok(())
    }
}

struct BatcherState {
    last_write: HashMap<String, Instant>,
    queue: HashMap<String, CycleSnapshot>,
}

/// Throttled, batching writer in front of a [`RecordStore`].
pub struct SnapshotBatcher {
    store: Arc<dyn RecordStore>,
    update_interval: Duration,
    state: Mutex<BatcherState>,
}

impl SnapshotBatcher {
    pub fn new(store: Arc<dyn RecordStore>, update_interval: Duration) -> Arc<Self> {
        Arc::new(Self {
            store,
            update_interval,
            state: Mutex::new(BatcherState {
                last_write: HashMap::new(),
                queue: HashMap::new(),
            }),
        })
    }

    pub fn store(&self) -> Arc<dyn RecordStore> {
        Arc::clone(&self.store)
    }

    /// Offer an interim snapshot. Written immediately when the cycle's
    /// throttle window has passed, otherwise coalesced into the batch queue
    /// (later offers replace earlier ones).
    pub async fn offer(&self, snapshot: CycleSnapshot) {
        let due = {
            let state = self.state.lock().unwrap();
            state
                .last_write
                .get(&snapshot.cycle_id)
                .map(|t| t.elapsed() >= self.update_interval)
                .unwrap_or(true)
        };
        if due {
            self.write(snapshot).await;
        } else {
            let mut state = self.state.lock().unwrap();
            debug!(cycle_id = %snapshot.cycle_id, "snapshot coalesced");
            state.queue.insert(snapshot.cycle_id.clone(), snapshot);
        }
    }

    /// Write immediately, bypassing the throttle. Used for closures and
    /// other must-not-lose updates.
    pub async fn force(&self, snapshot: CycleSnapshot) {
        {
            let mut state = self.state.lock().unwrap();
            state.queue.remove(&snapshot.cycle_id);
        }
        self.write(snapshot).await;
    }

    /// Flush everything waiting in the batch queue.
    pub async fn flush(&self) {
        let queued: Vec<CycleSnapshot> = {
            let mut state = self.state.lock().unwrap();
            state.queue.drain().map(|(_, s)| s).collect()
        };
        if queued.is_empty() {
            return;
        }
        debug!(count = queued.len(), "flushing batched snapshots");
        for snapshot in queued {
            self.write(snapshot).await;
        }
    }

    async fn write(&self, snapshot: CycleSnapshot) {
        let cycle_id = snapshot.cycle_id.clone();
        match self.store.save_cycle(&snapshot).await {
            Ok(()) => {
                let mut state = self.state.lock().unwrap();
                state.last_write.insert(cycle_id, Instant::now());
            }
            Err(err) => {
                error!(%cycle_id, %err, "cycle snapshot write failed");
            }
        }
    }

    /// Spawn the periodic batch flusher.
    pub fn spawn_flusher(
        self: &Arc<Self>,
        batch_interval: Duration,
        mut shutdown_rx: watch::Receiver<bool>,
    ) -> JoinHandle<()> {
        let batcher = Arc::clone(self);
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(batch_interval);
            tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = shutdown_rx.changed() => break,
                    _ = tick.tick() => batcher.flush().await,
                }
            }
            // Final flush so shutdown loses nothing already queued.
            batcher.flush().await;
            info!("snapshot batch flusher stopped");
        })
    }
}
