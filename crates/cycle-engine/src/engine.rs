//! The strategy tick loop.
//!
//! One engine instance owns a symbol: it polls the broker, walks every live
//! cycle through reconciliation, grid maintenance, trailing-stop and
//! take-profit evaluation, consumes command events, and streams snapshots to
//! the store. Errors are isolated per cycle; nothing crosses the loop
//! boundary.

use crate::config::CycleConfig;
use crate::coordinator::{CoordinatorSettings, CycleCoordinator};
use crate::cycle::Cycle;
use crate::grid::GridManager;
use crate::order::{CycleOrder, OrderStatus};
use crate::placer::{PlaceKind, PlaceOutcome, PlaceRequest, PlacerSettings, ResilientPlacer};
use crate::router::{
    close_cycle_response, CommandAction, ProcessedEvents, ResponseStatus, TradeEvent,
};
use crate::snapshot::CycleSnapshot;
use crate::store::{RecordStore, SnapshotBatcher};
use crate::take_profit::TakeProfitEngine;
use anyhow::{anyhow, bail, Result};
use broker_core::config::BotConfig;
use broker_core::market;
use broker_core::types::Direction;
use broker_core::Broker;
use chrono::Utc;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, watch};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Engine pacing. Defaults match production; tests shrink everything.
#[derive(Debug, Clone)]
pub struct EngineSettings {
    pub tick_interval: Duration,
    /// Minimum spacing between processing passes for one cycle.
    pub process_interval: Duration,
    /// Per-cycle store write throttle.
    pub snapshot_update_interval: Duration,
    /// Batch flush spacing.
    pub batch_interval: Duration,
    /// How long a derived pip value stays cached.
    pub pip_cache_ttl: Duration,
    pub processed_events_capacity: usize,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            tick_interval: Duration::from_millis(500),
            process_interval: Duration::from_secs(1),
            snapshot_update_interval: Duration::from_secs(5),
            batch_interval: Duration::from_secs(10),
            pip_cache_ttl: Duration::from_secs(60),
            processed_events_capacity: 1000,
        }
    }
}

/// Strategy owner for one symbol.
pub struct StrategyEngine {
    bot: BotConfig,
    settings: EngineSettings,
    /// Live configuration template; frozen into each new cycle.
    template: Mutex<CycleConfig>,
    /// Magic number for new cycles; running cycles keep their own.
    magic: AtomicI64,
    broker: Arc<dyn Broker>,
    grid: GridManager,
    take_profit: TakeProfitEngine,
    placer: Arc<ResilientPlacer>,
    coordinator: Arc<CycleCoordinator>,
    batcher: Arc<SnapshotBatcher>,
    processed: ProcessedEvents,
    pip_cache: Mutex<Option<(f64, Instant)>>,
    process_times: Mutex<HashMap<String, Instant>>,
    running: AtomicBool,
}

impl StrategyEngine {
    pub async fn new(
        bot: BotConfig,
        template: CycleConfig,
        broker: Arc<dyn Broker>,
        store: Arc<dyn RecordStore>,
        settings: EngineSettings,
        placer_settings: PlacerSettings,
        coordinator_settings: CoordinatorSettings,
    ) -> Arc<Self> {
        let template = template.validated();
        let placer = ResilientPlacer::new(Arc::clone(&broker), placer_settings);
        let grid = GridManager::new(Arc::clone(&broker), Arc::clone(&placer));
        let take_profit = TakeProfitEngine::new(grid.clone());

        let info = broker.symbol_info(&bot.symbol).await.ok();
        let pip = market::pip_value(info.as_ref(), &bot.symbol);
        let coordinator = Arc::new(CycleCoordinator::new(pip, coordinator_settings));
        let batcher = SnapshotBatcher::new(store, settings.snapshot_update_interval);
        let capacity = settings.processed_events_capacity;
        let magic = bot.magic_number;

        Arc::new(Self {
            bot,
            settings,
            template: Mutex::new(template),
            magic: AtomicI64::new(magic),
            broker,
            grid,
            take_profit,
            placer,
            coordinator,
            batcher,
            processed: ProcessedEvents::new(capacity),
            pip_cache: Mutex::new(Some((pip, Instant::now()))),
            process_times: Mutex::new(HashMap::new()),
            running: AtomicBool::new(true),
        })
    }

    pub fn coordinator(&self) -> Arc<CycleCoordinator> {
        Arc::clone(&self.coordinator)
    }

    pub fn placer(&self) -> Arc<ResilientPlacer> {
        Arc::clone(&self.placer)
    }

    /// Run until shutdown, consuming command events between ticks.
    pub async fn run(
        self: Arc<Self>,
        mut commands: mpsc::Receiver<TradeEvent>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        let flusher = self
            .batcher
            .spawn_flusher(self.settings.batch_interval, shutdown.clone());
        let mut tick = tokio::time::interval(self.settings.tick_interval);
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        let mut commands_open = true;

        info!(symbol = %self.bot.symbol, "strategy engine started");
        loop {
            tokio::select! {
                _ = shutdown.changed() => break,
                event = commands.recv(), if commands_open => {
                    match event {
                        Some(event) => {
                            let uuid = event.uuid.clone();
                            if let Err(err) = self.handle_command(event).await {
                                error!(event_uuid = %uuid, %err, "command failed");
                            }
                        }
                        None => commands_open = false,
                    }
                }
                _ = tick.tick() => self.tick().await,
            }
        }

        self.placer.shutdown();
        self.batcher.flush().await;
        let _ = flusher.await;
        info!(symbol = %self.bot.symbol, "strategy engine stopped");
    }

    /// One processing pass over every live cycle.
    pub async fn tick(&self) {
        if !self.running.load(Ordering::SeqCst) {
            return;
        }
        if !market::is_market_open(Utc::now()) {
            debug!("market closed, skipping tick");
            return;
        }

        let bid = match self.broker.bid(&self.bot.symbol).await {
            Ok(bid) => bid,
            Err(err) => {
                warn!(%err, "no market data this tick");
                return;
            }
        };

        let template = self.template.lock().unwrap().clone();
        if template.auto_place_cycles {
            if let Some((direction, level)) =
                self.coordinator.auto_create_level(bid, template.cycle_interval_pips)
            {
                match self.open_cycle(direction, Some(level), "auto").await {
                    Ok(cycle_id) => info!(%cycle_id, %direction, level, "auto-created cycle"),
                    Err(err) => debug!(%err, "auto-create rejected"),
                }
            }
        }

        self.coordinator.cleanup_closed_cycles();

        for (cycle_id, shared) in self.coordinator.snapshot() {
            if !self.due_for_processing(&cycle_id) {
                continue;
            }
            let mut cycle = shared.lock().await;
            if let Err(err) = self.process_cycle(&mut cycle, bid).await {
                error!(%cycle_id, %err, "cycle processing failed");
                continue;
            }
            let closed = cycle.is_closed;
            let snapshot = CycleSnapshot::from_cycle(&cycle);
            drop(cycle);

            if closed {
                self.batcher.force(snapshot).await;
                self.coordinator.mark_closed(&cycle_id);
                self.coordinator.remove_cycle(&cycle_id);
            } else {
                self.batcher.offer(snapshot).await;
            }
        }
    }

    fn due_for_processing(&self, cycle_id: &str) -> bool {
        let mut times = self.process_times.lock().unwrap();
        match times.get(cycle_id) {
            Some(last) if last.elapsed() < self.settings.process_interval => false,
            _ => {
                times.insert(cycle_id.to_string(), Instant::now());
                true
            }
        }
    }

    async fn process_cycle(&self, cycle: &mut Cycle, price: f64) -> Result<()> {
        if cycle.is_closed {
            return Ok(());
        }

        self.grid.reconcile_orders(cycle).await?;
        cycle.refresh_zone_bounds();
        self.grid.maintain_pending_orders(cycle).await?;
        self.grid.update_trailing_stop(cycle).await?;

        if self.grid.check_trailing_trigger(cycle, price).await? {
            cycle.refresh_zone_bounds();
        }

        if self.grid.acquire_initial_order(cycle, price).await? {
            // The first order's realised profit must survive an immediate
            // stop-out, so fetch it and let the caller force the write.
            self.refresh_initial_profit(cycle).await?;
        }

        self.grid.update_recovery(cycle, price).await?;
        self.take_profit.evaluate(cycle).await?;
        cycle.refresh_totals();
        Ok(())
    }

    async fn refresh_initial_profit(&self, cycle: &mut Cycle) -> Result<()> {
        let Some(ticket) = cycle.initial_order().map(|o| o.order_id) else {
            return Ok(());
        };
        if let Some(position) = self.broker.position_by_ticket(ticket).await? {
            if let Some(order) = cycle.order_by_ticket_mut(ticket) {
                order.profit = position.profit;
            }
        }
        cycle.refresh_totals();
        Ok(())
    }

    fn current_pip(&self) -> Option<f64> {
        let cache = self.pip_cache.lock().unwrap();
        cache.and_then(|(pip, at)| (at.elapsed() < self.settings.pip_cache_ttl).then_some(pip))
    }

    async fn pip_value(&self) -> f64 {
        if let Some(pip) = self.current_pip() {
            return pip;
        }
        let info = self.broker.symbol_info(&self.bot.symbol).await.ok();
        let pip = market::pip_value(info.as_ref(), &self.bot.symbol);
        *self.pip_cache.lock().unwrap() = Some((pip, Instant::now()));
        pip
    }

    /// Open a new cycle around a fresh market order.
    ///
    /// `level` pins the cycle's entry level (auto-creation); manual opens
    /// use the fill price. The coordinator's rules run before any broker
    /// order is placed.
    pub async fn open_cycle(
        &self,
        direction: Direction,
        level: Option<f64>,
        user: &str,
    ) -> Result<String> {
        let template = self.template.lock().unwrap().clone();
        let pip = self.pip_value().await;

        let market_price = match direction {
            Direction::Buy => self.broker.ask(&self.bot.symbol).await?,
            Direction::Sell => self.broker.bid(&self.bot.symbol).await?,
        };
        let entry = level.unwrap_or(market_price);
        self.coordinator
            .precheck(direction, entry)
            .await
            .map_err(|err| anyhow!(err))?;

        let sl_distance = template.initial_stop_loss_pips * pip;
        let sl = match direction {
            Direction::Buy => market_price - sl_distance,
            Direction::Sell => market_price + sl_distance,
        };

        let cycle_id = Uuid::new_v4().to_string();
        let request = PlaceRequest::new(
            Some(cycle_id.clone()),
            &self.bot.symbol,
            direction,
            PlaceKind::Market,
            template.lot_size,
            market_price,
            sl,
            0.0,
            &format!("{cycle_id}_L0"),
        );

        let ticket = match self.placer.place(request).await {
            PlaceOutcome::Placed(ticket) => ticket,
            PlaceOutcome::Queued => bail!("initial order queued, cycle not created"),
            PlaceOutcome::Failed(reason) => bail!("initial order failed: {reason}"),
        };

        let mut cycle = Cycle::new(
            cycle_id.clone(),
            self.bot.bot_id.clone(),
            self.bot.account_id.clone(),
            self.bot.symbol.clone(),
            self.magic.load(Ordering::SeqCst),
            direction,
            entry,
            pip,
            template,
        );
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
        self.refresh_initial_profit(&mut cycle).await?;

        let snapshot = CycleSnapshot::from_cycle(&cycle);
        self.coordinator
            .add_cycle(cycle)
            .await
            .map_err(|err| anyhow!(err))?;
        // Written immediately so the entry (and its profit) can never be
        // lost to the batching throttle.
        self.batcher.force(snapshot).await;

        info!(%cycle_id, %direction, entry, user, "cycle opened");
        Ok(cycle_id)
    }

    /// Close one cycle: broker teardown, forced write, index removal.
    pub async fn close_cycle(&self, cycle_id: &str, user: &str, method: &str) -> Result<()> {
        let shared = self
            .coordinator
            .get(cycle_id)
            .ok_or_else(|| anyhow!("cycle {cycle_id} not found"))?;
        let mut cycle = shared.lock().await;
        self.take_profit
            .close_cycle(&mut cycle, method, user, "closed by command")
            .await?;
        let snapshot = CycleSnapshot::from_cycle(&cycle);
        drop(cycle);

        self.batcher.force(snapshot).await;
        self.coordinator.mark_closed(cycle_id);
        self.coordinator.remove_cycle(cycle_id);
        Ok(())
    }

    /// Handle one command event. Duplicate UUIDs are no-ops.
    pub async fn handle_command(&self, event: TradeEvent) -> Result<bool> {
        if !self.processed.insert(&event.uuid) {
            debug!(event_uuid = %event.uuid, "duplicate event ignored");
            return Ok(false);
        }

        let Some(raw_action) = event.action().map(str::to_string) else {
            warn!(event_uuid = %event.uuid, "event without action");
            return Ok(false);
        };
        let Some(action) = CommandAction::parse(&raw_action) else {
            warn!(event_uuid = %event.uuid, action = %raw_action, "unknown action");
            return Ok(false);
        };

        match action {
            CommandAction::OpenOrder => {
                let direction = event
                    .contents
                    .get("type")
                    .and_then(Value::as_i64)
                    .and_then(Direction::from_order_type)
                    .or_else(|| {
                        event
                            .content_str("direction")
                            .and_then(|d| serde_json::from_value(Value::String(d.to_string())).ok())
                    })
                    .ok_or_else(|| anyhow!("open_order without a valid type/direction"))?;
                self.open_cycle(direction, None, &event.user_name()).await?;
                Ok(true)
            }
            CommandAction::CloseOrder => self.close_order_command(&event, false).await,
            CommandAction::ClosePendingOrder => self.close_order_command(&event, true).await,
            CommandAction::CloseAllOrders => {
                for (_, shared) in self.coordinator.snapshot() {
                    let mut cycle = shared.lock().await;
                    self.grid.close_all_active(&mut cycle, "close_all_orders").await?;
                    cycle.refresh_totals();
                }
                Ok(true)
            }
            CommandAction::CloseAllPendingOrders => {
                for (_, shared) in self.coordinator.snapshot() {
                    let mut cycle = shared.lock().await;
                    self.grid
                        .cancel_all_pending(&mut cycle, "close_all_pending_orders")
                        .await?;
                }
                Ok(true)
            }
            CommandAction::CloseCycle | CommandAction::CloseAllCycles => {
                self.close_cycle_command(&event, &raw_action).await
            }
            CommandAction::UpdateBot | CommandAction::UpdateOrderConfigs => {
                self.update_config_command(&event);
                Ok(true)
            }
            CommandAction::StartBot => {
                self.running.store(true, Ordering::SeqCst);
                info!("bot started");
                Ok(true)
            }
            CommandAction::StopBot => {
                self.running.store(false, Ordering::SeqCst);
                info!("bot stopped");
                Ok(true)
            }
        }
    }

    async fn close_order_command(&self, event: &TradeEvent, pending_only: bool) -> Result<bool> {
        let ticket = event
            .content_u64("order_id")
            .or_else(|| event.content_str("order_id").and_then(|s| s.parse().ok()))
            .ok_or_else(|| anyhow!("missing order_id"))?;

        for (_, shared) in self.coordinator.snapshot() {
            let mut cycle = shared.lock().await;
            let Some(status) = cycle.order_by_ticket(ticket).map(|o| o.status) else {
                continue;
            };
            match status {
                OrderStatus::Pending => {
                    self.grid
                        .cancel_pending_order(&mut cycle, ticket, "closed by command")
                        .await?;
                }
                OrderStatus::Active if !pending_only => {
                    let profit = self
                        .broker
                        .position_by_ticket(ticket)
                        .await?
                        .map(|p| p.profit);
                    self.broker.close_position(ticket).await?;
                    if let Some(order) = cycle.order_by_ticket_mut(ticket) {
                        if let Some(p) = profit {
                            order.profit = p;
                        }
                        order.mark_closed("closed by command");
                    }
                }
                _ => bail!("order {ticket} is not in a closable state"),
            }
            cycle.refresh_totals();
            let snapshot = CycleSnapshot::from_cycle(&cycle);
            drop(cycle);
            self.batcher.offer(snapshot).await;
            return Ok(true);
        }
        bail!("order {ticket} not found in any cycle")
    }

    async fn close_cycle_command(&self, event: &TradeEvent, action: &str) -> Result<bool> {
        let user = event.user_name();
        let store = self.batcher.store();

        let processing = close_cycle_response(
            event,
            ResponseStatus::Processing,
            action,
            event.content_str("cycle_id"),
            json!({"received_at": Utc::now().to_rfc3339()}),
        );
        if let Err(err) = store.save_event(&processing).await {
            warn!(%err, "failed to emit processing response");
        }

        let targets: Vec<String> = if action == "close_all_cycles" {
            self.coordinator.snapshot().into_iter().map(|(id, _)| id).collect()
        } else if let Some(ids) = event.contents.get("ids").and_then(Value::as_array) {
            ids.iter()
                .filter_map(Value::as_str)
                .map(str::to_string)
                .collect()
        } else {
            match event
                .content_str("cycle_id")
                .or_else(|| event.content_str("id"))
            {
                Some("all") => self.coordinator.snapshot().into_iter().map(|(id, _)| id).collect(),
                Some(id) => vec![id.to_string()],
                None => Vec::new(),
            }
        };

        let mut closed = 0usize;
        let mut failure: Option<String> = None;
        if targets.is_empty() && action == "close_cycle" {
            failure = Some("no cycle id in event".to_string());
        }
        for cycle_id in &targets {
            match self.close_cycle(cycle_id, &user, "manual").await {
                Ok(()) => closed += 1,
                Err(err) => {
                    error!(%cycle_id, %err, "close cycle failed");
                    failure.get_or_insert(err.to_string());
                }
            }
        }

        let success = failure.is_none();
        let details = match &failure {
            Some(error) => json!({"cycles_closed": closed, "error": error}),
            None => json!({"cycles_closed": closed, "completed_at": Utc::now().to_rfc3339()}),
        };
        let status = if success {
            ResponseStatus::Completed
        } else {
            ResponseStatus::Failed
        };
        let response = close_cycle_response(
            event,
            status,
            action,
            event.content_str("cycle_id"),
            details,
        );
        if let Err(err) = store.save_event(&response).await {
            warn!(%err, "failed to emit completion response");
        }

        Ok(success)
    }

    fn update_config_command(&self, event: &TradeEvent) {
        let source = event
            .contents
            .get("config")
            .cloned()
            .unwrap_or_else(|| event.contents.clone());
        match serde_json::from_value::<CycleConfig>(source) {
            Ok(config) => {
                let config = config.validated();
                *self.template.lock().unwrap() = config;
                info!("configuration template updated; applies to new cycles only");
            }
            Err(err) => warn!(%err, "unreadable config update ignored"),
        }
        if let Some(magic) = event.contents.get("magic_number").and_then(Value::as_i64) {
            // Effective for new cycles only; in-flight cycles keep theirs.
            self.magic.store(magic, Ordering::SeqCst);
            info!(magic, "magic number updated for new cycles");
        }
    }
}
