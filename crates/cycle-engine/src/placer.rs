//! Resilient order placement.
//!
//! Two-phase submission: a synchronous attempt with a few immediate retries,
//! then hand-off to a background queue drained by a dedicated task with
//! bounded retries. Terminal failures are parked in `failed_orders` for
//! diagnostic inspection, and bounded success/failure histories feed the
//! [`ResilientPlacer::statistics`] view.

use broker_core::types::{Direction, OrderTicket};
use broker_core::{Broker, BrokerError};
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::Serialize;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// How a request reaches the broker.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PlaceKind {
    Market,
    PendingStop,
}

/// An order submission request.
#[derive(Debug, Clone, Serialize)]
pub struct PlaceRequest {
    pub request_id: String,
    pub cycle_id: Option<String>,
    pub symbol: String,
    pub direction: Direction,
    pub kind: PlaceKind,
    pub volume: f64,
    /// Market reference price or stop trigger price, depending on `kind`.
    pub price: f64,
    pub sl: f64,
    pub tp: f64,
    pub comment: String,
    pub created_at: DateTime<Utc>,
    /// Background retry attempts consumed so far.
    pub attempts: u32,
}

impl PlaceRequest {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        cycle_id: Option<String>,
        symbol: &str,
        direction: Direction,
        kind: PlaceKind,
        volume: f64,
        price: f64,
        sl: f64,
        tp: f64,
        comment: &str,
    ) -> Self {
        Self {
            request_id: Uuid::new_v4().to_string(),
            cycle_id,
            symbol: symbol.to_string(),
            direction,
            kind,
            volume,
            price,
            sl,
            tp,
            comment: comment.to_string(),
            created_at: Utc::now(),
            attempts: 0,
        }
    }
}

/// Outcome of [`ResilientPlacer::place`].
#[derive(Debug, Clone)]
pub enum PlaceOutcome {
    /// Submitted synchronously.
    Placed(OrderTicket),
    /// Handed to the background queue; may still succeed later.
    Queued,
    /// Rejected before submission (validation) — will not be retried.
    Failed(String),
}

/// Failure taxonomy tracked by the diagnostics counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    /// Broker produced no usable result.
    NoneResult,
    /// Broker answered but without a ticket.
    NoTicket,
    /// Submission raised a typed error.
    Exception,
}

fn classify(error: &BrokerError) -> FailureKind {
    match error {
        BrokerError::Unknown(_) => FailureKind::NoneResult,
        _ => FailureKind::Exception,
    }
}

#[derive(Debug, Clone, Serialize)]
struct SuccessRecord {
    timestamp: DateTime<Utc>,
    request_id: String,
    ticket: u64,
    retry_count: u32,
}

#[derive(Debug, Clone, Serialize)]
struct FailureRecord {
    timestamp: DateTime<Utc>,
    request_id: String,
    comment: String,
    error: String,
    kind: FailureKind,
}

#[derive(Default)]
struct DiagnosticsInner {
    successes: VecDeque<SuccessRecord>,
    failures: VecDeque<FailureRecord>,
    failure_counts: HashMap<FailureKind, u64>,
}

struct Diagnostics {
    inner: Mutex<DiagnosticsInner>,
    max_history: usize,
}

impl Diagnostics {
    fn new(max_history: usize) -> Self {
        Self {
            inner: Mutex::new(DiagnosticsInner::default()),
            max_history,
        }
    }

    fn record_success(&self, request: &PlaceRequest, ticket: u64, retry_count: u32) {
        let mut inner = self.inner.lock().unwrap();
        inner.successes.push_back(SuccessRecord {
            timestamp: Utc::now(),
            request_id: request.request_id.clone(),
            ticket,
            retry_count,
        });
        if inner.successes.len() > self.max_history {
            inner.successes.pop_front();
        }
    }

    fn record_failure(&self, request: &PlaceRequest, error: &str, kind: FailureKind) {
        let mut inner = self.inner.lock().unwrap();
        inner.failures.push_back(FailureRecord {
            timestamp: Utc::now(),
            request_id: request.request_id.clone(),
            comment: request.comment.clone(),
            error: error.to_string(),
            kind,
        });
        if inner.failures.len() > self.max_history {
            inner.failures.pop_front();
        }
        *inner.failure_counts.entry(kind).or_insert(0) += 1;
    }
}

/// Aggregate submission metrics.
#[derive(Debug, Clone, Serialize)]
pub struct PlacerStatistics {
    pub total_attempts: u64,
    pub total_successes: u64,
    pub total_failures: u64,
    pub success_rate: f64,
    pub failure_counts: HashMap<FailureKind, u64>,
    pub most_common_failure: Option<FailureKind>,
    pub queue_size: usize,
    pub active_orders: usize,
    pub failed_orders: usize,
}

/// Tuning for the placement pipeline. The defaults match production pacing;
/// tests shrink the delays.
#[derive(Debug, Clone)]
pub struct PlacerSettings {
    pub immediate_retries: u32,
    pub backoff: Vec<Duration>,
    pub max_background_retries: u32,
    pub drain_interval: Duration,
    pub background_delay_unit: Duration,
    pub background_delay_cap: Duration,
    pub max_history: usize,
}

impl Default for PlacerSettings {
    fn default() -> Self {
        Self {
            immediate_retries: 2,
            backoff: vec![
                Duration::from_secs(1),
                Duration::from_secs(2),
                Duration::from_secs(5),
            ],
            max_background_retries: 5,
            drain_interval: Duration::from_secs(5),
            background_delay_unit: Duration::from_secs(5),
            background_delay_cap: Duration::from_secs(30),
            max_history: 1000,
        }
    }
}

/// Hybrid immediate-retry + background-queue order placer.
pub struct ResilientPlacer {
    broker: Arc<dyn Broker>,
    settings: PlacerSettings,
    queue_tx: mpsc::UnboundedSender<PlaceRequest>,
    queue_size: Arc<AtomicUsize>,
    active_orders: Arc<DashMap<u64, PlaceRequest>>,
    failed_orders: Arc<DashMap<String, PlaceRequest>>,
    diagnostics: Arc<Diagnostics>,
    shutdown_tx: watch::Sender<bool>,
}

impl ResilientPlacer {
    /// Create the placer and spawn its background worker.
    pub fn new(broker: Arc<dyn Broker>, settings: PlacerSettings) -> Arc<Self> {
        let (queue_tx, queue_rx) = mpsc::unbounded_channel();
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let queue_size = Arc::new(AtomicUsize::new(0));
        let active_orders = Arc::new(DashMap::new());
        let failed_orders = Arc::new(DashMap::new());
        let diagnostics = Arc::new(Diagnostics::new(settings.max_history));

        let placer = Arc::new(Self {
            broker: Arc::clone(&broker),
            settings: settings.clone(),
            queue_tx,
            queue_size: Arc::clone(&queue_size),
            active_orders: Arc::clone(&active_orders),
            failed_orders: Arc::clone(&failed_orders),
            diagnostics: Arc::clone(&diagnostics),
            shutdown_tx,
        });

        tokio::spawn(background_worker(
            broker,
            settings,
            queue_rx,
            shutdown_rx,
            queue_size,
            active_orders,
            failed_orders,
            diagnostics,
        ));

        placer
    }

    /// Submit an order with immediate retries, falling back to the queue.
    pub async fn place(&self, request: PlaceRequest) -> PlaceOutcome {
        if let Err(reason) = validate(&request) {
            warn!(request_id = %request.request_id, %reason, "order request rejected");
            self.diagnostics
                .record_failure(&request, &reason, FailureKind::Exception);
            return PlaceOutcome::Failed(reason);
        }

        // Phase 1: immediate attempt.
        match submit(self.broker.as_ref(), &request).await {
            Ok(ticket) => {
                self.record_placed(&request, ticket, 0);
                return PlaceOutcome::Placed(ticket);
            }
            Err((err, kind)) => {
                self.diagnostics.record_failure(&request, &err, kind);
            }
        }

        // Phase 2: immediate retries with backoff.
        for retry in 0..self.settings.immediate_retries {
            let delay_idx = (retry as usize).min(self.settings.backoff.len().saturating_sub(1));
            tokio::time::sleep(self.settings.backoff[delay_idx]).await;

            match submit(self.broker.as_ref(), &request).await {
                Ok(ticket) => {
                    self.record_placed(&request, ticket, retry + 1);
                    return PlaceOutcome::Placed(ticket);
                }
                Err((err, kind)) => {
                    debug!(
                        request_id = %request.request_id,
                        retry = retry + 1,
                        error = %err,
                        "immediate retry failed"
                    );
                    self.diagnostics.record_failure(&request, &err, kind);
                }
            }
        }

        // Phase 3: queue for background processing.
        info!(request_id = %request.request_id, "queueing order for background processing");
        self.queue_size.fetch_add(1, Ordering::SeqCst);
        if self.queue_tx.send(request.clone()).is_err() {
            self.queue_size.fetch_sub(1, Ordering::SeqCst);
            self.failed_orders.insert(request.request_id.clone(), request);
            return PlaceOutcome::Failed("background worker stopped".to_string());
        }
        PlaceOutcome::Queued
    }

    fn record_placed(&self, request: &PlaceRequest, ticket: OrderTicket, retries: u32) {
        self.diagnostics.record_success(request, ticket.ticket, retries);
        self.active_orders.insert(ticket.ticket, request.clone());
        info!(
            request_id = %request.request_id,
            ticket = ticket.ticket,
            retries,
            "order placed"
        );
    }

    /// Signal the background worker; in-flight queue items are abandoned to
    /// `failed_orders`.
    pub fn shutdown(&self) {
        let _ = self.shutdown_tx.send(true);
    }

    pub fn failed_order_ids(&self) -> Vec<String> {
        self.failed_orders.iter().map(|e| e.key().clone()).collect()
    }

    pub fn statistics(&self) -> PlacerStatistics {
        let inner = self.diagnostics.inner.lock().unwrap();
        let successes = inner.successes.len() as u64;
        let failures: u64 = inner.failure_counts.values().sum();
        let attempts = successes + failures;
        let most_common = inner
            .failure_counts
            .iter()
            .max_by_key(|(_, count)| **count)
            .map(|(kind, _)| *kind);
        PlacerStatistics {
            total_attempts: attempts,
            total_successes: successes,
            total_failures: failures,
            success_rate: if attempts == 0 {
                100.0
            } else {
                successes as f64 / attempts as f64 * 100.0
            },
            failure_counts: inner.failure_counts.clone(),
            most_common_failure: most_common,
            queue_size: self.queue_size.load(Ordering::SeqCst),
            active_orders: self.active_orders.len(),
            failed_orders: self.failed_orders.len(),
        }
    }
}

fn validate(request: &PlaceRequest) -> Result<(), String> {
    if request.volume <= 0.0 || !request.volume.is_finite() {
        return Err(format!("invalid volume {}", request.volume));
    }
    if request.price <= 0.0 || !request.price.is_finite() {
        return Err(format!("invalid price {}", request.price));
    }
    if request.comment.is_empty() {
        return Err("missing comment".to_string());
    }
    Ok(())
}

/// One submission attempt. Defensive about the returned ticket: a zero
/// ticket counts as a failure even when the call itself succeeded.
async fn submit(broker: &dyn Broker, request: &PlaceRequest) -> Result<OrderTicket, (String, FailureKind)> {
    let result = match request.kind {
        PlaceKind::Market => {
            broker
                .place_market(
                    &request.symbol,
                    request.direction,
                    request.volume,
                    request.sl,
                    request.tp,
                    &request.comment,
                )
                .await
        }
        PlaceKind::PendingStop => {
            broker
                .place_pending(
                    &request.symbol,
                    request.direction,
                    request.price,
                    request.volume,
                    request.sl,
                    request.tp,
                    &request.comment,
                )
                .await
        }
    };

    match result {
        Ok(ticket) if ticket.ticket == 0 => {
            Err(("result carried no ticket".to_string(), FailureKind::NoTicket))
        }
        Ok(ticket) => Ok(ticket),
        Err(err) => {
            let kind = classify(&err);
            Err((err.to_string(), kind))
        }
    }
}

#[allow(clippy::too_many_arguments)]
async fn background_worker(
    broker: Arc<dyn Broker>,
    settings: PlacerSettings,
    mut queue_rx: mpsc::UnboundedReceiver<PlaceRequest>,
    mut shutdown_rx: watch::Receiver<bool>,
    queue_size: Arc<AtomicUsize>,
    active_orders: Arc<DashMap<u64, PlaceRequest>>,
    failed_orders: Arc<DashMap<String, PlaceRequest>>,
    diagnostics: Arc<Diagnostics>,
) {
    let mut backlog: VecDeque<PlaceRequest> = VecDeque::new();
    let mut tick = tokio::time::interval(settings.drain_interval);
    tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    info!("background order processor started");
    loop {
        tokio::select! {
            _ = shutdown_rx.changed() => break,
            item = queue_rx.recv() => {
                match item {
                    Some(request) => backlog.push_back(request),
                    None => break,
                }
            }
            _ = tick.tick() => {
                let mut round: VecDeque<PlaceRequest> = std::mem::take(&mut backlog);
                while let Some(mut request) = round.pop_front() {
                    request.attempts += 1;

                    let delay = settings
                        .background_delay_unit
                        .saturating_mul(request.attempts.saturating_sub(1))
                        .min(settings.background_delay_cap);
                    tokio::time::sleep(delay).await;

                    match submit(broker.as_ref(), &request).await {
                        Ok(ticket) => {
                            queue_size.fetch_sub(1, Ordering::SeqCst);
                            diagnostics.record_success(&request, ticket.ticket, request.attempts);
                            active_orders.insert(ticket.ticket, request.clone());
                            info!(
                                request_id = %request.request_id,
                                ticket = ticket.ticket,
                                attempts = request.attempts,
                                "background placement succeeded"
                            );
                        }
                        Err((err, kind)) => {
                            diagnostics.record_failure(&request, &err, kind);
                            if request.attempts >= settings.max_background_retries {
                                queue_size.fetch_sub(1, Ordering::SeqCst);
                                error!(
                                    request_id = %request.request_id,
                                    error = %err,
                                    "background placement exhausted retries"
                                );
                                failed_orders.insert(request.request_id.clone(), request);
                            } else {
                                backlog.push_back(request);
                            }
                        }
                    }
                }
            }
        }
    }

    // Abandon whatever is left to the failure ledger.
    while let Ok(request) = queue_rx.try_recv() {
        backlog.push_back(request);
    }
    for request in backlog {
        queue_size.fetch_sub(1, Ordering::SeqCst);
        failed_orders.insert(request.request_id.clone(), request);
    }
    info!("background order processor stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use broker_core::PaperBroker;

    fn fast_settings() -> PlacerSettings {
        PlacerSettings {
            backoff: vec![Duration::from_millis(1)],
            drain_interval: Duration::from_millis(10),
            background_delay_unit: Duration::from_millis(1),
            background_delay_cap: Duration::from_millis(5),
            ..Default::default()
        }
    }

    fn market_request() -> PlaceRequest {
        PlaceRequest::new(
            Some("cycle-1".to_string()),
            "EURUSD",
            Direction::Buy,
            PlaceKind::Market,
            0.01,
            1.10002,
            0.0,
            0.0,
            "grid_0",
        )
    }

    fn paper() -> Arc<PaperBroker> {
        let broker = Arc::new(PaperBroker::new("EURUSD", 0.00001));
        broker.set_quote(1.10000, 1.10002);
        broker
    }

    #[tokio::test]
    async fn immediate_success() {
        let broker = paper();
        let placer = ResilientPlacer::new(broker, fast_settings());
        let outcome = placer.place(market_request()).await;
        assert!(matches!(outcome, PlaceOutcome::Placed(_)));
        let stats = placer.statistics();
        assert_eq!(stats.total_successes, 1);
        assert_eq!(stats.total_failures, 0);
    }

    #[tokio::test]
    async fn validation_failure_is_terminal() {
        let broker = paper();
        let placer = ResilientPlacer::new(broker, fast_settings());
        let mut request = market_request();
        request.volume = 0.0;
        let outcome = placer.place(request).await;
        assert!(matches!(outcome, PlaceOutcome::Failed(_)));
    }

    #[tokio::test]
    async fn retry_after_transient_failure() {
        let broker = paper();
        broker.fail_next_place(BrokerError::ConnectionLost("socket".to_string()));
        let placer = ResilientPlacer::new(Arc::clone(&broker) as Arc<dyn Broker>, fast_settings());
        let outcome = placer.place(market_request()).await;
        assert!(matches!(outcome, PlaceOutcome::Placed(_)));
        let stats = placer.statistics();
        assert_eq!(stats.total_failures, 1);
        assert_eq!(stats.total_successes, 1);
    }

    #[tokio::test]
    async fn queued_request_placed_by_worker() {
        let broker = paper();
        // Exhaust the immediate attempt plus both retries.
        for _ in 0..3 {
            broker.fail_next_place(BrokerError::ConnectionLost("socket".to_string()));
        }
        let placer = ResilientPlacer::new(Arc::clone(&broker) as Arc<dyn Broker>, fast_settings());
        let outcome = placer.place(market_request()).await;
        assert!(matches!(outcome, PlaceOutcome::Queued));

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(broker.position_count(), 1);
        let stats = placer.statistics();
        assert_eq!(stats.queue_size, 0);
        assert_eq!(stats.total_successes, 1);
    }

    #[tokio::test]
    async fn exhausted_background_retries_land_in_failed_orders() {
        let broker = paper();
        // Fail everything: 3 immediate + 5 background attempts.
        for _ in 0..8 {
            broker.fail_next_place(BrokerError::ConnectionLost("socket".to_string()));
        }
        let placer = ResilientPlacer::new(Arc::clone(&broker) as Arc<dyn Broker>, fast_settings());
        let outcome = placer.place(market_request()).await;
        assert!(matches!(outcome, PlaceOutcome::Queued));

        tokio::time::sleep(Duration::from_millis(300)).await;
        let stats = placer.statistics();
        assert_eq!(stats.failed_orders, 1);
        assert_eq!(stats.queue_size, 0);
        assert_eq!(stats.most_common_failure, Some(FailureKind::Exception));
    }
}
