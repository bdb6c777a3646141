//! Cycle Bot Runner
//!
//! Wires the strategy engine to an in-memory paper broker: a random-walk
//! quote feed drives ticks, and command events are accepted as JSON lines on
//! stdin (one `{uuid, accountId, botId, contents}` record per line).

use anyhow::Result;
use broker_core::config::Config;
use broker_core::{Broker, PaperBroker};
use clap::Parser;
use cycle_engine::config::CycleConfig;
use cycle_engine::coordinator::CoordinatorSettings;
use cycle_engine::engine::{EngineSettings, StrategyEngine};
use cycle_engine::placer::PlacerSettings;
use cycle_engine::router::TradeEvent;
use cycle_engine::store::{MemoryStore, RecordStore};
use rand::Rng;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncBufReadExt;
use tokio::sync::{mpsc, watch};
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser, Debug)]
#[command(about = "Run the cycle trading engine against a paper broker")]
struct Args {
    /// Initial bid price for the simulated feed.
    #[arg(long, default_value_t = 1.10000)]
    start_price: f64,

    /// Bid/ask spread of the simulated feed.
    #[arg(long, default_value_t = 0.00002)]
    spread: f64,

    /// Broker point size (pip = point * 10).
    #[arg(long, default_value_t = 0.00001)]
    point: f64,

    /// Maximum per-step move of the random walk, in points.
    #[arg(long, default_value_t = 20)]
    walk_points: u32,

    /// Enable interval-based cycle auto-creation.
    #[arg(long)]
    auto_place_cycles: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "bot_runner=info,cycle_engine=info,broker_core=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let args = Args::parse();
    let config = Config::from_env();
    info!(symbol = %config.bot.symbol, "starting cycle bot runner (paper mode)");

    let broker = Arc::new(PaperBroker::new(&config.bot.symbol, args.point));
    broker.set_quote(args.start_price, args.start_price + args.spread);
    let store = Arc::new(MemoryStore::new());

    let template = CycleConfig {
        auto_place_cycles: args.auto_place_cycles,
        ..Default::default()
    }
    .validated();

    let engine = StrategyEngine::new(
        config.bot.clone(),
        template.clone(),
        Arc::clone(&broker) as Arc<dyn Broker>,
        Arc::clone(&store) as Arc<dyn RecordStore>,
        EngineSettings {
            tick_interval: Duration::from_millis(config.bot.tick_interval_ms),
            snapshot_update_interval: Duration::from_secs(config.store.update_interval_secs),
            batch_interval: Duration::from_secs(config.store.batch_interval_secs),
            ..Default::default()
        },
        PlacerSettings::default(),
        CoordinatorSettings {
            max_active_cycles: template.max_active_cycles,
            ..Default::default()
        },
    )
    .await;

    let (command_tx, command_rx) = mpsc::channel::<TradeEvent>(64);
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    // Simulated quote feed: bounded random walk around the start price.
    {
        let broker = Arc::clone(&broker);
        let mut shutdown = shutdown_rx.clone();
        let (start, spread, step_points, point) =
            (args.start_price, args.spread, args.walk_points, args.point);
        tokio::spawn(async move {
            let mut bid = start;
            let mut tick = tokio::time::interval(Duration::from_millis(200));
            loop {
                tokio::select! {
                    _ = shutdown.changed() => break,
                    _ = tick.tick() => {
                        let step = rand::thread_rng()
                            .gen_range(-(step_points as i64)..=step_points as i64);
                        bid += step as f64 * point;
                        broker.set_quote(bid, bid + spread);
                    }
                }
            }
        });
    }

    // Command events as JSON lines on stdin.
    {
        let command_tx = command_tx.clone();
        tokio::spawn(async move {
            let mut lines = tokio::io::BufReader::new(tokio::io::stdin()).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                let line = line.trim().to_string();
                if line.is_empty() {
                    continue;
                }
                match serde_json::from_str::<serde_json::Value>(&line) {
                    Ok(value) => match TradeEvent::from_value(&value) {
                        Some(event) => {
                            if command_tx.send(event).await.is_err() {
                                break;
                            }
                        }
                        None => warn!("command line missing uuid, ignored"),
                    },
                    Err(err) => warn!(%err, "unparseable command line"),
                }
            }
        });
    }

    // Ctrl-c flips the shutdown switch.
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("shutdown requested");
            let _ = shutdown_tx.send(true);
        }
    });

    engine.run(command_rx, shutdown_rx).await;

    info!(
        cycles_written = store.write_count(),
        events_emitted = store.events().len(),
        "runner stopped"
    );
    Ok(())
}
