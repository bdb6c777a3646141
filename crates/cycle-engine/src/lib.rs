//! Cycle Engine
//!
//! Automated multi-cycle grid/zone trading core. Each cycle is a state
//! machine over price: a zone bounds the traded region, a grid of pending
//! stop orders is kept ahead of price outside the zone, a trailing stop
//! migrates with price extremes and resets the cycle when breached, and an
//! optional recovery sub-mode adds same-direction orders under drawdown.
//!
//! The engine talks to the terminal only through the `broker-core` port and
//! to persistence only through the [`store::RecordStore`] port.

pub mod config;
pub mod coordinator;
pub mod cycle;
pub mod engine;
pub mod grid;
pub mod order;
pub mod placer;
pub mod reconcile;
pub mod recovery;
pub mod router;
pub mod snapshot;
pub mod store;
pub mod take_profit;
pub mod trailing;
pub mod zone;

pub use config::{CycleConfig, ZoneMovementMode};
pub use coordinator::CycleCoordinator;
pub use cycle::Cycle;
pub use engine::StrategyEngine;
pub use placer::ResilientPlacer;
