//! Broker Core Library
//!
//! Broker port trait, typed broker errors, symbol/pip utilities, and the
//! in-memory paper broker used by tests and paper-trading mode.

pub mod broker;
pub mod config;
pub mod error;
pub mod market;
pub mod paper;
pub mod types;

pub use broker::Broker;
pub use error::{BrokerError, Result};
pub use paper::PaperBroker;
