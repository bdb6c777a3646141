//! Process-level configuration.
//!
//! Strategy parameters live in the cycle engine's own config snapshot; this
//! module only covers identity, symbol, and store/tick pacing loaded from
//! the environment.

use serde::Deserialize;
use std::env;

/// Application configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub bot: BotConfig,
    pub store: StoreConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct BotConfig {
    /// Bot identifier used in store records and response events.
    pub bot_id: String,
    /// Account identifier used in store records and response events.
    pub account_id: String,
    /// Trading symbol, e.g. "EURUSD".
    pub symbol: String,
    /// Magic number stamped on broker orders. Changes apply to new cycles only.
    pub magic_number: i64,
    /// Tick loop interval in milliseconds.
    pub tick_interval_ms: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct StoreConfig {
    /// Minimum seconds between store writes for the same cycle.
    pub update_interval_secs: u64,
    /// Seconds between batch flushes of coalesced updates.
    pub batch_interval_secs: u64,
}

impl Config {
    /// Load configuration from environment variables.
    pub fn from_env() -> Self {
        dotenvy::dotenv().ok();

        Self {
            bot: BotConfig {
                bot_id: env::var("BOT_ID").unwrap_or_else(|_| "local-bot".to_string()),
                account_id: env::var("ACCOUNT_ID").unwrap_or_else(|_| "local-account".to_string()),
                symbol: env::var("SYMBOL").unwrap_or_else(|_| "EURUSD".to_string()),
                magic_number: env::var("MAGIC_NUMBER")
                    .ok()
                    .and_then(|s| s.parse().ok())
                    .unwrap_or(777_001),
                tick_interval_ms: env::var("TICK_INTERVAL_MS")
                    .ok()
                    .and_then(|s| s.parse().ok())
                    .unwrap_or(500),
            },
            store: StoreConfig {
                update_interval_secs: env::var("STORE_UPDATE_INTERVAL_SECS")
                    .ok()
                    .and_then(|s| s.parse().ok())
                    .unwrap_or(5),
                batch_interval_secs: env::var("STORE_BATCH_INTERVAL_SECS")
                    .ok()
                    .and_then(|s| s.parse().ok())
                    .unwrap_or(10),
            },
        }
    }
}
