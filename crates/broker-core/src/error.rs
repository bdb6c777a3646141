//! Error types for the broker port.

use std::time::Duration;
use thiserror::Error;

/// Typed broker failures.
///
/// `NotFound` is common and benign: the ticket is gone on the broker side and
/// callers normalise local state to closed/cancelled. Everything else is
/// either corrected locally (`Rejected`, `InvalidPrice`) or waited out
/// (`MarketClosed`, `ConnectionLost`).
#[derive(Error, Debug, Clone, PartialEq)]
pub enum BrokerError {
    #[error("ticket {0} not found")]
    NotFound(u64),

    #[error("invalid price {0}")]
    InvalidPrice(f64),

    #[error("invalid volume {0}")]
    InvalidVolume(f64),

    #[error("market closed")]
    MarketClosed,

    #[error("connection lost: {0}")]
    ConnectionLost(String),

    #[error("rejected by broker: {0}")]
    Rejected(String),

    #[error("broker call timed out after {0:?}")]
    Timeout(Duration),

    #[error("broker error: {0}")]
    Unknown(String),
}

impl BrokerError {
    /// True when the ticket no longer exists on the broker.
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound(_))
    }

    /// True when the failure is transient and worth retrying.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::ConnectionLost(_) | Self::Timeout(_) | Self::Rejected(_) | Self::Unknown(_)
        )
    }
}

pub type Result<T> = std::result::Result<T, BrokerError>;
