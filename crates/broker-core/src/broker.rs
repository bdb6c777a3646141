//! The broker port.
//!
//! A narrow capability set over a MetaTrader-like terminal. The engine only
//! ever talks to the broker through this trait, which keeps the core free of
//! terminal-specific details and makes it testable against [`crate::PaperBroker`].

use crate::error::Result;
use crate::types::{Direction, OrderTicket, PendingOrder, Position, SymbolInfo};
use async_trait::async_trait;

/// Broker capability set used by the cycle engine.
///
/// Stop-order discipline is part of the contract: pendings are STOP orders,
/// BUY strictly above the current ask and SELL strictly below the current
/// bid. Implementations MAY re-quote a violating target at the minimum
/// distance instead of rejecting it.
#[async_trait]
pub trait Broker: Send + Sync {
    async fn bid(&self, symbol: &str) -> Result<f64>;

    async fn ask(&self, symbol: &str) -> Result<f64>;

    async fn symbol_info(&self, symbol: &str) -> Result<SymbolInfo>;

    /// Place a market order. Returns the ticket and actual open price.
    async fn place_market(
        &self,
        symbol: &str,
        side: Direction,
        volume: f64,
        sl: f64,
        tp: f64,
        comment: &str,
    ) -> Result<OrderTicket>;

    /// Place a pending STOP order at `target_price`.
    async fn place_pending(
        &self,
        symbol: &str,
        side: Direction,
        target_price: f64,
        volume: f64,
        sl: f64,
        tp: f64,
        comment: &str,
    ) -> Result<OrderTicket>;

    /// Modify the SL/TP of a live position.
    ///
    /// Returns [`crate::BrokerError::NotFound`] when the position no longer
    /// exists; the engine treats that as "already closed".
    async fn modify_sl_tp(&self, ticket: u64, sl: f64, tp: f64) -> Result<()>;

    /// Cancel a pending order.
    ///
    /// MUST fail if the pending has since become an active position; the
    /// engine then detects the position and reclassifies locally.
    async fn cancel_pending(&self, ticket: u64, symbol: &str) -> Result<()>;

    /// Close a live position at market.
    async fn close_position(&self, ticket: u64) -> Result<()>;

    async fn position_by_ticket(&self, ticket: u64) -> Result<Option<Position>>;

    async fn pending_by_ticket(&self, ticket: u64) -> Result<Option<PendingOrder>>;

    async fn list_positions(&self, symbol: &str) -> Result<Vec<Position>>;
}
