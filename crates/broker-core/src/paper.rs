//! In-memory paper broker.
//!
//! Deterministic [`Broker`] implementation backing paper-trading mode and
//! the engine test suite. Quotes are pushed in with [`PaperBroker::set_quote`],
//! which also fills any pending stop whose trigger the new quote crossed and
//! stops out positions whose SL was breached, mirroring what a real terminal
//! does between two ticks.

use crate::broker::Broker;
use crate::error::{BrokerError, Result};
use crate::types::{Direction, OrderTicket, PendingOrder, Position, SymbolInfo};
use async_trait::async_trait;
use chrono::Utc;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Mutex;

/// Standard-lot contract size used for profit conversion.
const CONTRACT_SIZE: f64 = 100_000.0;

#[derive(Debug)]
struct State {
    info: SymbolInfo,
    bid: f64,
    ask: f64,
    next_ticket: u64,
    positions: HashMap<u64, Position>,
    pendings: HashMap<u64, PendingOrder>,
    /// Last known state of positions the broker has closed.
    closed: HashMap<u64, Position>,
    /// Errors injected for upcoming place calls, consumed FIFO.
    place_failures: VecDeque<BrokerError>,
    /// Pendings that fill concurrently with a cancel attempt.
    fill_on_cancel: HashSet<u64>,
}

pub struct PaperBroker {
    state: Mutex<State>,
}

impl PaperBroker {
    pub fn new(symbol: &str, point: f64) -> Self {
        Self {
            state: Mutex::new(State {
                info: SymbolInfo {
                    symbol: symbol.to_string(),
                    point,
                    digits: 5,
                    volume_min: 0.01,
                    volume_step: 0.01,
                },
                bid: 0.0,
                ask: 0.0,
                next_ticket: 1000,
                positions: HashMap::new(),
                pendings: HashMap::new(),
                closed: HashMap::new(),
                place_failures: VecDeque::new(),
                fill_on_cancel: HashSet::new(),
            }),
        }
    }

    /// Push a new quote and settle whatever it triggers.
    pub fn set_quote(&self, bid: f64, ask: f64) {
        let mut state = self.state.lock().unwrap();
        state.bid = bid;
        state.ask = ask;

        // Fill stop orders the quote crossed.
        let triggered: Vec<u64> = state
            .pendings
            .values()
            .filter(|p| match p.direction {
                Direction::Buy => ask >= p.target_price,
                Direction::Sell => bid <= p.target_price,
            })
            .map(|p| p.ticket)
            .collect();
        for ticket in triggered {
            fill_pending(&mut state, ticket);
        }

        // Stop out positions whose SL was breached.
        let stopped: Vec<u64> = state
            .positions
            .values()
            .filter(|p| {
                p.sl > 0.0
                    && match p.direction {
                        Direction::Buy => bid <= p.sl,
                        Direction::Sell => ask >= p.sl,
                    }
            })
            .map(|p| p.ticket)
            .collect();
        for ticket in stopped {
            let sl = state.positions[&ticket].sl;
            close_at(&mut state, ticket, sl);
        }

        refresh_floating(&mut state);
    }

    /// Inject an error consumed by the next `place_market`/`place_pending` call.
    pub fn fail_next_place(&self, error: BrokerError) {
        self.state.lock().unwrap().place_failures.push_back(error);
    }

    /// Make a cancel attempt on `ticket` race with a fill: the pending becomes
    /// a live position and the cancel itself is rejected.
    pub fn fill_on_cancel(&self, ticket: u64) {
        self.state.lock().unwrap().fill_on_cancel.insert(ticket);
    }

    /// Overwrite the floating profit of a live position.
    pub fn set_position_profit(&self, ticket: u64, profit: f64) {
        if let Some(p) = self.state.lock().unwrap().positions.get_mut(&ticket) {
            p.profit = profit;
        }
    }

    /// Force-close a position at the given price, as the broker would at SL.
    pub fn force_close(&self, ticket: u64, price: f64) {
        let mut state = self.state.lock().unwrap();
        close_at(&mut state, ticket, price);
    }

    /// Last known state of a broker-closed position.
    pub fn last_closed(&self, ticket: u64) -> Option<Position> {
        self.state.lock().unwrap().closed.get(&ticket).cloned()
    }

    pub fn pending_count(&self) -> usize {
        self.state.lock().unwrap().pendings.len()
    }

    pub fn position_count(&self) -> usize {
        self.state.lock().unwrap().positions.len()
    }

    pub fn pending_orders(&self) -> Vec<PendingOrder> {
        self.state.lock().unwrap().pendings.values().cloned().collect()
    }
}

fn alloc_ticket(state: &mut State) -> u64 {
    let ticket = state.next_ticket;
    state.next_ticket += 1;
    ticket
}

fn profit_at(direction: Direction, open: f64, close: f64, volume: f64) -> f64 {
    let diff = match direction {
        Direction::Buy => close - open,
        Direction::Sell => open - close,
    };
    diff * volume * CONTRACT_SIZE
}

fn fill_pending(state: &mut State, ticket: u64) {
    if let Some(pending) = state.pendings.remove(&ticket) {
        let current = match pending.direction {
            Direction::Buy => state.bid,
            Direction::Sell => state.ask,
        };
        let position = Position {
            ticket: pending.ticket,
            symbol: pending.symbol,
            direction: pending.direction,
            volume: pending.volume,
            price_open: pending.target_price,
            price_current: current,
            sl: pending.sl,
            tp: pending.tp,
            profit: profit_at(pending.direction, pending.target_price, current, pending.volume),
            comment: pending.comment,
            open_time: Utc::now(),
        };
        state.positions.insert(ticket, position);
    }
}

fn close_at(state: &mut State, ticket: u64, price: f64) {
    if let Some(mut position) = state.positions.remove(&ticket) {
        position.price_current = price;
        position.profit = profit_at(position.direction, position.price_open, price, position.volume);
        state.closed.insert(ticket, position);
    }
}

fn refresh_floating(state: &mut State) {
    let (bid, ask) = (state.bid, state.ask);
    for p in state.positions.values_mut() {
        p.price_current = match p.direction {
            Direction::Buy => bid,
            Direction::Sell => ask,
        };
        p.profit = profit_at(p.direction, p.price_open, p.price_current, p.volume);
    }
}

#[async_trait]
impl Broker for PaperBroker {
    async fn bid(&self, _symbol: &str) -> Result<f64> {
        Ok(self.state.lock().unwrap().bid)
    }

    async fn ask(&self, _symbol: &str) -> Result<f64> {
        Ok(self.state.lock().unwrap().ask)
    }

    async fn symbol_info(&self, _symbol: &str) -> Result<SymbolInfo> {
        Ok(self.state.lock().unwrap().info.clone())
    }

    async fn place_market(
        &self,
        symbol: &str,
        side: Direction,
        volume: f64,
        sl: f64,
        tp: f64,
        comment: &str,
    ) -> Result<OrderTicket> {
        let mut state = self.state.lock().unwrap();
        if let Some(err) = state.place_failures.pop_front() {
            return Err(err);
        }
        if volume <= 0.0 {
            return Err(BrokerError::InvalidVolume(volume));
        }
        let price_open = match side {
            Direction::Buy => state.ask,
            Direction::Sell => state.bid,
        };
        if price_open <= 0.0 {
            return Err(BrokerError::InvalidPrice(price_open));
        }
        let ticket = alloc_ticket(&mut state);
        let current = match side {
            Direction::Buy => state.bid,
            Direction::Sell => state.ask,
        };
        let position = Position {
            ticket,
            symbol: symbol.to_string(),
            direction: side,
            volume,
            price_open,
            price_current: current,
            sl,
            tp,
            profit: profit_at(side, price_open, current, volume),
            comment: comment.to_string(),
            open_time: Utc::now(),
        };
        state.positions.insert(ticket, position);
        Ok(OrderTicket { ticket, price_open })
    }

    async fn place_pending(
        &self,
        symbol: &str,
        side: Direction,
        target_price: f64,
        volume: f64,
        sl: f64,
        tp: f64,
        comment: &str,
    ) -> Result<OrderTicket> {
        let mut state = self.state.lock().unwrap();
        if let Some(err) = state.place_failures.pop_front() {
            return Err(err);
        }
        if volume <= 0.0 {
            return Err(BrokerError::InvalidVolume(volume));
        }
        // STOP discipline: BUY_STOP strictly above ask, SELL_STOP strictly below bid.
        let valid = match side {
            Direction::Buy => target_price > state.ask,
            Direction::Sell => target_price < state.bid,
        };
        if !valid {
            return Err(BrokerError::InvalidPrice(target_price));
        }
        let ticket = alloc_ticket(&mut state);
        let pending = PendingOrder {
            ticket,
            symbol: symbol.to_string(),
            direction: side,
            volume,
            target_price,
            sl,
            tp,
            comment: comment.to_string(),
            placed_time: Utc::now(),
        };
        state.pendings.insert(ticket, pending);
        Ok(OrderTicket {
            ticket,
            price_open: target_price,
        })
    }

    async fn modify_sl_tp(&self, ticket: u64, sl: f64, tp: f64) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        match state.positions.get_mut(&ticket) {
            Some(p) => {
                p.sl = sl;
                p.tp = tp;
                Ok(())
            }
            None => Err(BrokerError::NotFound(ticket)),
        }
    }

    async fn cancel_pending(&self, ticket: u64, _symbol: &str) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        if state.fill_on_cancel.remove(&ticket) && state.pendings.contains_key(&ticket) {
            fill_pending(&mut state, ticket);
            return Err(BrokerError::Rejected(format!(
                "pending {ticket} already triggered"
            )));
        }
        if state.pendings.remove(&ticket).is_none() {
            return Err(BrokerError::NotFound(ticket));
        }
        Ok(())
    }

    async fn close_position(&self, ticket: u64) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        if !state.positions.contains_key(&ticket) {
            return Err(BrokerError::NotFound(ticket));
        }
        let price = match state.positions[&ticket].direction {
            Direction::Buy => state.bid,
            Direction::Sell => state.ask,
        };
        close_at(&mut state, ticket, price);
        Ok(())
    }

    async fn position_by_ticket(&self, ticket: u64) -> Result<Option<Position>> {
        Ok(self.state.lock().unwrap().positions.get(&ticket).cloned())
    }

    async fn pending_by_ticket(&self, ticket: u64) -> Result<Option<PendingOrder>> {
        Ok(self.state.lock().unwrap().pendings.get(&ticket).cloned())
    }

    async fn list_positions(&self, symbol: &str) -> Result<Vec<Position>> {
        Ok(self
            .state
            .lock()
            .unwrap()
            .positions
            .values()
            .filter(|p| p.symbol == symbol)
            .cloned()
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio_test::{assert_err, assert_ok};

    fn broker() -> PaperBroker {
        let b = PaperBroker::new("EURUSD", 0.00001);
        b.set_quote(1.10000, 1.10002);
        b
    }

    #[tokio::test]
    async fn market_order_fills_at_side_price() {
        let b = broker();
        let t = assert_ok!(
            b.place_market("EURUSD", Direction::Buy, 0.01, 0.0, 0.0, "test")
                .await
        );
        assert!((t.price_open - 1.10002).abs() < 1e-9);
        assert_eq!(b.position_count(), 1);
    }

    #[tokio::test]
    async fn stop_order_requires_correct_side() {
        let b = broker();
        // BUY_STOP below the ask is rejected.
        let err = assert_err!(
            b.place_pending("EURUSD", Direction::Buy, 1.09000, 0.01, 0.0, 0.0, "test")
                .await
        );
        assert!(matches!(err, BrokerError::InvalidPrice(_)));
    }

    #[tokio::test]
    async fn quote_crossing_fills_stop() {
        let b = broker();
        let t = b
            .place_pending("EURUSD", Direction::Buy, 1.10312, 0.01, 0.0, 0.0, "test")
            .await
            .unwrap();
        assert_eq!(b.pending_count(), 1);
        b.set_quote(1.10312, 1.10314);
        assert_eq!(b.pending_count(), 0);
        let position = b.position_by_ticket(t.ticket).await.unwrap().unwrap();
        assert!((position.price_open - 1.10312).abs() < 1e-9);
    }

    #[tokio::test]
    async fn sl_breach_stops_out() {
        let b = broker();
        let t = b
            .place_market("EURUSD", Direction::Buy, 0.01, 1.09000, 0.0, "test")
            .await
            .unwrap();
        b.set_quote(1.08999, 1.09001);
        assert!(b.position_by_ticket(t.ticket).await.unwrap().is_none());
        let closed = b.last_closed(t.ticket).unwrap();
        assert!(closed.profit < 0.0);
    }

    #[tokio::test]
    async fn cancel_race_promotes_to_position() {
        let b = broker();
        let t = b
            .place_pending("EURUSD", Direction::Buy, 1.10312, 0.01, 0.0, 0.0, "test")
            .await
            .unwrap();
        b.fill_on_cancel(t.ticket);
        let err = assert_err!(b.cancel_pending(t.ticket, "EURUSD").await);
        assert!(matches!(err, BrokerError::Rejected(_)));
        assert!(b.position_by_ticket(t.ticket).await.unwrap().is_some());
    }
}
