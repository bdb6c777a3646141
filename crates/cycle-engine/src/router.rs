//! Inbound command events and outbound responses.
//!
//! Commands arrive as JSON records (`{uuid, accountId, botId, contents}`)
//! and are made idempotent by a bounded set of processed event UUIDs.
//! Close-cycle commands answer with two response records: `processing` on
//! receipt and `completed`/`failed` on conclusion.

use chrono::Utc;
use serde_json::{json, Value};
use std::collections::{HashSet, VecDeque};
use std::sync::Mutex;
use uuid::Uuid;

/// A command event from the external channel.
#[derive(Debug, Clone)]
pub struct TradeEvent {
    pub uuid: String,
    pub account_id: String,
    pub bot_id: String,
    pub contents: Value,
}

impl TradeEvent {
    /// Decode the wire record, tolerating missing identity fields.
    pub fn from_value(value: &Value) -> Option<Self> {
        let uuid = value.get("uuid")?.as_str()?.to_string();
        Some(Self {
            uuid,
            account_id: value
                .get("accountId")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string(),
            bot_id: value
                .get("botId")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string(),
            contents: value.get("contents").cloned().unwrap_or(Value::Null),
        })
    }

    pub fn action(&self) -> Option<&str> {
        self.contents.get("action").and_then(Value::as_str)
    }

    pub fn content_str(&self, key: &str) -> Option<&str> {
        self.contents.get(key).and_then(Value::as_str)
    }

    pub fn content_u64(&self, key: &str) -> Option<u64> {
        self.contents.get(key).and_then(Value::as_u64)
    }

    pub fn user_name(&self) -> String {
        self.content_str("user_name")
            .or_else(|| self.content_str("username"))
            .unwrap_or("system")
            .to_string()
    }
}

/// Recognised command actions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandAction {
    OpenOrder,
    CloseOrder,
    ClosePendingOrder,
    CloseAllOrders,
    CloseAllPendingOrders,
    CloseCycle,
    CloseAllCycles,
    UpdateBot,
    StartBot,
    StopBot,
    UpdateOrderConfigs,
}

impl CommandAction {
    pub fn parse(action: &str) -> Option<Self> {
        match action {
            "open_order" => Some(Self::OpenOrder),
            "close_order" => Some(Self::CloseOrder),
            "close_pending_order" => Some(Self::ClosePendingOrder),
            "close_all_orders" => Some(Self::CloseAllOrders),
            "close_all_pending_orders" => Some(Self::CloseAllPendingOrders),
            "close_cycle" => Some(Self::CloseCycle),
            "close_all_cycles" => Some(Self::CloseAllCycles),
            "update_bot" => Some(Self::UpdateBot),
            "start_bot" => Some(Self::StartBot),
            "stop_bot" => Some(Self::StopBot),
            "update_order_configs" => Some(Self::UpdateOrderConfigs),
            _ => None,
        }
    }
}

/// Bounded set of already-processed event UUIDs.
pub struct ProcessedEvents {
    capacity: usize,
    inner: Mutex<(HashSet<String>, VecDeque<String>)>,
}

impl ProcessedEvents {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            inner: Mutex::new((HashSet::new(), VecDeque::new())),
        }
    }

    /// Record the UUID; false when it was already seen.
    pub fn insert(&self, uuid: &str) -> bool {
        let mut inner = self.inner.lock().unwrap();
        if inner.0.contains(uuid) {
            return false;
        }
        inner.0.insert(uuid.to_string());
        inner.1.push_back(uuid.to_string());
        if inner.1.len() > self.capacity {
            if let Some(evicted) = inner.1.pop_front() {
                inner.0.remove(&evicted);
            }
        }
        true
    }

    pub fn len(&self) -> usize {
        self.inner.lock().unwrap().1.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Response lifecycle status.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResponseStatus {
    Processing,
    Completed,
    Failed,
}

impl ResponseStatus {
    fn as_str(self) -> &'static str {
        match self {
            Self::Processing => "processing",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }
}

/// Build a close-cycle response record for the outbound channel.
pub fn close_cycle_response(
    event: &TradeEvent,
    status: ResponseStatus,
    action: &str,
    cycle_id: Option<&str>,
    details: Value,
) -> Value {
    json!({
        "uuid": format!("response_{}_{}", event.uuid, Uuid::new_v4()),
        "original_event_uuid": event.uuid,
        "type": "close_cycle_response",
        "bot_id": event.bot_id,
        "account_id": event.account_id,
        "user_name": event.user_name(),
        "timestamp": Utc::now().to_rfc3339(),
        "status": status.as_str(),
        "action": action,
        "cycle_id": cycle_id,
        "details": details,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn event(action: &str) -> TradeEvent {
        TradeEvent::from_value(&json!({
            "uuid": "evt-1",
            "accountId": "acct-1",
            "botId": "bot-1",
            "contents": {"action": action, "cycle_id": "c1", "user_name": "tester"},
        }))
        .unwrap()
    }

    #[test]
    fn decodes_wire_record() {
        let e = event("close_cycle");
        assert_eq!(e.uuid, "evt-1");
        assert_eq!(e.bot_id, "bot-1");
        assert_eq!(e.action(), Some("close_cycle"));
        assert_eq!(e.content_str("cycle_id"), Some("c1"));
        assert_eq!(e.user_name(), "tester");
    }

    #[test]
    fn known_actions_parse() {
        for (raw, parsed) in [
            ("open_order", CommandAction::OpenOrder),
            ("close_cycle", CommandAction::CloseCycle),
            ("close_all_cycles", CommandAction::CloseAllCycles),
            ("update_order_configs", CommandAction::UpdateOrderConfigs),
        ] {
            assert_eq!(CommandAction::parse(raw), Some(parsed));
        }
        assert_eq!(CommandAction::parse("dance"), None);
    }

    #[test]
    fn processed_events_dedup_with_bound() {
        let processed = ProcessedEvents::new(2);
        assert!(processed.insert("a"));
        assert!(!processed.insert("a"));
        assert!(processed.insert("b"));
        assert!(processed.insert("c"));
        // "a" was evicted by the bound and may be seen again.
        assert_eq!(processed.len(), 2);
        assert!(processed.insert("a"));
    }

    #[test]
    fn response_record_shape() {
        let e = event("close_cycle");
        let response = close_cycle_response(
            &e,
            ResponseStatus::Processing,
            "close_cycle",
            Some("c1"),
            json!({"received": true}),
        );
        assert_eq!(response["type"], "close_cycle_response");
        assert_eq!(response["original_event_uuid"], "evt-1");
        assert_eq!(response["status"], "processing");
        assert_eq!(response["cycle_id"], "c1");
        assert_eq!(response["details"]["received"], true);
    }
}
