//! Typed websocket event envelope shared by the operator and dashboard channels.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Closed set of server-originated event names.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    // Operator events
    IncomingCall,
    CallConnected,
    CallEnded,
    OperatorStatusChanged,

    // Dashboard events
    CampaignStatsUpdated,
    OperatorListUpdated,
    Alert,

    // System events
    Connected,
    Error,
    Ping,
    Pong,
}

/// The wire envelope: `{"event": ..., "data": ..., "timestamp": ...}`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WsMessage {
    pub event: EventType,
    pub data: Value,
    pub timestamp: DateTime<Utc>,
}

impl WsMessage {
    pub fn new(event: EventType, data: Value) -> Self {
        Self {
            event,
            data,
            timestamp: Utc::now(),
        }
    }

    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|_| "{}".to_string())
    }
}
