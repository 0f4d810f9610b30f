//! Operator session state.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Operator availability status.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum OperatorStatus {
    Offline,
    Available,
    OnCall,
    OnBreak,
    WrapUp,
}

impl OperatorStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            OperatorStatus::Offline => "offline",
            OperatorStatus::Available => "available",
            OperatorStatus::OnCall => "on_call",
            OperatorStatus::OnBreak => "on_break",
            OperatorStatus::WrapUp => "wrap_up",
        }
    }
}

/// One operator's volatile session: status, current call binding,
/// idle timing and per-session counters.
///
/// `idle_since` is Some exactly while the status is AVAILABLE.
#[derive(Debug, Clone)]
pub struct OperatorSession {
    pub id: String,
    pub name: String,
    pub status: OperatorStatus,

    pub current_call_sid: Option<String>,
    pub current_lead_id: Option<Uuid>,

    idle_since: Option<DateTime<Utc>>,
    call_started_at: Option<DateTime<Utc>>,
    pub session_started_at: Option<DateTime<Utc>>,

    pub calls_handled: u32,
    pub total_talk_time_seconds: u64,
}

impl OperatorSession {
    pub fn new(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            status: OperatorStatus::Offline,
            current_call_sid: None,
            current_lead_id: None,
            idle_since: None,
            call_started_at: None,
            session_started_at: None,
            calls_handled: 0,
            total_talk_time_seconds: 0,
        }
    }

    pub fn idle_since(&self) -> Option<DateTime<Utc>> {
        self.idle_since
    }

    /// Seconds spent waiting for a call; 0 unless AVAILABLE.
    pub fn idle_duration_seconds(&self) -> f64 {
        match self.idle_since {
            Some(since) => (Utc::now() - since).num_milliseconds() as f64 / 1000.0,
            None => 0.0,
        }
    }

    pub fn go_online(&mut self) {
        self.status = OperatorStatus::Available;
        self.idle_since = Some(Utc::now());
        self.session_started_at = Some(Utc::now());
    }

    /// Any status -> OFFLINE. Clears the current call binding.
    pub fn go_offline(&mut self) {
        self.status = OperatorStatus::Offline;
        self.idle_since = None;
        self.current_call_sid = None;
        self.current_lead_id = None;
    }

    pub fn start_call(&mut self, call_sid: impl Into<String>, lead_id: Uuid) {
        self.status = OperatorStatus::OnCall;
        self.current_call_sid = Some(call_sid.into());
        self.current_lead_id = Some(lead_id);
        self.call_started_at = Some(Utc::now());
        self.idle_since = None;
    }

    /// End the current call, accumulate talk time, return to AVAILABLE.
    pub fn end_call(&mut self) {
        if let Some(started) = self.call_started_at {
            let talked = (Utc::now() - started).num_seconds().max(0) as u64;
            self.total_talk_time_seconds += talked;
            self.calls_handled += 1;
        }

        self.status = OperatorStatus::Available;
        self.current_call_sid = None;
        self.current_lead_id = None;
        self.call_started_at = None;
        self.idle_since = Some(Utc::now());
    }

    pub fn go_on_break(&mut self) {
        self.status = OperatorStatus::OnBreak;
        self.idle_since = None;
    }

    pub fn return_from_break(&mut self) {
        self.status = OperatorStatus::Available;
        self.idle_since = Some(Utc::now());
    }

    pub fn start_wrap_up(&mut self) {
        self.status = OperatorStatus::WrapUp;
        self.idle_since = None;
    }

    pub fn end_wrap_up(&mut self) {
        self.status = OperatorStatus::Available;
        self.idle_since = Some(Utc::now());
    }

    pub fn is_available(&self) -> bool {
        self.status == OperatorStatus::Available
    }

    pub fn snapshot(&self) -> OperatorInfo {
        OperatorInfo {
            id: self.id.clone(),
            name: self.name.clone(),
            status: self.status,
            current_call_sid: self.current_call_sid.clone(),
            current_lead_id: self.current_lead_id,
            idle_duration_seconds: self.idle_duration_seconds(),
            calls_handled: self.calls_handled,
            total_talk_time_seconds: self.total_talk_time_seconds,
        }
    }
}

/// Serializable view of an operator session for websocket payloads.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OperatorInfo {
    pub id: String,
    pub name: String,
    pub status: OperatorStatus,
    pub current_call_sid: Option<String>,
    pub current_lead_id: Option<Uuid>,
    pub idle_duration_seconds: f64,
    pub calls_handled: u32,
    pub total_talk_time_seconds: u64,
}
