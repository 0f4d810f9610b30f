//! Telephony port: outbound calls, conferences and AMD signals.
//!
//! Backed either by the real Twilio REST API ([`twilio::TwilioClient`])
//! or by a timer-driven mock ([`mock::MockTelephony`]) that simulates
//! call progression without a provider account.

pub mod mock;
pub mod twilio;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

#[derive(Debug, thiserror::Error)]
pub enum TelephonyError {
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Provider API error: {message}")]
    Api { message: String },

    #[error("Call {0} not found")]
    CallNotFound(String),

    #[error("Conference {0} not found")]
    ConferenceNotFound(String),
}

/// Provider call status. Wire names use the provider's hyphenated forms.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum CallStatus {
    #[serde(rename = "queued")]
    Queued,
    #[serde(rename = "ringing")]
    Ringing,
    #[serde(rename = "in-progress")]
    InProgress,
    #[serde(rename = "completed")]
    Completed,
    #[serde(rename = "busy")]
    Busy,
    #[serde(rename = "failed")]
    Failed,
    #[serde(rename = "no-answer")]
    NoAnswer,
    #[serde(rename = "canceled")]
    Canceled,
}

impl CallStatus {
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "queued" => Some(CallStatus::Queued),
            "ringing" => Some(CallStatus::Ringing),
            "in-progress" => Some(CallStatus::InProgress),
            "completed" => Some(CallStatus::Completed),
            "busy" => Some(CallStatus::Busy),
            "failed" => Some(CallStatus::Failed),
            "no-answer" => Some(CallStatus::NoAnswer),
            "canceled" => Some(CallStatus::Canceled),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            CallStatus::Queued => "queued",
            CallStatus::Ringing => "ringing",
            CallStatus::InProgress => "in-progress",
            CallStatus::Completed => "completed",
            CallStatus::Busy => "busy",
            CallStatus::Failed => "failed",
            CallStatus::NoAnswer => "no-answer",
            CallStatus::Canceled => "canceled",
        }
    }
}

/// Answering Machine Detection results.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum AmdResult {
    Human,
    MachineStart,
    MachineEndBeep,
    MachineEndSilence,
    MachineEndOther,
    Fax,
    Unknown,
}

impl AmdResult {
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "human" => Some(AmdResult::Human),
            "machine_start" => Some(AmdResult::MachineStart),
            "machine_end_beep" => Some(AmdResult::MachineEndBeep),
            "machine_end_silence" => Some(AmdResult::MachineEndSilence),
            "machine_end_other" => Some(AmdResult::MachineEndOther),
            "fax" => Some(AmdResult::Fax),
            "unknown" => Some(AmdResult::Unknown),
            _ => None,
        }
    }

    pub fn is_machine(&self) -> bool {
        matches!(
            self,
            AmdResult::MachineStart
                | AmdResult::MachineEndBeep
                | AmdResult::MachineEndSilence
                | AmdResult::MachineEndOther
        )
    }
}

/// Result of a call initiation.
#[derive(Debug, Clone)]
pub struct CallResult {
    pub call_sid: String,
    pub status: CallStatus,
    pub to: String,
    pub from: String,
}

/// Conference room info.
#[derive(Debug, Clone)]
pub struct Conference {
    pub sid: String,
    pub friendly_name: String,
    pub status: String,
}

/// Call-progress signal pushed by the mock (the real provider delivers
/// these through the webhook endpoints instead).
#[derive(Debug, Clone)]
pub enum TelephonyEvent {
    StatusChanged {
        call_sid: String,
        status: CallStatus,
    },
    Amd {
        call_sid: String,
        result: AmdResult,
    },
}

/// Capability set the control plane needs from the telephony provider.
#[async_trait]
pub trait TelephonyPort: Send + Sync {
    /// Initiate an outbound call; both numbers are E.164.
    async fn make_call(
        &self,
        to: &str,
        from: &str,
        status_callback_url: Option<&str>,
        machine_detection: bool,
    ) -> Result<CallResult, TelephonyError>;

    async fn create_conference(&self, friendly_name: &str) -> Result<Conference, TelephonyError>;

    async fn add_participant_to_conference(
        &self,
        conference_sid: &str,
        call_sid: &str,
        muted: bool,
        hold: bool,
    ) -> Result<(), TelephonyError>;

    async fn hangup_call(&self, call_sid: &str) -> Result<(), TelephonyError>;

    async fn get_call_status(&self, call_sid: &str) -> Result<CallStatus, TelephonyError>;
}
