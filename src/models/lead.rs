//! Lead domain model and status state machine.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Lead status in the calling workflow.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, sqlx::Type)]
#[serde(rename_all = "snake_case")]
#[sqlx(rename_all = "snake_case")]
pub enum LeadStatus {
    Pending,
    Calling,
    Connected,
    Completed,
    Failed,
    Dnc,
}

impl LeadStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            LeadStatus::Pending => "pending",
            LeadStatus::Calling => "calling",
            LeadStatus::Connected => "connected",
            LeadStatus::Completed => "completed",
            LeadStatus::Failed => "failed",
            LeadStatus::Dnc => "dnc",
        }
    }

    /// Terminal statuses never transition out (DNC marking aside).
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            LeadStatus::Completed | LeadStatus::Failed | LeadStatus::Dnc
        )
    }
}

#[derive(Debug, thiserror::Error)]
pub enum LeadError {
    #[error("Cannot {action} from status {current}", current = .current.as_str())]
    InvalidTransition {
        current: LeadStatus,
        action: &'static str,
    },

    #[error("Retry limit reached ({max_retries} retries)")]
    RetryLimitReached { max_retries: i32 },

    #[error("Invalid phone number format: {0}. Must be E.164 (e.g., +818011112222)")]
    InvalidPhoneNumber(String),
}

/// Validate a phone number as E.164: `+`, a leading digit 1-9, then 1-14 digits.
pub fn validate_phone_number(phone: &str) -> Result<(), LeadError> {
    let invalid = || LeadError::InvalidPhoneNumber(phone.to_string());

    let rest = phone.strip_prefix('+').ok_or_else(invalid)?;
    let mut chars = rest.chars();

    match chars.next() {
        Some(c) if c.is_ascii_digit() && c != '0' => {}
        _ => return Err(invalid()),
    }

    let tail: Vec<char> = chars.collect();
    if tail.is_empty() || tail.len() > 14 || !tail.iter().all(|c| c.is_ascii_digit()) {
        return Err(invalid());
    }

    Ok(())
}

/// One entry of a lead's append-only call history.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CallAttempt {
    pub timestamp: DateTime<Utc>,
    pub attempt_number: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub outcome: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

/// A prospective callee within a campaign.
///
/// Tracks the calling status, retry accounting and call history. All
/// status changes go through the transition methods below.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Lead {
    pub id: Uuid,
    pub campaign_id: Uuid,
    pub phone_number: String,
    pub name: Option<String>,
    pub company: Option<String>,
    pub email: Option<String>,
    pub notes: Option<String>,

    pub status: LeadStatus,
    pub outcome: Option<String>,
    pub fail_reason: Option<String>,

    pub retry_count: i32,
    pub max_retries: i32,

    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub last_called_at: Option<DateTime<Utc>>,

    pub call_history: Vec<CallAttempt>,
}

impl Lead {
    /// Create a new PENDING lead. The phone number must be E.164.
    pub fn new(campaign_id: Uuid, phone_number: impl Into<String>) -> Result<Self, LeadError> {
        let phone_number = phone_number.into();
        validate_phone_number(&phone_number)?;

        let now = Utc::now();
        Ok(Self {
            id: Uuid::new_v4(),
            campaign_id,
            phone_number,
            name: None,
            company: None,
            email: None,
            notes: None,
            status: LeadStatus::Pending,
            outcome: None,
            fail_reason: None,
            retry_count: 0,
            max_retries: 3,
            created_at: now,
            updated_at: now,
            last_called_at: None,
            call_history: Vec::new(),
        })
    }

    fn touch(&mut self) {
        self.updated_at = Utc::now();
    }

    fn require_status(
        &self,
        allowed: &[LeadStatus],
        action: &'static str,
    ) -> Result<(), LeadError> {
        if allowed.contains(&self.status) {
            Ok(())
        } else {
            Err(LeadError::InvalidTransition {
                current: self.status,
                action,
            })
        }
    }

    /// PENDING -> CALLING. Sets `last_called_at`.
    pub fn start_calling(&mut self) -> Result<(), LeadError> {
        self.require_status(&[LeadStatus::Pending], "start_calling")?;
        self.status = LeadStatus::Calling;
        self.last_called_at = Some(Utc::now());
        self.touch();
        Ok(())
    }

    /// CALLING -> CONNECTED, after AMD detects a human and an operator is bridged.
    pub fn connect(&mut self) -> Result<(), LeadError> {
        self.require_status(&[LeadStatus::Calling], "connect")?;
        self.status = LeadStatus::Connected;
        self.touch();
        Ok(())
    }

    /// CONNECTED -> COMPLETED with an outcome tag (e.g. "interested").
    pub fn complete(&mut self, outcome: impl Into<String>) -> Result<(), LeadError> {
        self.require_status(&[LeadStatus::Connected], "complete")?;
        let outcome = outcome.into();
        self.status = LeadStatus::Completed;
        self.outcome = Some(outcome.clone());
        self.record_attempt(Some(outcome), None);
        self.touch();
        Ok(())
    }

    /// CALLING -> FAILED with a reason tag (e.g. "no_answer", "busy").
    pub fn fail(&mut self, reason: impl Into<String>) -> Result<(), LeadError> {
        self.require_status(&[LeadStatus::Calling], "fail")?;
        let reason = reason.into();
        self.status = LeadStatus::Failed;
        self.fail_reason = Some(reason.clone());
        self.record_attempt(None, Some(reason));
        self.touch();
        Ok(())
    }

    /// FAILED -> PENDING for another attempt, consuming one retry.
    pub fn retry(&mut self) -> Result<(), LeadError> {
        self.require_status(&[LeadStatus::Failed], "retry")?;

        if self.retry_count >= self.max_retries {
            return Err(LeadError::RetryLimitReached {
                max_retries: self.max_retries,
            });
        }

        self.status = LeadStatus::Pending;
        self.retry_count += 1;
        self.fail_reason = None;
        self.touch();
        Ok(())
    }

    /// Mark the lead Do-Not-Call. Terminal; idempotent when already DNC.
    pub fn mark_dnc(&mut self) {
        if self.status == LeadStatus::Dnc {
            return;
        }
        self.status = LeadStatus::Dnc;
        self.touch();
    }

    pub fn can_be_called(&self) -> bool {
        self.status == LeadStatus::Pending
    }

    fn record_attempt(&mut self, outcome: Option<String>, reason: Option<String>) {
        let attempt_number = self.call_history.len() + 1;
        self.call_history.push(CallAttempt {
            timestamp: Utc::now(),
            attempt_number,
            outcome,
            reason,
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn lead() -> Lead {
        Lead::new(Uuid::new_v4(), "+818011112222").unwrap()
    }

    #[test]
    fn validates_phone_number_on_creation() {
        assert!(Lead::new(Uuid::new_v4(), "+818011112222").is_ok());
        assert!(Lead::new(Uuid::new_v4(), "0801111222").is_err());
        assert!(Lead::new(Uuid::new_v4(), "+0801111222").is_err());
        assert!(Lead::new(Uuid::new_v4(), "").is_err());
        assert!(Lead::new(Uuid::new_v4(), "+8180abc12222").is_err());
        // 15 digits total is the E.164 maximum
        assert!(Lead::new(Uuid::new_v4(), "+123456789012345").is_ok());
        assert!(Lead::new(Uuid::new_v4(), "+1234567890123456").is_err());
        // "+" plus a single digit is too short
        assert!(Lead::new(Uuid::new_v4(), "+1").is_err());
        assert!(Lead::new(Uuid::new_v4(), "+12").is_ok());
    }

    #[test]
    fn full_happy_path() {
        let mut l = lead();
        assert_eq!(l.status, LeadStatus::Pending);
        assert!(l.last_called_at.is_none());

        l.start_calling().unwrap();
        assert_eq!(l.status, LeadStatus::Calling);
        assert!(l.last_called_at.is_some());

        l.connect().unwrap();
        assert_eq!(l.status, LeadStatus::Connected);

        l.complete("interested").unwrap();
        assert_eq!(l.status, LeadStatus::Completed);
        assert_eq!(l.outcome.as_deref(), Some("interested"));
        assert_eq!(l.call_history.len(), 1);
        assert_eq!(l.call_history[0].attempt_number, 1);
        assert_eq!(l.call_history[0].outcome.as_deref(), Some("interested"));
    }

    #[test]
    fn fail_records_reason_and_history() {
        let mut l = lead();
        l.start_calling().unwrap();
        l.fail("no_answer").unwrap();

        assert_eq!(l.status, LeadStatus::Failed);
        assert_eq!(l.fail_reason.as_deref(), Some("no_answer"));
        assert_eq!(l.call_history.len(), 1);
        assert_eq!(l.call_history[0].reason.as_deref(), Some("no_answer"));
    }

    #[test]
    fn retry_resets_to_pending_and_increments_counter() {
        let mut l = lead();
        l.start_calling().unwrap();
        l.fail("busy").unwrap();
        l.retry().unwrap();

        assert_eq!(l.status, LeadStatus::Pending);
        assert_eq!(l.retry_count, 1);
        assert!(l.fail_reason.is_none());
    }

    #[test]
    fn retry_rejected_at_limit() {
        let mut l = lead();
        for _ in 0..3 {
            l.start_calling().unwrap();
            l.fail("busy").unwrap();
            l.retry().unwrap();
        }
        assert_eq!(l.retry_count, 3);

        l.start_calling().unwrap();
        l.fail("busy").unwrap();
        let err = l.retry().unwrap_err();
        assert!(matches!(err, LeadError::RetryLimitReached { .. }));
        // The failed state is untouched by the rejected retry
        assert_eq!(l.status, LeadStatus::Failed);
        assert_eq!(l.retry_count, 3);
    }

    #[test]
    fn illegal_transitions_leave_state_untouched() {
        let mut l = lead();
        let before = l.clone();

        assert!(l.connect().is_err());
        assert!(l.complete("x").is_err());
        assert!(l.fail("x").is_err());
        assert!(l.retry().is_err());

        assert_eq!(l.status, before.status);
        assert_eq!(l.call_history, before.call_history);
        assert_eq!(l.updated_at, before.updated_at);
        assert_eq!(l.last_called_at, before.last_called_at);
    }

    #[test]
    fn completed_lead_cannot_be_called_again() {
        let mut l = lead();
        l.start_calling().unwrap();
        l.connect().unwrap();
        l.complete("done").unwrap();

        assert!(l.start_calling().is_err());
        assert!(l.fail("x").is_err());
    }

    #[test]
    fn mark_dnc_is_terminal_and_idempotent() {
        let mut l = lead();
        l.mark_dnc();
        assert_eq!(l.status, LeadStatus::Dnc);

        let updated = l.updated_at;
        l.mark_dnc();
        assert_eq!(l.status, LeadStatus::Dnc);
        assert_eq!(l.updated_at, updated);

        assert!(l.start_calling().is_err());
        assert!(l.retry().is_err());
    }

    #[test]
    fn mark_dnc_allowed_mid_call() {
        let mut l = lead();
        l.start_calling().unwrap();
        l.mark_dnc();
        assert_eq!(l.status, LeadStatus::Dnc);
    }

    #[test]
    fn history_accumulates_across_attempts() {
        let mut l = lead();
        l.start_calling().unwrap();
        l.fail("busy").unwrap();
        l.retry().unwrap();
        l.start_calling().unwrap();
        l.connect().unwrap();
        l.complete("callback").unwrap();

        assert_eq!(l.call_history.len(), 2);
        assert_eq!(l.call_history[0].attempt_number, 1);
        assert_eq!(l.call_history[1].attempt_number, 2);
        assert_eq!(l.call_history[1].outcome.as_deref(), Some("callback"));
    }
}
