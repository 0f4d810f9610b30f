//! Campaign domain model, lifecycle state machine and derived statistics.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::lead::LeadStatus;

/// Campaign lifecycle status.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, sqlx::Type)]
#[serde(rename_all = "snake_case")]
#[sqlx(rename_all = "snake_case")]
pub enum CampaignStatus {
    Draft,
    Running,
    Paused,
    Stopped,
    Completed,
}

impl CampaignStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            CampaignStatus::Draft => "draft",
            CampaignStatus::Running => "running",
            CampaignStatus::Paused => "paused",
            CampaignStatus::Stopped => "stopped",
            CampaignStatus::Completed => "completed",
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum CampaignError {
    #[error("Cannot {action} campaign in {current} status{reason}",
        current = .current.as_str(),
        reason = .reason.as_ref().map(|r| format!(": {r}")).unwrap_or_default())]
    InvalidState {
        current: CampaignStatus,
        action: &'static str,
        reason: Option<String>,
    },

    #[error("Campaign name is required")]
    NameRequired,

    #[error("Campaign name must be at most 100 characters")]
    NameTooLong,

    #[error("Dial ratio must be between 0.001 and 10")]
    InvalidDialRatio,
}

impl CampaignError {
    fn state(current: CampaignStatus, action: &'static str) -> Self {
        CampaignError::InvalidState {
            current,
            action,
            reason: None,
        }
    }
}

/// Counts of leads by status, plus the orchestrator-maintained abandon counter.
///
/// Derived, never persisted. `abandoned_leads` counts live answers that
/// found no available operator and were hung up.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq)]
pub struct CampaignStats {
    pub total_leads: i64,
    pub pending_leads: i64,
    pub calling_leads: i64,
    pub connected_leads: i64,
    pub completed_leads: i64,
    pub failed_leads: i64,
    pub dnc_leads: i64,
    pub abandoned_leads: i64,
}

impl CampaignStats {
    /// `abandoned / (connected + abandoned)`, or 0 with no answered calls.
    pub fn abandon_rate(&self) -> f64 {
        let total_answered = self.connected_leads + self.abandoned_leads;
        if total_answered == 0 {
            return 0.0;
        }
        self.abandoned_leads as f64 / total_answered as f64
    }

    pub fn record(&mut self, status: LeadStatus, count: i64) {
        self.total_leads += count;
        match status {
            LeadStatus::Pending => self.pending_leads += count,
            LeadStatus::Calling => self.calling_leads += count,
            LeadStatus::Connected => self.connected_leads += count,
            LeadStatus::Completed => self.completed_leads += count,
            LeadStatus::Failed => self.failed_leads += count,
            LeadStatus::Dnc => self.dnc_leads += count,
        }
    }
}

/// A calling campaign: an owned batch of leads plus dialing configuration.
///
/// Leads are referenced through the repository by `campaign_id`, never
/// held as live pointers.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Campaign {
    pub id: Uuid,
    pub name: String,
    pub description: String,

    pub status: CampaignStatus,

    /// Concurrent outbound calls per waiting operator.
    pub dial_ratio: f64,
    pub caller_id: Option<String>,

    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl Campaign {
    pub fn new(name: impl Into<String>, description: impl Into<String>) -> Result<Self, CampaignError> {
        let name = name.into();
        if name.trim().is_empty() {
            return Err(CampaignError::NameRequired);
        }
        if name.chars().count() > 100 {
            return Err(CampaignError::NameTooLong);
        }

        let now = Utc::now();
        Ok(Self {
            id: Uuid::new_v4(),
            name,
            description: description.into(),
            status: CampaignStatus::Draft,
            dial_ratio: 3.0,
            caller_id: None,
            created_at: now,
            updated_at: now,
            started_at: None,
            completed_at: None,
        })
    }

    fn touch(&mut self) {
        self.updated_at = Utc::now();
    }

    /// Whether leads may currently be added (DRAFT, RUNNING or PAUSED).
    pub fn can_add_leads(&self) -> Result<(), CampaignError> {
        match self.status {
            CampaignStatus::Stopped | CampaignStatus::Completed => {
                Err(CampaignError::state(self.status, "add lead"))
            }
            _ => Ok(()),
        }
    }

    /// DRAFT -> RUNNING. Requires at least one lead.
    pub fn start(&mut self, lead_count: i64) -> Result<(), CampaignError> {
        if self.status != CampaignStatus::Draft {
            return Err(CampaignError::state(self.status, "start"));
        }
        if lead_count == 0 {
            return Err(CampaignError::InvalidState {
                current: self.status,
                action: "start",
                reason: Some("no leads in campaign".to_string()),
            });
        }

        self.status = CampaignStatus::Running;
        self.started_at = Some(Utc::now());
        self.touch();
        Ok(())
    }

    /// RUNNING -> PAUSED.
    pub fn pause(&mut self) -> Result<(), CampaignError> {
        if self.status != CampaignStatus::Running {
            return Err(CampaignError::state(self.status, "pause"));
        }
        self.status = CampaignStatus::Paused;
        self.touch();
        Ok(())
    }

    /// PAUSED -> RUNNING.
    pub fn resume(&mut self) -> Result<(), CampaignError> {
        if self.status != CampaignStatus::Paused {
            return Err(CampaignError::state(self.status, "resume"));
        }
        self.status = CampaignStatus::Running;
        self.touch();
        Ok(())
    }

    /// RUNNING or PAUSED -> STOPPED. Terminal.
    pub fn stop(&mut self) -> Result<(), CampaignError> {
        if !matches!(self.status, CampaignStatus::Running | CampaignStatus::Paused) {
            return Err(CampaignError::state(self.status, "stop"));
        }
        self.status = CampaignStatus::Stopped;
        self.touch();
        Ok(())
    }

    /// RUNNING -> COMPLETED once every lead is terminal. Terminal.
    ///
    /// Returns true if the status changed. Idempotent in the sense that
    /// a second call with the same counts is a no-op.
    pub fn check_completion(&mut self, stats: &CampaignStats) -> bool {
        if self.status != CampaignStatus::Running {
            return false;
        }
        if stats.pending_leads > 0 || stats.calling_leads > 0 || stats.connected_leads > 0 {
            return false;
        }

        self.status = CampaignStatus::Completed;
        self.completed_at = Some(Utc::now());
        self.touch();
        true
    }

    pub fn update_dial_ratio(&mut self, new_ratio: f64) -> Result<(), CampaignError> {
        validate_dial_ratio(new_ratio)?;
        self.dial_ratio = new_ratio;
        self.touch();
        Ok(())
    }

    pub fn set_caller_id(&mut self, caller_id: Option<String>) {
        self.caller_id = caller_id;
        self.touch();
    }
}

/// Dial ratio must be a positive real within the sanity cap.
pub fn validate_dial_ratio(ratio: f64) -> Result<(), CampaignError> {
    if !ratio.is_finite() || !(1e-3..=10.0).contains(&ratio) {
        return Err(CampaignError::InvalidDialRatio);
    }
    Ok(())
}
