//! Repository port: durable storage of campaigns and leads.
//!
//! Two implementations: [`postgres::PgRepository`] backed by sqlx, and
//! [`memory::MemoryRepository`] for tests and mock-mode runs. One call
//! is one commit; callers tolerate `Conflict` and retry.

pub mod memory;
pub mod postgres;

use std::collections::{HashMap, HashSet};

use async_trait::async_trait;
use uuid::Uuid;

use crate::models::{Campaign, Lead, LeadStatus};

#[derive(Debug, thiserror::Error)]
pub enum RepoError {
    #[error("Not found")]
    NotFound,

    #[error("Phone number {0} already exists in campaign")]
    DuplicatePhone(String),

    #[error("Conflicting concurrent update")]
    Conflict,

    #[error("Database error: {0}")]
    Database(String),
}

impl From<sqlx::Error> for RepoError {
    fn from(err: sqlx::Error) -> Self {
        match &err {
            sqlx::Error::RowNotFound => RepoError::NotFound,
            sqlx::Error::Database(db) if db.is_unique_violation() => {
                RepoError::DuplicatePhone(String::new())
            }
            _ => RepoError::Database(err.to_string()),
        }
    }
}

/// Storage contract required by the control plane.
#[async_trait]
pub trait Repository: Send + Sync {
    async fn create_campaign(&self, campaign: &Campaign) -> Result<(), RepoError>;
    async fn get_campaign(&self, id: Uuid) -> Result<Campaign, RepoError>;
    async fn list_campaigns(&self) -> Result<Vec<Campaign>, RepoError>;
    async fn update_campaign(&self, campaign: &Campaign) -> Result<(), RepoError>;

    /// Insert a lead; `DuplicatePhone` when (campaign_id, phone_number) exists.
    async fn add_lead(&self, lead: &Lead) -> Result<(), RepoError>;
    async fn get_lead(&self, id: Uuid) -> Result<Lead, RepoError>;

    /// All leads of a campaign ordered by creation time.
    async fn list_leads(&self, campaign_id: Uuid) -> Result<Vec<Lead>, RepoError>;

    /// First `limit` PENDING leads of a campaign in creation order.
    async fn callable_leads(&self, campaign_id: Uuid, limit: i64) -> Result<Vec<Lead>, RepoError>;

    async fn count_leads(&self, campaign_id: Uuid) -> Result<i64, RepoError>;
    async fn count_leads_by_status(
        &self,
        campaign_id: Uuid,
    ) -> Result<HashMap<LeadStatus, i64>, RepoError>;
    async fn existing_phone_numbers(&self, campaign_id: Uuid) -> Result<HashSet<String>, RepoError>;

    async fn update_lead(&self, lead: &Lead) -> Result<(), RepoError>;
    async fn delete_lead(&self, id: Uuid) -> Result<(), RepoError>;
}
