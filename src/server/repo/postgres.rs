//! PostgreSQL repository backed by sqlx.

use std::collections::{HashMap, HashSet};

use async_trait::async_trait;
use sqlx::postgres::PgPoolOptions;
use sqlx::types::Json;
use sqlx::{PgPool, Row};
use std::time::Duration;
use uuid::Uuid;

use crate::models::lead::CallAttempt;
use crate::models::{Campaign, CampaignStatus, Lead, LeadStatus};

use super::{RepoError, Repository};

/// Initialize the database connection pool.
pub async fn init_pool(database_url: &str) -> Result<PgPool, sqlx::Error> {
    PgPoolOptions::new()
        .max_connections(10)
        .acquire_timeout(Duration::from_secs(5))
        .connect(database_url)
        .await
}

/// Run database migrations.
pub async fn run_migrations(pool: &PgPool) -> Result<(), sqlx::migrate::MigrateError> {
    sqlx::migrate!("./migrations").run(pool).await
}

pub struct PgRepository {
    pool: PgPool,
}

impl PgRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[derive(sqlx::FromRow)]
struct CampaignRow {
    id: Uuid,
    name: String,
    description: String,
    status: CampaignStatus,
    dial_ratio: f64,
    caller_id: Option<String>,
    created_at: chrono::DateTime<chrono::Utc>,
    updated_at: chrono::DateTime<chrono::Utc>,
    started_at: Option<chrono::DateTime<chrono::Utc>>,
    completed_at: Option<chrono::DateTime<chrono::Utc>>,
}

impl From<CampaignRow> for Campaign {
    fn from(row: CampaignRow) -> Self {
        Campaign {
            id: row.id,
            name: row.name,
            description: row.description,
            status: row.status,
            dial_ratio: row.dial_ratio,
            caller_id: row.caller_id,
            created_at: row.created_at,
            updated_at: row.updated_at,
            started_at: row.started_at,
            completed_at: row.completed_at,
        }
    }
}

#[derive(sqlx::FromRow)]
struct LeadRow {
    id: Uuid,
    campaign_id: Uuid,
    phone_number: String,
    name: Option<String>,
    company: Option<String>,
    email: Option<String>,
    notes: Option<String>,
    status: LeadStatus,
    outcome: Option<String>,
    fail_reason: Option<String>,
    retry_count: i32,
    max_retries: i32,
    created_at: chrono::DateTime<chrono::Utc>,
    updated_at: chrono::DateTime<chrono::Utc>,
    last_called_at: Option<chrono::DateTime<chrono::Utc>>,
    call_history: Json<Vec<CallAttempt>>,
}

impl From<LeadRow> for Lead {
    fn from(row: LeadRow) -> Self {
        Lead {
            id: row.id,
            campaign_id: row.campaign_id,
            phone_number: row.phone_number,
            name: row.name,
            company: row.company,
            email: row.email,
            notes: row.notes,
            status: row.status,
            outcome: row.outcome,
            fail_reason: row.fail_reason,
            retry_count: row.retry_count,
            max_retries: row.max_retries,
            created_at: row.created_at,
            updated_at: row.updated_at,
            last_called_at: row.last_called_at,
            call_history: row.call_history.0,
        }
    }
}

const CAMPAIGN_COLUMNS: &str = "id, name, description, status, dial_ratio, caller_id, \
     created_at, updated_at, started_at, completed_at";

const LEAD_COLUMNS: &str = "id, campaign_id, phone_number, name, company, email, notes, \
     status, outcome, fail_reason, retry_count, max_retries, \
     created_at, updated_at, last_called_at, call_history";

#[async_trait]
impl Repository for PgRepository {
    async fn create_campaign(&self, campaign: &Campaign) -> Result<(), RepoError> {
        sqlx::query(
            r#"
            INSERT INTO campaigns (id, name, description, status, dial_ratio, caller_id,
                                   created_at, updated_at, started_at, completed_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
            "#,
        )
        .bind(campaign.id)
        .bind(&campaign.name)
        .bind(&campaign.description)
        .bind(campaign.status)
        .bind(campaign.dial_ratio)
        .bind(&campaign.caller_id)
        .bind(campaign.created_at)
        .bind(campaign.updated_at)
        .bind(campaign.started_at)
        .bind(campaign.completed_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get_campaign(&self, id: Uuid) -> Result<Campaign, RepoError> {
        let row = sqlx::query_as::<_, CampaignRow>(&format!(
            "SELECT {CAMPAIGN_COLUMNS} FROM campaigns WHERE id = $1"
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await?
        .ok_or(RepoError::NotFound)?;
        Ok(row.into())
    }

    async fn list_campaigns(&self) -> Result<Vec<Campaign>, RepoError> {
        let rows = sqlx::query_as::<_, CampaignRow>(&format!(
            "SELECT {CAMPAIGN_COLUMNS} FROM campaigns ORDER BY created_at"
        ))
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(Into::into).collect())
    }

    async fn update_campaign(&self, campaign: &Campaign) -> Result<(), RepoError> {
        let result = sqlx::query(
            r#"
            UPDATE campaigns
            SET name = $2, description = $3, status = $4, dial_ratio = $5,
                caller_id = $6, updated_at = $7, started_at = $8, completed_at = $9
            WHERE id = $1
            "#,
        )
        .bind(campaign.id)
        .bind(&campaign.name)
        .bind(&campaign.description)
        .bind(campaign.status)
        .bind(campaign.dial_ratio)
        .bind(&campaign.caller_id)
        .bind(campaign.updated_at)
        .bind(campaign.started_at)
        .bind(campaign.completed_at)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(RepoError::NotFound);
        }
        Ok(())
    }

    async fn add_lead(&self, lead: &Lead) -> Result<(), RepoError> {
        sqlx::query(
            r#"
            INSERT INTO leads (id, campaign_id, phone_number, name, company, email, notes,
                               status, outcome, fail_reason, retry_count, max_retries,
                               created_at, updated_at, last_called_at, call_history)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16)
            "#,
        )
        .bind(lead.id)
        .bind(lead.campaign_id)
        .bind(&lead.phone_number)
        .bind(&lead.name)
        .bind(&lead.company)
        .bind(&lead.email)
        .bind(&lead.notes)
        .bind(lead.status)
        .bind(&lead.outcome)
        .bind(&lead.fail_reason)
        .bind(lead.retry_count)
        .bind(lead.max_retries)
        .bind(lead.created_at)
        .bind(lead.updated_at)
        .bind(lead.last_called_at)
        .bind(Json(&lead.call_history))
        .execute(&self.pool)
        .await
        .map_err(|err| match RepoError::from(err) {
            RepoError::DuplicatePhone(_) => RepoError::DuplicatePhone(lead.phone_number.clone()),
            other => other,
        })?;
        Ok(())
    }

    async fn get_lead(&self, id: Uuid) -> Result<Lead, RepoError> {
        let row = sqlx::query_as::<_, LeadRow>(&format!(
            "SELECT {LEAD_COLUMNS} FROM leads WHERE id = $1"
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await?
        .ok_or(RepoError::NotFound)?;
        Ok(row.into())
    }

    async fn list_leads(&self, campaign_id: Uuid) -> Result<Vec<Lead>, RepoError> {
        let rows = sqlx::query_as::<_, LeadRow>(&format!(
            "SELECT {LEAD_COLUMNS} FROM leads WHERE campaign_id = $1 ORDER BY created_at"
        ))
        .bind(campaign_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(Into::into).collect())
    }

    async fn callable_leads(&self, campaign_id: Uuid, limit: i64) -> Result<Vec<Lead>, RepoError> {
        let rows = sqlx::query_as::<_, LeadRow>(&format!(
            "SELECT {LEAD_COLUMNS} FROM leads \
             WHERE campaign_id = $1 AND status = 'pending' \
             ORDER BY created_at LIMIT $2"
        ))
        .bind(campaign_id)
        .bind(limit.max(0))
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(Into::into).collect())
    }

    async fn count_leads(&self, campaign_id: Uuid) -> Result<i64, RepoError> {
        let row = sqlx::query("SELECT COUNT(*) AS count FROM leads WHERE campaign_id = $1")
            .bind(campaign_id)
            .fetch_one(&self.pool)
            .await?;
        Ok(row.get::<i64, _>("count"))
    }

    async fn count_leads_by_status(
        &self,
        campaign_id: Uuid,
    ) -> Result<HashMap<LeadStatus, i64>, RepoError> {
        let rows = sqlx::query(
            "SELECT status, COUNT(*) AS count FROM leads WHERE campaign_id = $1 GROUP BY status",
        )
        .bind(campaign_id)
        .fetch_all(&self.pool)
        .await?;

        let mut counts = HashMap::new();
        for row in rows {
            let status: LeadStatus = row.get("status");
            counts.insert(status, row.get::<i64, _>("count"));
        }
        Ok(counts)
    }

    async fn existing_phone_numbers(
        &self,
        campaign_id: Uuid,
    ) -> Result<HashSet<String>, RepoError> {
        let rows = sqlx::query("SELECT phone_number FROM leads WHERE campaign_id = $1")
            .bind(campaign_id)
            .fetch_all(&self.pool)
            .await?;
        Ok(rows
            .into_iter()
            .map(|row| row.get::<String, _>("phone_number"))
            .collect())
    }

    async fn update_lead(&self, lead: &Lead) -> Result<(), RepoError> {
        // Atomic single-row replace; call_history is rewritten whole
        let result = sqlx::query(
            r#"
            UPDATE leads
            SET phone_number = $2, name = $3, company = $4, email = $5, notes = $6,
                status = $7, outcome = $8, fail_reason = $9,
                retry_count = $10, max_retries = $11,
                updated_at = $12, last_called_at = $13, call_history = $14
            WHERE id = $1
            "#,
        )
        .bind(lead.id)
        .bind(&lead.phone_number)
        .bind(&lead.name)
        .bind(&lead.company)
        .bind(&lead.email)
        .bind(&lead.notes)
        .bind(lead.status)
        .bind(&lead.outcome)
        .bind(&lead.fail_reason)
        .bind(lead.retry_count)
        .bind(lead.max_retries)
        .bind(lead.updated_at)
        .bind(lead.last_called_at)
        .bind(Json(&lead.call_history))
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(RepoError::NotFound);
        }
        Ok(())
    }

    async fn delete_lead(&self, id: Uuid) -> Result<(), RepoError> {
        let result = sqlx::query("DELETE FROM leads WHERE id = $1")
            .bind(id)
            .execute(&self.pool)
            .await?;

        if result.rows_affected() == 0 {
            return Err(RepoError::NotFound);
        }
        Ok(())
    }
}
