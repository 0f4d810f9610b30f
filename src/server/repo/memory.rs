//! Deterministic in-memory repository for tests and mock-mode runs.

use std::collections::{HashMap, HashSet};

use async_trait::async_trait;
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::models::{Campaign, Lead, LeadStatus};

use super::{RepoError, Repository};

#[derive(Default)]
struct Inner {
    campaigns: HashMap<Uuid, Campaign>,
    campaign_order: Vec<Uuid>,
    leads: HashMap<Uuid, Lead>,
    // Insertion order doubles as creation order
    lead_order: Vec<Uuid>,
}

/// HashMap-backed repository guarded by one RwLock.
#[derive(Default)]
pub struct MemoryRepository {
    inner: RwLock<Inner>,
}

impl MemoryRepository {
    pub fn new() -> Self {
        Self::default()
    }

    async fn leads_in_order(&self, campaign_id: Uuid) -> Vec<Lead> {
        let inner = self.inner.read().await;
        inner
            .lead_order
            .iter()
            .filter_map(|id| inner.leads.get(id))
            .filter(|l| l.campaign_id == campaign_id)
            .cloned()
            .collect()
    }
}

#[async_trait]
impl Repository for MemoryRepository {
    async fn create_campaign(&self, campaign: &Campaign) -> Result<(), RepoError> {
        let mut inner = self.inner.write().await;
        if inner.campaigns.contains_key(&campaign.id) {
            return Err(RepoError::Conflict);
        }
        inner.campaign_order.push(campaign.id);
        inner.campaigns.insert(campaign.id, campaign.clone());
        Ok(())
    }

    async fn get_campaign(&self, id: Uuid) -> Result<Campaign, RepoError> {
        self.inner
            .read()
            .await
            .campaigns
            .get(&id)
            .cloned()
            .ok_or(RepoError::NotFound)
    }

    async fn list_campaigns(&self) -> Result<Vec<Campaign>, RepoError> {
        let inner = self.inner.read().await;
        Ok(inner
            .campaign_order
            .iter()
            .filter_map(|id| inner.campaigns.get(id))
            .cloned()
            .collect())
    }

    async fn update_campaign(&self, campaign: &Campaign) -> Result<(), RepoError> {
        let mut inner = self.inner.write().await;
        match inner.campaigns.get_mut(&campaign.id) {
            Some(existing) => {
                *existing = campaign.clone();
                Ok(())
            }
            None => Err(RepoError::NotFound),
        }
    }

    async fn add_lead(&self, lead: &Lead) -> Result<(), RepoError> {
        let mut inner = self.inner.write().await;
        if !inner.campaigns.contains_key(&lead.campaign_id) {
            return Err(RepoError::NotFound);
        }
        let duplicate = inner
            .leads
            .values()
            .any(|l| l.campaign_id == lead.campaign_id && l.phone_number == lead.phone_number);
        if duplicate {
            return Err(RepoError::DuplicatePhone(lead.phone_number.clone()));
        }

        inner.lead_order.push(lead.id);
        inner.leads.insert(lead.id, lead.clone());
        Ok(())
    }

    async fn get_lead(&self, id: Uuid) -> Result<Lead, RepoError> {
        self.inner
            .read()
            .await
            .leads
            .get(&id)
            .cloned()
            .ok_or(RepoError::NotFound)
    }

    async fn list_leads(&self, campaign_id: Uuid) -> Result<Vec<Lead>, RepoError> {
        Ok(self.leads_in_order(campaign_id).await)
    }

    async fn callable_leads(&self, campaign_id: Uuid, limit: i64) -> Result<Vec<Lead>, RepoError> {
        Ok(self
            .leads_in_order(campaign_id)
            .await
            .into_iter()
            .filter(|l| l.status == LeadStatus::Pending)
            .take(limit.max(0) as usize)
            .collect())
    }

    async fn count_leads(&self, campaign_id: Uuid) -> Result<i64, RepoError> {
        let inner = self.inner.read().await;
        Ok(inner
            .leads
            .values()
            .filter(|l| l.campaign_id == campaign_id)
            .count() as i64)
    }

    async fn count_leads_by_status(
        &self,
        campaign_id: Uuid,
    ) -> Result<HashMap<LeadStatus, i64>, RepoError> {
        let inner = self.inner.read().await;
        let mut counts = HashMap::new();
        for lead in inner.leads.values().filter(|l| l.campaign_id == campaign_id) {
            *counts.entry(lead.status).or_insert(0) += 1;
        }
        Ok(counts)
    }

    async fn existing_phone_numbers(
        &self,
        campaign_id: Uuid,
    ) -> Result<HashSet<String>, RepoError> {
        let inner = self.inner.read().await;
        Ok(inner
            .leads
            .values()
            .filter(|l| l.campaign_id == campaign_id)
            .map(|l| l.phone_number.clone())
            .collect())
    }

    async fn update_lead(&self, lead: &Lead) -> Result<(), RepoError> {
        let mut inner = self.inner.write().await;
        match inner.leads.get_mut(&lead.id) {
            Some(existing) => {
                *existing = lead.clone();
                Ok(())
            }
            None => Err(RepoError::NotFound),
        }
    }

    async fn delete_lead(&self, id: Uuid) -> Result<(), RepoError> {
        let mut inner = self.inner.write().await;
        if inner.leads.remove(&id).is_none() {
            return Err(RepoError::NotFound);
        }
        inner.lead_order.retain(|l| *l != id);
        Ok(())
    }
}
