//! Per-campaign dialing engine.
//!
//! One background task per RUNNING campaign drives the control loop at a
//! fixed interval. Each tick samples lead counts and the operator pool,
//! runs the proportional control law and launches calls for the first
//! PENDING leads in creation order. AMD and call-status signals feed
//! back in through [`DialerEngine::handle_amd`] and
//! [`DialerEngine::handle_status`], whether they arrive from the webhook
//! endpoints or from the mock provider's event stream.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde_json::json;
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::config::Settings;
use crate::models::{Campaign, CampaignStats, CampaignStatus, EventType, Lead, LeadStatus, WsMessage};
use crate::server::operators::OperatorManager;
use crate::server::repo::{RepoError, Repository};
use crate::server::telephony::{AmdResult, CallStatus, TelephonyEvent, TelephonyPort};
use crate::server::ws::connection::ConnectionManager;

use super::control::{DialerOrchestrator, DialingHealth};

/// Fail reasons that qualify a lead for delayed re-admission.
const RETRIABLE_REASONS: [&str; 4] = ["busy", "no_answer", "abandoned", "unknown"];

/// Backoff before a failed lead is re-admitted to PENDING.
pub fn retry_backoff(retry_count: i32) -> Duration {
    let exp = retry_count.clamp(0, 16) as u32;
    let secs = 60u64.saturating_mul(1u64 << exp).min(600);
    Duration::from_secs(secs)
}

#[derive(Debug, thiserror::Error)]
pub enum DialerError {
    #[error("Campaign {0} is not running")]
    NotRunning(Uuid),

    #[error("Call {0} is not tracked")]
    UnknownCall(String),

    #[error("Operator {0} has no matching call")]
    NoMatchingCall(String),

    #[error(transparent)]
    Repo(#[from] RepoError),

    #[error(transparent)]
    Lead(#[from] crate::models::LeadError),
}

/// Outcome of one control-loop iteration, surfaced for tests and logs.
#[derive(Debug, Default, Clone)]
pub struct TickReport {
    pub launched: i64,
    pub failed_launches: i64,
    pub timed_out: i64,
    pub paused: bool,
}

#[derive(Debug, Clone)]
struct ActiveCall {
    campaign_id: Uuid,
    lead_id: Uuid,
    launched_at: DateTime<Utc>,
    amd_received: bool,
    conference_sid: Option<String>,
}

#[derive(Default)]
struct CampaignCounters {
    abandoned_leads: i64,
    failed_launches: i64,
    pause_alerted: bool,
    warned_long_idle: HashSet<String>,
}

struct CampaignRun {
    cancel: CancellationToken,
}

pub struct DialerEngine {
    repo: Arc<dyn Repository>,
    telephony: Arc<dyn TelephonyPort>,
    operators: Arc<OperatorManager>,
    connections: Arc<ConnectionManager>,
    orchestrator: DialerOrchestrator,
    settings: Settings,

    runs: RwLock<HashMap<Uuid, CampaignRun>>,
    counters: RwLock<HashMap<Uuid, CampaignCounters>>,
    active_calls: RwLock<HashMap<String, ActiveCall>>,
}

impl DialerEngine {
    pub fn new(
        repo: Arc<dyn Repository>,
        telephony: Arc<dyn TelephonyPort>,
        operators: Arc<OperatorManager>,
        connections: Arc<ConnectionManager>,
        orchestrator: DialerOrchestrator,
        settings: Settings,
    ) -> Self {
        Self {
            repo,
            telephony,
            operators,
            connections,
            orchestrator,
            settings,
            runs: RwLock::new(HashMap::new()),
            counters: RwLock::new(HashMap::new()),
            active_calls: RwLock::new(HashMap::new()),
        }
    }

    pub fn orchestrator(&self) -> &DialerOrchestrator {
        &self.orchestrator
    }

    /// Spawn the tick loop for a campaign that just entered RUNNING.
    /// Idempotent while the loop is alive.
    pub async fn start_campaign(self: Arc<Self>, campaign_id: Uuid) {
        let mut runs = self.runs.write().await;
        if runs.contains_key(&campaign_id) {
            return;
        }

        let cancel = CancellationToken::new();
        runs.insert(
            campaign_id,
            CampaignRun {
                cancel: cancel.clone(),
            },
        );
        drop(runs);

        let engine = self.clone();
        tokio::spawn(async move {
            engine.run_loop(campaign_id, cancel).await;
        });
        tracing::info!("Started dialer loop for campaign {}", campaign_id);
    }

    /// Cancel the tick loop. In-flight launches complete on their own.
    pub async fn stop_campaign(&self, campaign_id: Uuid) {
        if let Some(run) = self.runs.write().await.remove(&campaign_id) {
            run.cancel.cancel();
            tracing::info!("Stopped dialer loop for campaign {}", campaign_id);
        }
    }

    pub async fn is_running(&self, campaign_id: Uuid) -> bool {
        self.runs.read().await.contains_key(&campaign_id)
    }

    async fn run_loop(&self, campaign_id: Uuid, cancel: CancellationToken) {
        let mut ticker = tokio::time::interval(self.settings.tick_interval());
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        // The interval yields immediately; wait one full period instead
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {}
            }

            let campaign = match self.repo.get_campaign(campaign_id).await {
                Ok(campaign) => campaign,
                Err(err) => {
                    tracing::error!("Campaign {} unavailable, stopping loop: {}", campaign_id, err);
                    break;
                }
            };

            match campaign.status {
                CampaignStatus::Running => {
                    if let Err(err) = self.tick(campaign_id).await {
                        tracing::error!("Tick failed for campaign {}: {}", campaign_id, err);
                    }
                }
                // Paused campaigns idle; the loop survives for resume
                CampaignStatus::Paused => {}
                _ => break,
            }
        }

        self.runs.write().await.remove(&campaign_id);
        tracing::info!("Dialer loop ended for campaign {}", campaign_id);
    }

    /// One control iteration. Public so tests can drive it directly.
    pub async fn tick(&self, campaign_id: Uuid) -> Result<TickReport, DialerError> {
        let campaign = self.repo.get_campaign(campaign_id).await?;
        if campaign.status != CampaignStatus::Running {
            return Err(DialerError::NotRunning(campaign_id));
        }

        let mut report = TickReport::default();

        report.timed_out = self.expire_amd_timeouts(campaign_id).await;

        let stats = self.campaign_stats(campaign_id).await?;

        if self.orchestrator.should_pause_dialing(&stats) {
            report.paused = true;
            let newly_paused = {
                let mut counters = self.counters.write().await;
                let entry = counters.entry(campaign_id).or_default();
                !std::mem::replace(&mut entry.pause_alerted, true)
            };
            if newly_paused {
                tracing::warn!(
                    "Campaign {} abandon rate {:.1}% exceeds 2x target, pausing launches",
                    campaign_id,
                    stats.abandon_rate() * 100.0
                );
                self.alert(
                    "abandon_rate_critical",
                    "warning",
                    &format!(
                        "Dialing paused: abandon rate {:.1}% exceeds twice the target",
                        stats.abandon_rate() * 100.0
                    ),
                )
                .await;
            }
        } else {
            self.counters
                .write()
                .await
                .entry(campaign_id)
                .or_default()
                .pause_alerted = false;
        }

        if !report.paused {
            let available = self.operators.available_count().await as i64;
            if available > 0 {
                let ratio = self.orchestrator.calculate_dial_ratio(&stats);
                let effective_ratio = ratio.min(campaign.dial_ratio);
                let to_launch = self.orchestrator.calculate_calls_to_make(
                    available,
                    effective_ratio,
                    stats.calling_leads,
                );

                if to_launch > 0 {
                    let leads = self.repo.callable_leads(campaign_id, to_launch).await?;
                    for lead in leads {
                        match self.launch_lead(&campaign, lead).await {
                            Ok(()) => report.launched += 1,
                            Err(()) => report.failed_launches += 1,
                        }
                    }
                }
            }
        }

        self.warn_long_idle_operators(campaign_id).await;
        self.check_completion(campaign_id).await?;

        Ok(report)
    }

    /// Launch one lead: CALLING transition, repository commit, provider
    /// call. A provider failure restores the pre-launch snapshot.
    async fn launch_lead(&self, campaign: &Campaign, mut lead: Lead) -> Result<(), ()> {
        let snapshot = lead.clone();

        if lead.start_calling().is_err() {
            return Err(());
        }
        if let Err(err) = self.repo.update_lead(&lead).await {
            tracing::error!("Failed to persist launch for lead {}: {}", lead.id, err);
            return Err(());
        }

        let caller_id = campaign
            .caller_id
            .clone()
            .unwrap_or_else(|| self.settings.twilio_phone_number.clone());
        let callback = self.settings.webhook_url("/webhooks/twilio/status");

        match self
            .telephony
            .make_call(&lead.phone_number, &caller_id, callback.as_deref(), true)
            .await
        {
            Ok(result) => {
                self.active_calls.write().await.insert(
                    result.call_sid.clone(),
                    ActiveCall {
                        campaign_id: campaign.id,
                        lead_id: lead.id,
                        launched_at: Utc::now(),
                        amd_received: false,
                        conference_sid: None,
                    },
                );
                tracing::info!(
                    "Launched call {} to {} for campaign {}",
                    result.call_sid,
                    lead.phone_number,
                    campaign.id
                );
                self.publish_stats(campaign.id).await;
                Ok(())
            }
            Err(err) => {
                tracing::error!("Telephony launch failed for lead {}: {}", lead.id, err);
                if let Err(revert) = self.repo.update_lead(&snapshot).await {
                    tracing::error!("Failed to revert lead {}: {}", lead.id, revert);
                }
                self.counters
                    .write()
                    .await
                    .entry(campaign.id)
                    .or_default()
                    .failed_launches += 1;
                self.alert(
                    "telephony_error",
                    "error",
                    &format!("Call launch failed for {}: {}", lead.phone_number, err),
                )
                .await;
                Err(())
            }
        }
    }

    /// Hang up and fail leads whose AMD verdict never arrived.
    async fn expire_amd_timeouts(&self, campaign_id: Uuid) -> i64 {
        let deadline = Utc::now()
            - chrono::Duration::seconds(self.settings.amd_timeout_seconds as i64);

        let expired: Vec<(String, Uuid)> = {
            let calls = self.active_calls.read().await;
            calls
                .iter()
                .filter(|(_, call)| {
                    call.campaign_id == campaign_id
                        && !call.amd_received
                        && call.launched_at < deadline
                })
                .map(|(sid, call)| (sid.clone(), call.lead_id))
                .collect()
        };

        let mut timed_out = 0;
        for (call_sid, lead_id) in expired {
            tracing::warn!("AMD timeout for call {}, hanging up", call_sid);
            if let Err(err) = self.telephony.hangup_call(&call_sid).await {
                tracing::error!("Hangup failed for timed-out call {}: {}", call_sid, err);
            }

            if let Ok(mut lead) = self.repo.get_lead(lead_id).await {
                if lead.status == LeadStatus::Calling && lead.fail("amd_timeout").is_ok() {
                    if let Err(err) = self.repo.update_lead(&lead).await {
                        tracing::error!("Failed to persist AMD timeout for {}: {}", lead_id, err);
                    }
                    timed_out += 1;
                }
            }
            self.active_calls.write().await.remove(&call_sid);
        }

        if timed_out > 0 {
            self.publish_stats(campaign_id).await;
        }
        timed_out
    }

    async fn warn_long_idle_operators(&self, campaign_id: Uuid) {
        let long_idle = self.operators.get_long_idle_operators().await;
        let mut counters = self.counters.write().await;
        let entry = counters.entry(campaign_id).or_default();

        let current: HashSet<String> = long_idle.iter().map(|op| op.id.clone()).collect();
        let fresh: Vec<_> = long_idle
            .iter()
            .filter(|op| !entry.warned_long_idle.contains(&op.id))
            .collect();
        entry.warned_long_idle = current;

        if fresh.is_empty() {
            return;
        }
        let names: Vec<&str> = fresh.iter().map(|op| op.name.as_str()).collect();
        drop(counters);

        self.alert(
            "long_idle_operators",
            "warning",
            &format!("Operators idle too long: {}", names.join(", ")),
        )
        .await;
    }

    /// Route an AMD verdict for an in-flight call.
    pub async fn handle_amd(&self, call_sid: &str, result: AmdResult) -> Result<(), DialerError> {
        let call = {
            let mut calls = self.active_calls.write().await;
            match calls.get_mut(call_sid) {
                Some(call) => {
                    call.amd_received = true;
                    call.clone()
                }
                None => return Err(DialerError::UnknownCall(call_sid.to_string())),
            }
        };

        let mut lead = self.repo.get_lead(call.lead_id).await?;
        if lead.status != LeadStatus::Calling {
            // Duplicate or late verdict; the lead already moved on
            return Ok(());
        }

        match result {
            AmdResult::Human => self.bridge_or_abandon(call_sid, &call, lead).await?,
            other => {
                let reason = if other.is_machine() {
                    "machine"
                } else if other == AmdResult::Fax {
                    "fax"
                } else {
                    "unknown"
                };

                if let Err(err) = self.telephony.hangup_call(call_sid).await {
                    tracing::error!("Hangup failed for call {}: {}", call_sid, err);
                }
                lead.fail(reason)?;
                self.repo.update_lead(&lead).await?;
                self.active_calls.write().await.remove(call_sid);
                self.schedule_retry(&lead);
                self.publish_stats(call.campaign_id).await;
            }
        }

        self.check_completion(call.campaign_id).await?;
        Ok(())
    }

    /// A human answered: bridge to the longest-idle operator, or hang up
    /// and count an abandon when nobody is free.
    async fn bridge_or_abandon(
        &self,
        call_sid: &str,
        call: &ActiveCall,
        mut lead: Lead,
    ) -> Result<(), DialerError> {
        match self.operators.select_and_assign(call_sid, lead.id).await {
            Some(operator) => {
                lead.connect()?;
                self.repo.update_lead(&lead).await?;

                let room = format!("room-{call_sid}");
                match self.telephony.create_conference(&room).await {
                    Ok(conference) => {
                        if let Err(err) = self
                            .telephony
                            .add_participant_to_conference(&conference.sid, call_sid, false, false)
                            .await
                        {
                            tracing::error!("Failed to join {} to {}: {}", call_sid, room, err);
                        }
                        if let Some(active) =
                            self.active_calls.write().await.get_mut(call_sid)
                        {
                            active.conference_sid = Some(conference.sid);
                        }
                    }
                    Err(err) => {
                        tracing::error!("Failed to create conference {}: {}", room, err);
                    }
                }

                self.connections
                    .send_to_user(
                        &operator.id,
                        WsMessage::new(
                            EventType::IncomingCall,
                            json!({
                                "call_sid": call_sid,
                                "lead_id": lead.id,
                                "phone_number": lead.phone_number,
                                "name": lead.name,
                            }),
                        ),
                    )
                    .await;
                self.broadcast_operator_list().await;
                self.publish_stats(call.campaign_id).await;
            }
            None => {
                // Abandon: a live human with nobody to talk to
                if let Err(err) = self.telephony.hangup_call(call_sid).await {
                    tracing::error!("Hangup failed for abandoned call {}: {}", call_sid, err);
                }
                lead.fail("abandoned")?;
                self.repo.update_lead(&lead).await?;
                self.active_calls.write().await.remove(call_sid);

                self.counters
                    .write()
                    .await
                    .entry(call.campaign_id)
                    .or_default()
                    .abandoned_leads += 1;

                self.schedule_retry(&lead);
                self.publish_stats(call.campaign_id).await;
            }
        }
        Ok(())
    }

    /// Ingest a provider call-status update.
    pub async fn handle_status(
        &self,
        call_sid: &str,
        status: CallStatus,
    ) -> Result<(), DialerError> {
        let call = match self.active_calls.read().await.get(call_sid) {
            Some(call) => call.clone(),
            // Operator legs and long-gone calls are not tracked
            None => return Ok(()),
        };

        let mut lead = self.repo.get_lead(call.lead_id).await?;

        match (lead.status, status) {
            (LeadStatus::Connected, CallStatus::Completed) => {
                // Callee hung up before the operator wrapped up
                lead.complete("completed")?;
                self.repo.update_lead(&lead).await?;
                self.active_calls.write().await.remove(call_sid);

                if let Some(operator) = self.operators.find_operator_by_call(call_sid).await {
                    self.operators.end_call(&operator.id).await;
                    self.broadcast_operator_list().await;
                }
                self.publish_stats(call.campaign_id).await;
            }
            (LeadStatus::Calling, CallStatus::Busy) => {
                self.fail_from_status(call_sid, &call, lead, "busy").await?;
            }
            (LeadStatus::Calling, CallStatus::NoAnswer) => {
                self.fail_from_status(call_sid, &call, lead, "no_answer").await?;
            }
            (LeadStatus::Calling, CallStatus::Failed) => {
                self.fail_from_status(call_sid, &call, lead, "failed").await?;
            }
            (LeadStatus::Calling, CallStatus::Canceled) => {
                self.fail_from_status(call_sid, &call, lead, "canceled").await?;
            }
            // Ringing / in-progress / duplicates: nothing to record
            _ => return Ok(()),
        }

        self.check_completion(call.campaign_id).await?;
        Ok(())
    }

    async fn fail_from_status(
        &self,
        call_sid: &str,
        call: &ActiveCall,
        mut lead: Lead,
        reason: &str,
    ) -> Result<(), DialerError> {
        lead.fail(reason)?;
        self.repo.update_lead(&lead).await?;
        self.active_calls.write().await.remove(call_sid);
        self.schedule_retry(&lead);
        self.publish_stats(call.campaign_id).await;
        Ok(())
    }

    /// Operator finished the conversation: complete the lead, release
    /// the operator and hang up the customer leg.
    pub async fn operator_end_call(
        &self,
        operator_id: &str,
        call_sid: &str,
        outcome: &str,
    ) -> Result<(), DialerError> {
        let operator = self
            .operators
            .find_operator_by_call(call_sid)
            .await
            .filter(|op| op.id == operator_id)
            .ok_or_else(|| DialerError::NoMatchingCall(operator_id.to_string()))?;

        let call = self
            .active_calls
            .read()
            .await
            .get(call_sid)
            .cloned()
            .ok_or_else(|| DialerError::UnknownCall(call_sid.to_string()))?;

        let mut lead = self.repo.get_lead(call.lead_id).await?;
        lead.complete(outcome)?;
        self.repo.update_lead(&lead).await?;

        self.operators.end_call(&operator.id).await;
        self.active_calls.write().await.remove(call_sid);

        if let Err(err) = self.telephony.hangup_call(call_sid).await {
            tracing::error!("Hangup failed for call {}: {}", call_sid, err);
        }

        self.broadcast_operator_list().await;
        self.publish_stats(call.campaign_id).await;
        self.check_completion(call.campaign_id).await?;
        Ok(())
    }

    /// Delayed re-admission for retriable failures.
    fn schedule_retry(&self, lead: &Lead) {
        let Some(reason) = lead.fail_reason.as_deref() else {
            return;
        };
        if !RETRIABLE_REASONS.contains(&reason) || lead.retry_count >= lead.max_retries {
            return;
        }

        let delay = retry_backoff(lead.retry_count);
        let repo = self.repo.clone();
        let lead_id = lead.id;
        let expected_reason = reason.to_string();

        tokio::spawn(async move {
            tokio::time::sleep(delay).await;

            let mut lead = match repo.get_lead(lead_id).await {
                Ok(lead) => lead,
                Err(_) => return,
            };
            // Only re-admit if nothing else touched the lead meanwhile
            if lead.status != LeadStatus::Failed
                || lead.fail_reason.as_deref() != Some(expected_reason.as_str())
            {
                return;
            }
            if lead.retry().is_ok() {
                if let Err(err) = repo.update_lead(&lead).await {
                    tracing::error!("Failed to re-admit lead {}: {}", lead_id, err);
                } else {
                    tracing::info!("Re-admitted lead {} for retry", lead_id);
                }
            }
        });
    }

    /// Immediate re-admission, used by tests and manual intervention.
    pub async fn admit_retry(&self, lead_id: Uuid) -> Result<(), DialerError> {
        let mut lead = self.repo.get_lead(lead_id).await?;
        lead.retry()?;
        self.repo.update_lead(&lead).await?;
        Ok(())
    }

    /// Lead counts from the repository plus the volatile abandon counter.
    pub async fn campaign_stats(&self, campaign_id: Uuid) -> Result<CampaignStats, DialerError> {
        let counts = self.repo.count_leads_by_status(campaign_id).await?;
        let mut stats = CampaignStats::default();
        for (status, count) in counts {
            stats.record(status, count);
        }
        stats.abandoned_leads = self
            .counters
            .read()
            .await
            .get(&campaign_id)
            .map(|c| c.abandoned_leads)
            .unwrap_or(0);
        Ok(stats)
    }

    pub async fn failed_launches(&self, campaign_id: Uuid) -> i64 {
        self.counters
            .read()
            .await
            .get(&campaign_id)
            .map(|c| c.failed_launches)
            .unwrap_or(0)
    }

    pub async fn dialing_health(&self, campaign_id: Uuid) -> Result<DialingHealth, DialerError> {
        let stats = self.campaign_stats(campaign_id).await?;
        Ok(self.orchestrator.get_dialing_health(&stats))
    }

    /// Mark the campaign COMPLETED once every lead is terminal.
    pub async fn check_completion(&self, campaign_id: Uuid) -> Result<bool, DialerError> {
        let mut campaign = self.repo.get_campaign(campaign_id).await?;
        let stats = self.campaign_stats(campaign_id).await?;

        if !campaign.check_completion(&stats) {
            return Ok(false);
        }
        self.repo.update_campaign(&campaign).await?;
        self.stop_campaign(campaign_id).await;

        tracing::info!("Campaign {} completed", campaign_id);
        self.alert(
            "campaign_completed",
            "info",
            &format!("Campaign {} completed", campaign.name),
        )
        .await;
        self.publish_stats(campaign_id).await;
        Ok(true)
    }

    async fn publish_stats(&self, campaign_id: Uuid) {
        let Ok(campaign) = self.repo.get_campaign(campaign_id).await else {
            return;
        };
        let Ok(stats) = self.campaign_stats(campaign_id).await else {
            return;
        };

        self.connections
            .broadcast_campaign_stats(
                campaign_id,
                WsMessage::new(
                    EventType::CampaignStatsUpdated,
                    stats_payload(&campaign, &stats),
                ),
            )
            .await;
    }

    async fn broadcast_operator_list(&self) {
        let operators = self.operators.get_all_operators().await;
        self.connections
            .broadcast_to_dashboards(WsMessage::new(
                EventType::OperatorListUpdated,
                json!({"operators": operators}),
            ))
            .await;
    }

    async fn alert(&self, alert_type: &str, severity: &str, message: &str) {
        self.connections
            .broadcast_to_dashboards(WsMessage::new(
                EventType::Alert,
                json!({
                    "alert_type": alert_type,
                    "severity": severity,
                    "message": message,
                }),
            ))
            .await;
    }

    /// Pump mock-provider events into the engine. Spawned once at startup
    /// when the mock telephony backend is active.
    pub fn spawn_event_pump(
        self: Arc<Self>,
        mut events: tokio::sync::mpsc::UnboundedReceiver<TelephonyEvent>,
    ) {
        let engine = self;
        tokio::spawn(async move {
            while let Some(event) = events.recv().await {
                let result = match event {
                    TelephonyEvent::StatusChanged { call_sid, status } => {
                        engine.handle_status(&call_sid, status).await
                    }
                    TelephonyEvent::Amd { call_sid, result } => {
                        engine.handle_amd(&call_sid, result).await
                    }
                };
                if let Err(err) = result {
                    tracing::debug!("Telephony event ignored: {}", err);
                }
            }
        });
    }
}

/// Websocket payload for `campaign_stats_updated`.
pub fn stats_payload(campaign: &Campaign, stats: &CampaignStats) -> serde_json::Value {
    json!({
        "campaign_id": campaign.id,
        "name": campaign.name,
        "status": campaign.status.as_str(),
        "total_leads": stats.total_leads,
        "pending_leads": stats.pending_leads,
        "calling_leads": stats.calling_leads,
        "connected_leads": stats.connected_leads,
        "completed_leads": stats.completed_leads,
        "failed_leads": stats.failed_leads,
        "dnc_leads": stats.dnc_leads,
        "abandoned_leads": stats.abandoned_leads,
        "abandon_rate": stats.abandon_rate(),
    })
}
