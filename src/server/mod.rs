//! Server-side wiring: application state, HTTP API and router assembly.
#![allow(dead_code)]

pub mod auth;
pub mod csv_import;
pub mod dialer;
pub mod operators;
pub mod repo;
pub mod telephony;
pub mod webhooks;
pub mod ws;

use std::sync::Arc;

use axum::{
    extract::{Multipart, Path, State},
    http::{HeaderValue, Method, StatusCode},
    response::{IntoResponse, Response},
    routing::{delete, get, post},
    Json, Router,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tower_http::cors::{AllowOrigin, Any, CorsLayer};
use tower_http::trace::TraceLayer;
use uuid::Uuid;

use crate::config::Settings;
use crate::models::{Campaign, CampaignError, Lead, LeadError};
use dialer::{DialerConfig, DialerEngine, DialerError, DialerOrchestrator};
use operators::OperatorManager;
use repo::{postgres, RepoError, Repository};
use telephony::mock::MockTelephony;
use telephony::twilio::TwilioClient;
use telephony::{AmdResult, TelephonyPort};
use ws::connection::ConnectionManager;

/// Application state shared across all routes.
pub struct AppState {
    pub settings: Settings,
    pub users: auth::UserStore,
    pub repo: Arc<dyn Repository>,
    pub telephony: Arc<dyn TelephonyPort>,
    pub operators: Arc<OperatorManager>,
    pub connections: Arc<ConnectionManager>,
    pub engine: Arc<DialerEngine>,
}

/// HTTP error surface. Every core error maps onto one of these.
#[derive(Debug)]
pub enum ApiError {
    BadRequest(String),
    Unauthorized(String),
    Forbidden(String),
    NotFound(String),
    Conflict(String),
    ServiceUnavailable(String),
    Internal(String),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, detail) = match self {
            ApiError::BadRequest(detail) => (StatusCode::BAD_REQUEST, detail),
            ApiError::Unauthorized(detail) => (StatusCode::UNAUTHORIZED, detail),
            ApiError::Forbidden(detail) => (StatusCode::FORBIDDEN, detail),
            ApiError::NotFound(detail) => (StatusCode::NOT_FOUND, detail),
            ApiError::Conflict(detail) => (StatusCode::CONFLICT, detail),
            ApiError::ServiceUnavailable(detail) => (StatusCode::SERVICE_UNAVAILABLE, detail),
            ApiError::Internal(detail) => {
                tracing::error!("Internal error: {}", detail);
                (StatusCode::INTERNAL_SERVER_ERROR, detail)
            }
        };
        (status, Json(json!({"detail": detail}))).into_response()
    }
}

impl From<CampaignError> for ApiError {
    fn from(err: CampaignError) -> Self {
        ApiError::BadRequest(err.to_string())
    }
}

impl From<LeadError> for ApiError {
    fn from(err: LeadError) -> Self {
        ApiError::BadRequest(err.to_string())
    }
}

impl From<RepoError> for ApiError {
    fn from(err: RepoError) -> Self {
        match err {
            RepoError::NotFound => ApiError::NotFound("Not found".to_string()),
            RepoError::DuplicatePhone(_) => ApiError::BadRequest(err.to_string()),
            RepoError::Conflict => ApiError::Conflict(err.to_string()),
            RepoError::Database(_) => ApiError::Internal(err.to_string()),
        }
    }
}

impl From<DialerError> for ApiError {
    fn from(err: DialerError) -> Self {
        match err {
            DialerError::Repo(repo) => repo.into(),
            DialerError::Lead(lead) => lead.into(),
            other => ApiError::BadRequest(other.to_string()),
        }
    }
}

/// Create the Axum router with all API routes.
pub fn create_router(state: Arc<AppState>) -> Router {
    let cors = cors_layer(&state.settings);

    Router::new()
        // Health check
        .route("/health", get(health_check))

        // Auth routes
        .route("/api/v1/auth/login", post(auth::login))
        .route("/api/v1/auth/refresh", post(auth::refresh))
        .route("/api/v1/auth/me", get(auth::me))

        // Campaign routes
        .route("/api/v1/campaigns", get(list_campaigns).post(create_campaign))
        .route("/api/v1/campaigns/{id}", get(get_campaign))
        .route("/api/v1/campaigns/{id}/start", post(start_campaign))
        .route("/api/v1/campaigns/{id}/pause", post(pause_campaign))
        .route("/api/v1/campaigns/{id}/resume", post(resume_campaign))
        .route("/api/v1/campaigns/{id}/stop", post(stop_campaign))
        .route("/api/v1/campaigns/{id}/stats", get(get_campaign_stats))

        // Lead routes
        .route(
            "/api/v1/campaigns/{id}/leads",
            get(list_leads).post(add_lead),
        )
        .route(
            "/api/v1/campaigns/{id}/leads/{lead_id}",
            delete(remove_lead),
        )
        .route("/api/v1/campaigns/{id}/leads/import", post(import_leads))

        // Telephony client token
        .route("/api/v1/twilio/token", post(create_twilio_token))

        // Provider webhooks (no /api prefix, the provider needs exact paths)
        .route("/webhooks/twilio/status", post(webhooks::status_webhook))
        .route("/webhooks/twilio/amd", post(webhooks::amd_webhook))
        .route("/webhooks/twilio/voice", post(webhooks::voice_webhook))

        // Realtime channels
        .route("/ws/operator", get(ws::operator::operator_websocket))
        .route("/ws/dashboard", get(ws::dashboard::dashboard_websocket))

        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

fn cors_layer(settings: &Settings) -> CorsLayer {
    let layer = CorsLayer::new()
        .allow_methods([
            Method::GET,
            Method::POST,
            Method::PUT,
            Method::PATCH,
            Method::DELETE,
            Method::OPTIONS,
        ])
        .allow_headers(Any);

    if settings.cors_origins.iter().any(|origin| origin == "*") {
        layer.allow_origin(Any)
    } else {
        let origins: Vec<HeaderValue> = settings
            .cors_origins
            .iter()
            .filter_map(|origin| origin.parse().ok())
            .collect();
        layer.allow_origin(AllowOrigin::list(origins))
    }
}

// Health check
async fn health_check() -> Json<serde_json::Value> {
    Json(json!({"status": "healthy"}))
}

// ============== Campaign Routes ==============

#[derive(Debug, Deserialize)]
struct CampaignCreate {
    name: String,
    #[serde(default)]
    description: String,
    dial_ratio: Option<f64>,
    caller_id: Option<String>,
}

#[derive(Debug, Serialize)]
struct CampaignResponse {
    id: Uuid,
    name: String,
    description: String,
    status: &'static str,
    dial_ratio: f64,
    caller_id: Option<String>,
    lead_count: i64,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
    started_at: Option<DateTime<Utc>>,
    completed_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Serialize)]
struct CampaignStatsResponse {
    total_leads: i64,
    pending_leads: i64,
    calling_leads: i64,
    connected_leads: i64,
    completed_leads: i64,
    failed_leads: i64,
    dnc_leads: i64,
    abandoned_leads: i64,
    abandon_rate: f64,
}

async fn campaign_response(
    state: &AppState,
    campaign: Campaign,
) -> Result<CampaignResponse, ApiError> {
    let lead_count = state.repo.count_leads(campaign.id).await?;
    Ok(CampaignResponse {
        id: campaign.id,
        name: campaign.name,
        description: campaign.description,
        status: campaign.status.as_str(),
        dial_ratio: campaign.dial_ratio,
        caller_id: campaign.caller_id,
        lead_count,
        created_at: campaign.created_at,
        updated_at: campaign.updated_at,
        started_at: campaign.started_at,
        completed_at: campaign.completed_at,
    })
}

async fn create_campaign(
    State(state): State<Arc<AppState>>,
    _claims: auth::Claims,
    Json(body): Json<CampaignCreate>,
) -> Result<(StatusCode, Json<CampaignResponse>), ApiError> {
    let mut campaign = Campaign::new(body.name, body.description)?;
    if let Some(ratio) = body.dial_ratio {
        campaign.update_dial_ratio(ratio)?;
    }
    if let Some(caller_id) = body.caller_id {
        crate::models::lead::validate_phone_number(&caller_id)?;
        campaign.set_caller_id(Some(caller_id));
    }

    state.repo.create_campaign(&campaign).await?;
    let response = campaign_response(&state, campaign).await?;
    Ok((StatusCode::CREATED, Json(response)))
}

async fn list_campaigns(
    State(state): State<Arc<AppState>>,
    _claims: auth::Claims,
) -> Result<Json<Vec<CampaignResponse>>, ApiError> {
    let campaigns = state.repo.list_campaigns().await?;
    let mut responses = Vec::with_capacity(campaigns.len());
    for campaign in campaigns {
        responses.push(campaign_response(&state, campaign).await?);
    }
    Ok(Json(responses))
}

async fn get_campaign(
    State(state): State<Arc<AppState>>,
    _claims: auth::Claims,
    Path(id): Path<Uuid>,
) -> Result<Json<CampaignResponse>, ApiError> {
    let campaign = state
        .repo
        .get_campaign(id)
        .await
        .map_err(campaign_not_found)?;
    Ok(Json(campaign_response(&state, campaign).await?))
}

fn campaign_not_found(err: RepoError) -> ApiError {
    match err {
        RepoError::NotFound => ApiError::NotFound("Campaign not found".to_string()),
        other => other.into(),
    }
}

async fn start_campaign(
    State(state): State<Arc<AppState>>,
    _claims: auth::Claims,
    Path(id): Path<Uuid>,
) -> Result<Json<CampaignResponse>, ApiError> {
    let mut campaign = state
        .repo
        .get_campaign(id)
        .await
        .map_err(campaign_not_found)?;

    let lead_count = state.repo.count_leads(id).await?;
    campaign.start(lead_count)?;
    state.repo.update_campaign(&campaign).await?;

    state.engine.clone().start_campaign(id).await;
    Ok(Json(campaign_response(&state, campaign).await?))
}

async fn pause_campaign(
    State(state): State<Arc<AppState>>,
    _claims: auth::Claims,
    Path(id): Path<Uuid>,
) -> Result<Json<CampaignResponse>, ApiError> {
    let mut campaign = state
        .repo
        .get_campaign(id)
        .await
        .map_err(campaign_not_found)?;
    campaign.pause()?;
    state.repo.update_campaign(&campaign).await?;
    Ok(Json(campaign_response(&state, campaign).await?))
}

async fn resume_campaign(
    State(state): State<Arc<AppState>>,
    _claims: auth::Claims,
    Path(id): Path<Uuid>,
) -> Result<Json<CampaignResponse>, ApiError> {
    let mut campaign = state
        .repo
        .get_campaign(id)
        .await
        .map_err(campaign_not_found)?;
    campaign.resume()?;
    state.repo.update_campaign(&campaign).await?;

    // The loop survives a pause, but not a process restart
    state.engine.clone().start_campaign(id).await;
    Ok(Json(campaign_response(&state, campaign).await?))
}

async fn stop_campaign(
    State(state): State<Arc<AppState>>,
    _claims: auth::Claims,
    Path(id): Path<Uuid>,
) -> Result<Json<CampaignResponse>, ApiError> {
    let mut campaign = state
        .repo
        .get_campaign(id)
        .await
        .map_err(campaign_not_found)?;
    campaign.stop()?;
    state.repo.update_campaign(&campaign).await?;

    state.engine.stop_campaign(id).await;
    Ok(Json(campaign_response(&state, campaign).await?))
}

async fn get_campaign_stats(
    State(state): State<Arc<AppState>>,
    _claims: auth::Claims,
    Path(id): Path<Uuid>,
) -> Result<Json<CampaignStatsResponse>, ApiError> {
    state
        .repo
        .get_campaign(id)
        .await
        .map_err(campaign_not_found)?;

    let stats = state.engine.campaign_stats(id).await?;
    Ok(Json(CampaignStatsResponse {
        total_leads: stats.total_leads,
        pending_leads: stats.pending_leads,
        calling_leads: stats.calling_leads,
        connected_leads: stats.connected_leads,
        completed_leads: stats.completed_leads,
        failed_leads: stats.failed_leads,
        dnc_leads: stats.dnc_leads,
        abandoned_leads: stats.abandoned_leads,
        abandon_rate: stats.abandon_rate(),
    }))
}

// ============== Lead Routes ==============

#[derive(Debug, Deserialize)]
struct LeadCreate {
    phone_number: String,
    name: Option<String>,
    company: Option<String>,
    email: Option<String>,
    notes: Option<String>,
}

#[derive(Debug, Serialize)]
struct LeadResponse {
    id: Uuid,
    phone_number: String,
    name: Option<String>,
    company: Option<String>,
    email: Option<String>,
    status: &'static str,
    outcome: Option<String>,
    fail_reason: Option<String>,
    retry_count: i32,
    created_at: DateTime<Utc>,
    last_called_at: Option<DateTime<Utc>>,
}

fn lead_response(lead: Lead) -> LeadResponse {
    LeadResponse {
        id: lead.id,
        phone_number: lead.phone_number,
        name: lead.name,
        company: lead.company,
        email: lead.email,
        status: lead.status.as_str(),
        outcome: lead.outcome,
        fail_reason: lead.fail_reason,
        retry_count: lead.retry_count,
        created_at: lead.created_at,
        last_called_at: lead.last_called_at,
    }
}

async fn add_lead(
    State(state): State<Arc<AppState>>,
    _claims: auth::Claims,
    Path(id): Path<Uuid>,
    Json(body): Json<LeadCreate>,
) -> Result<(StatusCode, Json<LeadResponse>), ApiError> {
    let campaign = state
        .repo
        .get_campaign(id)
        .await
        .map_err(campaign_not_found)?;
    campaign.can_add_leads()?;

    let mut lead = Lead::new(campaign.id, body.phone_number)?;
    lead.name = body.name;
    lead.company = body.company;
    lead.email = body.email;
    lead.notes = body.notes;

    state.repo.add_lead(&lead).await?;
    Ok((StatusCode::CREATED, Json(lead_response(lead))))
}

async fn list_leads(
    State(state): State<Arc<AppState>>,
    _claims: auth::Claims,
    Path(id): Path<Uuid>,
) -> Result<Json<Vec<LeadResponse>>, ApiError> {
    state
        .repo
        .get_campaign(id)
        .await
        .map_err(campaign_not_found)?;

    let leads = state.repo.list_leads(id).await?;
    Ok(Json(leads.into_iter().map(lead_response).collect()))
}

async fn remove_lead(
    State(state): State<Arc<AppState>>,
    _claims: auth::Claims,
    Path((id, lead_id)): Path<(Uuid, Uuid)>,
) -> Result<StatusCode, ApiError> {
    let lead = state.repo.get_lead(lead_id).await.map_err(|err| match err {
        RepoError::NotFound => ApiError::NotFound("Lead not found".to_string()),
        other => other.into(),
    })?;

    if lead.campaign_id != id {
        return Err(ApiError::NotFound("Lead not found".to_string()));
    }
    if !lead.can_be_called() {
        return Err(ApiError::BadRequest(
            "Only pending leads can be removed".to_string(),
        ));
    }

    state.repo.delete_lead(lead_id).await?;
    Ok(StatusCode::NO_CONTENT)
}

#[derive(Debug, Serialize)]
struct ImportResult {
    imported_count: usize,
    skipped_count: usize,
    errors: Vec<serde_json::Value>,
}

/// CSV import. The file must carry a `phone_number` header; rows that
/// fail validation or collide with existing phones are skipped and
/// reported, not fatal.
async fn import_leads(
    State(state): State<Arc<AppState>>,
    _claims: auth::Claims,
    Path(id): Path<Uuid>,
    mut multipart: Multipart,
) -> Result<Json<ImportResult>, ApiError> {
    let campaign = state
        .repo
        .get_campaign(id)
        .await
        .map_err(campaign_not_found)?;
    campaign.can_add_leads()?;

    let mut content = None;
    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| ApiError::BadRequest(format!("Invalid multipart body: {e}")))?
    {
        if field.name() == Some("file") || content.is_none() {
            content = Some(
                field
                    .bytes()
                    .await
                    .map_err(|e| ApiError::BadRequest(format!("Unreadable upload: {e}")))?,
            );
        }
    }
    let content = content.ok_or_else(|| ApiError::BadRequest("Missing file field".to_string()))?;

    let parsed =
        csv_import::parse_csv(&content).map_err(|e| ApiError::BadRequest(e.to_string()))?;

    let mut errors: Vec<serde_json::Value> = parsed
        .errors
        .iter()
        .map(|e| json!({"row": e.row.to_string(), "error": e.error}))
        .collect();
    let parse_error_count = errors.len();

    let mut imported_count = 0;
    let mut skipped_count = 0;

    for row in parsed.leads {
        let mut lead = match Lead::new(campaign.id, row.phone_number.clone()) {
            Ok(lead) => lead,
            Err(err) => {
                skipped_count += 1;
                errors.push(json!({"phone": row.phone_number, "error": err.to_string()}));
                continue;
            }
        };
        lead.name = row.name;
        lead.company = row.company;
        lead.email = row.email;
        lead.notes = row.notes;

        match state.repo.add_lead(&lead).await {
            Ok(()) => imported_count += 1,
            Err(RepoError::DuplicatePhone(phone)) => {
                skipped_count += 1;
                errors.push(json!({
                    "phone": phone,
                    "error": "Phone number already exists in campaign",
                }));
            }
            Err(other) => return Err(other.into()),
        }
    }

    Ok(Json(ImportResult {
        imported_count,
        skipped_count: skipped_count + parse_error_count,
        errors,
    }))
}

// ============== Telephony Client Token ==============

#[derive(Debug, Serialize)]
struct TwilioTokenResponse {
    token: String,
    identity: String,
}

#[derive(Debug, Serialize)]
struct VoiceGrantOutgoing {
    application_sid: String,
}

#[derive(Debug, Serialize)]
struct VoiceGrantIncoming {
    allow: bool,
}

#[derive(Debug, Serialize)]
struct VoiceGrant {
    outgoing: VoiceGrantOutgoing,
    incoming: VoiceGrantIncoming,
}

#[derive(Debug, Serialize)]
struct TokenGrants {
    identity: String,
    voice: VoiceGrant,
}

#[derive(Debug, Serialize)]
struct TwilioAccessClaims {
    jti: String,
    iss: String,
    sub: String,
    exp: usize,
    grants: TokenGrants,
}

/// Issue a Twilio Voice access token for the browser SDK. 503 when the
/// API-key credentials are not configured.
async fn create_twilio_token(
    State(state): State<Arc<AppState>>,
    claims: auth::Claims,
) -> Result<Json<TwilioTokenResponse>, ApiError> {
    let settings = &state.settings;
    if settings.twilio_account_sid.is_empty()
        || settings.twilio_api_key_sid.is_empty()
        || settings.twilio_api_key_secret.is_empty()
        || settings.twilio_app_sid.is_empty()
    {
        return Err(ApiError::ServiceUnavailable(
            "Twilio credentials not configured".to_string(),
        ));
    }

    let identity = claims.sub.clone();
    let expiration = (Utc::now() + chrono::Duration::hours(1)).timestamp() as usize;

    let token_claims = TwilioAccessClaims {
        jti: format!("{}-{}", settings.twilio_api_key_sid, Uuid::new_v4().simple()),
        iss: settings.twilio_api_key_sid.clone(),
        sub: settings.twilio_account_sid.clone(),
        exp: expiration,
        grants: TokenGrants {
            identity: identity.clone(),
            voice: VoiceGrant {
                outgoing: VoiceGrantOutgoing {
                    application_sid: settings.twilio_app_sid.clone(),
                },
                incoming: VoiceGrantIncoming { allow: true },
            },
        },
    };

    let mut header = jsonwebtoken::Header::default();
    header.cty = Some("twilio-fpa;v=1".to_string());
    header.kid = Some(settings.twilio_api_key_sid.clone());

    let token = jsonwebtoken::encode(
        &header,
        &token_claims,
        &jsonwebtoken::EncodingKey::from_secret(settings.twilio_api_key_secret.as_bytes()),
    )
    .map_err(|_| ApiError::Internal("Token generation error".to_string()))?;

    Ok(Json(TwilioTokenResponse { token, identity }))
}

// ============== Server Startup ==============

/// Build application state and start serving.
pub async fn run_server(settings: Settings) -> anyhow::Result<()> {
    let pool = postgres::init_pool(&settings.database_url).await?;
    if let Err(e) = postgres::run_migrations(&pool).await {
        tracing::warn!("Migration warning (may be already applied): {}", e);
    }
    let repo: Arc<dyn Repository> = Arc::new(postgres::PgRepository::new(pool));

    let operators = Arc::new(OperatorManager::new(settings.max_idle_seconds));
    let connections = Arc::new(ConnectionManager::new());
    let orchestrator = DialerOrchestrator::new(DialerConfig::from_settings(&settings));

    let (telephony, mock_events): (Arc<dyn TelephonyPort>, _) = if settings.twilio_use_mock {
        tracing::info!("Using mock telephony provider");
        let (mock, events) = MockTelephony::new(AmdResult::Human);
        (mock, Some(events))
    } else {
        tracing::info!("Using Twilio telephony provider");
        let client = TwilioClient::new(
            settings.twilio_account_sid.clone(),
            settings.twilio_auth_token.clone(),
            settings.twilio_app_sid.clone(),
        );
        (Arc::new(client), None)
    };

    let engine = Arc::new(DialerEngine::new(
        repo.clone(),
        telephony.clone(),
        operators.clone(),
        connections.clone(),
        orchestrator,
        settings.clone(),
    ));

    // Mock call progression feeds the engine directly; the real provider
    // goes through the webhook endpoints instead.
    if let Some(events) = mock_events {
        engine.clone().spawn_event_pump(events);
    }

    let port = settings.port;
    let state = Arc::new(AppState {
        settings,
        users: auth::UserStore::with_demo_users(),
        repo,
        telephony,
        operators,
        connections,
        engine,
    });

    let app = create_router(state);

    let listener = tokio::net::TcpListener::bind(format!("0.0.0.0:{port}")).await?;
    tracing::info!("Server running on http://0.0.0.0:{}", port);
    axum::serve(listener, app).await?;

    Ok(())
}

#[cfg(test)]
pub(crate) mod testing {
    //! In-memory application state for handler tests.

    use std::sync::Arc;
    use std::time::Duration;

    use super::*;
    use crate::server::repo::memory::MemoryRepository;

    pub async fn state() -> Arc<AppState> {
        state_with(|_| {}).await
    }

    pub async fn state_with(configure: impl FnOnce(&mut Settings)) -> Arc<AppState> {
        state_and_mock(configure).await.0
    }

    /// Like [`state_with`], also handing back the concrete mock so tests
    /// can inspect calls and conferences.
    pub async fn state_and_mock(
        configure: impl FnOnce(&mut Settings),
    ) -> (Arc<AppState>, Arc<MockTelephony>) {
        let mut settings = Settings::from_env();
        settings.twilio_use_mock = true;
        settings.twilio_validate_signature = false;
        // Keep spawned campaign loops dormant; tests tick explicitly
        settings.tick_interval_ms = 3_600_000;
        configure(&mut settings);

        let repo: Arc<dyn Repository> = Arc::new(MemoryRepository::new());
        // Hour-long delays: tests drive transitions explicitly
        let (telephony, _events) = MockTelephony::with_delays(
            AmdResult::Human,
            Duration::from_secs(3600),
            Duration::from_secs(3600),
            Duration::from_secs(3600),
        );
        let mock = telephony.clone();
        let operators = Arc::new(OperatorManager::new(settings.max_idle_seconds));
        let connections = Arc::new(ConnectionManager::new());

        let engine = Arc::new(DialerEngine::new(
            repo.clone(),
            telephony.clone(),
            operators.clone(),
            connections.clone(),
            DialerOrchestrator::new(DialerConfig::from_settings(&settings)),
            settings.clone(),
        ));

        let state = Arc::new(AppState {
            settings,
            users: auth::UserStore::with_demo_users(),
            repo,
            telephony,
            operators,
            connections,
            engine,
        });
        (state, mock)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::CampaignStatus;

    fn claims() -> auth::Claims {
        auth::Claims {
            sub: "admin".to_string(),
            role: "admin".to_string(),
            exp: usize::MAX,
            token_type: "access".to_string(),
        }
    }

    async fn created_campaign(state: &Arc<AppState>, name: &str) -> Uuid {
        let (status, Json(response)) = create_campaign(
            State(state.clone()),
            claims(),
            Json(CampaignCreate {
                name: name.to_string(),
                description: String::new(),
                dial_ratio: None,
                caller_id: None,
            }),
        )
        .await
        .unwrap();
        assert_eq!(status, StatusCode::CREATED);
        response.id
    }

    async fn add_one_lead(state: &Arc<AppState>, campaign_id: Uuid, phone: &str) {
        let (status, _) = add_lead(
            State(state.clone()),
            claims(),
            Path(campaign_id),
            Json(LeadCreate {
                phone_number: phone.to_string(),
                name: None,
                company: None,
                email: None,
                notes: None,
            }),
        )
        .await
        .unwrap();
        assert_eq!(status, StatusCode::CREATED);
    }

    #[tokio::test]
    async fn campaign_crud_round_trip() {
        let state = testing::state().await;
        let id = created_campaign(&state, "C1").await;

        let Json(fetched) = get_campaign(State(state.clone()), claims(), Path(id))
            .await
            .unwrap();
        assert_eq!(fetched.name, "C1");
        assert_eq!(fetched.status, "draft");
        assert_eq!(fetched.lead_count, 0);

        let Json(all) = list_campaigns(State(state.clone()), claims()).await.unwrap();
        assert_eq!(all.len(), 1);

        let missing = get_campaign(State(state), claims(), Path(Uuid::new_v4())).await;
        assert!(matches!(missing.unwrap_err(), ApiError::NotFound(_)));
    }

    #[tokio::test]
    async fn invalid_campaign_payloads_rejected() {
        let state = testing::state().await;

        let blank = create_campaign(
            State(state.clone()),
            claims(),
            Json(CampaignCreate {
                name: "  ".to_string(),
                description: String::new(),
                dial_ratio: None,
                caller_id: None,
            }),
        )
        .await;
        assert!(matches!(blank.unwrap_err(), ApiError::BadRequest(_)));

        let bad_ratio = create_campaign(
            State(state.clone()),
            claims(),
            Json(CampaignCreate {
                name: "C".to_string(),
                description: String::new(),
                dial_ratio: Some(-1.0),
                caller_id: None,
            }),
        )
        .await;
        assert!(matches!(bad_ratio.unwrap_err(), ApiError::BadRequest(_)));

        let bad_caller = create_campaign(
            State(state),
            claims(),
            Json(CampaignCreate {
                name: "C".to_string(),
                description: String::new(),
                dial_ratio: None,
                caller_id: Some("0312345678".to_string()),
            }),
        )
        .await;
        assert!(matches!(bad_caller.unwrap_err(), ApiError::BadRequest(_)));
    }

    #[tokio::test]
    async fn lifecycle_endpoints_enforce_transitions() {
        let state = testing::state().await;
        let id = created_campaign(&state, "C1").await;

        // Cannot start without leads
        let empty_start = start_campaign(State(state.clone()), claims(), Path(id)).await;
        assert!(matches!(empty_start.unwrap_err(), ApiError::BadRequest(_)));

        // Resume on a draft campaign is a 400
        let resume_draft = resume_campaign(State(state.clone()), claims(), Path(id)).await;
        assert!(matches!(resume_draft.unwrap_err(), ApiError::BadRequest(_)));

        add_one_lead(&state, id, "+818011112222").await;

        let Json(started) = start_campaign(State(state.clone()), claims(), Path(id))
            .await
            .unwrap();
        assert_eq!(started.status, "running");
        assert!(started.started_at.is_some());
        assert!(state.engine.is_running(id).await);

        let Json(paused) = pause_campaign(State(state.clone()), claims(), Path(id))
            .await
            .unwrap();
        assert_eq!(paused.status, "paused");

        let Json(resumed) = resume_campaign(State(state.clone()), claims(), Path(id))
            .await
            .unwrap();
        assert_eq!(resumed.status, "running");

        let Json(stopped) = stop_campaign(State(state.clone()), claims(), Path(id))
            .await
            .unwrap();
        assert_eq!(stopped.status, "stopped");

        let campaign = state.repo.get_campaign(id).await.unwrap();
        assert_eq!(campaign.status, CampaignStatus::Stopped);
    }

    #[tokio::test]
    async fn duplicate_phone_is_bad_request_naming_the_phone() {
        let state = testing::state().await;
        let id = created_campaign(&state, "C1").await;

        add_one_lead(&state, id, "+818011112222").await;

        let dup = add_lead(
            State(state),
            claims(),
            Path(id),
            Json(LeadCreate {
                phone_number: "+818011112222".to_string(),
                name: None,
                company: None,
                email: None,
                notes: None,
            }),
        )
        .await;
        match dup.unwrap_err() {
            ApiError::BadRequest(message) => assert!(message.contains("+818011112222")),
            other => panic!("expected BadRequest, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn stats_endpoint_reports_counts() {
        let state = testing::state().await;
        let id = created_campaign(&state, "C1").await;
        add_one_lead(&state, id, "+818011112222").await;

        let Json(stats) = get_campaign_stats(State(state), claims(), Path(id))
            .await
            .unwrap();
        assert_eq!(stats.total_leads, 1);
        assert_eq!(stats.pending_leads, 1);
        assert_eq!(stats.abandon_rate, 0.0);
    }

    #[tokio::test]
    async fn remove_lead_pending_only() {
        let state = testing::state().await;
        let id = created_campaign(&state, "C1").await;
        add_one_lead(&state, id, "+818011112222").await;

        let lead = state.repo.list_leads(id).await.unwrap().remove(0);

        // A calling lead cannot be removed
        let mut calling = lead.clone();
        calling.start_calling().unwrap();
        state.repo.update_lead(&calling).await.unwrap();
        let rejected = remove_lead(State(state.clone()), claims(), Path((id, lead.id))).await;
        assert!(matches!(rejected.unwrap_err(), ApiError::BadRequest(_)));

        // Back to pending: removal works
        state.repo.update_lead(&lead).await.unwrap();
        let status = remove_lead(State(state.clone()), claims(), Path((id, lead.id)))
            .await
            .unwrap();
        assert_eq!(status, StatusCode::NO_CONTENT);
        assert_eq!(state.repo.count_leads(id).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn full_call_flow_to_completion() {
        use crate::models::{EventType, LeadStatus, OperatorStatus};
        use crate::server::ws::connection::ConnectionRole;
        use axum::http::HeaderMap;
        use std::collections::HashMap;

        let (state, mock) = testing::state_and_mock(|_| {}).await;
        let id = created_campaign(&state, "C1").await;
        add_one_lead(&state, id, "+818011112222").await;

        // Operator online and listening on the fabric
        state.operators.ensure_session("user-003", "operator1").await;
        state.operators.go_online("user-003").await.unwrap();
        let mut op_rx = state
            .connections
            .connect("user-003", ConnectionRole::Operator, json!({}))
            .await;
        op_rx.recv().await.unwrap(); // connected

        let Json(started) = start_campaign(State(state.clone()), claims(), Path(id))
            .await
            .unwrap();
        assert_eq!(started.status, "running");

        // One tick launches the only lead
        let report = state.engine.tick(id).await.unwrap();
        assert_eq!(report.launched, 1);
        assert_eq!(
            state.repo.list_leads(id).await.unwrap()[0].status,
            LeadStatus::Calling
        );
        let call_sid = mock.call_sids().pop().unwrap();

        // AMD verdict arrives through the webhook: bridged to the operator
        let mut form = HashMap::new();
        form.insert("CallSid".to_string(), call_sid.clone());
        form.insert("AnsweredBy".to_string(), "human".to_string());
        let response = webhooks::amd_webhook(
            State(state.clone()),
            HeaderMap::new(),
            axum::Form(form),
        )
        .await;
        assert_eq!(response.status(), StatusCode::OK);

        let lead = state.repo.list_leads(id).await.unwrap().remove(0);
        assert_eq!(lead.status, LeadStatus::Connected);

        let operator = state.operators.get_operator("user-003").await.unwrap();
        assert_eq!(operator.status, OperatorStatus::OnCall);
        assert_eq!(operator.current_call_sid.as_deref(), Some(call_sid.as_str()));

        // The customer leg joined the per-call conference room
        let conference_sid = mock.get_call(&call_sid).unwrap().conference_sid.unwrap();
        let conference = mock.get_conference(&conference_sid).unwrap();
        assert_eq!(conference.friendly_name, format!("room-{call_sid}"));

        // The operator was notified
        let msg = op_rx.recv().await.unwrap();
        assert_eq!(msg.event, EventType::IncomingCall);
        assert_eq!(msg.data["phone_number"], "+818011112222");

        // Operator wraps up with an outcome
        state
            .engine
            .operator_end_call("user-003", &call_sid, "interested")
            .await
            .unwrap();

        let lead = state.repo.list_leads(id).await.unwrap().remove(0);
        assert_eq!(lead.status, LeadStatus::Completed);
        assert_eq!(lead.outcome.as_deref(), Some("interested"));

        let operator = state.operators.get_operator("user-003").await.unwrap();
        assert_eq!(operator.status, OperatorStatus::Available);
        assert_eq!(operator.calls_handled, 1);

        // The single-lead campaign completed
        let Json(fetched) = get_campaign(State(state.clone()), claims(), Path(id))
            .await
            .unwrap();
        assert_eq!(fetched.status, "completed");
        assert!(fetched.completed_at.is_some());

        let Json(stats) = get_campaign_stats(State(state), claims(), Path(id))
            .await
            .unwrap();
        assert_eq!(stats.completed_leads, 1);
        assert_eq!(stats.abandon_rate, 0.0);
    }

    #[tokio::test]
    async fn twilio_token_requires_credentials() {
        let state = testing::state().await;
        let missing = create_twilio_token(State(state), claims()).await;
        assert!(matches!(
            missing.unwrap_err(),
            ApiError::ServiceUnavailable(_)
        ));

        let configured = testing::state_with(|settings| {
            settings.twilio_account_sid = "AC123".to_string();
            settings.twilio_api_key_sid = "SK123".to_string();
            settings.twilio_api_key_secret = "secret".to_string();
            settings.twilio_app_sid = "AP123".to_string();
        })
        .await;
        let Json(token) = create_twilio_token(State(configured), claims()).await.unwrap();
        assert_eq!(token.identity, "admin");
        assert!(!token.token.is_empty());
    }
}
