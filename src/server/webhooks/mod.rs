//! Telephony provider webhook ingestion.
//!
//! Three signed form-encoded callbacks: call status, AMD verdicts and
//! the initial voice handshake. Responses are always the provider's XML
//! control format; dispatch errors are logged and alerted but still
//! answered 200 to avoid provider retry storms. Only signature failures
//! are rejected.

pub mod signature;

use std::collections::HashMap;
use std::sync::Arc;

use axum::{
    extract::State,
    http::{header, HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    Form,
};

use crate::server::telephony::{AmdResult, CallStatus};
use crate::server::AppState;

const SIGNATURE_HEADER: &str = "X-Twilio-Signature";

const EMPTY_ACK: &str = r#"<?xml version="1.0" encoding="UTF-8"?><Response></Response>"#;
const HANGUP: &str = r#"<?xml version="1.0" encoding="UTF-8"?><Response><Hangup/></Response>"#;
const VOICE_PAUSE: &str =
    r#"<?xml version="1.0" encoding="UTF-8"?><Response><Pause length="1"/></Response>"#;

fn bridge_twiml(call_sid: &str) -> String {
    format!(
        r#"<?xml version="1.0" encoding="UTF-8"?><Response><Dial><Conference beep="false" startConferenceOnEnter="true" endConferenceOnExit="true">room-{call_sid}</Conference></Dial></Response>"#
    )
}

fn twiml(content: impl Into<String>) -> Response {
    (
        StatusCode::OK,
        [(header::CONTENT_TYPE, "application/xml")],
        content.into(),
    )
        .into_response()
}

/// Verify the provider signature when validation is enabled.
/// Returns an error response to short-circuit with on failure.
fn check_signature(
    state: &AppState,
    headers: &HeaderMap,
    path: &str,
    form: &HashMap<String, String>,
) -> Result<(), Response> {
    if !state.settings.twilio_validate_signature {
        return Ok(());
    }

    let Some(url) = state.settings.webhook_url(path) else {
        tracing::error!("Signature validation enabled but PUBLIC_BASE_URL is not set");
        return Err(StatusCode::INTERNAL_SERVER_ERROR.into_response());
    };
    if state.settings.twilio_auth_token.is_empty() {
        tracing::error!("Signature validation enabled but TWILIO_AUTH_TOKEN is not set");
        return Err(StatusCode::INTERNAL_SERVER_ERROR.into_response());
    }

    let provided = headers
        .get(SIGNATURE_HEADER)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("");

    let params: Vec<(String, String)> = form
        .iter()
        .map(|(k, v)| (k.clone(), v.clone()))
        .collect();

    if !signature::verify_signature(&state.settings.twilio_auth_token, &url, &params, provided) {
        tracing::warn!("Rejected webhook with invalid signature on {}", path);
        return Err(StatusCode::FORBIDDEN.into_response());
    }
    Ok(())
}

/// Call status callback: busy/no-answer/failed/canceled fail a CALLING
/// lead; completed finishes a CONNECTED one.
pub async fn status_webhook(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Form(form): Form<HashMap<String, String>>,
) -> Response {
    if let Err(rejection) = check_signature(&state, &headers, "/webhooks/twilio/status", &form) {
        return rejection;
    }

    let call_sid = form.get("CallSid").cloned().unwrap_or_default();
    let raw_status = form.get("CallStatus").cloned().unwrap_or_default();
    tracing::info!("Call {} status: {}", call_sid, raw_status);

    if let (false, Some(status)) = (call_sid.is_empty(), CallStatus::parse(&raw_status)) {
        if let Err(err) = state.engine.handle_status(&call_sid, status).await {
            tracing::debug!("Status callback not applied for {}: {}", call_sid, err);
        }
    }

    if let Some(code) = form.get("ErrorCode") {
        tracing::warn!(
            "Provider error on call {}: {} {}",
            call_sid,
            code,
            form.get("ErrorMessage").map(String::as_str).unwrap_or("")
        );
    }

    twiml(EMPTY_ACK)
}

/// AMD callback: humans get bridged into the per-call conference room,
/// everything else is told to hang up.
pub async fn amd_webhook(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Form(form): Form<HashMap<String, String>>,
) -> Response {
    if let Err(rejection) = check_signature(&state, &headers, "/webhooks/twilio/amd", &form) {
        return rejection;
    }

    let call_sid = form.get("CallSid").cloned().unwrap_or_default();
    let answered_by = form.get("AnsweredBy").cloned().unwrap_or_default();
    tracing::info!("AMD result for {}: {}", call_sid, answered_by);

    let result = AmdResult::parse(&answered_by).unwrap_or(AmdResult::Unknown);

    if !call_sid.is_empty() {
        if let Err(err) = state.engine.handle_amd(&call_sid, result).await {
            tracing::debug!("AMD callback not applied for {}: {}", call_sid, err);
        }
    }

    match result {
        AmdResult::Human => twiml(bridge_twiml(&call_sid)),
        _ => twiml(HANGUP),
    }
}

/// Initial answered-call handshake: a short pause lets AMD finish
/// before the provider fetches the next control step.
pub async fn voice_webhook(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Form(form): Form<HashMap<String, String>>,
) -> Response {
    if let Err(rejection) = check_signature(&state, &headers, "/webhooks/twilio/voice", &form) {
        return rejection;
    }

    tracing::info!(
        "Voice webhook: {} from {} to {}",
        form.get("CallSid").map(String::as_str).unwrap_or(""),
        form.get("From").map(String::as_str).unwrap_or(""),
        form.get("To").map(String::as_str).unwrap_or(""),
    );

    twiml(VOICE_PAUSE)
}
