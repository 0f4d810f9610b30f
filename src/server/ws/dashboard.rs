//! Supervisor dashboard websocket channel.

use std::sync::Arc;

use axum::{
    extract::{
        ws::{CloseFrame, Message, WebSocket, WebSocketUpgrade},
        Query, State,
    },
    response::Response,
};
use futures::{SinkExt, StreamExt};
use serde_json::{json, Value};
use tokio_stream::wrappers::UnboundedReceiverStream;
use uuid::Uuid;

use crate::models::{EventType, WsMessage};
use crate::server::dialer::engine::stats_payload;
use crate::server::ws::connection::ConnectionRole;
use crate::server::AppState;

use super::{authenticate_supervisor, WsAuthQuery, CLOSE_UNAUTHORIZED};

/// `GET /ws/dashboard?token=...`
///
/// Supervisor-only channel carrying campaign stats, operator lists and
/// alerts.
pub async fn dashboard_websocket(
    ws: WebSocketUpgrade,
    Query(query): Query<WsAuthQuery>,
    State(state): State<Arc<AppState>>,
) -> Response {
    ws.on_upgrade(move |socket| handle_socket(socket, state, query.token))
}

async fn handle_socket(mut socket: WebSocket, state: Arc<AppState>, token: Option<String>) {
    let Some(user) = authenticate_supervisor(&state, token.as_deref()) else {
        let _ = socket
            .send(Message::Close(Some(CloseFrame {
                code: CLOSE_UNAUTHORIZED,
                reason: "Unauthorized".into(),
            })))
            .await;
        return;
    };

    let connection_id = format!("dashboard-{}", user.id);
    let outbound = state
        .connections
        .connect(
            &connection_id,
            ConnectionRole::Dashboard,
            json!({"username": user.username, "role": user.role.as_str()}),
        )
        .await;

    let (mut sink, mut stream) = socket.split();

    let mut outbound = UnboundedReceiverStream::new(outbound);
    let writer = tokio::spawn(async move {
        while let Some(message) = outbound.next().await {
            if sink
                .send(Message::Text(message.to_json().into()))
                .await
                .is_err()
            {
                break;
            }
        }
    });

    while let Some(Ok(message)) = stream.next().await {
        match message {
            Message::Text(text) => match serde_json::from_str::<Value>(&text) {
                Ok(action) => handle_action(&state, &connection_id, action).await,
                Err(_) => {
                    state
                        .connections
                        .send_to_user(
                            &connection_id,
                            WsMessage::new(EventType::Error, json!({"message": "Invalid JSON"})),
                        )
                        .await;
                }
            },
            Message::Close(_) => break,
            _ => {}
        }
    }

    writer.abort();
    state.connections.disconnect(&connection_id).await;
}

async fn send_campaign_stats(state: &Arc<AppState>, connection_id: &str, campaign_id: Uuid) {
    let campaign = match state.repo.get_campaign(campaign_id).await {
        Ok(campaign) => campaign,
        Err(_) => {
            state
                .connections
                .send_to_user(
                    connection_id,
                    WsMessage::new(
                        EventType::Error,
                        json!({"message": format!("Campaign {campaign_id} not found")}),
                    ),
                )
                .await;
            return;
        }
    };

    match state.engine.campaign_stats(campaign_id).await {
        Ok(stats) => {
            state
                .connections
                .send_to_user(
                    connection_id,
                    WsMessage::new(
                        EventType::CampaignStatsUpdated,
                        stats_payload(&campaign, &stats),
                    ),
                )
                .await;
        }
        Err(err) => {
            state
                .connections
                .send_to_user(
                    connection_id,
                    WsMessage::new(EventType::Error, json!({"message": err.to_string()})),
                )
                .await;
        }
    }
}

async fn handle_action(state: &Arc<AppState>, connection_id: &str, action: Value) {
    match action.get("action").and_then(Value::as_str) {
        Some("ping") => {
            state
                .connections
                .send_to_user(connection_id, WsMessage::new(EventType::Pong, json!({})))
                .await;
        }

        Some("subscribe_campaign") => {
            let Some(campaign_id) = action
                .get("campaign_id")
                .and_then(Value::as_str)
                .and_then(|v| Uuid::parse_str(v).ok())
            else {
                state
                    .connections
                    .send_to_user(
                        connection_id,
                        WsMessage::new(
                            EventType::Error,
                            json!({"message": "campaign_id is required"}),
                        ),
                    )
                    .await;
                return;
            };

            state
                .connections
                .subscribe_campaign(connection_id, campaign_id)
                .await;
            send_campaign_stats(state, connection_id, campaign_id).await;
        }

        Some("refresh_stats") => {
            if let Some(campaign_id) = action
                .get("campaign_id")
                .and_then(Value::as_str)
                .and_then(|v| Uuid::parse_str(v).ok())
            {
                send_campaign_stats(state, connection_id, campaign_id).await;
            }
        }

        Some("get_operators") => {
            let operators = state.operators.get_all_operators().await;
            state
                .connections
                .send_to_user(
                    connection_id,
                    WsMessage::new(
                        EventType::OperatorListUpdated,
                        json!({"operators": operators}),
                    ),
                )
                .await;
        }

        // Test fixture: echo an alert to all dashboards
        Some("test_alert") => {
            state
                .connections
                .broadcast_to_dashboards(WsMessage::new(
                    EventType::Alert,
                    json!({
                        "alert_type": action.get("alert_type"),
                        "message": action.get("message"),
                        "severity": action.get("severity").cloned()
                            .unwrap_or_else(|| json!("warning")),
                    }),
                ))
                .await;
        }

        _ => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{Campaign, Lead};
    use crate::server::testing;

    #[tokio::test]
    async fn subscribe_returns_stats_and_registers() {
        let state = testing::state().await;

        let campaign = Campaign::new("Dash Test", "").unwrap();
        state.repo.create_campaign(&campaign).await.unwrap();
        state
            .repo
            .add_lead(&Lead::new(campaign.id, "+818011110001").unwrap())
            .await
            .unwrap();

        let mut rx = state
            .connections
            .connect("dashboard-1", ConnectionRole::Dashboard, json!({}))
            .await;
        rx.recv().await.unwrap();

        handle_action(
            &state,
            "dashboard-1",
            json!({"action": "subscribe_campaign", "campaign_id": campaign.id.to_string()}),
        )
        .await;

        let msg = rx.recv().await.unwrap();
        assert_eq!(msg.event, EventType::CampaignStatsUpdated);
        assert_eq!(msg.data["total_leads"], 1);
        assert_eq!(msg.data["pending_leads"], 1);
        assert_eq!(msg.data["abandon_rate"], 0.0);

        // Subscribed dashboards now receive pushed stats
        let sent = state
            .connections
            .broadcast_campaign_stats(
                campaign.id,
                WsMessage::new(EventType::CampaignStatsUpdated, json!({})),
            )
            .await;
        assert_eq!(sent, 1);
    }

    #[tokio::test]
    async fn subscribe_unknown_campaign_errors() {
        let state = testing::state().await;
        let mut rx = state
            .connections
            .connect("dashboard-1", ConnectionRole::Dashboard, json!({}))
            .await;
        rx.recv().await.unwrap();

        handle_action(
            &state,
            "dashboard-1",
            json!({"action": "subscribe_campaign", "campaign_id": Uuid::new_v4().to_string()}),
        )
        .await;

        let msg = rx.recv().await.unwrap();
        assert_eq!(msg.event, EventType::Error);
    }

    #[tokio::test]
    async fn get_operators_lists_sessions() {
        let state = testing::state().await;
        state.operators.ensure_session("op-1", "Alice").await;
        state.operators.go_online("op-1").await.unwrap();

        let mut rx = state
            .connections
            .connect("dashboard-1", ConnectionRole::Dashboard, json!({}))
            .await;
        rx.recv().await.unwrap();

        handle_action(&state, "dashboard-1", json!({"action": "get_operators"})).await;

        let msg = rx.recv().await.unwrap();
        assert_eq!(msg.event, EventType::OperatorListUpdated);
        assert_eq!(msg.data["operators"][0]["id"], "op-1");
        assert_eq!(msg.data["operators"][0]["status"], "available");
    }

    #[tokio::test]
    async fn test_alert_broadcasts_to_dashboards() {
        let state = testing::state().await;
        let mut rx = state
            .connections
            .connect("dashboard-1", ConnectionRole::Dashboard, json!({}))
            .await;
        rx.recv().await.unwrap();

        handle_action(
            &state,
            "dashboard-1",
            json!({"action": "test_alert", "alert_type": "drill", "message": "hello"}),
        )
        .await;

        let msg = rx.recv().await.unwrap();
        assert_eq!(msg.event, EventType::Alert);
        assert_eq!(msg.data["alert_type"], "drill");
        assert_eq!(msg.data["severity"], "warning");
    }
}
