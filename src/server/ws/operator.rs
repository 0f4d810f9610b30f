//! Operator websocket channel.

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
use crate::server::ws::connection::ConnectionRole;
use crate::server::AppState;

use super::{authenticate, WsAuthQuery, CLOSE_UNAUTHORIZED};

/// `GET /ws/operator?token=...`
///
/// Handles status changes, incoming-call notifications and call
/// accept/end actions for one operator principal.
pub async fn operator_websocket(
    ws: WebSocketUpgrade,
    Query(query): Query<WsAuthQuery>,
    State(state): State<Arc<AppState>>,
) -> Response {
    ws.on_upgrade(move |socket| handle_socket(socket, state, query.token))
}

async fn handle_socket(mut socket: WebSocket, state: Arc<AppState>, token: Option<String>) {
    let Some(user) = authenticate(&state, token.as_deref()) else {
        let _ = socket
            .send(Message::Close(Some(CloseFrame {
                code: CLOSE_UNAUTHORIZED,
                reason: "Unauthorized".into(),
            })))
            .await;
        return;
    };

    let user_id = user.id.clone();
    let outbound = state
        .connections
        .connect(
            &user_id,
            ConnectionRole::Operator,
            json!({"username": user.username, "role": user.role.as_str()}),
        )
        .await;
    state.operators.ensure_session(&user_id, &user.username).await;

    let (mut sink, mut stream) = socket.split();

    // Single writer: everything queued on the connection goes out here
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
                Ok(action) => handle_action(&state, &user_id, action).await,
                Err(_) => {
                    state
                        .connections
                        .send_to_user(
                            &user_id,
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
    state.connections.disconnect(&user_id).await;
    // A dropped connection takes the operator out of the pool
    state.operators.go_offline(&user_id).await;
    broadcast_operator_list(&state).await;
}

async fn handle_action(state: &Arc<AppState>, user_id: &str, action: Value) {
    match action.get("action").and_then(Value::as_str) {
        Some("ping") => {
            state
                .connections
                .send_to_user(user_id, WsMessage::new(EventType::Pong, json!({})))
                .await;
        }

        Some("set_status") => {
            let requested = action.get("status").and_then(Value::as_str).unwrap_or("");
            let updated = match requested {
                "available" => state.operators.make_available(user_id).await,
                "on_break" => state.operators.go_on_break(user_id).await,
                "offline" => state.operators.go_offline(user_id).await,
                "wrap_up" => state.operators.start_wrap_up(user_id).await,
                _ => None,
            };

            let Some(operator) = updated else {
                state
                    .connections
                    .send_to_user(
                        user_id,
                        WsMessage::new(
                            EventType::Error,
                            json!({"message": format!("Unknown status: {requested}")}),
                        ),
                    )
                    .await;
                return;
            };

            let change = json!({
                "operator_id": user_id,
                "status": operator.status.as_str(),
            });
            state
                .connections
                .send_to_user(
                    user_id,
                    WsMessage::new(EventType::OperatorStatusChanged, change.clone()),
                )
                .await;
            state
                .connections
                .broadcast_to_dashboards(WsMessage::new(EventType::OperatorStatusChanged, change))
                .await;
            broadcast_operator_list(state).await;
        }

        Some("accept_call") => {
            let call_sid = action
                .get("call_sid")
                .and_then(Value::as_str)
                .unwrap_or("")
                .to_string();
            let lead_id = action
                .get("lead_id")
                .and_then(Value::as_str)
                .and_then(|v| Uuid::parse_str(v).ok());

            // The engine normally assigns at AMD time; a manual accept
            // only binds the call if the operator is still free.
            let already_bound = state
                .operators
                .get_operator(user_id)
                .await
                .map(|op| op.current_call_sid.as_deref() == Some(call_sid.as_str()))
                .unwrap_or(false);
            if !already_bound {
                if let Some(lead_id) = lead_id {
                    state.operators.assign_call(user_id, &call_sid, lead_id).await;
                }
            }

            state
                .connections
                .send_to_user(
                    user_id,
                    WsMessage::new(
                        EventType::CallConnected,
                        json!({"call_sid": call_sid, "operator_id": user_id}),
                    ),
                )
                .await;
            broadcast_operator_list(state).await;
        }

        Some("end_call") => {
            let call_sid = action
                .get("call_sid")
                .and_then(Value::as_str)
                .unwrap_or("")
                .to_string();
            let outcome = action
                .get("outcome")
                .and_then(Value::as_str)
                .unwrap_or("completed")
                .to_string();

            match state
                .engine
                .operator_end_call(user_id, &call_sid, &outcome)
                .await
            {
                Ok(()) => {
                    state
                        .connections
                        .send_to_user(
                            user_id,
                            WsMessage::new(
                                EventType::CallEnded,
                                json!({
                                    "call_sid": call_sid,
                                    "operator_id": user_id,
                                    "outcome": outcome,
                                }),
                            ),
                        )
                        .await;
                }
                Err(err) => {
                    state
                        .connections
                        .send_to_user(
                            user_id,
                            WsMessage::new(
                                EventType::Error,
                                json!({"message": err.to_string()}),
                            ),
                        )
                        .await;
                }
            }
        }

        // Test fixture: echo an incoming call back to the operator
        Some("test_incoming_call") => {
            state
                .connections
                .send_to_user(
                    user_id,
                    WsMessage::new(
                        EventType::IncomingCall,
                        json!({
                            "call_sid": action.get("call_sid"),
                            "lead_id": action.get("lead_id"),
                            "phone_number": action.get("phone_number"),
                            "name": action.get("name"),
                        }),
                    ),
                )
                .await;
        }

        _ => {}
    }
}

async fn broadcast_operator_list(state: &Arc<AppState>) {
    let operators = state.operators.get_all_operators().await;
    state
        .connections
        .broadcast_to_dashboards(WsMessage::new(
            EventType::OperatorListUpdated,
            json!({"operators": operators}),
        ))
        .await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::OperatorStatus;
    use crate::server::testing;

    #[tokio::test]
    async fn ping_yields_pong() {
        let state = testing::state().await;
        let mut rx = state
            .connections
            .connect("user-003", ConnectionRole::Operator, json!({}))
            .await;
        rx.recv().await.unwrap(); // connected

        handle_action(&state, "user-003", json!({"action": "ping"})).await;
        assert_eq!(rx.recv().await.unwrap().event, EventType::Pong);
    }

    #[tokio::test]
    async fn set_status_updates_session_and_notifies() {
        let state = testing::state().await;
        state.operators.ensure_session("user-003", "operator1").await;
        let mut op_rx = state
            .connections
            .connect("user-003", ConnectionRole::Operator, json!({}))
            .await;
        let mut dash_rx = state
            .connections
            .connect("dash-1", ConnectionRole::Dashboard, json!({}))
            .await;
        op_rx.recv().await.unwrap();
        dash_rx.recv().await.unwrap();

        handle_action(
            &state,
            "user-003",
            json!({"action": "set_status", "status": "available"}),
        )
        .await;

        let operator = state.operators.get_operator("user-003").await.unwrap();
        assert_eq!(operator.status, OperatorStatus::Available);

        let msg = op_rx.recv().await.unwrap();
        assert_eq!(msg.event, EventType::OperatorStatusChanged);
        assert_eq!(msg.data["status"], "available");

        // Dashboards see both the status change and the refreshed list
        assert_eq!(
            dash_rx.recv().await.unwrap().event,
            EventType::OperatorStatusChanged
        );
        assert_eq!(
            dash_rx.recv().await.unwrap().event,
            EventType::OperatorListUpdated
        );
    }

    #[tokio::test]
    async fn unknown_status_is_an_error() {
        let state = testing::state().await;
        state.operators.ensure_session("user-003", "operator1").await;
        let mut rx = state
            .connections
            .connect("user-003", ConnectionRole::Operator, json!({}))
            .await;
        rx.recv().await.unwrap();

        handle_action(
            &state,
            "user-003",
            json!({"action": "set_status", "status": "napping"}),
        )
        .await;

        let msg = rx.recv().await.unwrap();
        assert_eq!(msg.event, EventType::Error);
    }

    #[tokio::test]
    async fn end_call_without_call_is_an_error() {
        let state = testing::state().await;
        state.operators.ensure_session("user-003", "operator1").await;
        let mut rx = state
            .connections
            .connect("user-003", ConnectionRole::Operator, json!({}))
            .await;
        rx.recv().await.unwrap();

        handle_action(
            &state,
            "user-003",
            json!({"action": "end_call", "call_sid": "CAghost", "outcome": "interested"}),
        )
        .await;

        let msg = rx.recv().await.unwrap();
        assert_eq!(msg.event, EventType::Error);
    }
}
