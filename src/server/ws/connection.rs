//! WebSocket connection registry and fan-out.
//!
//! Each connection owns an unbounded outbound queue; the socket task
//! drains it. Broadcasts snapshot the senders before emitting so a
//! failed send never mutates the registry mid-iteration; broken
//! connections are removed afterwards. Delivery is best-effort,
//! at-most-once.

use std::collections::{HashMap, HashSet};

use chrono::{DateTime, Utc};
use serde_json::{json, Value};
use tokio::sync::{mpsc, RwLock};
use uuid::Uuid;

use crate::models::{EventType, WsMessage};

/// Audience a connection belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionRole {
    Operator,
    Dashboard,
}

impl ConnectionRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConnectionRole::Operator => "operator",
            ConnectionRole::Dashboard => "dashboard",
        }
    }
}

struct Connection {
    user_id: String,
    role: ConnectionRole,
    tx: mpsc::UnboundedSender<WsMessage>,
    #[allow(dead_code)]
    connected_at: DateTime<Utc>,
    #[allow(dead_code)]
    metadata: Value,
    subscribed_campaigns: HashSet<Uuid>,
}

/// Process-wide registry of live websocket connections.
#[derive(Default)]
pub struct ConnectionManager {
    connections: RwLock<HashMap<String, Connection>>,
}

impl ConnectionManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a connection and hand back the outbound queue for the
    /// socket task to drain. The `connected` confirmation is queued
    /// immediately.
    pub async fn connect(
        &self,
        user_id: &str,
        role: ConnectionRole,
        metadata: Value,
    ) -> mpsc::UnboundedReceiver<WsMessage> {
        let (tx, rx) = mpsc::unbounded_channel();

        let connection = Connection {
            user_id: user_id.to_string(),
            role,
            tx: tx.clone(),
            connected_at: Utc::now(),
            metadata,
            subscribed_campaigns: HashSet::new(),
        };

        // A reconnect replaces the previous connection for the principal
        self.connections
            .write()
            .await
            .insert(user_id.to_string(), connection);

        let _ = tx.send(WsMessage::new(
            EventType::Connected,
            json!({"user_id": user_id, "connection_type": role.as_str()}),
        ));

        rx
    }

    pub async fn disconnect(&self, user_id: &str) {
        self.connections.write().await.remove(user_id);
    }

    pub async fn operator_count(&self) -> usize {
        self.count_by(ConnectionRole::Operator).await
    }

    pub async fn dashboard_count(&self) -> usize {
        self.count_by(ConnectionRole::Dashboard).await
    }

    async fn count_by(&self, role: ConnectionRole) -> usize {
        self.connections
            .read()
            .await
            .values()
            .filter(|c| c.role == role)
            .count()
    }

    pub async fn subscribe_campaign(&self, user_id: &str, campaign_id: Uuid) -> bool {
        let mut connections = self.connections.write().await;
        match connections.get_mut(user_id) {
            Some(connection) => {
                connection.subscribed_campaigns.insert(campaign_id);
                true
            }
            None => false,
        }
    }

    /// Send to one principal. A broken queue removes the connection.
    pub async fn send_to_user(&self, user_id: &str, message: WsMessage) -> bool {
        let tx = {
            let connections = self.connections.read().await;
            match connections.get(user_id) {
                Some(connection) => connection.tx.clone(),
                None => return false,
            }
        };

        if tx.send(message).is_err() {
            self.disconnect(user_id).await;
            return false;
        }
        true
    }

    async fn broadcast<F>(&self, message: WsMessage, filter: F) -> usize
    where
        F: Fn(&Connection) -> bool,
    {
        let targets: Vec<(String, mpsc::UnboundedSender<WsMessage>)> = {
            let connections = self.connections.read().await;
            connections
                .values()
                .filter(|c| filter(c))
                .map(|c| (c.user_id.clone(), c.tx.clone()))
                .collect()
        };

        let mut sent = 0;
        let mut failed = Vec::new();
        for (user_id, tx) in targets {
            if tx.send(message.clone()).is_ok() {
                sent += 1;
            } else {
                failed.push(user_id);
            }
        }

        for user_id in failed {
            self.disconnect(&user_id).await;
        }
        sent
    }

    pub async fn broadcast_to_operators(&self, message: WsMessage) -> usize {
        self.broadcast(message, |c| c.role == ConnectionRole::Operator)
            .await
    }

    pub async fn broadcast_to_dashboards(&self, message: WsMessage) -> usize {
        self.broadcast(message, |c| c.role == ConnectionRole::Dashboard)
            .await
    }

    pub async fn broadcast_to_all(&self, message: WsMessage) -> usize {
        self.broadcast(message, |_| true).await
    }

    /// Campaign stats go only to dashboards subscribed to that campaign.
    pub async fn broadcast_campaign_stats(&self, campaign_id: Uuid, message: WsMessage) -> usize {
        self.broadcast(message, |c| {
            c.role == ConnectionRole::Dashboard && c.subscribed_campaigns.contains(&campaign_id)
        })
        .await
    }
}
