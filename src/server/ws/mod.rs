//! Real-time event fabric: connection registry and the operator /
//! dashboard websocket channels.

pub mod connection;
pub mod dashboard;
pub mod operator;

use serde::Deserialize;

use crate::server::auth::{self, User};
use crate::server::AppState;

/// `?token=` query parameter carried on the websocket handshake.
#[derive(Debug, Deserialize)]
pub struct WsAuthQuery {
    pub token: Option<String>,
}

/// Close code sent when the handshake token does not resolve to a
/// principal allowed on the channel.
pub const CLOSE_UNAUTHORIZED: u16 = 4001;

/// Resolve the handshake token to a principal, or None.
pub(crate) fn authenticate(state: &AppState, token: Option<&str>) -> Option<User> {
    let claims = auth::verify_access_token(token?, &state.settings)?;
    state.users.get(&claims.sub).cloned()
}

/// Like [`authenticate`], but requires a supervisor-grade principal.
pub(crate) fn authenticate_supervisor(state: &AppState, token: Option<&str>) -> Option<User> {
    authenticate(state, token).filter(|user| user.role.is_supervisor_or_above())
}
