//! Authentication: JWT access/refresh tokens and the principal store.

use std::collections::HashMap;
use std::sync::Arc;

use axum::{
    extract::{FromRequestParts, State},
    http::request::Parts,
    Form, Json, RequestPartsExt,
};
use axum_extra::{
    headers::{authorization::Bearer, Authorization},
    typed_header::TypedHeader,
};
use bcrypt::{hash, verify, DEFAULT_COST};
use jsonwebtoken::{decode, encode, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};

use crate::config::Settings;
use crate::server::{ApiError, AppState};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum UserRole {
    Admin,
    Supervisor,
    Operator,
}

impl UserRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            UserRole::Admin => "admin",
            UserRole::Supervisor => "supervisor",
            UserRole::Operator => "operator",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "admin" => Some(UserRole::Admin),
            "supervisor" => Some(UserRole::Supervisor),
            "operator" => Some(UserRole::Operator),
            _ => None,
        }
    }

    pub fn is_supervisor_or_above(&self) -> bool {
        matches!(self, UserRole::Admin | UserRole::Supervisor)
    }
}

#[derive(Debug, Clone)]
pub struct User {
    pub id: String,
    pub username: String,
    pub email: String,
    pub password_hash: String,
    pub role: UserRole,
    pub is_active: bool,
}

/// In-process principal store seeded with the demo accounts.
#[derive(Clone)]
pub struct UserStore {
    users: Arc<HashMap<String, User>>,
}

impl UserStore {
    /// Build the store, bcrypt-hashing the demo passwords at startup.
    pub fn with_demo_users() -> Self {
        let seed = [
            ("user-001", "admin", "admin@example.com", "admin123", UserRole::Admin),
            (
                "user-002",
                "supervisor1",
                "sv1@example.com",
                "supervisor123",
                UserRole::Supervisor,
            ),
            (
                "user-003",
                "operator1",
                "op1@example.com",
                "operator123",
                UserRole::Operator,
            ),
        ];

        let mut users = HashMap::new();
        for (id, username, email, password, role) in seed {
            let password_hash =
                hash(password, DEFAULT_COST).expect("bcrypt hashing cannot fail on static input");
            users.insert(
                username.to_string(),
                User {
                    id: id.to_string(),
                    username: username.to_string(),
                    email: email.to_string(),
                    password_hash,
                    role,
                    is_active: true,
                },
            );
        }

        Self {
            users: Arc::new(users),
        }
    }

    pub fn get(&self, username: &str) -> Option<&User> {
        self.users.get(username)
    }

    pub fn authenticate(&self, username: &str, password: &str) -> Option<&User> {
        let user = self.users.get(username).filter(|u| u.is_active)?;
        match verify(password, &user.password_hash) {
            Ok(true) => Some(user),
            _ => None,
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct Claims {
    pub sub: String,
    pub role: String,
    pub exp: usize,
    pub token_type: String,
}

fn create_token(
    user: &User,
    token_type: &str,
    lifetime: chrono::Duration,
    settings: &Settings,
) -> Result<String, jsonwebtoken::errors::Error> {
    let expiration = chrono::Utc::now()
        .checked_add_signed(lifetime)
        .expect("valid timestamp")
        .timestamp() as usize;

    let claims = Claims {
        sub: user.username.clone(),
        role: user.role.as_str().to_string(),
        exp: expiration,
        token_type: token_type.to_string(),
    };

    encode(
        &Header::default(),
        &claims,
        &EncodingKey::from_secret(settings.secret_key.as_bytes()),
    )
}

pub fn create_access_token(
    user: &User,
    settings: &Settings,
) -> Result<String, jsonwebtoken::errors::Error> {
    create_token(
        user,
        "access",
        chrono::Duration::minutes(settings.access_token_expire_minutes),
        settings,
    )
}

pub fn create_refresh_token(
    user: &User,
    settings: &Settings,
) -> Result<String, jsonwebtoken::errors::Error> {
    create_token(
        user,
        "refresh",
        chrono::Duration::days(settings.refresh_token_expire_days),
        settings,
    )
}

fn decode_token(token: &str, settings: &Settings) -> Option<Claims> {
    decode::<Claims>(
        token,
        &DecodingKey::from_secret(settings.secret_key.as_bytes()),
        &Validation::default(),
    )
    .map(|data| data.claims)
    .ok()
}

pub fn verify_access_token(token: &str, settings: &Settings) -> Option<Claims> {
    decode_token(token, settings).filter(|claims| claims.token_type == "access")
}

pub fn verify_refresh_token(token: &str, settings: &Settings) -> Option<Claims> {
    decode_token(token, settings).filter(|claims| claims.token_type == "refresh")
}

/// Bearer-token extractor: handlers taking `Claims` require a valid
/// access token.
impl FromRequestParts<Arc<AppState>> for Claims {
    type Rejection = ApiError;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &Arc<AppState>,
    ) -> Result<Self, Self::Rejection> {
        let TypedHeader(Authorization(bearer)) = parts
            .extract::<TypedHeader<Authorization<Bearer>>>()
            .await
            .map_err(|_| ApiError::Unauthorized("Missing authorization header".to_string()))?;

        verify_access_token(bearer.token(), &state.settings)
            .ok_or_else(|| ApiError::Unauthorized("Could not validate credentials".to_string()))
    }
}

#[derive(Debug, Deserialize)]
pub struct LoginForm {
    pub username: String,
    pub password: String,
}

#[derive(Debug, Serialize)]
pub struct Token {
    pub access_token: String,
    pub refresh_token: String,
    pub token_type: String,
}

#[derive(Debug, Deserialize)]
pub struct TokenRefreshRequest {
    pub refresh_token: String,
}

#[derive(Debug, Serialize)]
pub struct TokenRefreshResponse {
    pub access_token: String,
}

#[derive(Debug, Serialize)]
pub struct UserResponse {
    pub id: String,
    pub username: String,
    pub email: String,
    pub role: String,
    pub is_active: bool,
}

/// Login with username and password (form-encoded). Returns access and
/// refresh tokens.
pub async fn login(
    State(state): State<Arc<AppState>>,
    Form(form): Form<LoginForm>,
) -> Result<Json<Token>, ApiError> {
    let user = state
        .users
        .authenticate(&form.username, &form.password)
        .ok_or_else(|| ApiError::Unauthorized("Incorrect username or password".to_string()))?;

    let access_token = create_access_token(user, &state.settings)
        .map_err(|_| ApiError::Internal("Token generation error".to_string()))?;
    let refresh_token = create_refresh_token(user, &state.settings)
        .map_err(|_| ApiError::Internal("Token generation error".to_string()))?;

    Ok(Json(Token {
        access_token,
        refresh_token,
        token_type: "bearer".to_string(),
    }))
}

/// Exchange a refresh token for a new access token.
pub async fn refresh(
    State(state): State<Arc<AppState>>,
    Json(request): Json<TokenRefreshRequest>,
) -> Result<Json<TokenRefreshResponse>, ApiError> {
    let claims = verify_refresh_token(&request.refresh_token, &state.settings)
        .ok_or_else(|| ApiError::Unauthorized("Invalid refresh token".to_string()))?;

    let user = state
        .users
        .get(&claims.sub)
        .ok_or_else(|| ApiError::Unauthorized("User not found".to_string()))?;

    let access_token = create_access_token(user, &state.settings)
        .map_err(|_| ApiError::Internal("Token generation error".to_string()))?;

    Ok(Json(TokenRefreshResponse { access_token }))
}

/// Current principal info.
pub async fn me(
    State(state): State<Arc<AppState>>,
    claims: Claims,
) -> Result<Json<UserResponse>, ApiError> {
    let user = state
        .users
        .get(&claims.sub)
        .ok_or_else(|| ApiError::Unauthorized("User not found".to_string()))?;

    Ok(Json(UserResponse {
        id: user.id.clone(),
        username: user.username.clone(),
        email: user.email.clone(),
        role: user.role.as_str().to_string(),
        is_active: user.is_active,
    }))
}
