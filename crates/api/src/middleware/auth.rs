//! JWT authentication helpers and the `AuthUser`, `Publisher` and `AdminUser`
//! extractors.
//!
//! Tokens are issued by the account service; this crate only validates them.
//! Browsers cannot set headers on a websocket handshake, so the extractor also
//! accepts the token as a `?token=` query parameter.
//!
//! The `role` claim gates the privileged routes. Tokens without one are
//! ordinary subscribers.

use axum::extract::{FromRequestParts, Query};
use axum::http::request::Parts;
use chrono::{Duration, Utc};
use jsonwebtoken::{DecodingKey, EncodingKey, Header, Validation, decode, encode};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use herald_common::error::AppError;

use crate::state::AppState;

/// What a token holder may do. Each role includes the ones before it.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    /// Manages their own subscription and live connection.
    #[default]
    User,
    /// Upstream service allowed to submit events, including direct-addressed ones.
    Publisher,
    /// Reloads rules and edits templates.
    Admin,
}

/// JWT claims stored in the token.
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct Claims {
    /// Subject: the user's UUID
    pub sub: String,
    /// Expiration time (UNIX timestamp)
    pub exp: i64,
    /// Issued at (UNIX timestamp)
    pub iat: i64,
    #[serde(default)]
    pub role: Role,
}

/// Authenticated user extracted from a JWT.
///
/// Use as an Axum extractor on protected routes:
/// ```ignore
/// async fn handler(auth: AuthUser) -> impl IntoResponse {
///     // auth.user_id is the authenticated user's UUID
/// }
/// ```
#[derive(Debug, Clone)]
pub struct AuthUser {
    pub user_id: Uuid,
    pub claims: Claims,
}

impl AuthUser {
    pub fn role(&self) -> Role {
        self.claims.role
    }

    fn require(self, needed: Role) -> Result<Self, AppError> {
        if self.role() >= needed {
            Ok(self)
        } else {
            tracing::warn!(user_id = %self.user_id, role = ?self.role(), needed = ?needed, "Insufficient role");
            Err(AppError::Forbidden(format!(
                "This operation requires the '{}' role",
                match needed {
                    Role::User => "user",
                    Role::Publisher => "publisher",
                    Role::Admin => "admin",
                }
            )))
        }
    }
}

/// Caller allowed to submit events.
#[derive(Debug, Clone)]
pub struct Publisher(pub AuthUser);

/// Caller allowed to change rules and templates.
#[derive(Debug, Clone)]
pub struct AdminUser(pub AuthUser);

#[derive(Debug, Deserialize)]
struct TokenQuery {
    token: Option<String>,
}

/// Encode a JWT token for an ordinary user.
pub fn encode_jwt(user_id: Uuid, secret: &str, expiry_hours: u64) -> Result<String, AppError> {
    encode_jwt_with_role(user_id, Role::User, secret, expiry_hours)
}

pub fn encode_jwt_with_role(
    user_id: Uuid,
    role: Role,
    secret: &str,
    expiry_hours: u64,
) -> Result<String, AppError> {
    let now = Utc::now();
    let exp = now + Duration::hours(expiry_hours as i64);

    let claims = Claims {
        sub: user_id.to_string(),
        exp: exp.timestamp(),
        iat: now.timestamp(),
        role,
    };

    encode(
        &Header::default(),
        &claims,
        &EncodingKey::from_secret(secret.as_bytes()),
    )
    .map_err(|e| AppError::Auth(format!("Failed to encode JWT: {}", e)))
}

/// Decode and validate a JWT token.
pub fn decode_jwt(token: &str, secret: &str) -> Result<Claims, AppError> {
    let token_data = decode::<Claims>(
        token,
        &DecodingKey::from_secret(secret.as_bytes()),
        &Validation::default(),
    )
    .map_err(|e| AppError::Auth(format!("Invalid token: {}", e)))?;

    Ok(token_data.claims)
}

/// Validate `token` and resolve the user it was issued to.
pub fn authenticate(token: &str, secret: &str) -> Result<AuthUser, AppError> {
    let claims = decode_jwt(token, secret)?;
    let user_id = Uuid::parse_str(&claims.sub)
        .map_err(|_| AppError::Auth("Invalid user ID in token".to_string()))?;
    Ok(AuthUser { user_id, claims })
}

impl FromRequestParts<AppState> for AuthUser {
    type Rejection = AppError;

    fn from_request_parts(
        parts: &mut Parts,
        state: &AppState,
    ) -> impl std::future::Future<Output = Result<Self, Self::Rejection>> + Send {
        let secret = state.config.jwt_secret.clone();

        let bearer = parts
            .headers
            .get("authorization")
            .and_then(|v| v.to_str().ok())
            .and_then(|s| s.strip_prefix("Bearer "))
            .map(|s| s.to_string());

        let query_token = Query::<TokenQuery>::try_from_uri(&parts.uri)
            .ok()
            .and_then(|Query(q)| q.token);

        async move {
            match bearer.or(query_token) {
                Some(token) => authenticate(&token, &secret),
                None => Err(AppError::Auth(
                    "Missing credentials. Use 'Authorization: Bearer <JWT>' or '?token=<JWT>'"
                        .to_string(),
                )),
            }
        }
    }
}

impl FromRequestParts<AppState> for Publisher {
    type Rejection = AppError;

    async fn from_request_parts(parts: &mut Parts, state: &AppState) -> Result<Self, Self::Rejection> {
        let auth = AuthUser::from_request_parts(parts, state).await?;
        auth.require(Role::Publisher).map(Self)
    }
}

impl FromRequestParts<AppState> for AdminUser {
    type Rejection = AppError;

    async fn from_request_parts(parts: &mut Parts, state: &AppState) -> Result<Self, Self::Rejection> {
        let auth = AuthUser::from_request_parts(parts, state).await?;
        auth.require(Role::Admin).map(Self)
    }
}
