use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::token::ActionPurpose;
use super::user::{Permissions, UserRole};

/// Claims embedded in the JWT access token
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Claims {
    pub sub: String, // user UUID
    pub email: String,
    pub role: UserRole,
    pub permissions: Permissions,
    /// `users.token_version` at mint time; the token is stale once the
    /// stored value moves past it.
    pub token_version: i64,
    pub exp: usize,
    pub iat: usize,
}

/// Claims embedded in the JWT refresh token
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RefreshClaims {
    pub sub: String, // user UUID
    pub jti: String, // refresh_tokens.id
    pub permissions: Permissions,
    pub token_version: i64,
    pub exp: usize,
    pub iat: usize,
}

/// Claims embedded in invite/reset link tokens
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActionClaims {
    pub sub: String, // user UUID
    pub jti: String, // password_tokens.id
    pub purpose: ActionPurpose,
    pub exp: usize,
    pub iat: usize,
}

/// Extracted from a validated, non-stale access token via the Axum extractor
#[derive(Debug, Clone)]
pub struct AuthenticatedUser {
    pub user_id: Uuid,
    pub email: String,
    pub role: UserRole,
    pub permissions: Permissions,
    pub token_version: i64,
}

impl AuthenticatedUser {
    pub fn can(&self, capability: &str) -> bool {
        self.role == UserRole::Admin || self.permissions.allows(capability)
    }
}

/// Where a request came from; carried into security alerts.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ClientOrigin {
    pub ip_address: String,
    pub user_agent: String,
}
