use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum UserRole {
    Admin,
    User,
}

impl std::fmt::Display for UserRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            UserRole::Admin => "admin",
            UserRole::User => "user",
        };
        write!(f, "{s}")
    }
}

impl std::str::FromStr for UserRole {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "admin" => Ok(UserRole::Admin),
            "user" => Ok(UserRole::User),
            _ => Err(anyhow::anyhow!("Unknown role: {s}")),
        }
    }
}

/// Account lifecycle: created `Invited`, becomes `Active` once the invite
/// token is consumed.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum AccountStatus {
    Invited,
    Active,
    Deactive,
}

impl std::fmt::Display for AccountStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            AccountStatus::Invited => "invited",
            AccountStatus::Active => "active",
            AccountStatus::Deactive => "deactive",
        };
        write!(f, "{s}")
    }
}

impl std::str::FromStr for AccountStatus {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "invited" => Ok(AccountStatus::Invited),
            "active" => Ok(AccountStatus::Active),
            "deactive" => Ok(AccountStatus::Deactive),
            _ => Err(anyhow::anyhow!("Unknown account status: {s}")),
        }
    }
}

/// Named capability → granted.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(transparent)]
pub struct Permissions(pub BTreeMap<String, bool>);

impl Permissions {
    pub fn allows(&self, capability: &str) -> bool {
        self.0.get(capability).copied().unwrap_or(false)
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl<const N: usize> From<[(&str, bool); N]> for Permissions {
    fn from(entries: [(&str, bool); N]) -> Self {
        Self(entries.into_iter().map(|(k, v)| (k.to_string(), v)).collect())
    }
}

/// Credential store record.
#[derive(Debug, Clone)]
pub struct User {
    pub id: Uuid,
    pub email: String,
    pub name: String,
    /// `None` until the invite is accepted.
    pub password_hash: Option<String>,
    pub status: AccountStatus,
    pub role: UserRole,
    pub permissions: Permissions,
    pub failed_login_attempts: i32,
    pub login_blocked_until: Option<DateTime<Utc>>,
    pub token_version: i64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl User {
    pub fn can(&self, capability: &str) -> bool {
        self.role == UserRole::Admin || self.permissions.allows(capability)
    }
}

/// Fields needed to create an invited account.
#[derive(Debug, Clone)]
pub struct NewUser {
    pub email: String,
    pub name: String,
    pub role: UserRole,
    pub permissions: Permissions,
}

/// Public projection of a user.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UserProfile {
    pub id: Uuid,
    pub email: String,
    pub name: String,
    pub status: AccountStatus,
    pub role: UserRole,
    pub permissions: Permissions,
}

impl From<User> for UserProfile {
    fn from(u: User) -> Self {
        Self {
            id: u.id,
            email: u.email,
            name: u.name,
            status: u.status,
            role: u.role,
            permissions: u.permissions,
        }
    }
}

// Request/Response DTOs
//
// Fields default to empty so that a missing field is reported as
// MISSING_FIELD instead of a deserialization rejection.

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LoginRequest {
    #[serde(default)]
    pub email: String,
    #[serde(default)]
    pub password: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VerifyOtpRequest {
    #[serde(default)]
    pub email: String,
    #[serde(default)]
    pub otp: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EmailRequest {
    #[serde(default)]
    pub email: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResendUpdateOtpRequest {
    #[serde(default)]
    pub email: String,
    #[serde(default, rename = "type")]
    pub kind: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResetPasswordRequest {
    #[serde(default)]
    pub email: String,
    #[serde(default)]
    pub otp: String,
    #[serde(default)]
    pub new_password: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VerifyPasswordSendOtpRequest {
    #[serde(default)]
    pub current_password: String,
    #[serde(default, rename = "type")]
    pub kind: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VerifyUpdateOtpRequest {
    #[serde(default)]
    pub otp: String,
    #[serde(default, rename = "type")]
    pub kind: String,
    pub new_email: Option<String>,
    pub new_password: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LogoutRequest {
    pub refresh_token: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InviteUserRequest {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub email: String,
    #[serde(default)]
    pub permissions: Permissions,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResendInviteRequest {
    pub user_id: Option<Uuid>,
}

#[derive(Debug, Deserialize)]
pub struct VerifyTokenQuery {
    #[serde(default)]
    pub token: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SetPasswordRequest {
    #[serde(default)]
    pub token: String,
    #[serde(default)]
    pub password: String,
}

/// Response from step 1 of login (before OTP verification).
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LoginStep1Response {
    pub message: String,
    pub email: String,
    pub otp_expires_at: DateTime<Utc>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LoginResponse {
    pub access_token: String,
    pub user: UserProfile,
}
