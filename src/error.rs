//! Error taxonomy of the auth core and its HTTP mapping.

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use chrono::{DateTime, Utc};
use serde_json::{json, Value};
use thiserror::Error;

pub type AuthResult<T> = Result<T, AuthError>;

#[derive(Debug, Error)]
pub enum AuthError {
    /// `remaining_attempts` is only known for existing accounts and is
    /// omitted otherwise.
    #[error("Invalid email or password")]
    InvalidCredentials { remaining_attempts: Option<u32> },

    #[error("Account locked after too many failed attempts, try again later")]
    AccountLocked { until: DateTime<Utc> },

    #[error("Account is deactivated")]
    AccountDeactivated,

    #[error("Account no longer exists")]
    AccountDeleted,

    #[error("Missing required field: {0}")]
    MissingField(&'static str),

    #[error("Missing token")]
    MissingToken,

    #[error("{0}")]
    Validation(String),

    #[error("{0}")]
    Conflict(String),

    #[error("{0}")]
    TokenInvalidOrExpired(String),

    #[error("{0} not found")]
    NotFound(&'static str),

    #[error("{0}")]
    Unauthorized(String),

    #[error("{0}")]
    Forbidden(String),

    #[error("Invalid or expired refresh token")]
    InvalidRefresh,

    #[error("Could not deliver email: {0}")]
    DeliveryFailed(String),

    #[error("Internal server error")]
    Internal(#[from] anyhow::Error),
}

impl AuthError {
    pub fn code(&self) -> &'static str {
        match self {
            AuthError::InvalidCredentials { .. } => "INVALID_CREDENTIALS",
            AuthError::AccountLocked { .. } => "ACCOUNT_LOCKED",
            AuthError::AccountDeactivated => "ACCOUNT_DEACTIVATED",
            AuthError::AccountDeleted => "ACCOUNT_DELETED",
            AuthError::MissingField(_) => "MISSING_FIELD",
            AuthError::MissingToken => "MISSING_TOKEN",
            AuthError::Validation(_) => "VALIDATION_ERROR",
            AuthError::Conflict(_) => "CONFLICT",
            AuthError::TokenInvalidOrExpired(_) => "TOKEN_INVALID_OR_EXPIRED",
            AuthError::NotFound(_) => "NOT_FOUND",
            AuthError::Unauthorized(_) => "UNAUTHORIZED",
            AuthError::Forbidden(_) => "FORBIDDEN",
            AuthError::InvalidRefresh => "INVALID_REFRESH",
            AuthError::DeliveryFailed(_) => "EMAIL_DELIVERY_FAILED",
            AuthError::Internal(_) => "INTERNAL_ERROR",
        }
    }

    pub fn status(&self) -> StatusCode {
        match self {
            AuthError::InvalidCredentials { .. } => StatusCode::UNAUTHORIZED,
            AuthError::AccountLocked { .. } => StatusCode::FORBIDDEN,
            AuthError::AccountDeactivated => StatusCode::FORBIDDEN,
            AuthError::AccountDeleted => StatusCode::FORBIDDEN,
            AuthError::MissingField(_) => StatusCode::BAD_REQUEST,
            AuthError::MissingToken => StatusCode::BAD_REQUEST,
            AuthError::Validation(_) => StatusCode::BAD_REQUEST,
            AuthError::Conflict(_) => StatusCode::CONFLICT,
            AuthError::TokenInvalidOrExpired(_) => StatusCode::BAD_REQUEST,
            AuthError::NotFound(_) => StatusCode::NOT_FOUND,
            AuthError::Unauthorized(_) => StatusCode::UNAUTHORIZED,
            AuthError::Forbidden(_) => StatusCode::FORBIDDEN,
            AuthError::InvalidRefresh => StatusCode::UNAUTHORIZED,
            AuthError::DeliveryFailed(_) => StatusCode::BAD_GATEWAY,
            AuthError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Same error, answered with a different status. Login-flow OTP failures
    /// are 401 while update-flow OTP failures are 400.
    pub fn with_status(self, status: StatusCode) -> (StatusCode, AuthError) {
        (status, self)
    }

    fn body(&self) -> Value {
        let mut body = json!({ "error": self.to_string(), "code": self.code() });
        match self {
            AuthError::InvalidCredentials {
                remaining_attempts: Some(n),
            } => body["remainingAttempts"] = json!(n),
            AuthError::AccountLocked { until } => body["lockedUntil"] = json!(until),
            AuthError::MissingField(field) => body["field"] = json!(field),
            _ => {}
        }
        body
    }
}

impl IntoResponse for AuthError {
    fn into_response(self) -> Response {
        if let AuthError::Internal(e) = &self {
            tracing::error!(error = %e, "request failed");
        }
        (self.status(), Json(self.body())).into_response()
    }
}
