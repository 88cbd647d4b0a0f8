pub mod auth;
pub mod health;
pub mod metrics;
pub mod users;

use axum::{
    http::{header, HeaderMap},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde_json::json;
use tower_http::trace::TraceLayer;

use crate::config::Config;
use crate::models::auth::ClientOrigin;
use crate::services::session::{SessionDecision, REFRESH_TOKEN_TTL_DAYS};
use crate::AppState;

pub const REFRESH_COOKIE: &str = "refresh_token";

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health::health_check))
        .route("/metrics", get(metrics::metrics_handler))
        // Auth
        .route("/auth/login", post(auth::login))
        .route("/auth/verify-otp", post(auth::verify_otp))
        .route("/auth/resend-otp", post(auth::resend_otp))
        .route("/auth/resend-update-otp", post(auth::resend_update_otp))
        .route("/auth/forgot-password", post(auth::forgot_password))
        .route("/auth/reset-password", post(auth::reset_password))
        .route("/auth/verify-password-send-otp", post(auth::verify_password_send_otp))
        .route("/auth/verify-update-otp", post(auth::verify_update_otp))
        .route("/auth/refresh-token", post(auth::refresh_token))
        .route("/auth/logout", post(auth::logout))
        // Users
        .route("/users/invite", post(users::invite))
        .route("/users/resend-invite", post(users::resend_invite))
        .route("/users/verify-token", get(users::verify_token))
        .route("/users/set-password", post(users::set_password))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Extract a named cookie value from request headers.
pub(crate) fn get_cookie(headers: &HeaderMap, name: &str) -> Option<String> {
    let prefix = format!("{name}=");
    headers
        .get(header::COOKIE)?
        .to_str()
        .ok()?
        .split(';')
        .find_map(|part| part.trim().strip_prefix(&prefix).map(str::to_string))
        .filter(|value| !value.is_empty())
}

pub(crate) fn refresh_cookie(config: &Config, token: &str) -> String {
    let max_age = REFRESH_TOKEN_TTL_DAYS * 24 * 3600;
    let secure = if config.cookie_secure { "; Secure" } else { "" };
    format!("{REFRESH_COOKIE}={token}; HttpOnly; SameSite=Strict; Path=/; Max-Age={max_age}{secure}")
}

pub(crate) fn cleared_refresh_cookie(config: &Config) -> String {
    let secure = if config.cookie_secure { "; Secure" } else { "" };
    format!("{REFRESH_COOKIE}=; HttpOnly; SameSite=Strict; Path=/; Max-Age=0{secure}")
}

pub(crate) fn client_origin(h: &HeaderMap) -> ClientOrigin {
    let ip_address = h
        .get("x-real-ip")
        .and_then(|v| v.to_str().ok())
        .or_else(|| {
            h.get("x-forwarded-for")
                .and_then(|v| v.to_str().ok())
                .and_then(|s| s.split(',').next())
                .map(|s| s.trim())
        })
        .unwrap_or("unknown")
        .to_string();
    let user_agent = h
        .get(header::USER_AGENT)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("unknown")
        .to_string();
    ClientOrigin {
        ip_address,
        user_agent,
    }
}

/// Body for flows that end in a credential change. A dropped session also
/// clears the refresh cookie.
pub(crate) fn session_response(config: &Config, decision: SessionDecision, message: &str) -> Response {
    match decision {
        SessionDecision::SignedIn { access_token } => {
            Json(json!({ "message": message, "accessToken": access_token })).into_response()
        }
        SessionDecision::ReloginRequired => (
            [(header::SET_COOKIE, cleared_refresh_cookie(config))],
            Json(json!({
                "message": format!("{message}, please sign in again"),
                "code": "RELOGIN_REQUIRED",
            })),
        )
            .into_response(),
    }
}
