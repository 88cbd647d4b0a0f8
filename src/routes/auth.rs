use axum::{
    extract::State,
    http::{header, HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use chrono::Utc;
use serde_json::{json, Value};

use super::{client_origin, get_cookie, refresh_cookie, session_response, REFRESH_COOKIE};
use crate::{
    error::AuthError,
    models::{
        auth::AuthenticatedUser,
        user::{
            EmailRequest, LoginRequest, LoginStep1Response, LogoutRequest, ResendUpdateOtpRequest,
            ResetPasswordRequest, VerifyOtpRequest, VerifyPasswordSendOtpRequest,
            VerifyUpdateOtpRequest,
        },
    },
    services::auth::{AuthService, UpdateOutcome},
    AppState,
};

/// Failed login-flow OTP checks answer 401 rather than the default 400.
fn login_otp_rejection(e: AuthError) -> (StatusCode, AuthError) {
    match e {
        AuthError::TokenInvalidOrExpired(_) => e.with_status(StatusCode::UNAUTHORIZED),
        other => (other.status(), other),
    }
}

pub async fn login(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(body): Json<LoginRequest>,
) -> Result<Json<LoginStep1Response>, AuthError> {
    let origin = client_origin(&headers);
    let step1 = AuthService::login(&state, &body.email, &body.password, &origin, Utc::now()).await?;
    Ok(Json(step1))
}

pub async fn verify_otp(
    State(state): State<AppState>,
    Json(body): Json<VerifyOtpRequest>,
) -> Result<Response, (StatusCode, AuthError)> {
    let (response, refresh_token) =
        AuthService::verify_login_otp(&state, &body.email, &body.otp, Utc::now())
            .await
            .map_err(login_otp_rejection)?;

    Ok((
        [(header::SET_COOKIE, refresh_cookie(&state.config, &refresh_token))],
        Json(response),
    )
        .into_response())
}

pub async fn resend_otp(
    State(state): State<AppState>,
    Json(body): Json<EmailRequest>,
) -> Result<Json<Value>, AuthError> {
    let expires_at = AuthService::resend_otp(&state, &body.email, Utc::now()).await?;
    Ok(Json(json!({ "message": "OTP resent", "otpExpiresAt": expires_at })))
}

pub async fn resend_update_otp(
    State(state): State<AppState>,
    Json(body): Json<ResendUpdateOtpRequest>,
) -> Result<Json<Value>, AuthError> {
    let expires_at =
        AuthService::resend_update_otp(&state, &body.email, &body.kind, Utc::now()).await?;
    Ok(Json(json!({ "message": "OTP resent", "otpExpiresAt": expires_at })))
}

pub async fn forgot_password(
    State(state): State<AppState>,
    Json(body): Json<EmailRequest>,
) -> Result<Json<Value>, AuthError> {
    AuthService::forgot_password(&state, &body.email, Utc::now()).await?;
    Ok(Json(json!({
        "message": "If an account exists for this email, a reset link has been sent"
    })))
}

pub async fn reset_password(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(body): Json<ResetPasswordRequest>,
) -> Result<Response, (StatusCode, AuthError)> {
    let presented = get_cookie(&headers, REFRESH_COOKIE);
    let decision = AuthService::reset_password_with_otp(
        &state,
        &body.email,
        &body.otp,
        &body.new_password,
        presented.as_deref(),
        Utc::now(),
    )
    .await
    .map_err(login_otp_rejection)?;

    Ok(session_response(&state.config, decision, "Password updated"))
}

pub async fn verify_password_send_otp(
    State(state): State<AppState>,
    user: AuthenticatedUser,
    Json(body): Json<VerifyPasswordSendOtpRequest>,
) -> Result<Json<Value>, AuthError> {
    let email = AuthService::verify_password_send_otp(
        &state,
        &user,
        &body.current_password,
        &body.kind,
        Utc::now(),
    )
    .await?;
    Ok(Json(json!({ "message": "OTP sent", "email": email })))
}

pub async fn verify_update_otp(
    State(state): State<AppState>,
    user: AuthenticatedUser,
    headers: HeaderMap,
    Json(body): Json<VerifyUpdateOtpRequest>,
) -> Result<Response, AuthError> {
    let presented = get_cookie(&headers, REFRESH_COOKIE);
    let outcome = AuthService::verify_update_otp(
        &state,
        &user,
        &body.otp,
        &body.kind,
        body.new_email.as_deref(),
        body.new_password.as_deref(),
        presented.as_deref(),
        Utc::now(),
    )
    .await?;

    Ok(match outcome {
        UpdateOutcome::Verified => Json(json!({ "message": "OTP verified" })).into_response(),
        UpdateOutcome::EmailChanged { email } => {
            Json(json!({ "message": "Email updated", "email": email })).into_response()
        }
        UpdateOutcome::PasswordChanged(decision) => {
            session_response(&state.config, decision, "Password updated")
        }
    })
}

pub async fn refresh_token(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<Json<Value>, AuthError> {
    let token = get_cookie(&headers, REFRESH_COOKIE)
        .ok_or_else(|| AuthError::Unauthorized("Missing refresh token".into()))?;
    let access_token = state.session_issuer().refresh(&token, Utc::now()).await?;
    Ok(Json(json!({ "accessToken": access_token })))
}

/// The token comes from the body; the cookie is only a fallback.
pub async fn logout(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Option<Json<LogoutRequest>>,
) -> Result<Response, AuthError> {
    let token = body
        .and_then(|Json(b)| b.refresh_token)
        .or_else(|| get_cookie(&headers, REFRESH_COOKIE));
    state.session_issuer().logout(token.as_deref()).await?;

    Ok((
        [(header::SET_COOKIE, super::cleared_refresh_cookie(&state.config))],
        Json(json!({ "message": "Logged out" })),
    )
        .into_response())
}
