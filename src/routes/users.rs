use axum::{
    extract::{Query, State},
    http::{HeaderMap, StatusCode},
    response::Response,
    Json,
};
use chrono::Utc;
use serde_json::{json, Value};

use super::{get_cookie, session_response, REFRESH_COOKIE};
use crate::{
    error::AuthError,
    models::{
        auth::AuthenticatedUser,
        user::{InviteUserRequest, ResendInviteRequest, SetPasswordRequest, VerifyTokenQuery},
    },
    services::users::UserService,
    AppState,
};

pub async fn invite(
    State(state): State<AppState>,
    user: AuthenticatedUser,
    Json(body): Json<InviteUserRequest>,
) -> Result<(StatusCode, Json<Value>), AuthError> {
    let profile = UserService::invite(
        &state,
        &user,
        &body.name,
        &body.email,
        body.permissions,
        Utc::now(),
    )
    .await?;
    Ok((
        StatusCode::CREATED,
        Json(json!({ "message": "Invitation sent", "user": profile })),
    ))
}

pub async fn resend_invite(
    State(state): State<AppState>,
    user: AuthenticatedUser,
    Json(body): Json<ResendInviteRequest>,
) -> Result<Json<Value>, AuthError> {
    UserService::resend_invite(&state, &user, body.user_id, Utc::now()).await?;
    Ok(Json(json!({ "message": "Invitation resent" })))
}

pub async fn verify_token(
    State(state): State<AppState>,
    Query(query): Query<VerifyTokenQuery>,
) -> Result<Json<Value>, AuthError> {
    let valid = UserService::verify_token(&state, &query.token, Utc::now()).await?;
    Ok(Json(json!({ "valid": valid })))
}

pub async fn set_password(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(body): Json<SetPasswordRequest>,
) -> Result<Response, AuthError> {
    let presented = get_cookie(&headers, REFRESH_COOKIE);
    let decision = UserService::set_password(
        &state,
        &body.token,
        &body.password,
        presented.as_deref(),
        Utc::now(),
    )
    .await?;
    Ok(session_response(&state.config, decision, "Password set"))
}
