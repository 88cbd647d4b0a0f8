use axum::{extract::State, http::StatusCode, Json};
use serde_json::{json, Value};

use crate::AppState;

pub async fn health_check(State(state): State<AppState>) -> (StatusCode, Json<Value>) {
    let users = state.users.ping().await;
    let otps = state.otps.ping().await;

    match (users, otps) {
        (Ok(()), Ok(())) => (
            StatusCode::OK,
            Json(json!({ "status": "ok", "store": "connected", "otpStore": "connected" })),
        ),
        (users, otps) => {
            let describe = |r: anyhow::Result<()>| match r {
                Ok(()) => "connected".to_string(),
                Err(e) => e.to_string(),
            };
            (
                StatusCode::SERVICE_UNAVAILABLE,
                Json(json!({
                    "status": "error",
                    "store": describe(users),
                    "otpStore": describe(otps),
                })),
            )
        }
    }
}
