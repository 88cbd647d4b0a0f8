use axum::{extract::FromRequestParts, http::request::Parts};
use jsonwebtoken::{decode, Algorithm, DecodingKey, Validation};

use crate::error::AuthError;
use crate::models::auth::{AuthenticatedUser, Claims};
use crate::models::user::AccountStatus;
use crate::AppState;

/// Bearer authentication. Beyond the signature and expiry, the token must
/// still match its user: the account exists, is not deactivated and has not
/// changed credentials since the token was minted.
impl FromRequestParts<AppState> for AuthenticatedUser {
    type Rejection = AuthError;

    async fn from_request_parts(parts: &mut Parts, state: &AppState) -> Result<Self, Self::Rejection> {
        let auth_header = parts
            .headers
            .get("Authorization")
            .and_then(|v| v.to_str().ok())
            .ok_or_else(|| AuthError::Unauthorized("Missing Authorization header".into()))?;

        let token = auth_header
            .strip_prefix("Bearer ")
            .ok_or_else(|| AuthError::Unauthorized("Invalid Authorization header format".into()))?;

        let claims = decode_access_token(token, &state.config.jwt_secret)
            .map_err(|_| AuthError::Unauthorized("Invalid or expired token".into()))?;
        let user_id = claims
            .sub
            .parse()
            .map_err(|_| AuthError::Unauthorized("Invalid or expired token".into()))?;

        let user = state
            .users
            .find_by_id(user_id)
            .await?
            .ok_or(AuthError::AccountDeleted)?;
        if user.token_version > claims.token_version {
            return Err(AuthError::Unauthorized("Session expired, sign in again".into()));
        }
        if user.status == AccountStatus::Deactive {
            return Err(AuthError::AccountDeactivated);
        }

        Ok(AuthenticatedUser {
            user_id,
            email: claims.email,
            role: claims.role,
            permissions: claims.permissions,
            token_version: claims.token_version,
        })
    }
}

pub fn decode_access_token(token: &str, secret: &str) -> Result<Claims, anyhow::Error> {
    let key = DecodingKey::from_secret(secret.as_bytes());
    let mut validation = Validation::new(Algorithm::HS256);
    validation.validate_exp = true;

    let data = decode::<Claims>(token, &key, &validation)?;
    Ok(data.claims)
}
