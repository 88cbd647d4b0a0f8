//! Access/refresh token issuance and the refresh-token lifecycle.

use chrono::{DateTime, Duration, Utc};
use jsonwebtoken::{decode, encode, Algorithm, DecodingKey, EncodingKey, Header, Validation};
use tracing::info;
use uuid::Uuid;

use crate::config::Config;
use crate::db::store::{RefreshTokenStore, UserStore};
use crate::error::{AuthError, AuthResult};
use crate::models::auth::{Claims, RefreshClaims};
use crate::models::token::RefreshTokenRecord;
use crate::models::user::{AccountStatus, Permissions, User};
use crate::services::credentials::sha256_hex;
use crate::services::metrics::REFRESH_COUNTER;

pub const ACCESS_TOKEN_TTL_SECS: i64 = 3600;
pub const REFRESH_TOKEN_TTL_DAYS: i64 = 7;

#[derive(Debug, Clone)]
pub struct SessionTokens {
    pub access_token: String,
    pub refresh_token: String,
}

/// What a client gets after its credentials changed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionDecision {
    /// The presenting device keeps its session with a fresh access token.
    SignedIn { access_token: String },
    /// Every session of the user was dropped.
    ReloginRequired,
}

pub fn mint_access_token(
    secret: &str,
    user: &User,
    permissions: &Permissions,
    token_version: i64,
    now: DateTime<Utc>,
) -> anyhow::Result<String> {
    let iat = now.timestamp() as usize;
    let claims = Claims {
        sub: user.id.to_string(),
        email: user.email.clone(),
        role: user.role,
        permissions: permissions.clone(),
        token_version,
        iat,
        exp: iat + ACCESS_TOKEN_TTL_SECS as usize,
    };
    let token = encode(
        &Header::new(Algorithm::HS256),
        &claims,
        &EncodingKey::from_secret(secret.as_bytes()),
    )?;
    Ok(token)
}

pub struct SessionIssuer<'a> {
    users: &'a dyn UserStore,
    refresh_tokens: &'a dyn RefreshTokenStore,
    config: &'a Config,
}

impl<'a> SessionIssuer<'a> {
    pub fn new(
        users: &'a dyn UserStore,
        refresh_tokens: &'a dyn RefreshTokenStore,
        config: &'a Config,
    ) -> Self {
        Self {
            users,
            refresh_tokens,
            config,
        }
    }

    pub fn access_token_for(&self, user: &User, now: DateTime<Utc>) -> AuthResult<String> {
        Ok(mint_access_token(
            &self.config.jwt_secret,
            user,
            &user.permissions,
            user.token_version,
            now,
        )?)
    }

    /// New access token plus a stored refresh token for a fresh sign-in.
    pub async fn start_session(&self, user: &User, now: DateTime<Utc>) -> AuthResult<SessionTokens> {
        let access_token = self.access_token_for(user, now)?;

        let id = Uuid::new_v4();
        let expires_at = now + Duration::days(REFRESH_TOKEN_TTL_DAYS);
        let claims = RefreshClaims {
            sub: user.id.to_string(),
            jti: id.to_string(),
            permissions: user.permissions.clone(),
            token_version: user.token_version,
            iat: now.timestamp() as usize,
            exp: expires_at.timestamp() as usize,
        };
        let refresh_token = encode(
            &Header::new(Algorithm::HS256),
            &claims,
            &EncodingKey::from_secret(self.config.jwt_refresh_secret.as_bytes()),
        )
        .map_err(anyhow::Error::from)?;

        self.refresh_tokens
            .insert(&RefreshTokenRecord {
                id,
                user_id: user.id,
                token_digest: sha256_hex(&refresh_token),
                expires_at,
                created_at: now,
            })
            .await?;

        Ok(SessionTokens {
            access_token,
            refresh_token,
        })
    }

    /// Mints an access token from a refresh token without rotating it. The
    /// token version always comes from the stored user, so a credential
    /// change since sign-in is reflected immediately.
    pub async fn refresh(&self, token: &str, now: DateTime<Utc>) -> AuthResult<String> {
        let result = self.refresh_inner(token, now).await;
        let outcome = match &result {
            Ok(_) => "ok",
            Err(e) => e.code(),
        };
        REFRESH_COUNTER.with_label_values(&[outcome]).inc();
        result
    }

    async fn refresh_inner(&self, token: &str, now: DateTime<Utc>) -> AuthResult<String> {
        let (_, claims) = self
            .live_refresh_token(token, now)
            .await?
            .ok_or(AuthError::InvalidRefresh)?;
        let user_id: Uuid = claims.sub.parse().map_err(|_| AuthError::InvalidRefresh)?;

        let user = self
            .users
            .find_by_id(user_id)
            .await?
            .ok_or(AuthError::AccountDeleted)?;
        if user.status != AccountStatus::Active {
            return Err(AuthError::AccountDeactivated);
        }

        let permissions = if user.permissions.is_empty() {
            &claims.permissions
        } else {
            &user.permissions
        };
        Ok(mint_access_token(
            &self.config.jwt_secret,
            &user,
            permissions,
            user.token_version,
            now,
        )?)
    }

    /// Idempotent: an unknown token is not an error.
    pub async fn logout(&self, token: Option<&str>) -> AuthResult<()> {
        let token = token
            .map(str::trim)
            .filter(|t| !t.is_empty())
            .ok_or(AuthError::MissingToken)?;
        self.refresh_tokens.delete_by_digest(&sha256_hex(token)).await?;
        Ok(())
    }

    /// Session pruning after a password change. A live refresh token of the
    /// same user keeps that device signed in and removes all others; without
    /// one every refresh token of the user is deleted.
    pub async fn continue_after_credential_change(
        &self,
        user: &User,
        presented: Option<&str>,
        now: DateTime<Utc>,
    ) -> AuthResult<SessionDecision> {
        let current = match presented {
            Some(token) => self
                .live_refresh_token(token, now)
                .await?
                .filter(|(record, _)| record.user_id == user.id),
            None => None,
        };

        match current {
            Some((record, _)) => {
                let pruned = self
                    .refresh_tokens
                    .delete_for_user_except(user.id, record.id)
                    .await?;
                info!(user_id = %user.id, pruned, "credential change kept current session");
                Ok(SessionDecision::SignedIn {
                    access_token: self.access_token_for(user, now)?,
                })
            }
            None => {
                let pruned = self.refresh_tokens.delete_for_user(user.id).await?;
                info!(user_id = %user.id, pruned, "credential change ended all sessions");
                Ok(SessionDecision::ReloginRequired)
            }
        }
    }

    /// Stored record and signature, both unexpired at `now` and agreeing on
    /// token id and owner.
    async fn live_refresh_token(
        &self,
        token: &str,
        now: DateTime<Utc>,
    ) -> AuthResult<Option<(RefreshTokenRecord, RefreshClaims)>> {
        let Some(record) = self
            .refresh_tokens
            .find_by_digest(&sha256_hex(token))
            .await?
            .filter(|r| r.expires_at > now)
        else {
            return Ok(None);
        };

        let mut validation = Validation::new(Algorithm::HS256);
        validation.validate_exp = false;
        let Ok(data) = decode::<RefreshClaims>(
            token,
            &DecodingKey::from_secret(self.config.jwt_refresh_secret.as_bytes()),
            &validation,
        ) else {
            return Ok(None);
        };
        let claims = data.claims;

        let agrees = (claims.exp as i64) > now.timestamp()
            && claims.jti == record.id.to_string()
            && claims.sub == record.user_id.to_string();
        Ok(agrees.then_some((record, claims)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::memory::MemoryStore;
    use crate::middleware::auth::decode_access_token;
    use crate::services::testing;

    #[tokio::test]
    async fn refresh_embeds_current_token_version() {
        let store = MemoryStore::new();
        let config = testing::config();
        let mut user = testing::active_user(&store, "ops@example.com", "password123").await;
        user.token_version = 2;
        store.put_user(user.clone()).unwrap();
        let sessions = SessionIssuer::new(&store, &store, &config);
        let now = Utc::now();

        let tokens = sessions.start_session(&user, now).await.unwrap();
        let access = sessions.refresh(&tokens.refresh_token, now).await.unwrap();
        assert_eq!(decode_access_token(&access, &config.jwt_secret).unwrap().token_version, 2);

        store.change_password(user.id, "new-hash").await.unwrap();
        let access = sessions.refresh(&tokens.refresh_token, now).await.unwrap();
        assert_eq!(decode_access_token(&access, &config.jwt_secret).unwrap().token_version, 3);
    }

    #[tokio::test]
    async fn refresh_rejects_unknown_and_deactivated() {
        let store = MemoryStore::new();
        let config = testing::config();
        let mut user = testing::active_user(&store, "ops@example.com", "password123").await;
        let sessions = SessionIssuer::new(&store, &store, &config);
        let now = Utc::now();

        let err = sessions.refresh("garbage", now).await.unwrap_err();
        assert_eq!(err.code(), "INVALID_REFRESH");

        let tokens = sessions.start_session(&user, now).await.unwrap();
        let later = now + Duration::days(REFRESH_TOKEN_TTL_DAYS);
        let err = sessions.refresh(&tokens.refresh_token, later).await.unwrap_err();
        assert_eq!(err.code(), "INVALID_REFRESH");

        user.status = AccountStatus::Deactive;
        store.put_user(user).unwrap();
        let err = sessions.refresh(&tokens.refresh_token, now).await.unwrap_err();
        assert_eq!(err.code(), "ACCOUNT_DEACTIVATED");
    }

    #[tokio::test]
    async fn stored_permissions_win_over_snapshot() {
        let store = MemoryStore::new();
        let config = testing::config();
        let mut user = testing::active_user(&store, "ops@example.com", "password123").await;
        let sessions = SessionIssuer::new(&store, &store, &config);
        let now = Utc::now();
        let tokens = sessions.start_session(&user, now).await.unwrap();

        user.permissions = Permissions::from([("manageUsers", true)]);
        store.put_user(user).unwrap();

        let access = sessions.refresh(&tokens.refresh_token, now).await.unwrap();
        let claims = decode_access_token(&access, &config.jwt_secret).unwrap();
        assert!(claims.permissions.allows("manageUsers"));
    }

    #[tokio::test]
    async fn logout_is_idempotent() {
        let store = MemoryStore::new();
        let config = testing::config();
        let user = testing::active_user(&store, "ops@example.com", "password123").await;
        let sessions = SessionIssuer::new(&store, &store, &config);
        let tokens = sessions.start_session(&user, Utc::now()).await.unwrap();

        sessions.logout(Some(&tokens.refresh_token)).await.unwrap();
        sessions.logout(Some(&tokens.refresh_token)).await.unwrap();
        assert!(store.refresh_tokens_for(user.id).unwrap().is_empty());

        let err = sessions.logout(None).await.unwrap_err();
        assert_eq!(err.code(), "MISSING_TOKEN");
    }

    #[tokio::test]
    async fn credential_change_keeps_only_presenting_device() {
        let store = MemoryStore::new();
        let config = testing::config();
        let user = testing::active_user(&store, "ops@example.com", "password123").await;
        let sessions = SessionIssuer::new(&store, &store, &config);
        let now = Utc::now();

        let device_a = sessions.start_session(&user, now).await.unwrap();
        let _device_b = sessions.start_session(&user, now).await.unwrap();
        let updated = store.change_password(user.id, "new-hash").await.unwrap().unwrap();

        let decision = sessions
            .continue_after_credential_change(&updated, Some(&device_a.refresh_token), now)
            .await
            .unwrap();
        let SessionDecision::SignedIn { access_token } = decision else {
            panic!("expected device A to stay signed in");
        };
        assert_eq!(
            decode_access_token(&access_token, &config.jwt_secret).unwrap().token_version,
            updated.token_version
        );

        let remaining = store.refresh_tokens_for(user.id).unwrap();
        assert_eq!(remaining.len(), 1);
        assert_eq!(remaining[0].token_digest, sha256_hex(&device_a.refresh_token));
    }

    #[tokio::test]
    async fn credential_change_without_cookie_ends_every_session() {
        let store = MemoryStore::new();
        let config = testing::config();
        let user = testing::active_user(&store, "ops@example.com", "password123").await;
        let other = testing::active_user(&store, "other@example.com", "password123").await;
        let sessions = SessionIssuer::new(&store, &store, &config);
        let now = Utc::now();

        sessions.start_session(&user, now).await.unwrap();
        sessions.start_session(&user, now).await.unwrap();
        let foreign = sessions.start_session(&other, now).await.unwrap();

        let decision = sessions
            .continue_after_credential_change(&user, None, now)
            .await
            .unwrap();
        assert_eq!(decision, SessionDecision::ReloginRequired);
        assert!(store.refresh_tokens_for(user.id).unwrap().is_empty());

        // Someone else's refresh token does not keep this user signed in.
        sessions.start_session(&user, now).await.unwrap();
        let decision = sessions
            .continue_after_credential_change(&user, Some(&foreign.refresh_token), now)
            .await
            .unwrap();
        assert_eq!(decision, SessionDecision::ReloginRequired);
        assert!(store.refresh_tokens_for(user.id).unwrap().is_empty());
        assert_eq!(store.refresh_tokens_for(other.id).unwrap().len(), 1);
    }
}
