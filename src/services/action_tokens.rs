//! Single-use invite/reset link tokens.
//!
//! A token is a signed JWT plus a stored record keyed by the token's digest.
//! Both halves are checked independently and must agree on id, user and
//! purpose; the record is what allows revoking a token before it expires.

use chrono::{DateTime, Duration, Utc};
use jsonwebtoken::{decode, encode, Algorithm, DecodingKey, EncodingKey, Header, Validation};
use tracing::info;
use uuid::Uuid;

use crate::db::store::ActionTokenStore;
use crate::error::{AuthError, AuthResult};
use crate::models::auth::ActionClaims;
use crate::models::token::{ActionPurpose, ActionToken};
use crate::models::user::User;
use crate::services::credentials::{hash_password, sha256_hex};
use crate::services::metrics::ACTION_TOKENS_COUNTER;

pub const ACTION_TOKEN_TTL_MINUTES: i64 = 60;

#[derive(Debug, Clone)]
pub struct IssuedActionToken {
    pub token: String,
    pub expires_at: DateTime<Utc>,
}

pub struct ActionTokenManager<'a> {
    store: &'a dyn ActionTokenStore,
    secret: &'a str,
    bcrypt_cost: u32,
}

impl<'a> ActionTokenManager<'a> {
    pub fn new(store: &'a dyn ActionTokenStore, secret: &'a str, bcrypt_cost: u32) -> Self {
        Self {
            store,
            secret,
            bcrypt_cost,
        }
    }

    /// Issuing a reset token retires every unused reset token of the user.
    pub async fn issue(
        &self,
        user_id: Uuid,
        purpose: ActionPurpose,
        now: DateTime<Utc>,
    ) -> AuthResult<IssuedActionToken> {
        let id = Uuid::new_v4();
        let expires_at = now + Duration::minutes(ACTION_TOKEN_TTL_MINUTES);
        let claims = ActionClaims {
            sub: user_id.to_string(),
            jti: id.to_string(),
            purpose,
            iat: now.timestamp() as usize,
            exp: expires_at.timestamp() as usize,
        };
        let token = encode(
            &Header::new(Algorithm::HS256),
            &claims,
            &EncodingKey::from_secret(self.secret.as_bytes()),
        )
        .map_err(anyhow::Error::from)?;

        self.store
            .insert(&ActionToken {
                id,
                user_id,
                token_digest: sha256_hex(&token),
                purpose,
                used: false,
                expires_at,
                created_at: now,
            })
            .await?;

        ACTION_TOKENS_COUNTER
            .with_label_values(&[&purpose.to_string(), "issued"])
            .inc();
        Ok(IssuedActionToken { token, expires_at })
    }

    /// Drops every earlier token of the user, then issues a new invite.
    pub async fn reissue_invite(&self, user_id: Uuid, now: DateTime<Utc>) -> AuthResult<IssuedActionToken> {
        self.store.delete_for_user(user_id).await?;
        self.issue(user_id, ActionPurpose::Invite, now).await
    }

    /// Read-only; never consumes.
    pub async fn verify(&self, token: &str, now: DateTime<Utc>) -> AuthResult<bool> {
        Ok(self.validate(token, now).await?.is_some())
    }

    /// Sets `new_password` on the token's owner. The store flips the token
    /// to used and applies the credential change in one transaction, so of
    /// two concurrent consumers only one succeeds.
    pub async fn consume(&self, token: &str, new_password: &str, now: DateTime<Utc>) -> AuthResult<User> {
        let invalid = || AuthError::TokenInvalidOrExpired("Invalid or expired token".into());

        let record = self.validate(token, now).await?.ok_or_else(invalid)?;
        let password_hash = hash_password(new_password, self.bcrypt_cost).await?;
        let user = self
            .store
            .consume_for_password(record.id, &password_hash, now)
            .await?
            .ok_or_else(invalid)?;

        ACTION_TOKENS_COUNTER
            .with_label_values(&[&record.purpose.to_string(), "consumed"])
            .inc();
        info!(user_id = %user.id, purpose = %record.purpose, "action token consumed");
        Ok(user)
    }

    async fn validate(&self, token: &str, now: DateTime<Utc>) -> AuthResult<Option<ActionToken>> {
        let Some(claims) = self.check_signature(token, now) else {
            return Ok(None);
        };
        let Some(record) = self.check_record(token, now).await? else {
            return Ok(None);
        };

        let agrees = claims.jti == record.id.to_string()
            && claims.sub == record.user_id.to_string()
            && claims.purpose == record.purpose;
        Ok(agrees.then_some(record))
    }

    fn check_signature(&self, token: &str, now: DateTime<Utc>) -> Option<ActionClaims> {
        let mut validation = Validation::new(Algorithm::HS256);
        // Expiry is compared against `now` below.
        validation.validate_exp = false;

        let claims = decode::<ActionClaims>(
            token,
            &DecodingKey::from_secret(self.secret.as_bytes()),
            &validation,
        )
        .ok()?
        .claims;
        ((claims.exp as i64) > now.timestamp()).then_some(claims)
    }

    async fn check_record(&self, token: &str, now: DateTime<Utc>) -> AuthResult<Option<ActionToken>> {
        let record = self.store.find_by_digest(&sha256_hex(token)).await?;
        Ok(record.filter(|r| r.is_live(now)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::memory::MemoryStore;
    use crate::db::store::UserStore;
    use crate::models::user::AccountStatus;
    use crate::services::testing;

    const SECRET: &str = "action-secret";

    #[tokio::test]
    async fn invite_consume_activates_once() {
        let store = MemoryStore::new();
        let user = testing::invited_user(&store, "new@example.com").await;
        let tokens = ActionTokenManager::new(&store, SECRET, 4);
        let now = Utc::now();

        let issued = tokens.issue(user.id, ActionPurpose::Invite, now).await.unwrap();
        assert!(tokens.verify(&issued.token, now).await.unwrap());
        // verify is read-only
        assert!(tokens.verify(&issued.token, now).await.unwrap());

        let updated = tokens.consume(&issued.token, "password123", now).await.unwrap();
        assert_eq!(updated.status, AccountStatus::Active);
        assert_eq!(updated.token_version, user.token_version + 1);
        assert!(updated.password_hash.is_some());

        let replay = tokens.consume(&issued.token, "password456", now).await.unwrap_err();
        assert_eq!(replay.code(), "TOKEN_INVALID_OR_EXPIRED");
        let stored = store.find_by_id(user.id).await.unwrap().unwrap();
        assert_eq!(stored.token_version, user.token_version + 1);
    }

    #[tokio::test]
    async fn second_reset_token_retires_the_first() {
        let store = MemoryStore::new();
        let user = testing::active_user(&store, "ops@example.com", "password123").await;
        let tokens = ActionTokenManager::new(&store, SECRET, 4);
        let now = Utc::now();

        let first = tokens.issue(user.id, ActionPurpose::Reset, now).await.unwrap();
        let second = tokens.issue(user.id, ActionPurpose::Reset, now).await.unwrap();

        assert!(!tokens.verify(&first.token, now).await.unwrap());
        assert!(tokens.verify(&second.token, now).await.unwrap());

        let updated = tokens.consume(&second.token, "newpassword1", now).await.unwrap();
        assert_eq!(updated.status, AccountStatus::Active);
    }

    #[tokio::test]
    async fn reissued_invite_replaces_previous_link() {
        let store = MemoryStore::new();
        let user = testing::invited_user(&store, "new@example.com").await;
        let tokens = ActionTokenManager::new(&store, SECRET, 4);
        let now = Utc::now();

        let first = tokens.issue(user.id, ActionPurpose::Invite, now).await.unwrap();
        let second = tokens.reissue_invite(user.id, now).await.unwrap();

        assert!(!tokens.verify(&first.token, now).await.unwrap());
        assert!(tokens.verify(&second.token, now).await.unwrap());
    }

    #[tokio::test]
    async fn expired_or_foreign_tokens_are_rejected() {
        let store = MemoryStore::new();
        let user = testing::invited_user(&store, "new@example.com").await;
        let tokens = ActionTokenManager::new(&store, SECRET, 4);
        let now = Utc::now();

        let issued = tokens.issue(user.id, ActionPurpose::Invite, now).await.unwrap();
        assert!(!tokens.verify(&issued.token, issued.expires_at).await.unwrap());

        let other_key = ActionTokenManager::new(&store, "another-secret", 4);
        assert!(!other_key.verify(&issued.token, now).await.unwrap());
        assert!(!tokens.verify("not-a-token", now).await.unwrap());

        let err = tokens
            .consume(&issued.token, "password123", issued.expires_at + Duration::seconds(1))
            .await
            .unwrap_err();
        assert_eq!(err.code(), "TOKEN_INVALID_OR_EXPIRED");
        let stored = store.find_by_id(user.id).await.unwrap().unwrap();
        assert_eq!(stored.status, AccountStatus::Invited);
        assert_eq!(stored.token_version, 0);
    }

    #[tokio::test]
    async fn concurrent_consumers_do_not_both_succeed() {
        let store = MemoryStore::new();
        let user = testing::invited_user(&store, "new@example.com").await;
        let tokens = ActionTokenManager::new(&store, SECRET, 4);
        let now = Utc::now();
        let issued = tokens.issue(user.id, ActionPurpose::Invite, now).await.unwrap();

        let (a, b) = tokio::join!(
            tokens.consume(&issued.token, "password123", now),
            tokens.consume(&issued.token, "password456", now),
        );
        assert_eq!(a.is_ok() as u8 + b.is_ok() as u8, 1);
        let stored = store.find_by_id(user.id).await.unwrap().unwrap();
        assert_eq!(stored.token_version, 1);
    }
}
