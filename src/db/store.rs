//! Persistence seams of the auth core.
//!
//! Every mutation of a user record is field-scoped: each method touches only
//! the columns it owns so concurrent unrelated edits (permissions, profile)
//! are never clobbered. Methods that must be atomic say so and the backends
//! implement them as single statements or transactions.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::models::{
    otp::{OtpChallenge, OtpPurpose},
    token::{ActionToken, JobKind, RefreshTokenRecord, ScheduledJob},
    user::{NewUser, User},
};

/// Counter state after a failed attempt was recorded.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FailedAttempt {
    pub attempts: i32,
    pub blocked_until: Option<DateTime<Utc>>,
}

#[async_trait]
pub trait UserStore: Send + Sync {
    async fn ping(&self) -> anyhow::Result<()>;

    async fn find_by_email(&self, email: &str) -> anyhow::Result<Option<User>>;

    async fn find_by_id(&self, id: Uuid) -> anyhow::Result<Option<User>>;

    /// Returns `None` when the email is already taken.
    async fn insert_invited(&self, new_user: &NewUser) -> anyhow::Result<Option<User>>;

    /// Clears the lock and the counter only if the lock has expired at `now`
    /// (compare-and-set on `login_blocked_until`). Returns whether it did.
    async fn clear_expired_lock(&self, id: Uuid, now: DateTime<Utc>) -> anyhow::Result<bool>;

    /// Atomic increment-and-fetch of the failure counter. When the new count
    /// reaches `threshold`, `login_blocked_until` is set to `lock_until` in
    /// the same operation.
    async fn record_failed_attempt(
        &self,
        id: Uuid,
        threshold: i32,
        lock_until: DateTime<Utc>,
    ) -> anyhow::Result<FailedAttempt>;

    /// Resets the counter and clears any lock.
    async fn reset_failed_attempts(&self, id: Uuid) -> anyhow::Result<()>;

    /// Sets the password hash and bumps `token_version` by one, atomically.
    async fn change_password(&self, id: Uuid, password_hash: &str) -> anyhow::Result<Option<User>>;

    /// Returns `false` when another account already uses `email`.
    async fn change_email(&self, id: Uuid, email: &str) -> anyhow::Result<bool>;
}

/// Seconds a challenge is kept past its own expiry before a backend drops it.
pub const OTP_RETENTION_MARGIN_SECS: i64 = 5 * 60;

/// Backing store of OTP challenges. Records are keyed by
/// (subject, purpose, code digest) so several codes may coexist.
#[async_trait]
pub trait OtpStore: Send + Sync {
    async fn ping(&self) -> anyhow::Result<()>;

    async fn insert(&self, challenge: &OtpChallenge) -> anyhow::Result<()>;

    async fn find(
        &self,
        subject: &str,
        purpose: OtpPurpose,
        code_digest: &str,
    ) -> anyhow::Result<Option<OtpChallenge>>;

    /// Returns `true` only for the caller that actually removed the record.
    async fn remove(&self, subject: &str, purpose: OtpPurpose, code_digest: &str)
        -> anyhow::Result<bool>;
}

#[async_trait]
pub trait ActionTokenStore: Send + Sync {
    /// Inserts `token`. For reset tokens every unused reset token of the same
    /// user is marked used in the same transaction.
    async fn insert(&self, token: &ActionToken) -> anyhow::Result<()>;

    async fn find_by_digest(&self, token_digest: &str) -> anyhow::Result<Option<ActionToken>>;

    async fn delete_for_user(&self, user_id: Uuid) -> anyhow::Result<u64>;

    /// One transaction: marks the token used (only if still unused and
    /// unexpired at `now`), sets the password hash, activates invited
    /// accounts for invite tokens and bumps `token_version`. Returns the
    /// updated user, or `None` if the token was no longer consumable.
    async fn consume_for_password(
        &self,
        token_id: Uuid,
        password_hash: &str,
        now: DateTime<Utc>,
    ) -> anyhow::Result<Option<User>>;
}

#[async_trait]
pub trait RefreshTokenStore: Send + Sync {
    async fn insert(&self, record: &RefreshTokenRecord) -> anyhow::Result<()>;

    async fn find_by_digest(&self, token_digest: &str)
        -> anyhow::Result<Option<RefreshTokenRecord>>;

    async fn delete_by_digest(&self, token_digest: &str) -> anyhow::Result<bool>;

    async fn delete_for_user(&self, user_id: Uuid) -> anyhow::Result<u64>;

    async fn delete_for_user_except(&self, user_id: Uuid, keep: Uuid) -> anyhow::Result<u64>;
}

/// Durable schedule of deferred checks.
#[async_trait]
pub trait JobStore: Send + Sync {
    /// Adds a job. Jobs sharing (kind, subject) coexist.
    async fn schedule(&self, job: &ScheduledJob) -> anyhow::Result<()>;

    /// Drops every pending job of `kind` for `subject`.
    async fn cancel(&self, kind: JobKind, subject: &str) -> anyhow::Result<u64>;

    /// Removes and returns up to `limit` jobs due at `now`. A job is handed
    /// to exactly one caller.
    async fn claim_due(&self, now: DateTime<Utc>, limit: i64) -> anyhow::Result<Vec<ScheduledJob>>;
}
