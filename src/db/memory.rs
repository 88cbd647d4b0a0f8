//! In-process implementation of every store trait.
//!
//! A single mutex guards all collections, which makes each trait method
//! trivially atomic. Used by the `memory` backend and by tests.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use uuid::Uuid;

use super::store::{
    ActionTokenStore, FailedAttempt, JobStore, OtpStore, RefreshTokenStore, UserStore,
    OTP_RETENTION_MARGIN_SECS,
};
use crate::models::{
    otp::{OtpChallenge, OtpPurpose},
    token::{ActionPurpose, ActionToken, JobKind, RefreshTokenRecord, ScheduledJob},
    user::{AccountStatus, NewUser, User},
};

type OtpKey = (String, OtpPurpose, String);

#[derive(Default)]
struct Inner {
    users: HashMap<Uuid, User>,
    otps: HashMap<OtpKey, OtpChallenge>,
    action_tokens: HashMap<Uuid, ActionToken>,
    refresh_tokens: HashMap<Uuid, RefreshTokenRecord>,
    jobs: HashMap<Uuid, ScheduledJob>,
}

#[derive(Default)]
pub struct MemoryStore {
    inner: Mutex<Inner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> anyhow::Result<MutexGuard<'_, Inner>> {
        self.inner
            .lock()
            .map_err(|_| anyhow::anyhow!("memory store poisoned"))
    }

    /// Inserts a fully formed user. Seeding helper for local runs and tests.
    pub fn put_user(&self, user: User) -> anyhow::Result<()> {
        self.lock()?.users.insert(user.id, user);
        Ok(())
    }

    pub fn refresh_tokens_for(&self, user_id: Uuid) -> anyhow::Result<Vec<RefreshTokenRecord>> {
        Ok(self
            .lock()?
            .refresh_tokens
            .values()
            .filter(|r| r.user_id == user_id)
            .cloned()
            .collect())
    }

    pub fn action_tokens_for(&self, user_id: Uuid) -> anyhow::Result<Vec<ActionToken>> {
        Ok(self
            .lock()?
            .action_tokens
            .values()
            .filter(|t| t.user_id == user_id)
            .cloned()
            .collect())
    }

    pub fn otp_count(&self) -> anyhow::Result<usize> {
        Ok(self.lock()?.otps.len())
    }

    pub fn pending_jobs(&self) -> anyhow::Result<Vec<ScheduledJob>> {
        Ok(self.lock()?.jobs.values().cloned().collect())
    }
}

#[async_trait]
impl UserStore for MemoryStore {
    async fn ping(&self) -> anyhow::Result<()> {
        self.lock().map(|_| ())
    }

    async fn find_by_email(&self, email: &str) -> anyhow::Result<Option<User>> {
        Ok(self
            .lock()?
            .users
            .values()
            .find(|u| u.email == email)
            .cloned())
    }

    async fn find_by_id(&self, id: Uuid) -> anyhow::Result<Option<User>> {
        Ok(self.lock()?.users.get(&id).cloned())
    }

    async fn insert_invited(&self, new_user: &NewUser) -> anyhow::Result<Option<User>> {
        let mut inner = self.lock()?;
        if inner.users.values().any(|u| u.email == new_user.email) {
            return Ok(None);
        }
        let now = Utc::now();
        let user = User {
            id: Uuid::new_v4(),
            email: new_user.email.clone(),
            name: new_user.name.clone(),
            password_hash: None,
            status: AccountStatus::Invited,
            role: new_user.role,
            permissions: new_user.permissions.clone(),
            failed_login_attempts: 0,
            login_blocked_until: None,
            token_version: 0,
            created_at: now,
            updated_at: now,
        };
        inner.users.insert(user.id, user.clone());
        Ok(Some(user))
    }

    async fn clear_expired_lock(&self, id: Uuid, now: DateTime<Utc>) -> anyhow::Result<bool> {
        let mut inner = self.lock()?;
        match inner.users.get_mut(&id) {
            Some(user) if user.login_blocked_until.is_some_and(|until| until <= now) => {
                user.login_blocked_until = None;
                user.failed_login_attempts = 0;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn record_failed_attempt(
        &self,
        id: Uuid,
        threshold: i32,
        lock_until: DateTime<Utc>,
    ) -> anyhow::Result<FailedAttempt> {
        let mut inner = self.lock()?;
        let user = inner
            .users
            .get_mut(&id)
            .ok_or_else(|| anyhow::anyhow!("user {id} not found"))?;
        user.failed_login_attempts += 1;
        if user.failed_login_attempts >= threshold {
            user.login_blocked_until = Some(lock_until);
        }
        Ok(FailedAttempt {
            attempts: user.failed_login_attempts,
            blocked_until: user.login_blocked_until,
        })
    }

    async fn reset_failed_attempts(&self, id: Uuid) -> anyhow::Result<()> {
        if let Some(user) = self.lock()?.users.get_mut(&id) {
            user.failed_login_attempts = 0;
            user.login_blocked_until = None;
        }
        Ok(())
    }

    async fn change_password(&self, id: Uuid, password_hash: &str) -> anyhow::Result<Option<User>> {
        let mut inner = self.lock()?;
        Ok(inner.users.get_mut(&id).map(|user| {
            user.password_hash = Some(password_hash.to_string());
            user.token_version += 1;
            user.updated_at = Utc::now();
            user.clone()
        }))
    }

    async fn change_email(&self, id: Uuid, email: &str) -> anyhow::Result<bool> {
        let mut inner = self.lock()?;
        if inner.users.values().any(|u| u.email == email && u.id != id) {
            return Ok(false);
        }
        if let Some(user) = inner.users.get_mut(&id) {
            user.email = email.to_string();
            user.updated_at = Utc::now();
        }
        Ok(true)
    }
}

#[async_trait]
impl OtpStore for MemoryStore {
    async fn ping(&self) -> anyhow::Result<()> {
        self.lock().map(|_| ())
    }

    async fn insert(&self, challenge: &OtpChallenge) -> anyhow::Result<()> {
        let key = (
            challenge.subject.clone(),
            challenge.purpose,
            challenge.code_digest.clone(),
        );
        let horizon = Utc::now() - Duration::seconds(OTP_RETENTION_MARGIN_SECS);
        let mut inner = self.lock()?;
        inner.otps.retain(|_, c| c.expires_at > horizon);
        inner.otps.insert(key, challenge.clone());
        Ok(())
    }

    async fn find(
        &self,
        subject: &str,
        purpose: OtpPurpose,
        code_digest: &str,
    ) -> anyhow::Result<Option<OtpChallenge>> {
        let key = (subject.to_string(), purpose, code_digest.to_string());
        Ok(self.lock()?.otps.get(&key).cloned())
    }

    async fn remove(
        &self,
        subject: &str,
        purpose: OtpPurpose,
        code_digest: &str,
    ) -> anyhow::Result<bool> {
        let key = (subject.to_string(), purpose, code_digest.to_string());
        Ok(self.lock()?.otps.remove(&key).is_some())
    }
}

#[async_trait]
impl ActionTokenStore for MemoryStore {
    async fn insert(&self, token: &ActionToken) -> anyhow::Result<()> {
        let mut inner = self.lock()?;
        if token.purpose == ActionPurpose::Reset {
            for existing in inner.action_tokens.values_mut().filter(|t| {
                t.user_id == token.user_id && t.purpose == ActionPurpose::Reset && !t.used
            }) {
                existing.used = true;
            }
        }
        inner.action_tokens.insert(token.id, token.clone());
        Ok(())
    }

    async fn find_by_digest(&self, token_digest: &str) -> anyhow::Result<Option<ActionToken>> {
        Ok(self
            .lock()?
            .action_tokens
            .values()
            .find(|t| t.token_digest == token_digest)
            .cloned())
    }

    async fn delete_for_user(&self, user_id: Uuid) -> anyhow::Result<u64> {
        let mut inner = self.lock()?;
        let before = inner.action_tokens.len();
        inner.action_tokens.retain(|_, t| t.user_id != user_id);
        Ok((before - inner.action_tokens.len()) as u64)
    }

    async fn consume_for_password(
        &self,
        token_id: Uuid,
        password_hash: &str,
        now: DateTime<Utc>,
    ) -> anyhow::Result<Option<User>> {
        let mut inner = self.lock()?;
        let Some(token) = inner.action_tokens.get(&token_id).cloned() else {
            return Ok(None);
        };
        if !token.is_live(now) || !inner.users.contains_key(&token.user_id) {
            return Ok(None);
        }
        if let Some(t) = inner.action_tokens.get_mut(&token_id) {
            t.used = true;
        }
        let user = inner.users.get_mut(&token.user_id).map(|user| {
            user.password_hash = Some(password_hash.to_string());
            if token.purpose == ActionPurpose::Invite {
                user.status = AccountStatus::Active;
            }
            user.token_version += 1;
            user.updated_at = now;
            user.clone()
        });
        Ok(user)
    }
}

#[async_trait]
impl RefreshTokenStore for MemoryStore {
    async fn insert(&self, record: &RefreshTokenRecord) -> anyhow::Result<()> {
        self.lock()?.refresh_tokens.insert(record.id, record.clone());
        Ok(())
    }

    async fn find_by_digest(
        &self,
        token_digest: &str,
    ) -> anyhow::Result<Option<RefreshTokenRecord>> {
        Ok(self
            .lock()?
            .refresh_tokens
            .values()
            .find(|r| r.token_digest == token_digest)
            .cloned())
    }

    async fn delete_by_digest(&self, token_digest: &str) -> anyhow::Result<bool> {
        let mut inner = self.lock()?;
        let before = inner.refresh_tokens.len();
        inner.refresh_tokens.retain(|_, r| r.token_digest != token_digest);
        Ok(inner.refresh_tokens.len() < before)
    }

    async fn delete_for_user(&self, user_id: Uuid) -> anyhow::Result<u64> {
        let mut inner = self.lock()?;
        let before = inner.refresh_tokens.len();
        inner.refresh_tokens.retain(|_, r| r.user_id != user_id);
        Ok((before - inner.refresh_tokens.len()) as u64)
    }

    async fn delete_for_user_except(&self, user_id: Uuid, keep: Uuid) -> anyhow::Result<u64> {
        let mut inner = self.lock()?;
        let before = inner.refresh_tokens.len();
        inner
            .refresh_tokens
            .retain(|id, r| r.user_id != user_id || *id == keep);
        Ok((before - inner.refresh_tokens.len()) as u64)
    }
}

#[async_trait]
impl JobStore for MemoryStore {
    async fn schedule(&self, job: &ScheduledJob) -> anyhow::Result<()> {
        self.lock()?.jobs.insert(job.id, job.clone());
        Ok(())
    }

    async fn cancel(&self, kind: JobKind, subject: &str) -> anyhow::Result<u64> {
        let mut inner = self.lock()?;
        let before = inner.jobs.len();
        inner
            .jobs
            .retain(|_, j| j.kind != kind || j.subject != subject);
        Ok((before - inner.jobs.len()) as u64)
    }

    async fn claim_due(&self, now: DateTime<Utc>, limit: i64) -> anyhow::Result<Vec<ScheduledJob>> {
        let mut inner = self.lock()?;
        let mut due: Vec<(Uuid, DateTime<Utc>)> = inner
            .jobs
            .values()
            .filter(|j| j.run_at <= now)
            .map(|j| (j.id, j.run_at))
            .collect();
        due.sort_by_key(|(_, run_at)| *run_at);
        due.truncate(usize::try_from(limit).unwrap_or(0));
        Ok(due
            .into_iter()
            .filter_map(|(id, _)| inner.jobs.remove(&id))
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::user::{Permissions, UserRole};

    fn new_user(email: &str) -> NewUser {
        NewUser {
            email: email.into(),
            name: "Someone".into(),
            role: UserRole::User,
            permissions: Permissions::default(),
        }
    }

    #[tokio::test]
    async fn insert_invited_rejects_duplicate_email() {
        let store = MemoryStore::new();
        assert!(store.insert_invited(&new_user("a@example.com")).await.unwrap().is_some());
        assert!(store.insert_invited(&new_user("a@example.com")).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn claim_due_hands_out_each_job_once() {
        let store = MemoryStore::new();
        let now = Utc::now();
        for (subject, offset) in [("late@example.com", 60), ("due@example.com", -1)] {
            store
                .schedule(&ScheduledJob {
                    id: Uuid::new_v4(),
                    kind: JobKind::OtpAlert,
                    subject: subject.into(),
                    run_at: now + chrono::Duration::seconds(offset),
                    payload: serde_json::Value::Null,
                    created_at: now,
                })
                .await
                .unwrap();
        }

        let first = store.claim_due(now, 10).await.unwrap();
        assert_eq!(first.len(), 1);
        assert_eq!(first[0].subject, "due@example.com");
        assert!(store.claim_due(now, 10).await.unwrap().is_empty());
        assert_eq!(store.pending_jobs().unwrap().len(), 1);
    }

    fn challenge(subject: &str, digest: &str, expires_at: DateTime<Utc>) -> OtpChallenge {
        OtpChallenge {
            subject: subject.into(),
            purpose: OtpPurpose::Login,
            code_digest: digest.into(),
            created_at: expires_at - Duration::minutes(5),
            expires_at,
        }
    }

    #[tokio::test]
    async fn stale_challenges_are_dropped_on_insert() {
        let store = MemoryStore::new();
        let now = Utc::now();
        let stale = now - Duration::hours(1);
        for i in 0..3 {
            OtpStore::insert(&store, &challenge("gone@example.com", &format!("old-{i}"), stale))
                .await
                .unwrap();
        }
        // Expired but still inside the retention margin.
        OtpStore::insert(&store, &challenge("recent@example.com", "recent", now - Duration::minutes(1)))
            .await
            .unwrap();
        OtpStore::insert(&store, &challenge("ops@example.com", "fresh", now + Duration::minutes(5)))
            .await
            .unwrap();

        assert_eq!(store.otp_count().unwrap(), 2);
        assert!(store
            .find("gone@example.com", OtpPurpose::Login, "old-0")
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn cancel_drops_only_the_matching_subject() {
        let store = MemoryStore::new();
        let now = Utc::now();
        for subject in ["ops@example.com:aaa", "ops@example.com:bbb"] {
            store
                .schedule(&ScheduledJob {
                    id: Uuid::new_v4(),
                    kind: JobKind::OtpAlert,
                    subject: subject.into(),
                    run_at: now,
                    payload: serde_json::Value::Null,
                    created_at: now,
                })
                .await
                .unwrap();
        }

        assert_eq!(store.cancel(JobKind::OtpAlert, "ops@example.com:aaa").await.unwrap(), 1);
        let left = store.pending_jobs().unwrap();
        assert_eq!(left.len(), 1);
        assert_eq!(left[0].subject, "ops@example.com:bbb");
    }
}
