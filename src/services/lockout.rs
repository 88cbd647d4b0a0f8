//! Failed-attempt counting and lock windows around password checks.
//!
//! Locks expire lazily: nothing sweeps them, the next attempt after the
//! window clears the lock before it is evaluated.

use chrono::{DateTime, Duration, Utc};
use tracing::warn;

use crate::db::store::UserStore;
use crate::error::{AuthError, AuthResult};
use crate::models::user::User;
use crate::services::metrics::LOCKOUTS_COUNTER;

pub const MAX_FAILED_ATTEMPTS: i32 = 5;
pub const LOCKOUT_MINUTES: i64 = 15;

/// Counter state reported back to the caller after a wrong password.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FailureReport {
    pub attempts: i32,
    pub remaining: u32,
    pub locked_until: Option<DateTime<Utc>>,
}

impl FailureReport {
    pub fn into_error(self) -> AuthError {
        AuthError::InvalidCredentials {
            remaining_attempts: Some(self.remaining),
        }
    }
}

pub struct LockoutGuard<'a> {
    users: &'a dyn UserStore,
}

impl<'a> LockoutGuard<'a> {
    pub fn new(users: &'a dyn UserStore) -> Self {
        Self { users }
    }

    /// Gate before the password compare. An expired lock is cleared in the
    /// store and on `user` so the attempt starts from a zero counter.
    pub async fn check(&self, user: &mut User, now: DateTime<Utc>) -> AuthResult<()> {
        match user.login_blocked_until {
            Some(until) if until > now => Err(AuthError::AccountLocked { until }),
            Some(_) => {
                self.users.clear_expired_lock(user.id, now).await?;
                user.login_blocked_until = None;
                user.failed_login_attempts = 0;
                Ok(())
            }
            None => Ok(()),
        }
    }

    pub async fn record_failure(&self, user: &User, now: DateTime<Utc>) -> AuthResult<FailureReport> {
        let lock_until = now + Duration::minutes(LOCKOUT_MINUTES);
        let state = self
            .users
            .record_failed_attempt(user.id, MAX_FAILED_ATTEMPTS, lock_until)
            .await?;

        let locked_until = state.blocked_until.filter(|until| *until > now);
        if state.attempts == MAX_FAILED_ATTEMPTS {
            LOCKOUTS_COUNTER.inc();
            warn!(user_id = %user.id, until = ?locked_until, "account locked after failed logins");
        }

        Ok(FailureReport {
            attempts: state.attempts,
            remaining: (MAX_FAILED_ATTEMPTS - state.attempts).max(0) as u32,
            locked_until,
        })
    }

    pub async fn record_success(&self, user: &User) -> AuthResult<()> {
        self.users.reset_failed_attempts(user.id).await?;
        Ok(())
    }
}
