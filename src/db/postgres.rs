use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{types::Json, FromRow, PgPool};
use uuid::Uuid;

use super::store::{ActionTokenStore, FailedAttempt, JobStore, RefreshTokenStore, UserStore};
use crate::models::{
    token::{ActionPurpose, ActionToken, JobKind, RefreshTokenRecord, ScheduledJob},
    user::{NewUser, Permissions, User},
};

const USER_COLUMNS: &str = "id, email, name, password_hash, status, role, permissions,
    failed_login_attempts, login_blocked_until, token_version, created_at, updated_at";

/// DB row struct: status/role are TEXT and parsed into enums.
#[derive(Debug, FromRow)]
struct UserRow {
    id: Uuid,
    email: String,
    name: String,
    password_hash: Option<String>,
    status: String,
    role: String,
    permissions: Json<Permissions>,
    failed_login_attempts: i32,
    login_blocked_until: Option<DateTime<Utc>>,
    token_version: i64,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl TryFrom<UserRow> for User {
    type Error = anyhow::Error;

    fn try_from(row: UserRow) -> Result<Self, Self::Error> {
        Ok(User {
            id: row.id,
            email: row.email,
            name: row.name,
            password_hash: row.password_hash,
            status: row.status.parse()?,
            role: row.role.parse()?,
            permissions: row.permissions.0,
            failed_login_attempts: row.failed_login_attempts,
            login_blocked_until: row.login_blocked_until,
            token_version: row.token_version,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}

#[derive(Debug, FromRow)]
struct ActionTokenRow {
    id: Uuid,
    user_id: Uuid,
    token_digest: String,
    purpose: String,
    used: bool,
    expires_at: DateTime<Utc>,
    created_at: DateTime<Utc>,
}

impl TryFrom<ActionTokenRow> for ActionToken {
    type Error = anyhow::Error;

    fn try_from(row: ActionTokenRow) -> Result<Self, Self::Error> {
        Ok(ActionToken {
            id: row.id,
            user_id: row.user_id,
            token_digest: row.token_digest,
            purpose: row.purpose.parse()?,
            used: row.used,
            expires_at: row.expires_at,
            created_at: row.created_at,
        })
    }
}

#[derive(Debug, FromRow)]
struct RefreshTokenRow {
    id: Uuid,
    user_id: Uuid,
    token_digest: String,
    expires_at: DateTime<Utc>,
    created_at: DateTime<Utc>,
}

impl From<RefreshTokenRow> for RefreshTokenRecord {
    fn from(row: RefreshTokenRow) -> Self {
        RefreshTokenRecord {
            id: row.id,
            user_id: row.user_id,
            token_digest: row.token_digest,
            expires_at: row.expires_at,
            created_at: row.created_at,
        }
    }
}

#[derive(Debug, FromRow)]
struct JobRow {
    id: Uuid,
    kind: String,
    subject: String,
    run_at: DateTime<Utc>,
    payload: Json<serde_json::Value>,
    created_at: DateTime<Utc>,
}

impl TryFrom<JobRow> for ScheduledJob {
    type Error = anyhow::Error;

    fn try_from(row: JobRow) -> Result<Self, Self::Error> {
        Ok(ScheduledJob {
            id: row.id,
            kind: row.kind.parse()?,
            subject: row.subject,
            run_at: row.run_at,
            payload: row.payload.0,
            created_at: row.created_at,
        })
    }
}

/// Rows removed by [`PgStore::purge_expired`].
#[derive(Debug, Default)]
pub struct PurgeReport {
    pub action_tokens: u64,
    pub refresh_tokens: u64,
    pub jobs: u64,
}

#[derive(Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Deletes dead rows: action tokens used or expired before `cutoff`,
    /// expired refresh tokens, and jobs that nobody claimed before `cutoff`.
    pub async fn purge_expired(
        &self,
        now: DateTime<Utc>,
        cutoff: DateTime<Utc>,
    ) -> anyhow::Result<PurgeReport> {
        let action_tokens = sqlx::query(
            "DELETE FROM password_tokens
             WHERE (used = TRUE OR expires_at <= $1) AND created_at < $2",
        )
        .bind(now)
        .bind(cutoff)
        .execute(&self.pool)
        .await?
        .rows_affected();

        let refresh_tokens = sqlx::query("DELETE FROM refresh_tokens WHERE expires_at <= $1")
            .bind(now)
            .execute(&self.pool)
            .await?
            .rows_affected();

        let jobs = sqlx::query("DELETE FROM scheduled_jobs WHERE run_at < $1")
            .bind(cutoff)
            .execute(&self.pool)
            .await?
            .rows_affected();

        Ok(PurgeReport {
            action_tokens,
            refresh_tokens,
            jobs,
        })
    }
}

#[async_trait]
impl UserStore for PgStore {
    async fn ping(&self) -> anyhow::Result<()> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }

    async fn find_by_email(&self, email: &str) -> anyhow::Result<Option<User>> {
        sqlx::query_as::<_, UserRow>(&format!("SELECT {USER_COLUMNS} FROM users WHERE email = $1"))
            .bind(email)
            .fetch_optional(&self.pool)
            .await?
            .map(User::try_from)
            .transpose()
    }

    async fn find_by_id(&self, id: Uuid) -> anyhow::Result<Option<User>> {
        sqlx::query_as::<_, UserRow>(&format!("SELECT {USER_COLUMNS} FROM users WHERE id = $1"))
            .bind(id)
            .fetch_optional(&self.pool)
            .await?
            .map(User::try_from)
            .transpose()
    }

    async fn insert_invited(&self, new_user: &NewUser) -> anyhow::Result<Option<User>> {
        sqlx::query_as::<_, UserRow>(&format!(
            "INSERT INTO users (id, email, name, status, role, permissions)
             VALUES ($1, $2, $3, 'invited', $4, $5)
             ON CONFLICT (email) DO NOTHING
             RETURNING {USER_COLUMNS}"
        ))
        .bind(Uuid::new_v4())
        .bind(&new_user.email)
        .bind(&new_user.name)
        .bind(new_user.role.to_string())
        .bind(Json(&new_user.permissions))
        .fetch_optional(&self.pool)
        .await?
        .map(User::try_from)
        .transpose()
    }

    async fn clear_expired_lock(&self, id: Uuid, now: DateTime<Utc>) -> anyhow::Result<bool> {
        let result = sqlx::query(
            "UPDATE users
             SET failed_login_attempts = 0, login_blocked_until = NULL, updated_at = NOW()
             WHERE id = $1 AND login_blocked_until IS NOT NULL AND login_blocked_until <= $2",
        )
        .bind(id)
        .bind(now)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn record_failed_attempt(
        &self,
        id: Uuid,
        threshold: i32,
        lock_until: DateTime<Utc>,
    ) -> anyhow::Result<FailedAttempt> {
        // SET expressions see the pre-update row, hence `+ 1` in the CASE.
        let row: Option<(i32, Option<DateTime<Utc>>)> = sqlx::query_as(
            "UPDATE users
             SET failed_login_attempts = failed_login_attempts + 1,
                 login_blocked_until = CASE
                     WHEN failed_login_attempts + 1 >= $2 THEN $3
                     ELSE login_blocked_until
                 END,
                 updated_at = NOW()
             WHERE id = $1
             RETURNING failed_login_attempts, login_blocked_until",
        )
        .bind(id)
        .bind(threshold)
        .bind(lock_until)
        .fetch_optional(&self.pool)
        .await?;

        let (attempts, blocked_until) =
            row.ok_or_else(|| anyhow::anyhow!("user {id} not found"))?;
        Ok(FailedAttempt {
            attempts,
            blocked_until,
        })
    }

    async fn reset_failed_attempts(&self, id: Uuid) -> anyhow::Result<()> {
        sqlx::query(
            "UPDATE users
             SET failed_login_attempts = 0, login_blocked_until = NULL, updated_at = NOW()
             WHERE id = $1",
        )
        .bind(id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn change_password(&self, id: Uuid, password_hash: &str) -> anyhow::Result<Option<User>> {
        sqlx::query_as::<_, UserRow>(&format!(
            "UPDATE users
             SET password_hash = $2, token_version = token_version + 1, updated_at = NOW()
             WHERE id = $1
             RETURNING {USER_COLUMNS}"
        ))
        .bind(id)
        .bind(password_hash)
        .fetch_optional(&self.pool)
        .await?
        .map(User::try_from)
        .transpose()
    }

    async fn change_email(&self, id: Uuid, email: &str) -> anyhow::Result<bool> {
        let result = sqlx::query("UPDATE users SET email = $2, updated_at = NOW() WHERE id = $1")
            .bind(id)
            .bind(email)
            .execute(&self.pool)
            .await;

        match result {
            Ok(_) => Ok(true),
            Err(sqlx::Error::Database(e)) if e.is_unique_violation() => Ok(false),
            Err(e) => Err(e.into()),
        }
    }
}

#[async_trait]
impl ActionTokenStore for PgStore {
    async fn insert(&self, token: &ActionToken) -> anyhow::Result<()> {
        let mut tx = self.pool.begin().await?;

        if token.purpose == ActionPurpose::Reset {
            sqlx::query(
                "UPDATE password_tokens SET used = TRUE
                 WHERE user_id = $1 AND purpose = 'reset' AND used = FALSE",
            )
            .bind(token.user_id)
            .execute(&mut *tx)
            .await?;
        }

        sqlx::query(
            "INSERT INTO password_tokens (id, user_id, token_digest, purpose, used, expires_at, created_at)
             VALUES ($1, $2, $3, $4, FALSE, $5, $6)",
        )
        .bind(token.id)
        .bind(token.user_id)
        .bind(&token.token_digest)
        .bind(token.purpose.to_string())
        .bind(token.expires_at)
        .bind(token.created_at)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(())
    }

    async fn find_by_digest(&self, token_digest: &str) -> anyhow::Result<Option<ActionToken>> {
        sqlx::query_as::<_, ActionTokenRow>(
            "SELECT id, user_id, token_digest, purpose, used, expires_at, created_at
             FROM password_tokens WHERE token_digest = $1",
        )
        .bind(token_digest)
        .fetch_optional(&self.pool)
        .await?
        .map(ActionToken::try_from)
        .transpose()
    }

    async fn delete_for_user(&self, user_id: Uuid) -> anyhow::Result<u64> {
        let result = sqlx::query("DELETE FROM password_tokens WHERE user_id = $1")
            .bind(user_id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }

    async fn consume_for_password(
        &self,
        token_id: Uuid,
        password_hash: &str,
        now: DateTime<Utc>,
    ) -> anyhow::Result<Option<User>> {
        let mut tx = self.pool.begin().await?;

        // Conditional flip: a concurrent consumer of the same token gets no row.
        let claimed: Option<(Uuid, String)> = sqlx::query_as(
            "UPDATE password_tokens SET used = TRUE
             WHERE id = $1 AND used = FALSE AND expires_at > $2
             RETURNING user_id, purpose",
        )
        .bind(token_id)
        .bind(now)
        .fetch_optional(&mut *tx)
        .await?;

        let Some((user_id, purpose)) = claimed else {
            return Ok(None);
        };
        let activate = purpose.parse::<ActionPurpose>()? == ActionPurpose::Invite;

        let user = sqlx::query_as::<_, UserRow>(&format!(
            "UPDATE users
             SET password_hash = $2,
                 status = CASE WHEN $3 THEN 'active' ELSE status END,
                 token_version = token_version + 1,
                 updated_at = NOW()
             WHERE id = $1
             RETURNING {USER_COLUMNS}"
        ))
        .bind(user_id)
        .bind(password_hash)
        .bind(activate)
        .fetch_optional(&mut *tx)
        .await?;

        // No user: dropping `tx` rolls the token flip back.
        let Some(user) = user else {
            return Ok(None);
        };

        tx.commit().await?;
        User::try_from(user).map(Some)
    }
}

#[async_trait]
impl RefreshTokenStore for PgStore {
    async fn insert(&self, record: &RefreshTokenRecord) -> anyhow::Result<()> {
        sqlx::query(
            "INSERT INTO refresh_tokens (id, user_id, token_digest, expires_at, created_at)
             VALUES ($1, $2, $3, $4, $5)",
        )
        .bind(record.id)
        .bind(record.user_id)
        .bind(&record.token_digest)
        .bind(record.expires_at)
        .bind(record.created_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn find_by_digest(
        &self,
        token_digest: &str,
    ) -> anyhow::Result<Option<RefreshTokenRecord>> {
        let row = sqlx::query_as::<_, RefreshTokenRow>(
            "SELECT id, user_id, token_digest, expires_at, created_at
             FROM refresh_tokens WHERE token_digest = $1",
        )
        .bind(token_digest)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(RefreshTokenRecord::from))
    }

    async fn delete_by_digest(&self, token_digest: &str) -> anyhow::Result<bool> {
        let result = sqlx::query("DELETE FROM refresh_tokens WHERE token_digest = $1")
            .bind(token_digest)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn delete_for_user(&self, user_id: Uuid) -> anyhow::Result<u64> {
        let result = sqlx::query("DELETE FROM refresh_tokens WHERE user_id = $1")
            .bind(user_id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }

    async fn delete_for_user_except(&self, user_id: Uuid, keep: Uuid) -> anyhow::Result<u64> {
        let result = sqlx::query("DELETE FROM refresh_tokens WHERE user_id = $1 AND id <> $2")
            .bind(user_id)
            .bind(keep)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }
}

#[async_trait]
impl JobStore for PgStore {
    async fn schedule(&self, job: &ScheduledJob) -> anyhow::Result<()> {
        sqlx::query(
            "INSERT INTO scheduled_jobs (id, kind, subject, run_at, payload, created_at)
             VALUES ($1, $2, $3, $4, $5, $6)",
        )
        .bind(job.id)
        .bind(job.kind.to_string())
        .bind(&job.subject)
        .bind(job.run_at)
        .bind(Json(&job.payload))
        .bind(job.created_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn cancel(&self, kind: JobKind, subject: &str) -> anyhow::Result<u64> {
        let result = sqlx::query("DELETE FROM scheduled_jobs WHERE kind = $1 AND subject = $2")
            .bind(kind.to_string())
            .bind(subject)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }

    async fn claim_due(&self, now: DateTime<Utc>, limit: i64) -> anyhow::Result<Vec<ScheduledJob>> {
        let rows = sqlx::query_as::<_, JobRow>(
            "DELETE FROM scheduled_jobs
             WHERE id IN (
                 SELECT id FROM scheduled_jobs
                 WHERE run_at <= $1
                 ORDER BY run_at
                 LIMIT $2
                 FOR UPDATE SKIP LOCKED
             )
             RETURNING id, kind, subject, run_at, payload, created_at",
        )
        .bind(now)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(ScheduledJob::try_from).collect()
    }
}
