use async_trait::async_trait;
use chrono::Utc;
use redis::aio::MultiplexedConnection;

use super::store::{OtpStore, OTP_RETENTION_MARGIN_SECS};
use crate::models::otp::{OtpChallenge, OtpPurpose};

/// OTP challenges in Redis, one key per (subject, purpose, code digest).
///
/// Login challenges live under `otp_verifications:*`, confirmation codes of
/// the update flows under `update_otp_verifications:*`. Redis drops each key
/// once its expiry plus the retention margin has passed.
#[derive(Clone)]
pub struct RedisOtpStore {
    conn: MultiplexedConnection,
}

impl RedisOtpStore {
    pub fn new(conn: MultiplexedConnection) -> Self {
        Self { conn }
    }
}

fn key(subject: &str, purpose: OtpPurpose, code_digest: &str) -> String {
    match purpose {
        OtpPurpose::Login => format!("otp_verifications:{subject}:{code_digest}"),
        _ => format!("update_otp_verifications:{purpose}:{subject}:{code_digest}"),
    }
}

#[async_trait]
impl OtpStore for RedisOtpStore {
    async fn ping(&self) -> anyhow::Result<()> {
        let mut conn = self.conn.clone();
        let _: String = redis::cmd("PING").query_async(&mut conn).await?;
        Ok(())
    }

    async fn insert(&self, challenge: &OtpChallenge) -> anyhow::Result<()> {
        let ttl = (challenge.expires_at - Utc::now()).num_seconds().max(0) + OTP_RETENTION_MARGIN_SECS;
        let value = serde_json::to_string(challenge)?;

        let mut conn = self.conn.clone();
        let _: () = redis::cmd("SET")
            .arg(key(&challenge.subject, challenge.purpose, &challenge.code_digest))
            .arg(value)
            .arg("EX")
            .arg(ttl)
            .query_async(&mut conn)
            .await?;
        Ok(())
    }

    async fn find(
        &self,
        subject: &str,
        purpose: OtpPurpose,
        code_digest: &str,
    ) -> anyhow::Result<Option<OtpChallenge>> {
        let mut conn = self.conn.clone();
        let raw: Option<String> = redis::cmd("GET")
            .arg(key(subject, purpose, code_digest))
            .query_async(&mut conn)
            .await?;

        raw.map(|s| serde_json::from_str(&s).map_err(anyhow::Error::from))
            .transpose()
    }

    async fn remove(
        &self,
        subject: &str,
        purpose: OtpPurpose,
        code_digest: &str,
    ) -> anyhow::Result<bool> {
        // DEL reports how many keys it removed; only one caller sees 1.
        let mut conn = self.conn.clone();
        let removed: i64 = redis::cmd("DEL")
            .arg(key(subject, purpose, code_digest))
            .query_async(&mut conn)
            .await?;
        Ok(removed > 0)
    }
}
