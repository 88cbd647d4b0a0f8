use chrono::{DateTime, Duration, Utc};
use rand::Rng;
use tracing::warn;

use crate::db::store::OtpStore;
use crate::error::{AuthError, AuthResult};
use crate::models::otp::{OtpChallenge, OtpPurpose, OtpStatus};
use crate::services::credentials::keyed_digest;
use crate::services::email::SecurityNotifier;
use crate::services::metrics::OTP_COUNTER;

pub const OTP_TTL_MINUTES: i64 = 5;
/// Delay after a login OTP before the "still unconfirmed" alert fires.
pub const ALERT_DELAY_MINUTES: i64 = 4;

/// Four digits, uniform in 1000..=9999.
pub fn generate_code() -> String {
    rand::thread_rng().gen_range(1000..=9999).to_string()
}

/// Reference to a challenge that was stored and mailed.
#[derive(Debug, Clone)]
pub struct IssuedOtp {
    pub code_digest: String,
    pub expires_at: DateTime<Utc>,
}

/// Subject of the alert job armed by one login challenge.
pub fn alert_job_subject(subject: &str, code_digest: &str) -> String {
    format!("{subject}:{code_digest}")
}

pub struct OtpManager<'a> {
    store: &'a dyn OtpStore,
    notifier: &'a dyn SecurityNotifier,
    digest_key: &'a str,
}

impl<'a> OtpManager<'a> {
    pub fn new(store: &'a dyn OtpStore, notifier: &'a dyn SecurityNotifier, digest_key: &'a str) -> Self {
        Self {
            store,
            notifier,
            digest_key,
        }
    }

    /// Lookup digest of a submitted or generated code.
    pub fn code_digest(&self, code: &str) -> AuthResult<String> {
        Ok(keyed_digest(self.digest_key, code.trim())?)
    }

    /// Stores a fresh code and mails it. Earlier codes for the same subject
    /// and purpose are left alone and stay usable until they expire. The
    /// record survives a delivery failure so a resend can follow.
    pub async fn issue(
        &self,
        subject: &str,
        purpose: OtpPurpose,
        now: DateTime<Utc>,
    ) -> AuthResult<IssuedOtp> {
        let code = generate_code();
        let challenge = OtpChallenge {
            subject: subject.to_string(),
            purpose,
            code_digest: self.code_digest(&code)?,
            created_at: now,
            expires_at: now + Duration::minutes(OTP_TTL_MINUTES),
        };
        self.store.insert(&challenge).await?;
        OTP_COUNTER.with_label_values(&[purpose.as_str(), "issued"]).inc();

        if let Err(e) = self.notifier.send_otp(subject, &code, purpose).await {
            warn!(subject, %purpose, error = %e, "OTP email delivery failed");
            return Err(AuthError::DeliveryFailed("verification code".into()));
        }

        Ok(IssuedOtp {
            code_digest: challenge.code_digest,
            expires_at: challenge.expires_at,
        })
    }

    /// `Expired` leaves the record in place; the store drops it later.
    /// Only the caller whose delete removed the record gets `Verified`.
    pub async fn verify(
        &self,
        subject: &str,
        code: &str,
        purpose: OtpPurpose,
        now: DateTime<Utc>,
    ) -> AuthResult<OtpStatus> {
        let digest = self.code_digest(code)?;
        let status = match self.store.find(subject, purpose, &digest).await? {
            None => OtpStatus::Invalid,
            Some(challenge) if now >= challenge.expires_at => OtpStatus::Expired,
            Some(_) => {
                if self.store.remove(subject, purpose, &digest).await? {
                    OtpStatus::Verified
                } else {
                    OtpStatus::Invalid
                }
            }
        };

        let result = match status {
            OtpStatus::Verified => "verified",
            OtpStatus::Invalid => "invalid",
            OtpStatus::Expired => "expired",
        };
        OTP_COUNTER.with_label_values(&[purpose.as_str(), result]).inc();
        Ok(status)
    }
}

impl OtpStatus {
    /// Maps a failed check onto the error answered to the client.
    pub fn into_result(self) -> AuthResult<()> {
        match self {
            OtpStatus::Verified => Ok(()),
            OtpStatus::Invalid => Err(AuthError::TokenInvalidOrExpired("Invalid OTP".into())),
            OtpStatus::Expired => Err(AuthError::TokenInvalidOrExpired(
                "OTP has expired, request a new one".into(),
            )),
        }
    }
}
