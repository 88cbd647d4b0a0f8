use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::auth::ClientOrigin;

/// What an action token authorizes.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ActionPurpose {
    Invite,
    Reset,
}

impl std::fmt::Display for ActionPurpose {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ActionPurpose::Invite => "invite",
            ActionPurpose::Reset => "reset",
        };
        write!(f, "{s}")
    }
}

impl std::str::FromStr for ActionPurpose {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "invite" => Ok(ActionPurpose::Invite),
            "reset" => Ok(ActionPurpose::Reset),
            _ => Err(anyhow::anyhow!("Unknown action token purpose: {s}")),
        }
    }
}

/// Stored half of an action token. The signed half lives in the link.
#[derive(Debug, Clone)]
pub struct ActionToken {
    pub id: Uuid,
    pub user_id: Uuid,
    /// SHA-256 of the signed token string.
    pub token_digest: String,
    pub purpose: ActionPurpose,
    pub used: bool,
    pub expires_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
}

impl ActionToken {
    pub fn is_live(&self, now: DateTime<Utc>) -> bool {
        !self.used && self.expires_at > now
    }
}

#[derive(Debug, Clone)]
pub struct RefreshTokenRecord {
    pub id: Uuid,
    pub user_id: Uuid,
    pub token_digest: String,
    pub expires_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum JobKind {
    /// Login OTP still pending after the alert delay.
    OtpAlert,
}

impl std::fmt::Display for JobKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            JobKind::OtpAlert => write!(f, "otp_alert"),
        }
    }
}

impl std::str::FromStr for JobKind {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "otp_alert" => Ok(JobKind::OtpAlert),
            _ => Err(anyhow::anyhow!("Unknown job kind: {s}")),
        }
    }
}

/// Durable due-at record. OTP alert jobs use one subject per login challenge.
#[derive(Debug, Clone)]
pub struct ScheduledJob {
    pub id: Uuid,
    pub kind: JobKind,
    pub subject: String,
    pub run_at: DateTime<Utc>,
    pub payload: serde_json::Value,
    pub created_at: DateTime<Utc>,
}

/// Payload of an `OtpAlert` job: enough to find the pending challenge again
/// and to tell the account owner where the sign-in came from.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct OtpAlertPayload {
    pub email: String,
    pub code_digest: String,
    pub origin: ClientOrigin,
    pub requested_at: DateTime<Utc>,
}
