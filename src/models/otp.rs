use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Which flow an OTP challenge confirms.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "kebab-case")]
pub enum OtpPurpose {
    Login,
    EmailUpdate,
    PasswordUpdate,
}

impl OtpPurpose {
    /// Parses the `type` field of the update-OTP endpoints. `login` is not
    /// an accepted update type.
    pub fn parse_update(s: &str) -> Option<Self> {
        match s {
            "email-update" => Some(OtpPurpose::EmailUpdate),
            "password-update" => Some(OtpPurpose::PasswordUpdate),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            OtpPurpose::Login => "login",
            OtpPurpose::EmailUpdate => "email-update",
            OtpPurpose::PasswordUpdate => "password-update",
        }
    }
}

impl std::fmt::Display for OtpPurpose {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OtpChallenge {
    /// Lower-cased email of the account.
    pub subject: String,
    pub purpose: OtpPurpose,
    /// HMAC-SHA256 of the code under the server's OTP key.
    pub code_digest: String,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

/// Result of checking a submitted code.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OtpStatus {
    Verified,
    Invalid,
    Expired,
}
