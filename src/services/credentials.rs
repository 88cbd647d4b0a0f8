//! Password hashing and digests for stored secrets.

use hmac::{Hmac, Mac};
use sha2::{Digest, Sha256};

use crate::error::{AuthError, AuthResult};

pub const MIN_PASSWORD_LENGTH: usize = 8;

type HmacSha256 = Hmac<Sha256>;

/// Hex SHA-256 of a high-entropy token string. Only digests are persisted.
pub fn sha256_hex(value: &str) -> String {
    hex::encode(Sha256::digest(value.as_bytes()))
}

/// Hex HMAC-SHA256 of `value` under `key`. OTP codes are digested this way
/// since a bare hash of a four-digit code is reversed by enumeration.
pub fn keyed_digest(key: &str, value: &str) -> anyhow::Result<String> {
    let mut mac = HmacSha256::new_from_slice(key.as_bytes())
        .map_err(|e| anyhow::anyhow!("invalid digest key: {e}"))?;
    mac.update(value.as_bytes());
    Ok(hex::encode(mac.finalize().into_bytes()))
}

pub fn normalize_email(email: &str) -> String {
    email.trim().to_lowercase()
}

pub fn validate_email(email: &str) -> AuthResult<()> {
    match email.split_once('@') {
        Some((local, domain)) if !local.is_empty() && domain.contains('.') => Ok(()),
        _ => Err(AuthError::Validation("Invalid email address".into())),
    }
}

pub fn validate_password(password: &str) -> AuthResult<()> {
    if password.chars().count() < MIN_PASSWORD_LENGTH {
        return Err(AuthError::Validation(format!(
            "Password must be at least {MIN_PASSWORD_LENGTH} characters"
        )));
    }
    if !password.chars().any(|c| c.is_alphabetic()) || !password.chars().any(|c| c.is_ascii_digit()) {
        return Err(AuthError::Validation(
            "Password must contain letters and digits".into(),
        ));
    }
    Ok(())
}

/// bcrypt runs on the blocking pool so slow hashes do not stall the runtime.
pub async fn hash_password(password: &str, cost: u32) -> anyhow::Result<String> {
    let password = password.to_string();
    let hash = tokio::task::spawn_blocking(move || bcrypt::hash(password, cost)).await??;
    Ok(hash)
}

/// A missing hash (account not yet activated) never matches.
pub async fn verify_password(password: &str, hash: Option<&str>) -> anyhow::Result<bool> {
    let Some(hash) = hash else {
        return Ok(false);
    };
    let password = password.to_string();
    let hash = hash.to_string();
    let valid = tokio::task::spawn_blocking(move || bcrypt::verify(password, &hash)).await??;
    Ok(valid)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn weak_passwords_are_rejected() {
        assert!(validate_password("short1").is_err());
        assert!(validate_password("onlyletters").is_err());
        assert!(validate_password("1234567890").is_err());
        assert!(validate_password("correct horse 9").is_ok());
    }

    #[test]
    fn emails_are_trimmed_and_lowercased() {
        assert_eq!(normalize_email("  Ops@Example.COM "), "ops@example.com");
        assert!(validate_email("ops@example.com").is_ok());
        assert!(validate_email("ops.example.com").is_err());
        assert!(validate_email("@example.com").is_err());
    }

    #[test]
    fn code_digest_depends_on_key() {
        let a = keyed_digest("key-a", "4821").unwrap();
        assert_eq!(a, keyed_digest("key-a", "4821").unwrap());
        assert_ne!(a, keyed_digest("key-b", "4821").unwrap());
        assert_ne!(a, sha256_hex("4821"));
        assert_eq!(a.len(), 64);
    }

    #[tokio::test]
    async fn bcrypt_round_trip() {
        let hash = hash_password("s3cret-pass", 4).await.unwrap();
        assert!(verify_password("s3cret-pass", Some(&hash)).await.unwrap());
        assert!(!verify_password("wrong-pass1", Some(&hash)).await.unwrap());
        assert!(!verify_password("s3cret-pass", None).await.unwrap());
    }
}
