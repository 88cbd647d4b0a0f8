use chrono::{DateTime, Duration, Utc};
use tracing::{info, warn};
use uuid::Uuid;

use crate::{
    error::{AuthError, AuthResult},
    models::{
        auth::{AuthenticatedUser, ClientOrigin},
        otp::OtpPurpose,
        token::{ActionPurpose, JobKind, OtpAlertPayload, ScheduledJob},
        user::{AccountStatus, LoginResponse, LoginStep1Response, User},
    },
    services::{
        credentials::{
            hash_password, normalize_email, validate_email, validate_password, verify_password,
        },
        metrics::{ACTION_TOKENS_COUNTER, LOGINS_COUNTER},
        otp::{alert_job_subject, ALERT_DELAY_MINUTES},
        session::{SessionDecision, SessionTokens},
    },
    AppState,
};

/// Result of a confirmed update OTP.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UpdateOutcome {
    /// Code confirmed; no change was submitted with it.
    Verified,
    EmailChanged { email: String },
    PasswordChanged(SessionDecision),
}

fn required<'a>(value: &'a str, field: &'static str) -> AuthResult<&'a str> {
    let value = value.trim();
    if value.is_empty() {
        Err(AuthError::MissingField(field))
    } else {
        Ok(value)
    }
}

fn update_purpose(kind: &str) -> AuthResult<OtpPurpose> {
    OtpPurpose::parse_update(kind.trim()).ok_or_else(|| {
        AuthError::Validation("type must be one of: email-update, password-update".into())
    })
}

pub struct AuthService;

impl AuthService {
    /// Step 1 of login: password check behind the lockout gate, then a
    /// login OTP and a delayed alert in case the code is never confirmed.
    pub async fn login(
        state: &AppState,
        email: &str,
        password: &str,
        origin: &ClientOrigin,
        now: DateTime<Utc>,
    ) -> AuthResult<LoginStep1Response> {
        let email = normalize_email(required(email, "email")?);
        if password.is_empty() {
            return Err(AuthError::MissingField("password"));
        }

        let result = Self::check_credentials(state, &email, password, now).await;
        let outcome = match &result {
            Ok(_) => "password_ok",
            Err(e) => e.code(),
        };
        LOGINS_COUNTER.with_label_values(&[outcome]).inc();
        let user = result?;

        let issued = state.otp_manager().issue(&email, OtpPurpose::Login, now).await?;

        // One alert job per challenge, so a later login never displaces it.
        let subject = alert_job_subject(&email, &issued.code_digest);
        let payload = OtpAlertPayload {
            email: email.clone(),
            code_digest: issued.code_digest,
            origin: origin.clone(),
            requested_at: now,
        };
        state
            .jobs
            .schedule(&ScheduledJob {
                id: Uuid::new_v4(),
                kind: JobKind::OtpAlert,
                subject,
                run_at: now + Duration::minutes(ALERT_DELAY_MINUTES),
                payload: serde_json::to_value(&payload).map_err(anyhow::Error::from)?,
                created_at: now,
            })
            .await?;

        info!(user_id = %user.id, ip = %origin.ip_address, "login OTP issued");
        Ok(LoginStep1Response {
            message: "OTP sent to your email".into(),
            email,
            otp_expires_at: issued.expires_at,
        })
    }

    async fn check_credentials(
        state: &AppState,
        email: &str,
        password: &str,
        now: DateTime<Utc>,
    ) -> AuthResult<User> {
        // Unknown email answers like a wrong password, minus the attempt count.
        let mut user = state
            .users
            .find_by_email(email)
            .await?
            .ok_or(AuthError::InvalidCredentials {
                remaining_attempts: None,
            })?;
        if user.status == AccountStatus::Deactive {
            return Err(AuthError::AccountDeactivated);
        }

        let guard = state.lockout_guard();
        guard.check(&mut user, now).await?;

        if !verify_password(password, user.password_hash.as_deref()).await? {
            let report = guard.record_failure(&user, now).await?;
            return Err(report.into_error());
        }
        guard.record_success(&user).await?;
        Ok(user)
    }

    /// Step 2 of login. Returns the response body and the refresh token to
    /// set as a cookie.
    pub async fn verify_login_otp(
        state: &AppState,
        email: &str,
        otp: &str,
        now: DateTime<Utc>,
    ) -> AuthResult<(LoginResponse, String)> {
        let email = normalize_email(required(email, "email")?);
        let otp = required(otp, "otp")?;

        let user = state
            .users
            .find_by_email(&email)
            .await?
            .ok_or_else(|| AuthError::TokenInvalidOrExpired("Invalid OTP".into()))?;
        if user.status == AccountStatus::Deactive {
            return Err(AuthError::AccountDeactivated);
        }

        let otp_manager = state.otp_manager();
        otp_manager
            .verify(&email, otp, OtpPurpose::Login, now)
            .await?
            .into_result()?;

        // Only the verified challenge's alert goes; others for this account stay armed.
        let subject = alert_job_subject(&email, &otp_manager.code_digest(otp)?);
        if let Err(e) = state.jobs.cancel(JobKind::OtpAlert, &subject).await {
            warn!(user_id = %user.id, error = %e, "failed to cancel OTP alert");
        }

        let SessionTokens {
            access_token,
            refresh_token,
        } = state.session_issuer().start_session(&user, now).await?;

        LOGINS_COUNTER.with_label_values(&["signed_in"]).inc();
        info!(user_id = %user.id, "login completed");
        Ok((
            LoginResponse {
                access_token,
                user: user.into(),
            },
            refresh_token,
        ))
    }

    pub async fn resend_otp(state: &AppState, email: &str, now: DateTime<Utc>) -> AuthResult<DateTime<Utc>> {
        let email = normalize_email(required(email, "email")?);
        let user = state
            .users
            .find_by_email(&email)
            .await?
            .ok_or(AuthError::NotFound("User"))?;
        if user.status == AccountStatus::Deactive {
            return Err(AuthError::AccountDeactivated);
        }

        let issued = state.otp_manager().issue(&email, OtpPurpose::Login, now).await?;
        Ok(issued.expires_at)
    }

    pub async fn resend_update_otp(
        state: &AppState,
        email: &str,
        kind: &str,
        now: DateTime<Utc>,
    ) -> AuthResult<DateTime<Utc>> {
        let email = normalize_email(required(email, "email")?);
        let purpose = update_purpose(kind)?;

        // Update codes are only minted for accounts that already hold a password.
        state
            .users
            .find_by_email(&email)
            .await?
            .filter(|user| user.status == AccountStatus::Active)
            .ok_or(AuthError::NotFound("User"))?;

        let issued = state.otp_manager().issue(&email, purpose, now).await?;
        Ok(issued.expires_at)
    }

    /// Password reset confirmed by a password-update OTP instead of a link.
    pub async fn reset_password_with_otp(
        state: &AppState,
        email: &str,
        otp: &str,
        new_password: &str,
        presented_refresh: Option<&str>,
        now: DateTime<Utc>,
    ) -> AuthResult<SessionDecision> {
        let email = normalize_email(required(email, "email")?);
        let otp = required(otp, "otp")?;
        if new_password.is_empty() {
            return Err(AuthError::MissingField("newPassword"));
        }
        validate_password(new_password)?;

        let user = state
            .users
            .find_by_email(&email)
            .await?
            .filter(|user| user.status == AccountStatus::Active)
            .ok_or_else(|| AuthError::TokenInvalidOrExpired("Invalid OTP".into()))?;

        state
            .otp_manager()
            .verify(&email, otp, OtpPurpose::PasswordUpdate, now)
            .await?
            .into_result()?;

        let user = Self::apply_new_password(state, &user, new_password).await?;
        state
            .session_issuer()
            .continue_after_credential_change(&user, presented_refresh, now)
            .await
    }

    /// Mails a reset link to active accounts. Unknown or inactive emails get
    /// the same silent success.
    pub async fn forgot_password(state: &AppState, email: &str, now: DateTime<Utc>) -> AuthResult<()> {
        let email = normalize_email(required(email, "email")?);

        let Some(user) = state.users.find_by_email(&email).await? else {
            return Ok(());
        };
        if user.status != AccountStatus::Active {
            return Ok(());
        }

        let issued = state
            .action_token_manager()
            .issue(user.id, ActionPurpose::Reset, now)
            .await?;
        let link = state.config.set_password_url(&issued.token);

        if let Err(e) = state.notifier.send_password_reset(&user.email, &link).await {
            warn!(user_id = %user.id, error = %e, "password reset email delivery failed");
            ACTION_TOKENS_COUNTER
                .with_label_values(&["reset", "delivery_failed"])
                .inc();
            return Err(AuthError::DeliveryFailed("password reset link".into()));
        }
        Ok(())
    }

    /// Re-checks the current password of a signed-in user and mails an
    /// update OTP. Returns the address the code went to.
    pub async fn verify_password_send_otp(
        state: &AppState,
        auth: &AuthenticatedUser,
        current_password: &str,
        kind: &str,
        now: DateTime<Utc>,
    ) -> AuthResult<String> {
        if current_password.is_empty() {
            return Err(AuthError::MissingField("currentPassword"));
        }
        let purpose = update_purpose(kind)?;

        let user = state
            .users
            .find_by_id(auth.user_id)
            .await?
            .ok_or(AuthError::AccountDeleted)?;
        if !verify_password(current_password, user.password_hash.as_deref()).await? {
            return Err(AuthError::InvalidCredentials {
                remaining_attempts: None,
            });
        }

        state.otp_manager().issue(&user.email, purpose, now).await?;
        Ok(user.email)
    }

    /// Confirms an update OTP and applies the change submitted with it.
    pub async fn verify_update_otp(
        state: &AppState,
        auth: &AuthenticatedUser,
        otp: &str,
        kind: &str,
        new_email: Option<&str>,
        new_password: Option<&str>,
        presented_refresh: Option<&str>,
        now: DateTime<Utc>,
    ) -> AuthResult<UpdateOutcome> {
        let otp = required(otp, "otp")?;
        let purpose = update_purpose(kind)?;

        let new_email = match (purpose, new_email.map(str::trim).filter(|e| !e.is_empty())) {
            (OtpPurpose::EmailUpdate, Some(email)) => {
                validate_email(email)?;
                Some(normalize_email(email))
            }
            _ => None,
        };
        let new_password = match (purpose, new_password.filter(|p| !p.is_empty())) {
            (OtpPurpose::PasswordUpdate, Some(password)) => {
                validate_password(password)?;
                Some(password)
            }
            _ => None,
        };

        let user = state
            .users
            .find_by_id(auth.user_id)
            .await?
            .ok_or(AuthError::AccountDeleted)?;

        // Checked before the code is spent so a taken address does not burn it.
        if let Some(email) = &new_email {
            if let Some(existing) = state.users.find_by_email(email).await? {
                if existing.id != user.id {
                    return Err(AuthError::Conflict("Email is already in use".into()));
                }
            }
        }

        state
            .otp_manager()
            .verify(&user.email, otp, purpose, now)
            .await?
            .into_result()?;

        if let Some(email) = new_email {
            if !state.users.change_email(user.id, &email).await? {
                return Err(AuthError::Conflict("Email is already in use".into()));
            }
            info!(user_id = %user.id, "email changed");
            return Ok(UpdateOutcome::EmailChanged { email });
        }

        if let Some(password) = new_password {
            let user = Self::apply_new_password(state, &user, password).await?;
            let decision = state
                .session_issuer()
                .continue_after_credential_change(&user, presented_refresh, now)
                .await?;
            return Ok(UpdateOutcome::PasswordChanged(decision));
        }

        Ok(UpdateOutcome::Verified)
    }

    async fn apply_new_password(state: &AppState, user: &User, password: &str) -> AuthResult<User> {
        let hash = hash_password(password, state.config.bcrypt_cost).await?;
        let updated = state
            .users
            .change_password(user.id, &hash)
            .await?
            .ok_or(AuthError::AccountDeleted)?;
        info!(user_id = %user.id, token_version = updated.token_version, "password changed");
        Ok(updated)
    }
}
