use chrono::{DateTime, Utc};
use tracing::{info, warn};
use uuid::Uuid;

use crate::{
    error::{AuthError, AuthResult},
    models::{
        auth::AuthenticatedUser,
        token::ActionPurpose,
        user::{AccountStatus, NewUser, Permissions, UserProfile, UserRole},
    },
    services::{
        credentials::{normalize_email, validate_email, validate_password},
        metrics::ACTION_TOKENS_COUNTER,
        session::SessionDecision,
    },
    AppState,
};

pub const MANAGE_USERS: &str = "manageUsers";

fn require_manage_users(actor: &AuthenticatedUser) -> AuthResult<()> {
    if actor.can(MANAGE_USERS) {
        Ok(())
    } else {
        Err(AuthError::Forbidden("Missing permission: manageUsers".into()))
    }
}

pub struct UserService;

impl UserService {
    /// Creates an invited account and mails its set-password link. The
    /// account and token stay in place when the mail fails.
    pub async fn invite(
        state: &AppState,
        actor: &AuthenticatedUser,
        name: &str,
        email: &str,
        permissions: Permissions,
        now: DateTime<Utc>,
    ) -> AuthResult<UserProfile> {
        require_manage_users(actor)?;
        let name = name.trim();
        if name.is_empty() {
            return Err(AuthError::MissingField("name"));
        }
        let email = email.trim();
        if email.is_empty() {
            return Err(AuthError::MissingField("email"));
        }
        validate_email(email)?;

        let user = state
            .users
            .insert_invited(&NewUser {
                email: normalize_email(email),
                name: name.to_string(),
                role: UserRole::User,
                permissions,
            })
            .await?
            .ok_or_else(|| AuthError::Conflict("User with this email already exists".into()))?;

        let issued = state
            .action_token_manager()
            .issue(user.id, ActionPurpose::Invite, now)
            .await?;
        info!(user_id = %user.id, invited_by = %actor.user_id, "user invited");

        Self::deliver_invitation(state, user.id, &user.email, &user.name, &issued.token).await?;
        Ok(user.into())
    }

    pub async fn resend_invite(
        state: &AppState,
        actor: &AuthenticatedUser,
        user_id: Option<Uuid>,
        now: DateTime<Utc>,
    ) -> AuthResult<()> {
        require_manage_users(actor)?;
        let user_id = user_id.ok_or(AuthError::MissingField("userId"))?;

        let user = state
            .users
            .find_by_id(user_id)
            .await?
            .ok_or(AuthError::NotFound("User"))?;
        if user.status != AccountStatus::Invited {
            return Err(AuthError::Validation(
                "User has already activated the account".into(),
            ));
        }

        let issued = state.action_token_manager().reissue_invite(user.id, now).await?;
        Self::deliver_invitation(state, user.id, &user.email, &user.name, &issued.token).await
    }

    /// Empty or malformed tokens are simply not valid.
    pub async fn verify_token(state: &AppState, token: &str, now: DateTime<Utc>) -> AuthResult<bool> {
        let token = token.trim();
        if token.is_empty() {
            return Ok(false);
        }
        state.action_token_manager().verify(token, now).await
    }

    /// Consumes an invite or reset token, then keeps or ends the caller's
    /// sessions depending on the refresh token it presented.
    pub async fn set_password(
        state: &AppState,
        token: &str,
        password: &str,
        presented_refresh: Option<&str>,
        now: DateTime<Utc>,
    ) -> AuthResult<SessionDecision> {
        let token = token.trim();
        if token.is_empty() {
            return Err(AuthError::MissingField("token"));
        }
        if password.is_empty() {
            return Err(AuthError::MissingField("password"));
        }
        validate_password(password)?;

        let user = state.action_token_manager().consume(token, password, now).await?;
        state
            .session_issuer()
            .continue_after_credential_change(&user, presented_refresh, now)
            .await
    }

    async fn deliver_invitation(
        state: &AppState,
        user_id: Uuid,
        email: &str,
        name: &str,
        token: &str,
    ) -> AuthResult<()> {
        let link = state.config.set_password_url(token);
        if let Err(e) = state.notifier.send_invitation(email, name, &link).await {
            warn!(%user_id, error = %e, "invitation email delivery failed");
            ACTION_TOKENS_COUNTER
                .with_label_values(&["invite", "delivery_failed"])
                .inc();
            return Err(AuthError::DeliveryFailed("invitation".into()));
        }
        Ok(())
    }
}
