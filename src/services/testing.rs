//! Fixtures shared by the unit tests.

use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::config::{Config, StoreBackend};
use crate::db::memory::MemoryStore;
use crate::db::store::UserStore;
use crate::models::auth::ClientOrigin;
use crate::models::otp::OtpPurpose;
use crate::models::user::{AccountStatus, NewUser, Permissions, User, UserRole};
use crate::services::email::SecurityNotifier;
use crate::AppState;

pub fn config() -> Config {
    Config {
        store_backend: StoreBackend::Memory,
        database_url: None,
        redis_url: "redis://127.0.0.1:6379".into(),
        jwt_secret: "access-secret".into(),
        jwt_refresh_secret: "refresh-secret".into(),
        action_token_secret: "action-secret".into(),
        otp_secret: "otp-secret".into(),
        bcrypt_cost: 4,
        cookie_secure: false,
        alert_poll_seconds: 15,
        host: "127.0.0.1".into(),
        port: 0,
        app_base_url: "http://localhost:3000".into(),
        smtp_host: None,
        smtp_port: None,
        smtp_username: None,
        smtp_password: None,
        smtp_from: None,
    }
}

#[derive(Debug, Clone)]
pub enum Sent {
    Otp { to: String, code: String, purpose: OtpPurpose },
    Invitation { to: String, link: String },
    PasswordReset { to: String, link: String },
    SecurityAlert { to: String, origin: ClientOrigin },
}

#[derive(Default)]
pub struct RecordingNotifier {
    sent: Mutex<Vec<Sent>>,
    fail: bool,
}

impl RecordingNotifier {
    pub fn failing() -> Self {
        Self {
            sent: Mutex::default(),
            fail: true,
        }
    }

    fn record(&self, message: Sent) -> anyhow::Result<()> {
        if self.fail {
            anyhow::bail!("smtp unavailable");
        }
        self.sent.lock().unwrap().push(message);
        Ok(())
    }

    pub fn sent(&self) -> Vec<Sent> {
        self.sent.lock().unwrap().clone()
    }

    pub fn last_code(&self, email: &str) -> Option<String> {
        self.sent().into_iter().rev().find_map(|m| match m {
            Sent::Otp { to, code, .. } if to == email => Some(code),
            _ => None,
        })
    }

    pub fn last_link(&self, email: &str) -> Option<String> {
        self.sent().into_iter().rev().find_map(|m| match m {
            Sent::Invitation { to, link } | Sent::PasswordReset { to, link } if to == email => {
                Some(link)
            }
            _ => None,
        })
    }

    pub fn alerts(&self) -> Vec<(String, ClientOrigin)> {
        self.sent()
            .into_iter()
            .filter_map(|m| match m {
                Sent::SecurityAlert { to, origin } => Some((to, origin)),
                _ => None,
            })
            .collect()
    }
}

#[async_trait]
impl SecurityNotifier for RecordingNotifier {
    async fn send_otp(&self, to: &str, code: &str, purpose: OtpPurpose) -> anyhow::Result<()> {
        self.record(Sent::Otp {
            to: to.into(),
            code: code.into(),
            purpose,
        })
    }

    async fn send_invitation(&self, to: &str, _name: &str, link: &str) -> anyhow::Result<()> {
        self.record(Sent::Invitation {
            to: to.into(),
            link: link.into(),
        })
    }

    async fn send_password_reset(&self, to: &str, link: &str) -> anyhow::Result<()> {
        self.record(Sent::PasswordReset {
            to: to.into(),
            link: link.into(),
        })
    }

    async fn send_security_alert(
        &self,
        to: &str,
        origin: &ClientOrigin,
        _requested_at: DateTime<Utc>,
    ) -> anyhow::Result<()> {
        self.record(Sent::SecurityAlert {
            to: to.into(),
            origin: origin.clone(),
        })
    }
}

pub struct Harness {
    pub state: AppState,
    pub store: Arc<MemoryStore>,
    pub notifier: Arc<RecordingNotifier>,
}

pub fn harness() -> Harness {
    harness_with(RecordingNotifier::default())
}

pub fn harness_with(notifier: RecordingNotifier) -> Harness {
    let store = Arc::new(MemoryStore::new());
    let notifier = Arc::new(notifier);
    let state = AppState::in_memory(Arc::new(config()), store.clone(), notifier.clone());
    Harness {
        state,
        store,
        notifier,
    }
}

pub async fn active_user(store: &MemoryStore, email: &str, password: &str) -> User {
    let now = Utc::now();
    let user = User {
        id: Uuid::new_v4(),
        email: email.into(),
        name: "Test User".into(),
        password_hash: Some(bcrypt::hash(password, 4).unwrap()),
        status: AccountStatus::Active,
        role: UserRole::User,
        permissions: Permissions::default(),
        failed_login_attempts: 0,
        login_blocked_until: None,
        token_version: 0,
        created_at: now,
        updated_at: now,
    };
    store.put_user(user.clone()).unwrap();
    user
}

pub async fn admin_user(store: &MemoryStore, email: &str, password: &str) -> User {
    let mut user = active_user(store, email, password).await;
    user.role = UserRole::Admin;
    store.put_user(user.clone()).unwrap();
    user
}

pub async fn invited_user(store: &MemoryStore, email: &str) -> User {
    store
        .insert_invited(&NewUser {
            email: email.into(),
            name: "Invitee".into(),
            role: UserRole::User,
            permissions: Permissions::default(),
        })
        .await
        .unwrap()
        .unwrap()
}

pub fn origin() -> ClientOrigin {
    ClientOrigin {
        ip_address: "203.0.113.7".into(),
        user_agent: "test-agent/1.0".into(),
    }
}

/// Token query parameter of a set-password link.
pub fn token_from_link(link: &str) -> String {
    link.split_once("token=").unwrap().1.to_string()
}
