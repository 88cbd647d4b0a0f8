// Library exports for binary tools and tests
pub mod config;
pub mod db;
pub mod error;
pub mod middleware;
pub mod models;
pub mod routes;
pub mod services;

use std::sync::Arc;

use config::Config;
use db::{
    memory::MemoryStore,
    postgres::PgStore,
    redis_otp::RedisOtpStore,
    store::{ActionTokenStore, JobStore, OtpStore, RefreshTokenStore, UserStore},
};
use services::{
    action_tokens::ActionTokenManager, email::SecurityNotifier, lockout::LockoutGuard,
    otp::OtpManager, session::SessionIssuer,
};

/// Application state shared across all handlers.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub users: Arc<dyn UserStore>,
    pub otps: Arc<dyn OtpStore>,
    pub action_tokens: Arc<dyn ActionTokenStore>,
    pub refresh_tokens: Arc<dyn RefreshTokenStore>,
    pub jobs: Arc<dyn JobStore>,
    pub notifier: Arc<dyn SecurityNotifier>,
}

impl AppState {
    /// Postgres for records and the job schedule, Redis for OTP challenges.
    pub fn persistent(
        config: Arc<Config>,
        pg: PgStore,
        otps: RedisOtpStore,
        notifier: Arc<dyn SecurityNotifier>,
    ) -> Self {
        let pg = Arc::new(pg);
        Self {
            config,
            users: pg.clone(),
            otps: Arc::new(otps),
            action_tokens: pg.clone(),
            refresh_tokens: pg.clone(),
            jobs: pg,
            notifier,
        }
    }

    pub fn in_memory(
        config: Arc<Config>,
        store: Arc<MemoryStore>,
        notifier: Arc<dyn SecurityNotifier>,
    ) -> Self {
        Self {
            config,
            users: store.clone(),
            otps: store.clone(),
            action_tokens: store.clone(),
            refresh_tokens: store.clone(),
            jobs: store,
            notifier,
        }
    }

    pub fn lockout_guard(&self) -> LockoutGuard<'_> {
        LockoutGuard::new(self.users.as_ref())
    }

    pub fn otp_manager(&self) -> OtpManager<'_> {
        OtpManager::new(
            self.otps.as_ref(),
            self.notifier.as_ref(),
            &self.config.otp_secret,
        )
    }

    pub fn action_token_manager(&self) -> ActionTokenManager<'_> {
        ActionTokenManager::new(
            self.action_tokens.as_ref(),
            &self.config.action_token_secret,
            self.config.bcrypt_cost,
        )
    }

    pub fn session_issuer(&self) -> SessionIssuer<'_> {
        SessionIssuer::new(self.users.as_ref(), self.refresh_tokens.as_ref(), &self.config)
    }
}
