use std::env;

/// Which persistence backend the API runs on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreBackend {
    /// Postgres for users/tokens/jobs, Redis for OTP challenges.
    Postgres,
    /// Everything in process memory. Local development only.
    Memory,
}

impl std::str::FromStr for StoreBackend {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "postgres" => Ok(StoreBackend::Postgres),
            "memory" => Ok(StoreBackend::Memory),
            _ => Err(anyhow::anyhow!("Unknown STORE_BACKEND: {s}")),
        }
    }
}

#[derive(Debug, Clone)]
pub struct Config {
    pub store_backend: StoreBackend,
    pub database_url: Option<String>,
    pub redis_url: String,
    pub jwt_secret: String,
    pub jwt_refresh_secret: String,
    pub action_token_secret: String,
    /// Key of the OTP code digests.
    pub otp_secret: String,
    pub bcrypt_cost: u32,
    pub cookie_secure: bool,
    pub alert_poll_seconds: u64,
    pub host: String,
    pub port: u16,
    pub app_base_url: String,
    // SMTP (optional)
    pub smtp_host: Option<String>,
    pub smtp_port: Option<u16>,
    pub smtp_username: Option<String>,
    pub smtp_password: Option<String>,
    pub smtp_from: Option<String>,
}

impl Config {
    pub fn from_env() -> anyhow::Result<Self> {
        let store_backend: StoreBackend = env::var("STORE_BACKEND")
            .unwrap_or_else(|_| "postgres".into())
            .parse()?;

        let database_url = match store_backend {
            StoreBackend::Postgres => Some(required("DATABASE_URL")?),
            StoreBackend::Memory => env::var("DATABASE_URL").ok().filter(|s| !s.is_empty()),
        };

        Ok(Self {
            store_backend,
            database_url,
            redis_url: env::var("REDIS_URL").unwrap_or_else(|_| "redis://127.0.0.1:6379".into()),
            jwt_secret: required("JWT_SECRET")?,
            jwt_refresh_secret: required("JWT_REFRESH_SECRET")?,
            action_token_secret: required("ACTION_TOKEN_SECRET")?,
            otp_secret: required("OTP_SECRET")?,
            bcrypt_cost: env::var("BCRYPT_COST")
                .unwrap_or_else(|_| bcrypt::DEFAULT_COST.to_string())
                .parse()?,
            cookie_secure: env::var("COOKIE_SECURE")
                .map(|v| v == "true" || v == "1")
                .unwrap_or(true),
            alert_poll_seconds: env::var("ALERT_POLL_SECONDS")
                .unwrap_or_else(|_| "15".into())
                .parse()?,
            host: env::var("HOST").unwrap_or_else(|_| "0.0.0.0".into()),
            port: env::var("PORT")
                .unwrap_or_else(|_| "8080".into())
                .parse()?,
            app_base_url: env::var("APP_BASE_URL")
                .unwrap_or_else(|_| "http://localhost:3000".into()),
            smtp_host: env::var("SMTP_HOST").ok().filter(|s| !s.is_empty()),
            smtp_port: env::var("SMTP_PORT").ok().and_then(|v| v.parse().ok()),
            smtp_username: env::var("SMTP_USERNAME").ok().filter(|s| !s.is_empty()),
            smtp_password: env::var("SMTP_PASSWORD").ok().filter(|s| !s.is_empty()),
            smtp_from: env::var("SMTP_FROM").ok().filter(|s| !s.is_empty()),
        })
    }

    /// Link target for invite/reset emails.
    pub fn set_password_url(&self, token: &str) -> String {
        format!(
            "{}/set-password?token={token}",
            self.app_base_url.trim_end_matches('/')
        )
    }
}

fn required(key: &str) -> anyhow::Result<String> {
    env::var(key).map_err(|_| anyhow::anyhow!("Missing required env var: {}", key))
}
