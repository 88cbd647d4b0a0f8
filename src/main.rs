use std::sync::Arc;

use axum::http::{header, HeaderValue, Method};
use redis::Client as RedisClient;
use tower_http::cors::{AllowHeaders, AllowOrigin, CorsLayer};
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use backoffice_auth::{
    config::{Config, StoreBackend},
    db::{self, memory::MemoryStore, postgres::PgStore, redis_otp::RedisOtpStore},
    routes,
    services::{
        alert_scheduler,
        email::{EmailService, LogNotifier, SecurityNotifier},
    },
    AppState,
};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let _ = dotenvy::dotenv();

    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::from_default_env())
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = Arc::new(Config::from_env()?);

    let notifier: Arc<dyn SecurityNotifier> = match EmailService::new(&config) {
        Some(email) => {
            info!("SMTP email service configured");
            Arc::new(email)
        }
        None => {
            warn!("SMTP not configured, emails are logged instead of sent");
            Arc::new(LogNotifier)
        }
    };

    let state = match config.store_backend {
        StoreBackend::Postgres => {
            let database_url = config
                .database_url
                .as_deref()
                .ok_or_else(|| anyhow::anyhow!("DATABASE_URL is required for the postgres backend"))?;
            let pool = db::create_pool(database_url).await?;
            db::run_migrations(&pool).await?;
            info!("Database connected and migrations applied");

            let redis_client = RedisClient::open(config.redis_url.as_str())?;
            let redis_conn = redis_client.get_multiplexed_async_connection().await?;
            info!("Redis connected");

            AppState::persistent(
                config.clone(),
                PgStore::new(pool),
                RedisOtpStore::new(redis_conn),
                notifier,
            )
        }
        StoreBackend::Memory => {
            warn!("Using the in-memory store, all data is lost on restart");
            AppState::in_memory(config.clone(), Arc::new(MemoryStore::new()), notifier)
        }
    };

    alert_scheduler::start(state.clone(), config.alert_poll_seconds);

    // Allow the configured front-end origin, plus localhost for development.
    let base_url = config.app_base_url.trim_end_matches('/').to_string();
    let cors_origin = AllowOrigin::predicate(move |origin: &HeaderValue, _| {
        let Ok(o) = origin.to_str() else {
            return false;
        };
        o == base_url || o.starts_with("http://localhost") || o.starts_with("http://127.0.0.1")
    });

    let cors = CorsLayer::new()
        .allow_methods([Method::GET, Method::POST, Method::OPTIONS])
        .allow_headers(AllowHeaders::list([
            header::AUTHORIZATION,
            header::CONTENT_TYPE,
            header::ACCEPT,
        ]))
        .allow_credentials(true)
        .allow_origin(cors_origin);

    let app = routes::router(state).layer(cors);

    let addr = format!("{}:{}", config.host, config.port);
    info!("back-office auth API listening on {}", addr);

    let listener = tokio::net::TcpListener::bind(&addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}
