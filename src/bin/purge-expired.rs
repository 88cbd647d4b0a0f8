/// Delete dead auth rows: used or expired action tokens, expired refresh
/// tokens and scheduled jobs that nobody claimed.
/// Run daily (e.g., via cron job: 0 3 * * * /app/purge-expired)
///
/// Usage: purge-expired [--retain-days N] [--dry-run]

use chrono::{Duration, Utc};
use clap::Parser;

use backoffice_auth::db::{self, postgres::PgStore};

#[derive(Parser)]
#[command(name = "purge-expired", about = "Purge expired auth tokens and stale jobs")]
struct Args {
    /// Keep used/expired action tokens and unclaimed jobs this many days
    #[arg(long, default_value_t = 7)]
    retain_days: i64,

    /// Only report the cutoff, delete nothing
    #[arg(long)]
    dry_run: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let _ = dotenvy::dotenv();
    tracing_subscriber::fmt()
        .with_max_level(tracing::Level::INFO)
        .init();

    let args = Args::parse();
    let database_url = std::env::var("DATABASE_URL")
        .map_err(|_| anyhow::anyhow!("DATABASE_URL environment variable not set"))?;

    let now = Utc::now();
    let cutoff = now - Duration::days(args.retain_days);
    tracing::info!(%cutoff, "Starting auth purge job...");

    if args.dry_run {
        tracing::info!("Dry run, nothing deleted");
        return Ok(());
    }

    let pool = db::create_pool(&database_url).await?;
    let report = PgStore::new(pool).purge_expired(now, cutoff).await?;

    tracing::info!(
        action_tokens = report.action_tokens,
        refresh_tokens = report.refresh_tokens,
        jobs = report.jobs,
        "Auth purge job completed"
    );
    Ok(())
}
