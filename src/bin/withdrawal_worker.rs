use std::time::Duration;

use anyhow::Context;
use chrono::Utc;
use clap::Parser;
use rand::Rng;
use sqlx::postgres::PgPoolOptions;
use tracing::{info, warn};
use wallet_engine::config::Settings;
use wallet_engine::gateway::{build_rate_limiter, HttpBankGateway, TransferGateway};
use wallet_engine::observability::{init_logging, init_metrics, LogConfig, LogFormat};
use wallet_engine::workers::{execute_due_withdrawals, reconcile_withdrawals};

/// Runs the withdrawal executor and reconciler once or in a loop.
#[derive(Debug, Parser)]
#[command(name = "withdrawal_worker")]
struct Args {
    /// Max due withdrawals to process per run.
    #[arg(long, default_value_t = 100)]
    limit: i64,

    /// Max reconciliation items to process per run.
    #[arg(long, default_value_t = 100)]
    reconcile_limit: i64,

    /// Run continuously with sleep intervals between cycles.
    #[arg(long = "loop")]
    run_loop: bool,

    /// Sleep interval for loop mode, in seconds. Defaults to the configured
    /// worker loop interval.
    #[arg(long)]
    sleep_seconds: Option<f64>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    let args = Args::parse();

    if args.limit <= 0 {
        anyhow::bail!("--limit must be greater than zero");
    }
    if args.reconcile_limit <= 0 {
        anyhow::bail!("--reconcile-limit must be greater than zero");
    }
    if matches!(args.sleep_seconds, Some(seconds) if seconds < 0.0) {
        anyhow::bail!("--sleep-seconds must be >= 0");
    }

    let settings = Settings::new().context("invalid configuration")?;

    init_logging(&LogConfig {
        level: settings.application.log_level.clone(),
        format: LogFormat::from(
            std::env::var("LOG_FORMAT")
                .unwrap_or_else(|_| "compact".to_string())
                .as_str(),
        ),
        include_target: false,
    });
    init_metrics();

    let pool = PgPoolOptions::new()
        .max_connections(settings.database.pool_size)
        .acquire_timeout(Duration::from_secs(5))
        .connect(&settings.database.url)
        .await
        .context("failed to connect to database")?;

    sqlx::migrate!("./migrations")
        .run(&pool)
        .await
        .context("failed to run migrations")?;

    let limiter = build_rate_limiter(&settings.bank).await;
    let gateway = HttpBankGateway::new(&settings.bank, limiter)?;

    // Desynchronize worker fleets so their ticks do not align.
    sleep_jitter(settings.worker.startup_jitter_max).await;

    let pause = args
        .sleep_seconds
        .unwrap_or(settings.worker.loop_interval)
        .max(0.0);

    loop {
        run_once(&pool, &gateway, &settings, &args).await;

        if !args.run_loop {
            break;
        }

        if pause > 0.0 {
            tokio::time::sleep(Duration::from_secs_f64(pause)).await;
        }
        sleep_jitter(settings.worker.loop_jitter_max).await;
    }

    Ok(())
}

/// One tick: executor then reconciler. Errors are reported and absorbed so
/// a bad tick never kills the loop; unfinished rows are picked up by
/// stale-PROCESSING recovery on a later tick.
async fn run_once(
    pool: &sqlx::PgPool,
    gateway: &dyn TransferGateway,
    settings: &Settings,
    args: &Args,
) {
    let now = Utc::now();

    match execute_due_withdrawals(pool, gateway, settings, args.limit, now).await {
        Ok(summary) => info!(
            processed = summary.processed,
            succeeded = summary.succeeded,
            failed = summary.failed,
            insufficient_funds = summary.insufficient_funds,
            reconciliation_queued = summary.reconciliation_queued,
            unknown = summary.unknown,
            "withdrawal executor run completed"
        ),
        Err(e) => warn!(error = %e, kind = e.kind(), "executor run failed"),
    }

    match reconcile_withdrawals(pool, gateway, settings, args.reconcile_limit, now).await {
        Ok(summary) => info!(
            stale_marked_unknown = summary.stale_marked_unknown,
            resolved_success = summary.resolved_success,
            resolved_failure = summary.resolved_failure,
            pending = summary.pending,
            resolved = summary.resolved,
            "withdrawal reconciler run completed"
        ),
        Err(e) => warn!(error = %e, kind = e.kind(), "reconciler run failed"),
    }
}

async fn sleep_jitter(jitter_max: f64) {
    if jitter_max > 0.0 {
        let jitter = rand::thread_rng().gen_range(0.0..=jitter_max);
        tokio::time::sleep(Duration::from_secs_f64(jitter)).await;
    }
}
