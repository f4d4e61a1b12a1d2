use std::time::Duration;

use sqlx::postgres::PgPoolOptions;
use tokio::net::TcpListener;
use tracing::info;
use wallet_engine::api::{create_router, AppState};
use wallet_engine::config::Settings;
use wallet_engine::observability::{init_logging, init_metrics, LogConfig, LogFormat};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    // Load configuration first (needed for log level).
    let settings = Settings::new()?;

    let log_config = LogConfig {
        level: settings.application.log_level.clone(),
        format: LogFormat::from(
            std::env::var("LOG_FORMAT")
                .unwrap_or_else(|_| "pretty".to_string())
                .as_str(),
        ),
        include_target: true,
    };
    init_logging(&log_config);

    let metrics_handle = init_metrics();
    info!("Configuration loaded, metrics initialized");

    info!("Connecting to database...");
    let pool = PgPoolOptions::new()
        .max_connections(settings.database.pool_size)
        .acquire_timeout(Duration::from_secs(5))
        .connect(&settings.database.url)
        .await?;
    info!("Database connection established");

    info!("Running database migrations...");
    sqlx::migrate!("./migrations").run(&pool).await?;
    info!("Migrations applied successfully");

    // The rate limiter backend is optional; the API only probes it for
    // health reporting. A missing backend is not a startup failure.
    let redis_client = if settings.bank.max_rps > 0.0 {
        match redis::Client::open(settings.bank.rate_limit_backend_url.as_str()) {
            Ok(client) => Some(client),
            Err(e) => {
                tracing::warn!(
                    error = %e,
                    "rate limiter backend misconfigured, health checks will skip it"
                );
                None
            }
        }
    } else {
        None
    };

    let state = AppState::new(pool, redis_client).with_metrics(metrics_handle);
    let app = create_router(state);

    let addr = format!("0.0.0.0:{}", settings.application.port);
    info!("Starting HTTP server on {}", addr);

    let listener = TcpListener::bind(&addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}
