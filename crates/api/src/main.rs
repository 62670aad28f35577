use std::sync::Arc;

use anyhow::Context;
use sqlx::postgres::PgPoolOptions;

use ispadmin_api::app::{build_app, services::AppServices};
use ispadmin_infra::config::QueueConfig;

const BIND_ADDR_VAR: &str = "ISPADMIN_BIND_ADDR";
const DEFAULT_BIND_ADDR: &str = "0.0.0.0:8080";
const DATABASE_URL_VAR: &str = "DATABASE_URL";
const DB_MAX_CONNECTIONS: u32 = 16;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    ispadmin_observability::init();

    let config = QueueConfig::from_env().context("invalid queue configuration")?;
    tracing::info!(
        heartbeat_timeout_secs = config.heartbeat_timeout.as_secs(),
        reap_interval_secs = config.reap_interval.as_secs(),
        default_max_retries = config.default_max_retries,
        "queue configuration loaded"
    );

    let services = match std::env::var(DATABASE_URL_VAR) {
        Ok(url) => {
            let pool = PgPoolOptions::new()
                .max_connections(DB_MAX_CONNECTIONS)
                .connect(&url)
                .await
                .context("failed to connect to Postgres")?;
            tracing::info!("using postgres job store");
            AppServices::postgres(config, pool)
                .await
                .context("failed to prepare postgres job store")?
        }
        Err(_) => {
            tracing::warn!("{DATABASE_URL_VAR} not set; jobs are kept in memory only");
            AppServices::new(config)
        }
    };
    let services = Arc::new(services);
    let reaper = services
        .spawn_reaper()
        .context("failed to start reaper thread")?;

    let bind_addr = std::env::var(BIND_ADDR_VAR).unwrap_or_else(|_| DEFAULT_BIND_ADDR.to_string());
    let listener = tokio::net::TcpListener::bind(&bind_addr)
        .await
        .with_context(|| format!("failed to bind {bind_addr}"))?;

    tracing::info!("listening on {}", listener.local_addr()?);

    axum::serve(listener, build_app(services))
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            tracing::info!("shutdown requested");
        })
        .await
        .context("http server failed")?;

    reaper.shutdown();
    Ok(())
}
