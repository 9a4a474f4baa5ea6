use anyhow::{Context, Result};
use std::sync::Arc;
use tracing::{error, info};
use waterline::config::WaterlineConfig;
use waterline::coordinator::Coordinator;
use waterline::session::PortalSession;
use waterline::sink::JsonlSink;
use waterline::types::Credentials;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    info!("starting waterline daemon");

    let config = WaterlineConfig::from_env()?;

    let username =
        std::env::var("WATERLINE_USERNAME").context("WATERLINE_USERNAME must be set")?;
    let password =
        std::env::var("WATERLINE_PASSWORD").context("WATERLINE_PASSWORD must be set")?;
    let credentials = Credentials::new(username.clone(), password);
    info!(user = %credentials.username_prefix(), "configured portal account");

    let sink = Arc::new(
        JsonlSink::open(&config.state_path)
            .with_context(|| format!("open point store at {}", config.state_path.display()))?,
    );
    info!(path = ?config.state_path, "opened usage point store");

    let portal = PortalSession::new(&config.base_url, credentials, config.request_timeout)
        .context("build portal session")?;

    let update_interval = config.update_interval;
    let coordinator = Arc::new(Coordinator::new(
        config,
        Box::new(portal),
        sink,
        &username,
    ));

    // Deep history fetch runs off the startup path; updates never wait on it.
    coordinator.maybe_spawn_historical_backfill();

    let worker = coordinator.clone();
    let update_handle = tokio::task::spawn(async move {
        let mut ticker = tokio::time::interval(update_interval);
        loop {
            ticker.tick().await;
            worker.maybe_spawn_historical_backfill();

            let now = chrono::Local::now().naive_local();
            match worker.update(now).await {
                Ok(report) => {
                    info!(
                        daily = report.daily_usage,
                        latest_hourly = report.latest_hourly_usage,
                        month_to_date = report.month_to_date_usage,
                        billing_cycle = report.billing_cycle_usage,
                        cycle_start = %report.billing_cycle_start,
                        cycle_end = %report.billing_cycle_end,
                        "usage updated"
                    );
                }
                Err(err) => {
                    error!(err = %err, "update cycle failed; will retry on the next tick");
                }
            }
        }
    });

    tokio::signal::ctrl_c().await?;
    info!("received shutdown signal, stopping");

    update_handle.abort();

    // Brief pause so an in-flight sink append can finish.
    tokio::time::sleep(std::time::Duration::from_millis(200)).await;

    info!("waterline daemon stopped");
    Ok(())
}
