use std::time::Duration;

use anyhow::Result;
use signoff_core::config::{AppConfig, LoadOptions};
use signoff_server::api::{self, ApiState};
use signoff_server::{bootstrap, health};
use tokio::sync::watch;

fn init_logging(config: &AppConfig) {
    use signoff_core::config::LogFormat::*;
    use tracing::Level;

    let log_level = config.logging.level.parse::<Level>().unwrap_or(Level::INFO);

    match config.logging.format {
        Compact => {
            tracing_subscriber::fmt().with_target(false).with_max_level(log_level).compact().init();
        }
        Pretty => {
            tracing_subscriber::fmt().with_target(false).with_max_level(log_level).pretty().init();
        }
        Json => {
            tracing_subscriber::fmt().with_target(false).with_max_level(log_level).json().init();
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    run().await
}

pub async fn run() -> Result<()> {
    // Logging must be up before bootstrap emits its first event.
    let config = AppConfig::load(LoadOptions::default())?;
    init_logging(&config);

    let app = bootstrap::bootstrap_with_config(config).await?;

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let scheduler_task = if app.config.scheduler.enabled {
        let scheduler = app.scheduler.clone();
        Some(tokio::spawn(async move { scheduler.run(shutdown_rx).await }))
    } else {
        tracing::warn!(
            event_name = "system.server.scheduler_disabled",
            correlation_id = "bootstrap",
            "timeout scheduler disabled; SLA auto-approval will not fire"
        );
        None
    };

    let routes = api::router(ApiState { catalog: app.catalog.clone(), service: app.service.clone() })
        .merge(health::router(health::HealthState::from_application(&app)));
    let address = format!("{}:{}", app.config.server.bind_address, app.config.server.port);
    let listener = tokio::net::TcpListener::bind(&address).await?;

    tracing::info!(
        event_name = "system.server.started",
        correlation_id = "bootstrap",
        bind_address = %address,
        "signoff-server started"
    );
    axum::serve(listener, routes).with_graceful_shutdown(wait_for_shutdown()).await?;
    tracing::info!(
        event_name = "system.server.stopping",
        correlation_id = "shutdown",
        "signoff-server stopping"
    );

    let _ = shutdown_tx.send(true);
    if let Some(task) = scheduler_task {
        let grace = Duration::from_secs(app.config.server.graceful_shutdown_secs);
        if tokio::time::timeout(grace, task).await.is_err() {
            tracing::warn!(
                event_name = "system.server.scheduler_shutdown_timeout",
                correlation_id = "shutdown",
                "timeout scheduler did not stop within the grace period"
            );
        }
    }
    app.db_pool.close().await;

    Ok(())
}

async fn wait_for_shutdown() {
    if let Err(error) = tokio::signal::ctrl_c().await {
        tracing::error!(
            event_name = "system.server.signal_error",
            correlation_id = "shutdown",
            error = %error,
            "failed to listen for shutdown signal"
        );
        std::future::pending::<()>().await;
    }
}
