use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use anyhow::{Context, Result};
use beacond::api;
use beacond::config::Config;
use beacond::{Launch, LocalBeacon};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("beacond=info"))
        )
        .init();

    tracing::info!("Starting beacond");

    // Load config; every setting has a default
    let config = match std::env::args().nth(1) {
        Some(path) => {
            let config = Config::load(&path)
                .with_context(|| format!("Failed to load config from {}", path))?;
            tracing::info!("Loaded config from {}", path);
            config
        }
        None => Config::default(),
    };

    // Binding may back off and retry, so keep it off the async workers
    let start_config = config.clone();
    let launch = tokio::task::spawn_blocking(move || beacond::start(&start_config))
        .await
        .context("Beacon start task failed")?
        .context("Failed to start beacon")?;

    let beacon: LocalBeacon = match launch {
        Launch::Local(beacon) => beacon,
        Launch::Remote => anyhow::bail!(
            "A beacon is already running on this host (control port {})",
            config.beacon.control_port
        ),
    };
    let handle = beacon.handle();

    // Create cancellation token for graceful shutdown
    let cancel = CancellationToken::new();

    let server_handle = if config.api.enabled {
        let hostname = hostname::get()
            .context("Failed to get system hostname")?
            .to_string_lossy()
            .to_string();

        let app = api::routes::router(api::routes::AppState {
            beacon: handle.clone(),
            config: Arc::new(config.beacon.clone()),
            hostname,
        });

        let listener = tokio::net::TcpListener::bind(&config.api.listen)
            .await
            .with_context(|| format!("Failed to bind to {}", config.api.listen))?;

        tracing::info!("API listening on {}", config.api.listen);

        let server_cancel = cancel.clone();
        Some(tokio::spawn(async move {
            if let Err(e) = axum::serve(listener, app)
                .with_graceful_shutdown(async move { server_cancel.cancelled().await })
                .await
            {
                tracing::error!("Server error: {}", e);
            }
        }))
    } else {
        None
    };

    // Wait for a shutdown signal or a `stop` control request
    tokio::select! {
        signal = tokio::signal::ctrl_c() => {
            signal.context("Failed to listen for ctrl-c")?;
            tracing::info!("Shutdown signal received");
        }
        _ = handle.stopped() => {
            tracing::info!("Beacon stopped by control request");
        }
    }

    // Trigger cancellation
    cancel.cancel();

    if let Some(server_handle) = server_handle {
        let _ = server_handle.await;
    }

    // Stop the loop and release its sockets
    if let Err(e) = tokio::task::spawn_blocking(move || beacon.shutdown()).await {
        tracing::error!("Failed to shut down beacon: {}", e);
    }

    tracing::info!("Shutdown complete");
    Ok(())
}
