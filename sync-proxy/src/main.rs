//! syncproxy binary entry point.
//!
//! Usage:
//! ```bash
//! syncproxy --config syncproxy.toml
//! HOMESERVER_URL=https://matrix.example.com SHARED_SECRET=... syncproxy
//! ```

use anyhow::{Context, Result};
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use syncproxy::{http, Config, HomeserverClient, SqliteStore, SyncProxy};
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "syncproxy", version, about = "Relay /sync for encrypted appservices")]
struct Cli {
    /// Path to the TOML configuration file. Missing files fall back to
    /// defaults plus environment variables.
    #[arg(short, long, default_value = "syncproxy.toml")]
    config: PathBuf,
}

fn init_tracing(config: &Config) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(config.log_directive()));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = Config::load(&cli.config).context("failed to load configuration")?;
    init_tracing(&config);

    tracing::info!(
        listen_address = %config.server.listen_address,
        homeserver = %config.homeserver.url,
        "starting syncproxy v{}",
        env!("CARGO_PKG_VERSION")
    );

    let store = SqliteStore::new(&config.storage.database, config.storage.max_connections)
        .await
        .context("failed to open database")?;
    let homeserver =
        HomeserverClient::new(&config.homeserver.url).context("failed to create homeserver client")?;
    let listen_address = config.server.listen_address.clone();

    let proxy = Arc::new(
        SyncProxy::new(config, Arc::new(store), Arc::new(homeserver))
            .context("failed to initialize proxy")?,
    );
    proxy
        .load_targets()
        .await
        .context("failed to load targets")?;
    let resumed = proxy.start_active_targets();
    tracing::info!("Resumed {} active targets", resumed);

    let listener = tokio::net::TcpListener::bind(&listen_address)
        .await
        .with_context(|| format!("failed to bind {listen_address}"))?;
    tracing::info!("Control API listening on {}", listen_address);

    axum::serve(listener, http::build_router(proxy))
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("server shutdown with error")?;

    // Loops keep their active flag so they resume on the next start.
    tracing::info!("Shutdown complete");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(err) = tokio::signal::ctrl_c().await {
            tracing::error!("Failed to listen for ctrl-c: {}", err);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(err) => {
                tracing::error!("Failed to listen for SIGTERM: {}", err);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
    tracing::info!("Shutdown signal received");
}
