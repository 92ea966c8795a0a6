//! repo-server: always-on sync peer.
//!
//! Serves the HTTP bootstrap surface on `--port` and WebSocket sync clients
//! on `--sync-port`, persisting documents and shares under `--storage-dir`.

use anyhow::Result;
use clap::Parser;
use repo_server::{Config, Server};
use tokio::net::TcpListener;
use tokio::signal;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    let config = Config::parse();

    // Respects RUST_LOG, defaults to info (or debug with --verbose)
    let default_filter = if config.verbose {
        "debug,repo_server=debug,repo_net=debug"
    } else {
        "info,repo_server=info,repo_net=info,tower_http=info"
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    info!("Starting repo-server");
    info!("Storage directory: {:?}", config.storage_dir);

    let server = Server::from_config(&config)?;
    info!("Server identity: {}", server.provider().device().id);

    let sync_listener = TcpListener::bind(config.sync_addr()).await?;
    let sync_task = server.spawn_sync(sync_listener);

    let http_listener = TcpListener::bind(config.http_addr()).await?;
    info!("HTTP listening on {}", config.http_addr());
    axum::serve(http_listener, server.router())
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    server.shutdown();
    let _ = sync_task.await;
    info!("repo-server shut down");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!("Failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                tracing::error!("Failed to install SIGTERM handler: {}", e);
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

    info!("Shutdown signal received");
}
