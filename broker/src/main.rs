mod handlers;
mod session;
mod state;
#[cfg(test)]
mod testutil;

use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use lattice_protocol::rpc::{self, Handler};
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "lattice-broker", about = "Central coordinator for the lattice engine")]
struct Cli {
    /// Port to listen on
    #[arg(short = 'p', long, default_value_t = 8020)]
    port: u16,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let cli = Cli::parse();
    tracing::info!(port = cli.port, "Starting lattice broker");

    let (shutdown_tx, mut shutdown_rx) = watch::channel(false);
    let state = state::BrokerState::new(shutdown_tx);

    let listener = TcpListener::bind(("0.0.0.0", cli.port))
        .await
        .with_context(|| format!("failed to bind port {}", cli.port))?;
    tracing::info!("Listening on 0.0.0.0:{}", cli.port);

    let handler: Arc<dyn Handler> = Arc::new(handlers::BrokerRpc { state });
    tokio::select! {
        result = rpc::serve(listener, handler) => result?,
        _ = shutdown_rx.changed() => {
            tracing::info!("Shutdown requested, closing listener");
        }
        _ = shutdown_signal() => {}
    }

    tracing::info!("Broker shut down");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c().await.ok();
    };
    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();
    tokio::select! {
        _ = ctrl_c => tracing::info!("Received SIGINT"),
        _ = terminate => tracing::info!("Received SIGTERM"),
    }
}
