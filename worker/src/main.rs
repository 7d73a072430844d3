mod engine;

use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use clap::Parser;
use lattice_protocol::rpc::{self, reply, Handler, RpcClient};
use lattice_protocol::{Call, DoTurnResponse, Empty, ServerResponse, WorkerConnectRequest};
use serde_json::Value;
use tokio::net::TcpListener;
use tokio::signal;
use tokio::sync::watch;

/// How often we ping the broker (and retry registration when disconnected).
const PING_INTERVAL: Duration = Duration::from_secs(2);

#[derive(Parser)]
#[command(name = "lattice-worker", about = "Strip compute node for the lattice engine")]
struct Cli {
    /// Port our RPC endpoint listens on
    #[arg(short = 'p', long, default_value_t = 8010)]
    port: u16,

    /// Broker address to register with
    #[arg(short = 's', long, default_value = "localhost:8020", env = "GOL_SERVER")]
    server: String,

    /// Advertise 127.0.0.1 instead of our discovered public IP
    #[arg(long, default_value = "false")]
    localhost: bool,
}

/// Serves the broker-facing half of the worker: turn requests and the
/// cascade shutdown.
struct WorkerRpc {
    shutdown: watch::Sender<bool>,
}

#[async_trait]
impl Handler for WorkerRpc {
    async fn handle(&self, call: Call) -> Result<Value> {
        match call {
            Call::DoTurn(req) => {
                let frag =
                    tokio::task::spawn_blocking(move || engine::evolve(&req.halo, req.threads))
                        .await
                        .context("turn task panicked")?;
                reply(&DoTurnResponse { frag })
            }
            Call::Shutdown(_) => {
                tracing::info!("broker requested shutdown");
                let _ = self.shutdown.send(true);
                reply(&Empty {})
            }
            other => bail!("method {} not served by workers", other.method()),
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    let cli = Cli::parse();

    let host = if cli.localhost {
        "127.0.0.1".to_string()
    } else {
        discover_public_ip().await?
    };
    let our_address = format!("{host}:{}", cli.port);
    tracing::info!(address = %our_address, broker = %cli.server, "Starting lattice worker");

    let listener = TcpListener::bind(("0.0.0.0", cli.port))
        .await
        .with_context(|| format!("failed to bind port {}", cli.port))?;

    let (shutdown_tx, mut shutdown_rx) = watch::channel(false);
    let handler: Arc<dyn Handler> = Arc::new(WorkerRpc {
        shutdown: shutdown_tx,
    });
    tokio::spawn(rpc::serve(listener, handler));

    // Connected/Disconnected lifecycle: register, then ping at an interval,
    // re-registering whenever the broker drops us.
    let mut broker = connect_to_broker(&cli.server, &our_address).await;
    let mut ticker = tokio::time::interval(PING_INTERVAL);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                match &broker {
                    Some(client) => {
                        if let Err(e) = client.call::<Empty>(Call::Ping(Empty {})).await {
                            tracing::warn!(error = %e, "lost connection to broker");
                            client.close();
                            broker = None;
                        }
                    }
                    None => broker = connect_to_broker(&cli.server, &our_address).await,
                }
            }
            _ = shutdown_rx.changed() => {
                tracing::info!("Shutting down");
                break;
            }
            _ = shutdown_signal() => break,
        }
    }

    if let Some(client) = broker {
        client.close();
    }
    // Let the in-flight Shutdown reply drain before the process exits.
    tokio::time::sleep(Duration::from_millis(100)).await;
    tracing::info!("Worker shut down");
    Ok(())
}

/// Dial the broker and register our address. Returns `None` (and logs) on
/// any failure; the ping loop retries on the next tick.
async fn connect_to_broker(server: &str, our_address: &str) -> Option<Arc<RpcClient>> {
    let client = match RpcClient::dial(server).await {
        Ok(client) => Arc::new(client),
        Err(e) => {
            tracing::warn!(broker = %server, error = %e, "cannot reach broker");
            return None;
        }
    };
    let request = WorkerConnectRequest {
        worker_address: our_address.to_string(),
    };
    match client
        .call::<ServerResponse>(Call::ConnectWorker(request))
        .await
    {
        Ok(resp) if resp.success => {
            tracing::info!(broker = %server, "🌐 Registered with broker");
            Some(client)
        }
        Ok(resp) => {
            tracing::warn!(broker = %server, message = %resp.message, "broker rejected registration");
            None
        }
        Err(e) => {
            tracing::warn!(broker = %server, error = %e, "registration failed");
            None
        }
    }
}

/// Ask ipify for the address other machines can dial us back on.
async fn discover_public_ip() -> Result<String> {
    let ip = reqwest::get("https://api.ipify.org")
        .await
        .context("failed to reach ipify")?
        .text()
        .await
        .context("bad ipify response")?;
    Ok(ip.trim().to_string())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c().await.ok();
    };
    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
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
