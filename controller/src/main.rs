mod controller;
mod events;
mod pgm;

use anyhow::Result;
use clap::Parser;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::mpsc;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "lattice-controller", about = "Interactive front-end for the lattice engine")]
struct Cli {
    /// Worker-side threads per turn
    #[arg(short = 't', long, default_value_t = 8)]
    threads: usize,

    /// Board width
    #[arg(short = 'w', long, default_value_t = 512)]
    width: usize,

    /// Board height
    #[arg(long, default_value_t = 512)]
    height: usize,

    /// Number of turns to process
    #[arg(long, default_value_t = 10_000_000_000)]
    turns: u64,

    /// Broker address
    #[arg(long, default_value = "localhost:8020", env = "GOL_SERVER")]
    server: String,

    /// Port our RPC endpoint listens on
    #[arg(short = 'p', long, default_value_t = 8050)]
    port: u16,

    /// Receive a board snapshot after every turn
    #[arg(long, action = clap::ArgAction::Set, default_value_t = true)]
    sdl: bool,

    /// Resume the broker's previous game instead of starting fresh
    #[arg(long, default_value = "false")]
    resume: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let cli = Cli::parse();
    let params = controller::Params {
        threads: cli.threads,
        width: cli.width,
        height: cli.height,
        turns: cli.turns,
        server_address: cli.server,
        port: cli.port,
        visual_updates: cli.sdl,
        resume: cli.resume,
    };
    tracing::info!(
        width = params.width,
        height = params.height,
        turns = params.turns,
        threads = params.threads,
        broker = %params.server_address,
        "Starting lattice controller"
    );

    let (events_tx, mut events_rx) = mpsc::channel(1000);
    let (keys_tx, keys_rx) = mpsc::channel(10);

    // Keys come in on stdin, one per line: q, p, s, r, k.
    tokio::spawn(async move {
        let mut lines = BufReader::new(tokio::io::stdin()).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            if let Some(key) = line.trim().chars().next() {
                if keys_tx.send(key).await.is_err() {
                    return;
                }
            }
        }
    });

    // Headless front-end: render the event stream into the log.
    let renderer = tokio::spawn(async move {
        while let Some(event) = events_rx.recv().await {
            match &event {
                events::Event::CellFlipped { .. } => tracing::trace!("{event}"),
                _ => tracing::info!("{event}"),
            }
        }
    });

    controller::run(params, events_tx, keys_rx).await?;
    renderer.await.ok();
    tracing::info!("Controller shut down");
    Ok(())
}
