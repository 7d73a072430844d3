use std::sync::Arc;

use chrono::{DateTime, Utc};
use lattice_protocol::{Board, RpcClient};
use tokio::sync::{mpsc, watch, Mutex};

/// A registered worker: its dial-back address and the open connection.
/// Addresses are unique within the registry.
#[derive(Clone)]
pub struct WorkerHandle {
    pub address: String,
    pub client: Arc<RpcClient>,
    pub connected_at: DateTime<Utc>,
}

/// The board and turn count left behind by the last completed session, kept
/// so a controller can resume with `start_new = false`.
pub struct ResumePoint {
    pub board: Board,
    pub turn: u64,
}

/// Everything the broker shares between its RPC handlers and the session
/// loop. One mutex per logical resource; the keystroke queue is bounded and
/// fed without blocking.
pub struct BrokerState {
    pub workers: Mutex<Vec<WorkerHandle>>,
    pub controller: Mutex<Option<Arc<RpcClient>>>,
    pub keys_tx: mpsc::Sender<char>,
    /// Held by the active session loop for its whole lifetime.
    pub keys_rx: Mutex<mpsc::Receiver<char>>,
    pub last_game: Mutex<Option<ResumePoint>>,
    pub shutdown: watch::Sender<bool>,
}

impl BrokerState {
    pub fn new(shutdown: watch::Sender<bool>) -> Arc<Self> {
        let (keys_tx, keys_rx) = mpsc::channel(10);
        Arc::new(BrokerState {
            workers: Mutex::new(Vec::new()),
            controller: Mutex::new(None),
            keys_tx,
            keys_rx: Mutex::new(keys_rx),
            last_game: Mutex::new(None),
            shutdown,
        })
    }

    /// Close a worker's connection and drop it from the registry. Called
    /// when a `DoTurn` fails mid-session.
    pub async fn disconnect_worker(&self, address: &str) {
        let mut workers = self.workers.lock().await;
        if let Some(index) = workers.iter().position(|w| w.address == address) {
            let worker = workers.remove(index);
            worker.client.close();
            let connected_for = Utc::now().signed_duration_since(worker.connected_at);
            tracing::info!(
                worker = %address,
                connected_secs = connected_for.num_seconds(),
                remaining = workers.len(),
                "💀 Worker disconnected"
            );
        } else {
            tracing::debug!(worker = %address, "worker already removed");
        }
    }
}
