use std::sync::Arc;

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use chrono::Utc;
use lattice_protocol::rpc::{reply, Handler, RpcClient};
use lattice_protocol::{
    Board, Call, Empty, ServerResponse, StartGameRequest, WorkerConnectRequest,
};
use serde_json::Value;

use crate::session::{self, SessionParams};
use crate::state::{BrokerState, WorkerHandle};

/// The broker's inbound RPC surface: controller session management and
/// worker registration.
pub struct BrokerRpc {
    pub state: Arc<BrokerState>,
}

#[async_trait]
impl Handler for BrokerRpc {
    async fn handle(&self, call: Call) -> Result<Value> {
        match call {
            Call::StartGame(req) => reply(&start_game(&self.state, req).await?),
            Call::RegisterKeypress(req) => {
                // Non-blocking: a full queue drops the key rather than
                // stalling the controller's RPC.
                if let Err(e) = self.state.keys_tx.try_send(req.key) {
                    tracing::warn!(key = %req.key, error = %e, "dropping keypress");
                    return reply(&ServerResponse::rejected("keypress queue full"));
                }
                reply(&ServerResponse::ok("queued"))
            }
            Call::ConnectWorker(req) => reply(&connect_worker(&self.state, req).await?),
            Call::Ping(_) => reply(&Empty {}),
            other => bail!("method {} not served by the broker", other.method()),
        }
    }
}

/// Accept a controller session: dial the controller back, pick the starting
/// board (fresh from the request, or the cached one on resume) and launch
/// the session loop.
async fn start_game(state: &Arc<BrokerState>, req: StartGameRequest) -> Result<ServerResponse> {
    tracing::info!(controller = %req.controller_address, "received StartGame");

    // The slot is held across the whole handshake so a second controller
    // cannot race us between the check and the assignment.
    let mut controller_slot = state.controller.lock().await;
    if controller_slot.is_some() {
        tracing::warn!("rejecting StartGame: a controller is already connected");
        return Ok(ServerResponse::rejected("broker already has a controller"));
    }
    if state.workers.lock().await.is_empty() {
        tracing::warn!("rejecting StartGame: no workers registered");
        return Ok(ServerResponse::rejected("broker has no workers"));
    }

    let (board, start_turn) = if req.start_new {
        (Board::from_bitboard(&req.board), 0)
    } else {
        let last = state.last_game.lock().await;
        match &*last {
            None => {
                return Ok(ServerResponse::rejected("cannot resume: no previous board"));
            }
            Some(point)
                if point.board.height != req.height || point.board.width != req.width =>
            {
                return Ok(ServerResponse::rejected(
                    "cannot resume: board dimensions do not match",
                ));
            }
            Some(point) => {
                tracing::info!(turn = point.turn, "resuming previous game");
                (point.board.clone(), point.turn)
            }
        }
    };

    let controller = match RpcClient::dial(&req.controller_address).await {
        Ok(client) => Arc::new(client),
        Err(e) => {
            tracing::warn!(error = %e, "failed to dial controller back");
            return Ok(ServerResponse::rejected(format!(
                "failed to connect to controller: {e:#}"
            )));
        }
    };
    *controller_slot = Some(controller.clone());
    drop(controller_slot);

    let params = SessionParams {
        height: req.height,
        width: req.width,
        max_turns: req.max_turns,
        threads: req.threads,
        visual_updates: req.visual_updates,
    };
    tokio::spawn(session::run(
        state.clone(),
        controller,
        board,
        start_turn,
        params,
    ));

    Ok(ServerResponse::ok("connected"))
}

/// Register a worker, dialing it back on the address it advertised. A
/// duplicate address replaces the old connection in place, keeping the
/// registry's insertion order.
async fn connect_worker(
    state: &Arc<BrokerState>,
    req: WorkerConnectRequest,
) -> Result<ServerResponse> {
    let client = RpcClient::dial(&req.worker_address)
        .await
        .context("failed to dial worker back")?;
    let handle = WorkerHandle {
        address: req.worker_address.clone(),
        client: Arc::new(client),
        connected_at: Utc::now(),
    };

    let mut workers = state.workers.lock().await;
    if let Some(existing) = workers.iter_mut().find(|w| w.address == req.worker_address) {
        tracing::info!(worker = %req.worker_address, "duplicate registration, replacing connection");
        existing.client.close();
        *existing = handle;
    } else {
        workers.push(handle);
    }
    tracing::info!(
        worker = %req.worker_address,
        workers = workers.len(),
        "🌐 Worker registered"
    );

    Ok(ServerResponse::ok("connected"))
}
