//! The controller engine: loads the starting board, serves the broker's
//! report calls, and multiplexes keypresses with the stop signal until the
//! session ends.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use lattice_protocol::rpc::{self, reply, Handler, RpcClient};
use lattice_protocol::{
    AliveCellsReport, Board, BoardStateReport, Call, Cell, Empty, KeypressRequest, ServerResponse,
    StartGameRequest, State,
};
use serde_json::Value;
use tokio::net::TcpListener;
use tokio::sync::{mpsc, watch, Mutex};
use tokio::task::JoinSet;
use tokio::time::Instant;

/// Delay between `StartGame` attempts.
const START_RETRY_DELAY: Duration = Duration::from_millis(500);
const START_ATTEMPTS: u32 = 4;

#[derive(Debug, Clone)]
pub struct Params {
    pub threads: usize,
    pub width: usize,
    pub height: usize,
    pub turns: u64,
    pub server_address: String,
    pub port: u16,
    pub visual_updates: bool,
    pub resume: bool,
}

/// Serves the broker's inbound report calls and feeds the event stream.
struct ControllerRpc {
    events: mpsc::Sender<crate::events::Event>,
    /// Board from the previous `TurnComplete`, for cell-flip diffing. Empty
    /// on resume until the first snapshot arrives.
    previous: Mutex<Option<Board>>,
    /// Last observed completed-turn count, echoed in the closing event.
    last_turn: Mutex<u64>,
    /// `(turn, instant)` of the last alive-cells report, for the
    /// turns-per-second log.
    last_sample: Mutex<Option<(u64, Instant)>>,
    /// In-flight board saves, drained before the events channel closes.
    saves: Mutex<JoinSet<()>>,
    stop: watch::Sender<bool>,
}

impl ControllerRpc {
    async fn emit(&self, event: crate::events::Event) {
        // The consumer owns the receiver for the whole run; a closed
        // channel only happens on teardown.
        let _ = self.events.send(event).await;
    }

    async fn note_turn(&self, turn: u64) {
        *self.last_turn.lock().await = turn;
    }

    /// Diff a fresh snapshot against the previous one, emitting a
    /// `CellFlipped` per change. With no previous board every alive cell
    /// counts as flipped from dead.
    async fn diff_and_cache(&self, board: Board, turn: u64) {
        let mut previous = self.previous.lock().await;
        for y in 0..board.height {
            for x in 0..board.width {
                let now = board.get(x, y);
                let before = previous.as_ref().is_some_and(|p| p.get(x, y));
                if now != before {
                    self.emit(crate::events::Event::CellFlipped {
                        completed_turns: turn,
                        cell: Cell { x, y },
                    })
                    .await;
                }
            }
        }
        *previous = Some(board);
    }

    async fn spawn_save(&self, report: BoardStateReport) {
        let board = Board::from_bitboard(&report.board);
        let turn = report.completed_turns;
        self.saves.lock().await.spawn(async move {
            if let Err(e) = crate::pgm::write_board(&board, turn).await {
                tracing::error!(error = %e, turn, "failed to save board");
            }
        });
    }

    async fn drain_saves(&self) {
        let mut saves = self.saves.lock().await;
        while saves.join_next().await.is_some() {}
    }
}

#[async_trait]
impl Handler for ControllerRpc {
    async fn handle(&self, call: Call) -> Result<Value> {
        match call {
            Call::GameStateChange(req) => {
                tracing::info!(turn = req.completed_turns, "state change: {} -> {}", req.previous, req.new);
                self.note_turn(req.completed_turns).await;
                self.emit(crate::events::Event::StateChange {
                    completed_turns: req.completed_turns,
                    new_state: req.new,
                })
                .await;
                if req.new == State::Quitting {
                    let _ = self.stop.send(true);
                }
                reply(&Empty {})
            }
            Call::TurnComplete(req) => {
                let board = Board::from_bitboard(&req.board);
                self.note_turn(req.completed_turns).await;
                self.diff_and_cache(board, req.completed_turns).await;
                self.emit(crate::events::Event::TurnComplete {
                    completed_turns: req.completed_turns,
                })
                .await;
                reply(&Empty {})
            }
            Call::FinalTurnComplete(req) => {
                tracing::info!(turn = req.completed_turns, "final turn complete");
                let board = Board::from_bitboard(&req.board);
                self.note_turn(req.completed_turns).await;
                self.emit(crate::events::Event::FinalTurnComplete {
                    completed_turns: req.completed_turns,
                    alive: board.alive_cells(),
                })
                .await;
                self.spawn_save(req).await;
                let _ = self.stop.send(true);
                reply(&Empty {})
            }
            Call::SaveBoard(req) => {
                self.spawn_save(req).await;
                reply(&Empty {})
            }
            Call::ReportAliveCells(req) => {
                self.log_throughput(&req).await;
                self.note_turn(req.completed_turns).await;
                self.emit(crate::events::Event::AliveCellsCount {
                    completed_turns: req.completed_turns,
                    cells_count: req.num_alive,
                })
                .await;
                reply(&Empty {})
            }
            other => bail!("method {} not served by the controller", other.method()),
        }
    }
}

impl ControllerRpc {
    async fn log_throughput(&self, req: &AliveCellsReport) {
        let mut sample = self.last_sample.lock().await;
        let now = Instant::now();
        if let Some((turn, at)) = *sample {
            let elapsed = now.duration_since(at).as_secs_f64();
            if elapsed > 0.0 {
                let rate = req.completed_turns.saturating_sub(turn) as f64 / elapsed;
                tracing::info!(
                    turn = req.completed_turns,
                    alive = req.num_alive,
                    turns_per_sec = format!("{rate:.1}"),
                    "alive cells report"
                );
            }
        } else {
            tracing::info!(turn = req.completed_turns, alive = req.num_alive, "alive cells report");
        }
        *sample = Some((req.completed_turns, now));
    }
}

/// Start the engine and block until the session terminates. The events
/// channel closes when this returns.
pub async fn run(
    params: Params,
    events: mpsc::Sender<crate::events::Event>,
    mut keys: mpsc::Receiver<char>,
) -> Result<()> {
    // Build the starting board. A fresh game seeds it from the image on
    // disk; a resume leaves it zeroed and the broker's cached board wins.
    let mut board = Board::new(params.width, params.height);
    let mut previous = None;
    if !params.resume {
        board = crate::pgm::read_board(params.width, params.height).await?;
        for cell in board.alive_cells() {
            let _ = events
                .send(crate::events::Event::CellFlipped {
                    completed_turns: 0,
                    cell,
                })
                .await;
        }
        previous = Some(board.clone());
    }

    let (stop_tx, mut stop_rx) = watch::channel(false);
    let rpc_state = Arc::new(ControllerRpc {
        events: events.clone(),
        previous: Mutex::new(previous),
        last_turn: Mutex::new(0),
        last_sample: Mutex::new(None),
        saves: Mutex::new(JoinSet::new()),
        stop: stop_tx,
    });

    let listener = TcpListener::bind(("127.0.0.1", params.port))
        .await
        .with_context(|| format!("failed to bind port {}", params.port))?;
    let handler: Arc<dyn Handler> = rpc_state.clone();
    let server = tokio::spawn(rpc::serve(listener, handler));

    let broker = match start_game(&params, &board).await {
        Ok(broker) => broker,
        Err(e) => {
            server.abort();
            return Err(e);
        }
    };

    // Forward keypresses until the broker tells us to stop.
    loop {
        tokio::select! {
            Some(key) = keys.recv() => {
                tracing::debug!(key = %key, "forwarding keypress");
                if let Err(e) = broker
                    .call::<ServerResponse>(Call::RegisterKeypress(KeypressRequest { key }))
                    .await
                {
                    tracing::warn!(error = %e, "failed to forward keypress");
                }
            }
            _ = stop_rx.changed() => break,
        }
    }

    tracing::info!("session over, closing connections");
    broker.close();
    server.abort();

    // Let pending board saves finish before the event stream closes.
    rpc_state.drain_saves().await;
    let final_turn = *rpc_state.last_turn.lock().await;
    let _ = events
        .send(crate::events::Event::StateChange {
            completed_turns: final_turn,
            new_state: State::Quitting,
        })
        .await;
    Ok(())
}

/// Dial the broker and ask it to start (or resume) the session, retrying a
/// rejected or unreachable broker a few times before giving up.
async fn start_game(params: &Params, board: &Board) -> Result<Arc<RpcClient>> {
    let request = StartGameRequest {
        controller_address: format!("127.0.0.1:{}", params.port),
        height: params.height,
        width: params.width,
        max_turns: params.turns,
        threads: params.threads,
        visual_updates: params.visual_updates,
        start_new: !params.resume,
        board: board.to_bitboard(),
    };

    let mut last_failure = String::new();
    for attempt in 1..=START_ATTEMPTS {
        match try_start(params, &request).await {
            Ok(broker) => {
                tracing::info!(broker = %params.server_address, "session accepted");
                return Ok(broker);
            }
            Err(e) => {
                last_failure = format!("{e:#}");
                tracing::warn!(attempt, error = %last_failure, "StartGame failed");
                if attempt < START_ATTEMPTS {
                    tokio::time::sleep(START_RETRY_DELAY).await;
                }
            }
        }
    }
    bail!("broker refused the session after {START_ATTEMPTS} attempts: {last_failure}");
}

async fn try_start(params: &Params, request: &StartGameRequest) -> Result<Arc<RpcClient>> {
    let broker = Arc::new(RpcClient::dial(&params.server_address).await?);
    let resp: ServerResponse = broker.call(Call::StartGame(request.clone())).await?;
    if !resp.success {
        bail!("broker rejected StartGame: {}", resp.message);
    }
    Ok(broker)
}
