//! Shared fixtures for broker tests: scripted in-process workers and a
//! recording controller, served over real sockets so dispatch failures look
//! exactly like production transport errors.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use anyhow::{bail, Result};
use async_trait::async_trait;
use lattice_protocol::rpc::{self, reply, Handler};
use lattice_protocol::{
    BitBoard, Board, BoardStateReport, Call, DoTurnResponse, Empty, Fragment, Halo,
};
use serde_json::Value;
use tokio::net::TcpListener;
use tokio::sync::{mpsc, Semaphore};

/// Reference next-generation step over a full board, for expected results
/// and for scripted worker replies.
pub fn step(board: &Board) -> Board {
    let mut next = Board::new(board.width, board.height);
    for y in 0..board.height {
        for x in 0..board.width {
            let mut neighbours = 0;
            for dy in [board.height - 1, 0, 1] {
                for dx in [board.width - 1, 0, 1] {
                    if dx == 0 && dy == 0 {
                        continue;
                    }
                    if board.get((x + dx) % board.width, (y + dy) % board.height) {
                        neighbours += 1;
                    }
                }
            }
            let alive = if board.get(x, y) {
                neighbours == 2 || neighbours == 3
            } else {
                neighbours == 3
            };
            next.set(x, y, alive);
        }
    }
    next
}

/// Evolve a halo the way a live worker does: step the halo grid (wrapping
/// over its own dimensions) and keep the strip rows.
fn evolve_halo(halo: &Halo) -> Fragment {
    let cols = halo.bitboard.row_length;
    let rows = halo.bitboard.num_rows;
    let grid = Board::from_cells(halo.bitboard.to_cells(), cols, rows);
    let stepped = step(&grid);

    let strip_rows = halo.end_ptr - halo.start_ptr;
    let mut out = Vec::with_capacity(strip_rows * cols);
    for y in halo.offset..halo.offset + strip_rows {
        out.extend_from_slice(stepped.row(y));
    }
    Fragment {
        start_row: halo.start_ptr,
        end_row: halo.end_ptr,
        bitboard: BitBoard::from_cells(&out, strip_rows, cols),
    }
}

pub fn seeded_board(width: usize, height: usize) -> Board {
    use rand::{rngs::StdRng, SeedableRng};
    let mut board = Board::new(width, height);
    board.randomise(&mut StdRng::seed_from_u64(42), 0.3);
    board
}

/// A glider in the top-left corner: never dies, and occupies a different
/// set of cells after every turn count, so wrong-board bugs cannot cancel
/// out.
pub fn glider_board(size: usize) -> Board {
    let mut board = Board::new(size, size);
    for (x, y) in [(1, 0), (2, 1), (0, 2), (1, 2), (2, 2)] {
        board.set(x, y, true);
    }
    board
}

/// An in-process worker with scripted behaviour: answer turns correctly,
/// fail them, or hold each reply until the test opens the gate.
pub struct ScriptedWorker {
    calls: Arc<AtomicUsize>,
    fail: bool,
    gate: Option<Arc<Semaphore>>,
    started: Option<mpsc::UnboundedSender<()>>,
}

impl ScriptedWorker {
    pub fn ok() -> Self {
        ScriptedWorker {
            calls: Arc::default(),
            fail: false,
            gate: None,
            started: None,
        }
    }

    /// Every `DoTurn` returns a handler error, like a worker whose process
    /// died mid-call.
    pub fn failing() -> Self {
        ScriptedWorker {
            fail: true,
            ..Self::ok()
        }
    }

    /// Signals `started` when a `DoTurn` arrives, then waits for a permit
    /// on `gate` before replying, letting a test act while a turn is in
    /// flight.
    pub fn gated(gate: Arc<Semaphore>, started: mpsc::UnboundedSender<()>) -> Self {
        ScriptedWorker {
            gate: Some(gate),
            started: Some(started),
            ..Self::ok()
        }
    }
}

#[async_trait]
impl Handler for ScriptedWorker {
    async fn handle(&self, call: Call) -> Result<Value> {
        match call {
            Call::DoTurn(req) => {
                self.calls.fetch_add(1, Ordering::SeqCst);
                if let Some(started) = &self.started {
                    let _ = started.send(());
                }
                if let Some(gate) = &self.gate {
                    let _permit = gate.acquire().await;
                }
                if self.fail {
                    bail!("scripted worker failure");
                }
                reply(&DoTurnResponse {
                    frag: evolve_halo(&req.halo),
                })
            }
            Call::Shutdown(_) => reply(&Empty {}),
            other => bail!("unexpected call {}", other.method()),
        }
    }
}

/// Serve a scripted worker on an ephemeral port. Returns its address and
/// the `DoTurn` call counter.
pub async fn spawn_worker(worker: ScriptedWorker) -> (String, Arc<AtomicUsize>) {
    let calls = worker.calls.clone();
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap().to_string();
    tokio::spawn(rpc::serve(listener, Arc::new(worker)));
    (addr, calls)
}

/// A controller stand-in that acknowledges every report and forwards each
/// `FinalTurnComplete` to the test.
struct RecordingController {
    finals: mpsc::UnboundedSender<BoardStateReport>,
}

#[async_trait]
impl Handler for RecordingController {
    async fn handle(&self, call: Call) -> Result<Value> {
        match call {
            Call::FinalTurnComplete(report) => {
                let _ = self.finals.send(report);
                reply(&Empty {})
            }
            Call::GameStateChange(_)
            | Call::TurnComplete(_)
            | Call::SaveBoard(_)
            | Call::ReportAliveCells(_) => reply(&Empty {}),
            other => bail!("unexpected call {}", other.method()),
        }
    }
}

/// Serve a recording controller on an ephemeral port. Returns the address
/// the broker should dial back and the stream of final-turn reports.
pub async fn spawn_controller() -> (String, mpsc::UnboundedReceiver<BoardStateReport>) {
    let (finals_tx, finals_rx) = mpsc::unbounded_channel();
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap().to_string();
    tokio::spawn(rpc::serve(
        listener,
        Arc::new(RecordingController { finals: finals_tx }),
    ));
    (addr, finals_rx)
}
