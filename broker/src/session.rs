//! The session loop: one logical task driving turns from `StartGame` until
//! the final turn, a quit, or a controller failure.

use std::sync::Arc;
use std::time::Duration;

use lattice_protocol::{
    AliveCellsReport, Board, BoardStateReport, Call, DoTurnRequest, DoTurnResponse, Empty,
    RpcClient, State, StateChangeReport,
};
use tokio::task::JoinSet;
use tokio::time::Instant;

use crate::state::{BrokerState, ResumePoint, WorkerHandle};

/// How often the controller gets an alive-cell count.
const REPORT_INTERVAL: Duration = Duration::from_secs(2);
/// Back-off while the worker registry is empty mid-session.
const NO_WORKER_BACKOFF: Duration = Duration::from_millis(500);

#[derive(Debug, Clone, Copy)]
pub struct SessionParams {
    pub height: usize,
    pub width: usize,
    pub max_turns: u64,
    pub threads: usize,
    pub visual_updates: bool,
}

/// Why the session loop stopped before `max_turns`.
enum SessionEnd {
    /// All turns done; `FinalTurnComplete` has been pushed.
    Finished,
    /// 'q' or 'k': the controller has already been notified.
    Quit,
    /// The controller stopped answering; nothing more to send.
    ControllerGone,
}

/// Run a session to completion, then release the controller slot so the
/// next `StartGame` is accepted.
pub async fn run(
    state: Arc<BrokerState>,
    controller: Arc<RpcClient>,
    board: Board,
    start_turn: u64,
    params: SessionParams,
) {
    tracing::info!(
        height = params.height,
        width = params.width,
        max_turns = params.max_turns,
        start_turn,
        "session started"
    );

    match drive(&state, &controller, board, start_turn, params).await {
        SessionEnd::Finished => tracing::info!("session finished all turns"),
        SessionEnd::Quit => tracing::info!("session quit by controller"),
        SessionEnd::ControllerGone => tracing::warn!("session aborted: controller unreachable"),
    }

    controller.close();
    *state.controller.lock().await = None;
    tracing::info!("controller disconnected");
}

async fn drive(
    state: &Arc<BrokerState>,
    controller: &RpcClient,
    mut board: Board,
    start_turn: u64,
    params: SessionParams,
) -> SessionEnd {
    // The session owns the keystroke queue for its whole lifetime.
    let mut keys = state.keys_rx.lock().await;

    let mut next = Board::new(params.width, params.height);
    let mut turn = start_turn;
    let mut last_report = Instant::now();

    // Let the front-end draw generation zero.
    if params.visual_updates && push_board(controller, Call::TurnComplete, turn, &board).await.is_err() {
        return SessionEnd::ControllerGone;
    }

    while turn < params.max_turns {
        // Control events preempt compute between turns, never mid-turn.
        if let Ok(key) = keys.try_recv() {
            tracing::info!(key = %key, "received keypress");
            match handle_key(state, controller, &mut keys, key, turn, &mut board).await {
                KeyOutcome::Continue => {}
                KeyOutcome::End(end) => return end,
            }
            continue;
        }

        if last_report.elapsed() >= REPORT_INTERVAL {
            last_report = Instant::now();
            let report = AliveCellsReport {
                completed_turns: turn,
                num_alive: board.alive_count(),
            };
            if let Err(e) = controller
                .call::<Empty>(Call::ReportAliveCells(report))
                .await
            {
                tracing::warn!(error = %e, "failed to report alive cells");
                return SessionEnd::ControllerGone;
            }
            continue;
        }

        match do_turn(state, &board, &mut next, params.threads).await {
            TurnOutcome::Done => {
                std::mem::swap(&mut board, &mut next);
                turn += 1;
                if params.visual_updates
                    && push_board(controller, Call::TurnComplete, turn, &board)
                        .await
                        .is_err()
                {
                    return SessionEnd::ControllerGone;
                }
                *state.last_game.lock().await = Some(ResumePoint {
                    board: board.clone(),
                    turn,
                });
            }
            TurnOutcome::Retry => {
                tracing::warn!(turn, "turn failed, retrying against remaining workers");
            }
            TurnOutcome::NoWorkers => {
                tracing::warn!(turn, "no workers available, waiting");
                tokio::time::sleep(NO_WORKER_BACKOFF).await;
            }
        }
    }

    if let Err(e) = push_board(controller, Call::FinalTurnComplete, turn, &board).await
    {
        tracing::warn!(error = %e, "failed to send final turn");
        return SessionEnd::ControllerGone;
    }
    SessionEnd::Finished
}

enum KeyOutcome {
    Continue,
    End(SessionEnd),
}

async fn handle_key(
    state: &Arc<BrokerState>,
    controller: &RpcClient,
    keys: &mut tokio::sync::MutexGuard<'_, tokio::sync::mpsc::Receiver<char>>,
    key: char,
    turn: u64,
    board: &mut Board,
) -> KeyOutcome {
    match key {
        'q' => {
            let change = StateChangeReport {
                previous: State::Executing,
                new: State::Quitting,
                completed_turns: turn,
            };
            let _ = controller
                .call::<Empty>(Call::GameStateChange(change))
                .await;
            KeyOutcome::End(SessionEnd::Quit)
        }
        'p' => {
            let pause = StateChangeReport {
                previous: State::Executing,
                new: State::Paused,
                completed_turns: turn,
            };
            if controller
                .call::<Empty>(Call::GameStateChange(pause))
                .await
                .is_err()
            {
                return KeyOutcome::End(SessionEnd::ControllerGone);
            }
            tracing::info!("paused, waiting for the next 'p'");
            // Everything except the resume key is discarded while paused.
            loop {
                match keys.recv().await {
                    Some('p') => break,
                    Some(_) => {}
                    None => return KeyOutcome::End(SessionEnd::ControllerGone),
                }
            }
            let resume = StateChangeReport {
                previous: State::Paused,
                new: State::Executing,
                completed_turns: turn,
            };
            if controller
                .call::<Empty>(Call::GameStateChange(resume))
                .await
                .is_err()
            {
                return KeyOutcome::End(SessionEnd::ControllerGone);
            }
            tracing::info!("resumed");
            KeyOutcome::Continue
        }
        's' => {
            if push_board(controller, Call::SaveBoard, turn, board)
                .await
                .is_err()
            {
                return KeyOutcome::End(SessionEnd::ControllerGone);
            }
            KeyOutcome::Continue
        }
        'r' => {
            board.randomise(&mut rand::thread_rng(), 0.2);
            tracing::info!("board randomised");
            KeyOutcome::Continue
        }
        'k' => {
            // Cascade shutdown: workers first, then the controller, then us.
            let drained: Vec<WorkerHandle> = state.workers.lock().await.drain(..).collect();
            for worker in drained {
                tracing::info!(worker = %worker.address, "shutting down worker");
                let _ = worker.client.call::<Empty>(Call::Shutdown(Empty {})).await;
                worker.client.close();
            }
            let _ = push_board(controller, Call::FinalTurnComplete, turn, board).await;
            let _ = state.shutdown.send(true);
            KeyOutcome::End(SessionEnd::Quit)
        }
        other => {
            tracing::debug!(key = %other, "ignoring keypress");
            KeyOutcome::Continue
        }
    }
}

/// Push the current board to the controller under the given report method.
async fn push_board(
    controller: &RpcClient,
    wrap: fn(BoardStateReport) -> Call,
    turn: u64,
    board: &Board,
) -> anyhow::Result<Empty> {
    let report = BoardStateReport {
        completed_turns: turn,
        board: board.to_bitboard(),
    };
    controller.call::<Empty>(wrap(report)).await
}

enum TurnOutcome {
    Done,
    /// At least one worker failed and has been removed; the turn must be
    /// retried and the counter left alone.
    Retry,
    NoWorkers,
}

/// One halo-exchange turn: snapshot the registry, farm a strip out to every
/// worker concurrently, then assemble the fragments into `next`.
async fn do_turn(
    state: &Arc<BrokerState>,
    board: &Board,
    next: &mut Board,
    threads: usize,
) -> TurnOutcome {
    // Snapshot under the mutex so membership changes cannot interleave with
    // strip assignment.
    let snapshot: Vec<WorkerHandle> = state.workers.lock().await.clone();
    if snapshot.is_empty() {
        return TurnOutcome::NoWorkers;
    }

    let num_workers = snapshot.len().min(board.height);
    let bounds = strip_bounds(board.height, num_workers);

    let mut calls = JoinSet::new();
    for (worker, (start, end)) in snapshot.into_iter().zip(bounds) {
        let halo = board.halo(start, end);
        calls.spawn(async move {
            let result = worker
                .client
                .call::<DoTurnResponse>(Call::DoTurn(DoTurnRequest { halo, threads }))
                .await;
            (worker.address, result)
        });
    }

    let mut failed = false;
    let mut fragments = Vec::with_capacity(num_workers);
    while let Some(joined) = calls.join_next().await {
        let Ok((address, result)) = joined else {
            failed = true;
            continue;
        };
        match result {
            Ok(resp) => fragments.push(resp.frag),
            Err(e) => {
                tracing::warn!(worker = %address, error = %e, "worker failed mid-turn");
                state.disconnect_worker(&address).await;
                failed = true;
            }
        }
    }
    if failed {
        return TurnOutcome::Retry;
    }

    for frag in fragments {
        next.copy_rows(frag.start_row, frag.end_row, &frag.bitboard.to_cells());
    }
    TurnOutcome::Done
}

/// Uniform strip assignment: `height / n` rows each, the last strip taking
/// the remainder. Callers cap `n` at the board height.
fn strip_bounds(height: usize, n: usize) -> Vec<(usize, usize)> {
    let strip_height = height / n;
    (0..n)
        .map(|i| {
            let start = i * strip_height;
            let end = if i == n - 1 {
                height
            } else {
                (i + 1) * strip_height
            };
            (start, end)
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::Ordering;

    use tokio::sync::{mpsc, watch, Semaphore};

    use super::*;
    use crate::testutil::{self, ScriptedWorker};

    fn test_state() -> Arc<BrokerState> {
        let (shutdown, _) = watch::channel(false);
        BrokerState::new(shutdown)
    }

    async fn register(state: &Arc<BrokerState>, addr: &str) {
        let client = Arc::new(RpcClient::dial(addr).await.unwrap());
        state.workers.lock().await.push(WorkerHandle {
            address: addr.to_string(),
            client,
            connected_at: chrono::Utc::now(),
        });
    }

    #[tokio::test]
    async fn an_empty_registry_reports_no_workers() {
        let state = test_state();
        let board = testutil::seeded_board(4, 4);
        let mut next = Board::new(4, 4);
        assert!(matches!(
            do_turn(&state, &board, &mut next, 1).await,
            TurnOutcome::NoWorkers
        ));
        assert_eq!(next, Board::new(4, 4));
    }

    #[tokio::test]
    async fn failing_worker_is_dropped_and_the_turn_retries() {
        let state = test_state();
        let (good, good_calls) = testutil::spawn_worker(ScriptedWorker::ok()).await;
        let (bad, _) = testutil::spawn_worker(ScriptedWorker::failing()).await;
        register(&state, &good).await;
        register(&state, &bad).await;

        let board = testutil::seeded_board(8, 8);
        let mut next = Board::new(8, 8);

        // First attempt: the bad worker errors, so the whole turn is
        // invalidated and nothing lands in the next-turn buffer, not even
        // the good worker's strip.
        assert!(matches!(
            do_turn(&state, &board, &mut next, 1).await,
            TurnOutcome::Retry
        ));
        assert_eq!(next, Board::new(8, 8));
        let remaining: Vec<String> = state
            .workers
            .lock()
            .await
            .iter()
            .map(|w| w.address.clone())
            .collect();
        assert_eq!(remaining, vec![good.clone()]);

        // The retry against the reduced set commits the full turn.
        assert!(matches!(
            do_turn(&state, &board, &mut next, 1).await,
            TurnOutcome::Done
        ));
        assert_eq!(next, testutil::step(&board));
        assert_eq!(good_calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn workers_added_mid_turn_sit_out_until_the_next_turn() {
        let state = test_state();
        let gate = Arc::new(Semaphore::new(0));
        let (started_tx, mut started_rx) = mpsc::unbounded_channel();
        let (slow, slow_calls) =
            testutil::spawn_worker(ScriptedWorker::gated(gate.clone(), started_tx)).await;
        register(&state, &slow).await;

        let board = testutil::seeded_board(6, 6);
        let dispatch_state = state.clone();
        let dispatch_board = board.clone();
        let turn = tokio::spawn(async move {
            let mut next = Board::new(6, 6);
            let outcome = do_turn(&dispatch_state, &dispatch_board, &mut next, 1).await;
            (matches!(outcome, TurnOutcome::Done), next)
        });

        // The slow worker holds its reply, so the turn is now in flight;
        // register a second worker while it runs.
        started_rx.recv().await.unwrap();
        let (late, late_calls) = testutil::spawn_worker(ScriptedWorker::ok()).await;
        register(&state, &late).await;
        gate.add_permits(1);

        let (done, next) = turn.await.unwrap();
        assert!(done);
        assert_eq!(next, testutil::step(&board));
        assert_eq!(slow_calls.load(Ordering::SeqCst), 1);
        assert_eq!(late_calls.load(Ordering::SeqCst), 0);

        // The next turn snapshots the grown registry and uses both.
        let mut next = Board::new(6, 6);
        assert!(matches!(
            do_turn(&state, &board, &mut next, 1).await,
            TurnOutcome::Done
        ));
        assert_eq!(next, testutil::step(&board));
        assert_eq!(slow_calls.load(Ordering::SeqCst), 2);
        assert_eq!(late_calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn strips_tile_the_board_exactly() {
        for height in [1, 2, 5, 10, 16, 512] {
            for n in 1..=height.min(8) {
                let bounds = strip_bounds(height, n);
                assert_eq!(bounds.len(), n);
                assert_eq!(bounds[0].0, 0);
                assert_eq!(bounds[n - 1].1, height);
                for pair in bounds.windows(2) {
                    assert_eq!(pair[0].1, pair[1].0);
                }
                for &(start, end) in &bounds {
                    assert!(end > start);
                }
            }
        }
    }

    #[test]
    fn last_strip_takes_the_remainder() {
        assert_eq!(strip_bounds(10, 3), vec![(0, 3), (3, 6), (6, 10)]);
        assert_eq!(strip_bounds(16, 4), vec![(0, 4), (4, 8), (8, 12), (12, 16)]);
        assert_eq!(strip_bounds(5, 5), vec![(0, 1), (1, 2), (2, 3), (3, 4), (4, 5)]);
    }
}
