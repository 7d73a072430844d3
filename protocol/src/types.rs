use std::fmt;

use serde::{Deserialize, Serialize};

use crate::bitboard::BitBoard;

/// Execution state of a session, as reported to the controller.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum State {
    Paused,
    Executing,
    Quitting,
}

impl fmt::Display for State {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            State::Paused => write!(f, "Paused"),
            State::Executing => write!(f, "Executing"),
            State::Quitting => write!(f, "Quitting"),
        }
    }
}

/// A strip of computed rows sent back by a worker. `start_row` is the first
/// row of the full board this fragment covers, `end_row` the row after the
/// last.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Fragment {
    pub start_row: usize,
    pub end_row: usize,
    pub bitboard: BitBoard,
}

/// The input a worker needs for one turn: the strip rows plus one wrap-aware
/// neighbour row on each side (omitted when the strip spans the whole
/// board). `offset` is the halo row where the strip begins; `start_ptr` /
/// `end_ptr` locate the strip inside the full board (`end_ptr` exclusive).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Halo {
    pub bitboard: BitBoard,
    pub offset: usize,
    pub start_ptr: usize,
    pub end_ptr: usize,
}

/// Result of the policy-level server calls: whether the request was accepted
/// and a human-readable reason when it was not.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerResponse {
    pub success: bool,
    pub message: String,
}

impl ServerResponse {
    pub fn ok(message: impl Into<String>) -> Self {
        ServerResponse {
            success: true,
            message: message.into(),
        }
    }

    pub fn rejected(message: impl Into<String>) -> Self {
        ServerResponse {
            success: false,
            message: message.into(),
        }
    }
}

/// Everything the broker needs to start (or resume) a session.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StartGameRequest {
    pub controller_address: String,
    pub height: usize,
    pub width: usize,
    pub max_turns: u64,
    pub threads: usize,
    pub visual_updates: bool,
    /// When false the broker resumes from its cached board instead of
    /// `board`.
    pub start_new: bool,
    pub board: BitBoard,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KeypressRequest {
    pub key: char,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerConnectRequest {
    pub worker_address: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StateChangeReport {
    pub previous: State,
    pub new: State,
    pub completed_turns: u64,
}

/// A snapshot of the whole board, pushed to the controller on visual
/// updates, saves and session end.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BoardStateReport {
    pub completed_turns: u64,
    pub board: BitBoard,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AliveCellsReport {
    pub completed_turns: u64,
    pub num_alive: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DoTurnRequest {
    pub halo: Halo,
    pub threads: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DoTurnResponse {
    pub frag: Fragment,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Empty {}

/// Every request that can travel over a lattice connection, tagged with its
/// stable method string. Each role serves the subset addressed to it and
/// rejects the rest.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "method", content = "params")]
pub enum Call {
    #[serde(rename = "Server.StartGame")]
    StartGame(StartGameRequest),
    #[serde(rename = "Server.RegisterKeypress")]
    RegisterKeypress(KeypressRequest),
    #[serde(rename = "Server.ConnectWorker")]
    ConnectWorker(WorkerConnectRequest),
    #[serde(rename = "Server.Ping")]
    Ping(Empty),

    #[serde(rename = "Controller.GameStateChange")]
    GameStateChange(StateChangeReport),
    #[serde(rename = "Controller.TurnComplete")]
    TurnComplete(BoardStateReport),
    #[serde(rename = "Controller.FinalTurnComplete")]
    FinalTurnComplete(BoardStateReport),
    #[serde(rename = "Controller.SaveBoard")]
    SaveBoard(BoardStateReport),
    #[serde(rename = "Controller.ReportAliveCells")]
    ReportAliveCells(AliveCellsReport),

    #[serde(rename = "Worker.DoTurn")]
    DoTurn(DoTurnRequest),
    #[serde(rename = "Worker.Shutdown")]
    Shutdown(Empty),
}

impl Call {
    /// The wire-level method name, for logging.
    pub fn method(&self) -> &'static str {
        match self {
            Call::StartGame(_) => "Server.StartGame",
            Call::RegisterKeypress(_) => "Server.RegisterKeypress",
            Call::ConnectWorker(_) => "Server.ConnectWorker",
            Call::Ping(_) => "Server.Ping",
            Call::GameStateChange(_) => "Controller.GameStateChange",
            Call::TurnComplete(_) => "Controller.TurnComplete",
            Call::FinalTurnComplete(_) => "Controller.FinalTurnComplete",
            Call::SaveBoard(_) => "Controller.SaveBoard",
            Call::ReportAliveCells(_) => "Controller.ReportAliveCells",
            Call::DoTurn(_) => "Worker.DoTurn",
            Call::Shutdown(_) => "Worker.Shutdown",
        }
    }
}
