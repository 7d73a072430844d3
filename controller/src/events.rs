use std::fmt;

use lattice_protocol::{Cell, State};

/// Everything the controller tells its front-end about a running session.
/// The stream ends with a `FinalTurnComplete` on a clean finish, or simply
/// closes on an unrecoverable error.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    /// A single cell changed value. Emitted for every alive cell when the
    /// initial board is loaded, and for every difference between
    /// consecutive board snapshots after that.
    CellFlipped { completed_turns: u64, cell: Cell },
    TurnComplete { completed_turns: u64 },
    AliveCellsCount { completed_turns: u64, cells_count: usize },
    StateChange { completed_turns: u64, new_state: State },
    /// The last event of a successful session, carrying the final
    /// population.
    FinalTurnComplete { completed_turns: u64, alive: Vec<Cell> },
}

impl Event {
    pub fn completed_turns(&self) -> u64 {
        match self {
            Event::CellFlipped { completed_turns, .. }
            | Event::TurnComplete { completed_turns }
            | Event::AliveCellsCount { completed_turns, .. }
            | Event::StateChange { completed_turns, .. }
            | Event::FinalTurnComplete { completed_turns, .. } => *completed_turns,
        }
    }
}

impl fmt::Display for Event {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Event::CellFlipped { completed_turns, cell } => {
                write!(f, "turn {completed_turns}: cell ({}, {}) flipped", cell.x, cell.y)
            }
            Event::TurnComplete { completed_turns } => {
                write!(f, "turn {completed_turns} complete")
            }
            Event::AliveCellsCount { completed_turns, cells_count } => {
                write!(f, "turn {completed_turns}: {cells_count} cells alive")
            }
            Event::StateChange { completed_turns, new_state } => {
                write!(f, "turn {completed_turns}: now {new_state}")
            }
            Event::FinalTurnComplete { completed_turns, alive } => {
                write!(f, "final turn {completed_turns}: {} cells alive", alive.len())
            }
        }
    }
}
