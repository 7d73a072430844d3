//! Lattice wire protocol
//!
//! A controller, one broker and a pool of workers cooperate to evolve a
//! toroidal Game of Life board. Every edge in the diagram is a framed
//! JSON-RPC connection over TCP; both ends of an edge dial the other side,
//! so each connection carries requests in one direction only.
//!
//! ```text
//!  ┌────────────┐  StartGame / keys   ┌────────┐  DoTurn(halo)   ┌────────┐
//!  │ Controller │────────────────────►│ Broker │────────────────►│ Worker │
//!  │  (render)  │◄────────────────────│ (farm) │◄────────────────│ (strip)│
//!  └────────────┘  turn/alive reports └────────┘    fragment     └────────┘
//! ```
//!
//! ## Wire format
//! - Frames are a 4-byte big-endian length followed by a JSON body.
//! - Requests carry `{id, method, params}` where `method` is one of the
//!   stable `Server.*` / `Controller.*` / `Worker.*` strings.
//! - Replies echo the id: `{id, error?, body}`.
//!
//! ## Board encoding
//! Boards and strips travel as [`BitBoard`]s: row-major bits compressed with
//! run-length encoding (runs alternate starting from *dead*, capped at 255).

pub mod bitboard;
pub mod board;
pub mod rpc;
pub mod types;

pub use bitboard::BitBoard;
pub use board::{Board, Cell};
pub use rpc::{Handler, RpcClient};
pub use types::*;
