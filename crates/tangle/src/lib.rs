//! Rollback-aware distributed execution coordinator: the "Tangle" that
//! sits above a single-peer deterministic Time Machine and a
//! peer-to-peer Room, so that every peer running an identical
//! sandboxed module converges on the same simulation state despite
//! unsynchronized clocks, variable latency, and out-of-order delivery.
//!
//! See `Tangle` for the public surface; `TimeMachine` and `Room` are
//! the collaborator traits an embedder implements.

mod config;
mod error;
mod peer_table;
mod room;
mod serializer;
mod state;
mod tangle;
mod time_machine;

pub use config::{NoImports, SetupArgs, TangleConfig};
pub use error::{Error, Result};
pub use peer_table::{PeerRecord, PeerTable};
pub use room::{Room, RoomEvent};
pub use state::{BufferedCall, CallArg, RoomState, TangleState};
pub use tangle::Tangle;
pub use time_machine::TimeMachine;

pub use tangle_core::{room_name_for_binary, stable_hash_hex, successor, LocalOffset, PeerId, SimTime, TimeStamp};

#[cfg(test)]
mod tests;
