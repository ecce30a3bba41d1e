use tangle_protocol::MessageDeserializeError;

/// Errors surfaced by the local API. Per the wire-level policy, nothing
/// encountered while dispatching an inbound message or running the
/// pacing loop ever becomes one of these — those are logged and
/// absorbed where they occur. These variants are reserved for local-API
/// misuse and the one genuinely reserved/unimplemented wire branch.
#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("tangle is disconnected")]
    Disconnected,

    #[error(transparent)]
    Deserialize(#[from] MessageDeserializeError),

    #[error("SetProgram received but no inbound handler is implemented; accept_new_programs was set")]
    SetProgramNotImplemented,

    #[error("bug: peer record missing for {0:?}")]
    BugPeerNotFound(tangle_core::PeerId),

    #[error(transparent)]
    TimeMachine(#[from] anyhow::Error),
}

pub type Result<T> = core::result::Result<T, Error>;
