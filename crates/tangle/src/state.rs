use tangle_core::{PeerId, TimeStamp};

/// Lifecycle state of a `Tangle` instance.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TangleState {
    /// Transport is not connected, or is connected but bootstrap has
    /// not completed.
    Disconnected,
    /// A full-state dump has been requested from a peer; inbound calls
    /// are buffered rather than executed.
    RequestingHeap,
    /// Calls execute immediately and heap requests are served.
    Connected,
}

/// Connectivity state reported by the Room collaborator.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RoomState {
    Connected,
    Joining,
    Disconnected,
}

/// A call argument as seen by local call sites. `CallerId` is a typed
/// "substitute the caller's id" sentinel (see `DESIGN.md`'s note on the
/// substitution asymmetry): it is resolved to the local `PeerId`'s
/// numeric form at the moment the call is processed inside the
/// serializer, before it is either executed or put on the wire.
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum CallArg {
    Number(f64),
    CallerId,
}

impl CallArg {
    pub fn resolve(self, local_id: PeerId) -> f64 {
        match self {
            CallArg::Number(n) => n,
            CallArg::CallerId => local_id.as_f64(),
        }
    }
}

/// A WasmCall received while `RequestingHeap`, held until `SetHeap` is
/// applied and then replayed in arrival order.
#[derive(Clone, Debug, PartialEq)]
pub struct BufferedCall {
    pub function_index: u32,
    pub time_stamp: TimeStamp,
    pub args: Vec<f64>,
}
