use bytes::Bytes;
use futures::Stream;
use tangle_core::PeerId;

use crate::state::RoomState;

/// An event the Room delivers to the coordinator: peer join/leave,
/// room-level connection state, and inbound messages, reshaped as a
/// single `Stream` item rather than four separate callbacks.
///
/// The Room must deliver events for a given peer in causal order
/// (`PeerJoined` before any `Message` from that peer, and before the
/// corresponding `PeerLeft`) — the coordinator relies on this instead
/// of maintaining a separate join-race buffer (see `DESIGN.md`).
#[derive(Clone, Debug, PartialEq)]
pub enum RoomEvent {
    PeerJoined(PeerId),
    PeerLeft(PeerId),
    StateChanged(RoomState),
    Message(PeerId, Bytes),
}

/// Per-peer ordered reliable datagram transport. Signaling, NAT
/// traversal and on-wire reliability/ordering are entirely the
/// implementation's concern.
pub trait Room: Send + Sync + 'static {
    /// Stream of events this instance delivers. Taken exactly once, at
    /// setup, by the pacing/dispatch task.
    type Events: Stream<Item = RoomEvent> + Send + Unpin;

    /// This room's own id, assigned once the transport connects.
    fn my_id(&self) -> PeerId;

    /// The peer with the lowest measured latency, used to pick a heap
    /// donor when requesting a fresh heap. `None` if there are no
    /// peers, or the transport has no latency estimate yet.
    fn get_lowest_latency_peer(&self) -> Option<PeerId>;

    /// Sends `bytes` to `peer`, or broadcasts to every peer in the room
    /// if `peer` is `None`.
    fn send_message(&self, bytes: Bytes, peer: Option<PeerId>);

    fn disconnect(&self);

    /// Takes ownership of the event stream. Must be called exactly
    /// once; subsequent calls may panic.
    fn take_events(&self) -> Self::Events;
}
