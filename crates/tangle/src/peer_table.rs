use std::collections::HashMap;

use tangle_core::{PeerId, SimTime};

/// Per-peer liveness/latency bookkeeping. Only ever touched from
/// inside the serializer lane.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct PeerRecord {
    pub last_sent_message: SimTime,
    pub last_received_message: SimTime,
    pub round_trip_time_ms: f64,
}

impl PeerRecord {
    /// Created on peer-joined. `+inf` means "no upper bound known yet,
    /// cannot prune history on this peer's behalf."
    pub fn new_joined() -> Self {
        Self {
            last_sent_message: 0.0,
            last_received_message: f64::INFINITY,
            round_trip_time_ms: 0.0,
        }
    }
}

#[derive(Debug, Default)]
pub struct PeerTable {
    peers: HashMap<PeerId, PeerRecord>,
}

impl PeerTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert_joined(&mut self, peer: PeerId) {
        self.peers.insert(peer, PeerRecord::new_joined());
    }

    pub fn remove(&mut self, peer: &PeerId) -> Option<PeerRecord> {
        self.peers.remove(peer)
    }

    pub fn get(&self, peer: &PeerId) -> Option<&PeerRecord> {
        self.peers.get(peer)
    }

    pub fn get_mut(&mut self, peer: &PeerId) -> Option<&mut PeerRecord> {
        self.peers.get_mut(peer)
    }

    pub fn contains(&self, peer: &PeerId) -> bool {
        self.peers.contains_key(peer)
    }

    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }

    pub fn ids(&self) -> impl Iterator<Item = PeerId> + '_ {
        self.peers.keys().copied()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&PeerId, &PeerRecord)> {
        self.peers.iter()
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = (&PeerId, &mut PeerRecord)> {
        self.peers.iter_mut()
    }

    /// `min(last_received_message)` over all peers, or `+inf` if there
    /// are no peers (so it never constrains the pruning watermark by
    /// itself).
    pub fn min_last_received_message(&self) -> SimTime {
        self.peers
            .values()
            .map(|p| p.last_received_message)
            .fold(f64::INFINITY, f64::min)
    }
}
