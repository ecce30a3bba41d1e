use std::fmt;

use serde::{Deserialize, Serialize};

/// Opaque, totally-ordered identifier for a room participant.
///
/// Only three things are ever done with a `PeerId`: it is used as a map
/// key, it is widened to `f64` so a module can receive it as a call
/// argument (see `CallArg::CallerId`), and its signed distance to
/// another `PeerId` is used to elect a unique "responsible" peer on
/// departure (see [`successor`]).
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct PeerId(pub u64);

impl PeerId {
    pub const fn new(id: u64) -> Self {
        Self(id)
    }

    /// Signed distance `self - other`, widened so it never overflows.
    pub fn distance(&self, other: &PeerId) -> i128 {
        self.0 as i128 - other.0 as i128
    }

    /// Numeric form substituted for the `CallArg::CallerId` sentinel.
    /// `PeerId`s are assumed to fit the 53 bits of f64
    /// mantissa precision; the room is not expected to run with more
    /// peer ids than that in a single process lifetime.
    pub fn as_f64(&self) -> f64 {
        self.0 as f64
    }
}

impl fmt::Debug for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "peer#{}", self.0)
    }
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Elects the peer responsible for announcing `departed`'s exit to the
/// module: the remaining peer whose id minus `departed`'s id is the
/// smallest *positive* value. Every peer (including `departed` itself,
/// were it still around) runs this same pure function over the same
/// peer set and arrives at the same answer, so exactly one of them
/// finds itself as the elected peer and invokes `peer_left`.
///
/// Returns `None` if `remaining` is empty or no peer has a positive
/// distance to `departed` (can only happen if `remaining` is empty,
/// since distance is never zero for a set excluding `departed`).
pub fn successor(remaining: impl IntoIterator<Item = PeerId>, departed: PeerId) -> Option<PeerId> {
    remaining
        .into_iter()
        .filter_map(|candidate| {
            let d = candidate.distance(&departed);
            (d > 0).then_some((d, candidate))
        })
        .min_by_key(|(d, _)| *d)
        .map(|(_, candidate)| candidate)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn distance_is_signed() {
        let a = PeerId::new(2);
        let b = PeerId::new(5);
        assert_eq!(b.distance(&a), 3);
        assert_eq!(a.distance(&b), -3);
    }

    #[test]
    fn successor_picks_smallest_positive_distance() {
        // peers {1, 2, 5}; peer 2 departs. 1-2=-1 (rejected), 5-2=3 (elected).
        let remaining = [PeerId::new(1), PeerId::new(5)];
        assert_eq!(successor(remaining, PeerId::new(2)), Some(PeerId::new(5)));
    }

    #[test]
    fn successor_is_unique_across_every_remaining_peer_view() {
        // Every remaining peer runs the same election over the same set
        // and must agree on the same elected peer.
        let all = [
            PeerId::new(1),
            PeerId::new(2),
            PeerId::new(5),
            PeerId::new(9),
        ];
        let departed = PeerId::new(2);
        let remaining: Vec<_> = all.iter().copied().filter(|p| *p != departed).collect();

        let elected = successor(remaining.iter().copied(), departed);
        assert_eq!(elected, Some(PeerId::new(5)));

        // Exhaustively check: exactly one peer in `remaining` is the elected one.
        let winners = remaining.iter().filter(|p| Some(**p) == elected).count();
        assert_eq!(winners, 1);
    }

    #[test]
    fn successor_none_when_alone() {
        assert_eq!(successor(std::iter::empty(), PeerId::new(2)), None);
    }

    #[test]
    fn successor_exhaustive_over_small_universe() {
        // For every subset of a small id universe and every departed id in it,
        // there is at most one elected peer, and it has the smallest positive
        // distance by brute force comparison.
        let universe: Vec<PeerId> = (0..12).map(PeerId::new).collect();
        for &departed in &universe {
            let remaining: Vec<PeerId> = universe.iter().copied().filter(|p| *p != departed).collect();
            let elected = successor(remaining.iter().copied(), departed);

            let expected = remaining
                .iter()
                .copied()
                .filter(|p| p.distance(&departed) > 0)
                .min_by_key(|p| p.distance(&departed));

            assert_eq!(elected, expected, "departed={departed:?}");
        }
    }
}
