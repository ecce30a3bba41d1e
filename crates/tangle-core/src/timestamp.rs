use crate::peer_id::PeerId;

/// Simulation time, in the same units the Time Machine uses. Monotonic
/// non-decreasing in practice; small fractional offsets disambiguate
/// simultaneous local events.
pub type SimTime = f64;

/// Total order key used by the Time Machine to sequence calls. Ties on
/// `time` are broken by `player_id`, which is why `PeerId` must be `Ord`.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct TimeStamp {
    pub time: SimTime,
    pub player_id: PeerId,
}

impl TimeStamp {
    pub fn new(time: SimTime, player_id: PeerId) -> Self {
        Self { time, player_id }
    }
}

impl PartialOrd for TimeStamp {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Eq for TimeStamp {}

impl Ord for TimeStamp {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.time
            .partial_cmp(&other.time)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| self.player_id.cmp(&other.player_id))
    }
}

/// Per-peer offset generator for local call timestamps: a call's
/// `time` is `time_machine.target_time + offset`, and `offset`
/// increments by `STEP` after every local call so two calls issued in
/// the same tick still sort strictly after one another. `reset` is
/// called whenever wall-clock time actually advances (a new
/// `progress_time` tick), since at that point the target time itself
/// moved forward and no longer needs a manual nudge.
#[derive(Clone, Copy, Debug, Default)]
pub struct LocalOffset {
    offset: f64,
}

impl LocalOffset {
    const STEP: f64 = 1e-4;

    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the current offset and advances it by `STEP`.
    pub fn take(&mut self) -> f64 {
        let current = self.offset;
        self.offset += Self::STEP;
        current
    }

    pub fn reset(&mut self) {
        self.offset = 0.0;
    }
}
