use std::sync::Arc;
use std::time::Duration;

use crate::state::TangleState;

/// Tunables controlling the pacing loop and bootstrap behavior. Every
/// magic number from the pacing algorithm is a `Default`-backed field
/// here rather than hardcoded.
#[derive(Clone)]
pub struct TangleConfig {
    /// Absent means variable-step mode: `progress_time` runs once per
    /// local/remote call and `step()` is invoked opportunistically.
    /// Present means fixed-step mode: a background interval task also
    /// drives `progress_time` on this cadence.
    pub fixed_update_interval: Option<Duration>,

    /// Gates the (reserved, unimplemented) `SetProgram` inbound branch.
    pub accept_new_programs: bool,

    /// Falls back to the ambient default room name (`tangle`) if unset;
    /// the stable hash of the program binary is always appended.
    pub room_name: Option<String>,

    /// Optional closure-based notification, for parity with the
    /// source's callback-based `on_state_change`. `Tangle::subscribe()`
    /// is the idiomatic alternative and receives every transition too.
    /// `Arc` rather than `Box` so `TangleConfig` stays `Clone`.
    pub on_state_change: Option<Arc<dyn Fn(TangleState) + Send + Sync>>,

    /// How far `target_time` may run ahead of `current_simulation_time`
    /// before a fixed-step peer is considered unrecoverably behind and
    /// requests a fresh heap.
    pub divergence_guard: Duration,

    /// Peers quieter than this for longer are sent a keep-alive
    /// `TimeProgressed` hint so their pruning watermark can still move.
    pub keep_alive_interval: Duration,

    /// Safety cushion subtracted from the computed pruning watermark
    /// before calling `remove_history_before`. See the open design
    /// note on the pruning boundary in `DESIGN.md`.
    pub pruning_cushion: Duration,

    /// Fraction of the wall-clock elapsed time each `progress_time`
    /// tick is allowed to spend stepping the Time Machine before
    /// yielding back to the embedder.
    pub pacing_budget_fraction: f64,
}

impl TangleConfig {
    pub const DEFAULT_ROOM_NAME: &'static str = "tangle";
}

impl Default for TangleConfig {
    fn default() -> Self {
        Self {
            fixed_update_interval: None,
            accept_new_programs: false,
            room_name: None,
            on_state_change: None,
            divergence_guard: Duration::from_millis(2000),
            keep_alive_interval: Duration::from_millis(200),
            pruning_cushion: Duration::from_millis(50),
            pacing_budget_fraction: 0.7,
        }
    }
}

impl std::fmt::Debug for TangleConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TangleConfig")
            .field("fixed_update_interval", &self.fixed_update_interval)
            .field("accept_new_programs", &self.accept_new_programs)
            .field("room_name", &self.room_name)
            .field("has_on_state_change", &self.on_state_change.is_some())
            .field("divergence_guard", &self.divergence_guard)
            .field("keep_alive_interval", &self.keep_alive_interval)
            .field("pruning_cushion", &self.pruning_cushion)
            .field("pacing_budget_fraction", &self.pacing_budget_fraction)
            .finish()
    }
}

/// Bootstrap-time inputs that are not tunables: the module binary, its
/// host-provided import table, and who we are once the room assigns us
/// an id (supplied by the `Room` at connect time, not here).
pub struct SetupArgs<I> {
    pub binary: Vec<u8>,
    pub imports: I,
    pub config: TangleConfig,
}

/// Placeholder used when an embedder has no import table to thread
/// through (most test doubles).
pub type NoImports = ();

pub(crate) fn room_name_for(config_room_name: &Option<String>, binary: &[u8]) -> String {
    let base = config_room_name
        .as_deref()
        .unwrap_or(TangleConfig::DEFAULT_ROOM_NAME);
    tangle_core::room_name_for_binary(base, binary)
}
