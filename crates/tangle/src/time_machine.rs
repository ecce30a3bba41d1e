use tangle_core::{SimTime, TimeStamp};

/// The deterministic execution engine for a loaded module. Snapshotting,
/// rollback and the module loader live entirely on the other side of
/// this trait — the coordinator only ever calls through it.
///
/// Deliberately a synchronous trait, not an async one: the coordinator's
/// serializer lane (`serializer.rs`) already guarantees at most one
/// caller is ever inside these methods at a time, so there is nothing
/// for an executor to interleave here. An embedder backed by a real
/// sandboxed VM is free to implement this with interior blocking calls.
pub trait TimeMachine: Send + 'static {
    /// Host-provided import table threaded through to the sandbox at
    /// load time. Opaque to the coordinator.
    type Imports;

    /// Loads `binary` with `imports` and returns a ready-to-run engine.
    /// `fixed_update_interval` absent means variable-step mode.
    fn setup(
        binary: &[u8],
        imports: Self::Imports,
        fixed_update_interval: Option<std::time::Duration>,
    ) -> anyhow::Result<Self>
    where
        Self: Sized;

    /// Resolves an exported function by name to the index used by
    /// `call_with_time_stamp`/`call_and_revert`. `None` means the
    /// module exports no such function.
    fn get_function_export_index(&self, name: &str) -> Option<u32>;

    /// Executes `index` with `args` at `time_stamp`. Out-of-order
    /// delivery relative to already-applied history triggers a
    /// rollback-and-reapply inside the implementation; the coordinator
    /// does not observe this beyond the call returning.
    ///
    /// `authoritative` distinguishes a call that commits to history
    /// (local calls, remote `WasmCall`s) from a speculative one — this
    /// trait only exposes the authoritative path; see
    /// [`TimeMachine::call_and_revert`] for the speculative one.
    fn call_with_time_stamp(
        &mut self,
        index: u32,
        args: &[f64],
        time_stamp: TimeStamp,
    ) -> anyhow::Result<()>;

    /// Executes `index` with `args` speculatively, captures the
    /// module's return values, then reverts: no mutation survives the
    /// call, nothing is networked or recorded in rollback history.
    /// Useful for pure queries and rendering.
    fn call_and_revert(&mut self, index: u32, args: &[f64]) -> anyhow::Result<Vec<f64>>;

    /// Advances `target_time` by `delta_ms` (wall-clock milliseconds
    /// translated to simulation time by the implementation).
    fn progress_time(&mut self, delta_ms: f64);

    /// Runs one fixed-interval tick. Returns whether more work remains
    /// to reach `target_time` (`false` once `current_simulation_time`
    /// has caught up).
    fn step(&mut self) -> bool;

    /// Records a snapshot at the current simulation time so a later
    /// rollback can replay from it.
    fn take_snapshot(&mut self);

    /// Discards history strictly before `t`. Once called with a given
    /// `t`, no rollback to an earlier time may ever be requested again.
    fn remove_history_before(&mut self, t: SimTime);

    /// The time up to which the engine intends to advance.
    fn target_time(&self) -> SimTime;

    /// The time the engine has actually reached by stepping.
    fn current_simulation_time(&self) -> SimTime;

    /// `Some(interval_ms)` in fixed-step mode, `None` in variable-step
    /// mode.
    fn fixed_update_interval(&self) -> Option<f64>;

    /// Encodes the complete state as an opaque blob (the "heap").
    fn encode_state(&self) -> Vec<u8>;

    /// Replaces the complete state with the one encoded in `blob`.
    fn decode_and_apply(&mut self, blob: &[u8]) -> anyhow::Result<()>;

    fn read_memory(&self, addr: u32, len: u32) -> anyhow::Result<Vec<u8>>;

    fn read_string(&self, addr: u32, len: u32) -> anyhow::Result<String>;
}
