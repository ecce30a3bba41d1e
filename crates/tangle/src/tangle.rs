use std::collections::VecDeque;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use bytes::Bytes;
use futures::StreamExt;
use tangle_core::{PeerId, TimeStamp};
use tangle_protocol::Message;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, trace, warn};

use crate::config::{room_name_for, SetupArgs, TangleConfig};
use crate::error::{Error, Result};
use crate::peer_table::PeerTable;
use crate::room::{Room, RoomEvent};
use crate::serializer::Lane;
use crate::state::{BufferedCall, CallArg, RoomState, TangleState};
use crate::time_machine::TimeMachine;

fn now_ms(epoch: SystemTime) -> f64 {
    SystemTime::now()
        .duration_since(epoch)
        .unwrap_or_default()
        .as_secs_f64()
        * 1000.0
}

/// The rollback-aware distributed execution coordinator. Sits above a
/// [`TimeMachine`] (single-peer deterministic engine) and a [`Room`]
/// (ordered per-peer transport); owns the peer table, the lifecycle
/// state and the buffered-call queue. Both collaborators live inside
/// the serializer lane (`Inner`), since every operation that touches
/// either one must run under the same reentrancy discipline.
pub struct Tangle<TM: TimeMachine, R: Room> {
    lane: Lane<Inner<TM, R>>,
    config: TangleConfig,
    room_name: String,
    my_id: PeerId,
    state_tx: watch::Sender<TangleState>,
    cancel: CancellationToken,
}

struct Inner<TM: TimeMachine, R: Room> {
    time_machine: TM,
    room: R,
    peer_table: PeerTable,
    tangle_state: TangleState,
    buffered_calls: VecDeque<BufferedCall>,
    local_offset: tangle_core::LocalOffset,
    last_performance_now: Option<tokio::time::Instant>,
    my_id: PeerId,
    config: TangleConfig,
    state_tx: watch::Sender<TangleState>,
    epoch: SystemTime,
}

impl<TM: TimeMachine, R: Room> Tangle<TM, R> {
    /// Bootstraps a coordinator: loads the Time Machine with
    /// `args.binary`/`args.imports`, derives the room name from the
    /// stable hash of the binary, takes ownership of the Room's event
    /// stream and starts the event loop (and, in fixed-step mode, the
    /// pacing task). Starts `Disconnected`.
    pub fn setup(args: SetupArgs<TM::Imports>, room: R) -> anyhow::Result<Arc<Self>> {
        let time_machine = TM::setup(&args.binary, args.imports, args.config.fixed_update_interval)?;
        let room_name = room_name_for(&args.config.room_name, &args.binary);
        let my_id = room.my_id();
        let (state_tx, _rx) = watch::channel(TangleState::Disconnected);
        let events = room.take_events();

        let inner = Inner {
            time_machine,
            room,
            peer_table: PeerTable::new(),
            tangle_state: TangleState::Disconnected,
            buffered_calls: VecDeque::new(),
            local_offset: tangle_core::LocalOffset::new(),
            last_performance_now: None,
            my_id,
            config: args.config.clone(),
            state_tx: state_tx.clone(),
            epoch: UNIX_EPOCH,
        };

        let this = Arc::new(Self {
            lane: Lane::new(inner),
            config: args.config,
            room_name,
            my_id,
            state_tx,
            cancel: CancellationToken::new(),
        });

        tokio::spawn(run_event_loop(this.clone(), events));
        if let Some(interval) = this.config.fixed_update_interval {
            tokio::spawn(run_pacing_interval(this.clone(), interval));
        }

        Ok(this)
    }

    pub fn room_name(&self) -> &str {
        &self.room_name
    }

    pub fn my_id(&self) -> PeerId {
        self.my_id
    }

    /// Current lifecycle state, snapshotted (not serialized through the
    /// lane — `watch` already guarantees a consistent last-sent value).
    pub fn state(&self) -> TangleState {
        *self.state_tx.subscribe().borrow()
    }

    /// A receiver that observes every lifecycle transition exactly
    /// once. `TangleConfig::on_state_change`, if set, is additionally
    /// invoked from inside the serializer lane for callers that prefer
    /// a callback to a channel.
    pub fn subscribe(&self) -> watch::Receiver<TangleState> {
        self.state_tx.subscribe()
    }

    /// Local call path: resolves `name`, substitutes
    /// [`CallArg::CallerId`] with this peer's id, executes
    /// authoritatively, and broadcasts a `WasmCall` to every peer.
    /// Silently dropped if `name` does not resolve to an export.
    pub fn call(self: &Arc<Self>, name: impl Into<String> + Send + 'static, args: Vec<CallArg>) {
        self.lane.submit(
            move |inner| {
                let name = name.into();
                inner.do_local_call(&name, &args)
            },
            false,
        );
    }

    /// Executes `name` speculatively and reverts; never networked,
    /// never recorded in rollback history.
    pub async fn call_and_revert(
        &self,
        name: impl Into<String> + Send + 'static,
        args: Vec<CallArg>,
    ) -> Result<Vec<f64>> {
        let rx = self.lane.submit_for_result(move |inner| {
            let name = name.into();
            inner.do_call_and_revert(&name, &args)
        });
        rx.await.map_err(|_| Error::Disconnected)?
    }

    pub async fn read_memory(&self, addr: u32, len: u32) -> Result<Vec<u8>> {
        let rx = self
            .lane
            .submit_for_result(move |inner| inner.time_machine.read_memory(addr, len));
        rx.await.map_err(|_| Error::Disconnected)?.map_err(Error::from)
    }

    pub async fn read_string(&self, addr: u32, len: u32) -> Result<String> {
        let rx = self
            .lane
            .submit_for_result(move |inner| inner.time_machine.read_string(addr, len));
        rx.await.map_err(|_| Error::Disconnected)?.map_err(Error::from)
    }

    /// Requests a fresh heap from the lowest-latency peer.
    pub fn resync(self: &Arc<Self>) {
        self.lane.submit(|inner| inner.begin_heap_request(), false);
    }

    /// Drives the pacing loop. Called by the embedder's tick driver,
    /// and internally after each call in variable-step mode, and on a
    /// background interval in fixed-step mode.
    pub fn progress_time(self: &Arc<Self>) {
        self.lane.submit(|inner| inner.run_pacing_tick(), false);
    }

    pub fn disconnect(&self) {
        self.cancel.cancel();
        self.lane.submit(|inner| inner.room.disconnect(), false);
    }
}

async fn run_event_loop<TM: TimeMachine, R: Room>(tangle: Arc<Tangle<TM, R>>, mut events: R::Events) {
    loop {
        tokio::select! {
            _ = tangle.cancel.cancelled() => return,
            event = events.next() => {
                let Some(event) = event else { return };
                tangle.lane.submit(move |inner| inner.handle_room_event(event), false);
            }
        }
    }
}

async fn run_pacing_interval<TM: TimeMachine, R: Room>(tangle: Arc<Tangle<TM, R>>, interval: Duration) {
    let mut ticker = tokio::time::interval(interval);
    loop {
        tokio::select! {
            _ = tangle.cancel.cancelled() => return,
            _ = ticker.tick() => tangle.progress_time(),
        }
    }
}

impl<TM: TimeMachine, R: Room> Inner<TM, R> {
    fn transition(&mut self, new_state: TangleState) {
        if self.tangle_state == new_state {
            return;
        }
        debug!(from = ?self.tangle_state, to = ?new_state, "tangle state transition");
        self.tangle_state = new_state;
        if new_state == TangleState::Connected {
            self.last_performance_now = Some(tokio::time::Instant::now());
        }
        let _ = self.state_tx.send(new_state);
        if let Some(cb) = &self.config.on_state_change {
            cb(new_state);
        }
    }

    fn handle_room_event(&mut self, event: RoomEvent) {
        match event {
            RoomEvent::PeerJoined(peer) => self.on_peer_joined(peer),
            RoomEvent::PeerLeft(peer) => self.on_peer_left(peer),
            RoomEvent::StateChanged(state) => self.on_room_state_changed(state),
            RoomEvent::Message(peer, bytes) => self.dispatch(peer, bytes),
        }
    }

    fn on_peer_joined(&mut self, peer: PeerId) {
        trace!(?peer, "peer joined");
        self.peer_table.insert_joined(peer);
        self.room.send_message(
            Message::Ping {
                wall_clock_ms: now_ms(self.epoch),
            }
            .serialize(),
            Some(peer),
        );
    }

    /// On departure, every remaining peer runs the same deterministic
    /// election over the same remaining set; exactly one of them finds
    /// itself elected and invokes the module's `peer_left` export,
    /// which then propagates to everyone else as an ordinary
    /// `WasmCall`.
    fn on_peer_left(&mut self, peer: PeerId) {
        trace!(?peer, "peer left");
        self.peer_table.remove(&peer);
        let candidates = self
            .peer_table
            .ids()
            .chain(std::iter::once(self.my_id))
            .filter(|&p| p != peer);
        if tangle_core::successor(candidates, peer) == Some(self.my_id) {
            debug!(?peer, "elected to announce peer departure");
            match self.time_machine.get_function_export_index("peer_left") {
                Some(index) => self.execute_and_broadcast(index, &[peer.as_f64()]),
                None => trace!("module exports no peer_left; nothing to announce"),
            }
        }
    }

    fn on_room_state_changed(&mut self, state: RoomState) {
        match state {
            RoomState::Connected => {
                if self.peer_table.is_empty() {
                    self.transition(TangleState::Connected);
                } else {
                    self.begin_heap_request();
                }
            }
            RoomState::Joining | RoomState::Disconnected => {
                self.transition(TangleState::Disconnected);
            }
        }
    }

    /// Primes RTT with a Ping, then requests the full state from the
    /// lowest-latency peer.
    fn begin_heap_request(&mut self) {
        let Some(peer) = self.room.get_lowest_latency_peer() else {
            warn!("heap request requested but no peer available");
            return;
        };
        self.room.send_message(
            Message::Ping {
                wall_clock_ms: now_ms(self.epoch),
            }
            .serialize(),
            Some(peer),
        );
        self.room.send_message(Message::RequestState.serialize(), Some(peer));
        self.transition(TangleState::RequestingHeap);
    }

    fn dispatch(&mut self, peer: PeerId, bytes: Bytes) {
        if !self.peer_table.contains(&peer) {
            warn!(?peer, "message from peer with no peer record; dropping");
            return;
        }
        let msg = match Message::deserialize(&bytes) {
            Ok(m) => m,
            Err(e) => {
                warn!(?peer, error = %e, "malformed message; dropping");
                return;
            }
        };
        match msg {
            Message::WasmCall {
                function_index,
                time,
                args,
            } => self.dispatch_wasm_call(peer, function_index, time, args),
            Message::TimeProgressed { time } => match self.peer_table.get_mut(&peer) {
                Some(record) => record.last_received_message = time,
                None => error!(error = %Error::BugPeerNotFound(peer), "peer record vanished after dispatch's own contains-check"),
            },
            Message::RequestState => {
                let blob = self.time_machine.encode_state();
                self.room.send_message(
                    Message::SetHeap {
                        blob: Bytes::from(blob),
                    }
                    .serialize(),
                    None,
                );
            }
            Message::SetProgram { .. } => {
                if self.config.accept_new_programs {
                    warn!(error = %Error::SetProgramNotImplemented, "dropping message");
                } else {
                    trace!("ignoring reserved SetProgram message (accept_new_programs disabled)");
                }
            }
            Message::SetHeap { blob } => self.dispatch_set_heap(peer, blob),
            ref ping @ Message::Ping { .. } => {
                let pong = Message::pong_for(ping).expect("just matched Ping");
                self.room.send_message(pong.serialize(), Some(peer));
            }
            Message::Pong { wall_clock_ms } => match self.peer_table.get_mut(&peer) {
                Some(record) => record.round_trip_time_ms = (now_ms(self.epoch) - wall_clock_ms).max(0.0),
                None => error!(error = %Error::BugPeerNotFound(peer), "peer record vanished after dispatch's own contains-check"),
            },
        }
    }

    fn dispatch_wasm_call(&mut self, peer: PeerId, function_index: u32, time: f64, args: Vec<f64>) {
        match self.peer_table.get_mut(&peer) {
            Some(record) => record.last_received_message = time,
            None => error!(error = %Error::BugPeerNotFound(peer), "peer record vanished after dispatch's own contains-check"),
        }
        match self.tangle_state {
            TangleState::RequestingHeap => {
                self.buffered_calls.push_back(BufferedCall {
                    function_index,
                    time_stamp: TimeStamp::new(time, peer),
                    args,
                });
            }
            _ => {
                let ts = TimeStamp::new(time, peer);
                if let Err(e) = self.time_machine.call_with_time_stamp(function_index, &args, ts) {
                    error!(?peer, error = %e, "remote call failed");
                }
                if self.config.fixed_update_interval.is_none() {
                    self.run_pacing_tick();
                }
            }
        }
    }

    /// `SetHeap` handler: only honored while not already `Connected`
    /// (prevents rejoin storms). Buffered calls accumulated during
    /// `RequestingHeap` are replayed in arrival order before the state
    /// transitions.
    fn dispatch_set_heap(&mut self, peer: PeerId, blob: Bytes) {
        if self.tangle_state == TangleState::Connected {
            trace!(?peer, "ignoring SetHeap received while already connected");
            return;
        }
        if let Err(e) = self.time_machine.decode_and_apply(&blob) {
            error!(?peer, error = %e, "failed to apply SetHeap; staying in RequestingHeap");
            return;
        }
        for call in std::mem::take(&mut self.buffered_calls) {
            if let Err(e) = self
                .time_machine
                .call_with_time_stamp(call.function_index, &call.args, call.time_stamp)
            {
                error!(error = %e, "failed to replay buffered call");
            }
        }
        let rtt = match self.peer_table.get(&peer) {
            Some(record) => record.round_trip_time_ms,
            None => {
                error!(error = %Error::BugPeerNotFound(peer), "peer record vanished after dispatch's own contains-check");
                0.0
            }
        };
        self.time_machine.progress_time(rtt / 2.0);
        self.transition(TangleState::Connected);
    }

    fn do_local_call(&mut self, name: &str, args: &[CallArg]) {
        let Some(index) = self.time_machine.get_function_export_index(name) else {
            trace!(name, "unknown function name; dropping local call");
            return;
        };
        let resolved: Vec<f64> = args.iter().map(|a| a.resolve(self.my_id)).collect();
        self.execute_and_broadcast(index, &resolved);
    }

    /// Shared between `call()` and the `peer_left` election outcome:
    /// build a strictly-increasing timestamp, execute authoritatively,
    /// broadcast the `WasmCall`, and bump every peer's conservative
    /// pruning upper bound.
    fn execute_and_broadcast(&mut self, index: u32, args: &[f64]) {
        let time = self.time_machine.target_time() + self.local_offset.take();
        let ts = TimeStamp::new(time, self.my_id);
        if let Err(e) = self.time_machine.call_with_time_stamp(index, args, ts) {
            error!(error = %e, "local call failed");
            return;
        }
        let wire = Message::WasmCall {
            function_index: index,
            time,
            args: args.to_vec(),
        }
        .serialize();
        self.room.send_message(wire, None);
        for (_, record) in self.peer_table.iter_mut() {
            record.last_sent_message = record.last_received_message.max(time);
        }
        if self.config.fixed_update_interval.is_none() {
            self.run_pacing_tick();
        }
    }

    fn do_call_and_revert(&mut self, name: &str, args: &[CallArg]) -> Result<Vec<f64>> {
        let Some(index) = self.time_machine.get_function_export_index(name) else {
            trace!(name, "unknown function name; dropping call_and_revert");
            return Ok(Vec::new());
        };
        let resolved: Vec<f64> = args.iter().map(|a| a.resolve(self.my_id)).collect();
        Ok(self.time_machine.call_and_revert(index, &resolved)?)
    }

    /// The pacing loop. Driven by the embedder, by the fixed-step
    /// interval task, and inline after every local/remote call in
    /// variable-step mode: divergence check, advance the clock, step
    /// the engine within budget, prune history, send keep-alives.
    ///
    /// Runs inline within whichever job already holds the lane rather
    /// than re-entering it, since `TimeMachine` is a synchronous trait
    /// (see its doc comment) with no suspension point to protect
    /// against — recorded as a deliberate simplification in
    /// `DESIGN.md`.
    fn run_pacing_tick(&mut self) {
        let now = tokio::time::Instant::now();
        let last = match self.last_performance_now {
            Some(last) => last,
            None => {
                self.last_performance_now = Some(now);
                return;
            }
        };
        let elapsed = now.saturating_duration_since(last);
        let mut elapsed_ms = elapsed.as_secs_f64() * 1000.0;

        if let Some(interval) = self.config.fixed_update_interval {
            let target = self.time_machine.target_time();
            let current = self.time_machine.current_simulation_time();
            let guard_ms = self.config.divergence_guard.as_secs_f64() * 1000.0;
            if (target + elapsed_ms) - current > guard_ms {
                warn!(lag_ms = (target + elapsed_ms) - current, "divergence guard tripped");
                elapsed_ms = interval.as_secs_f64() * 1000.0;
                if !self.peer_table.is_empty() {
                    self.begin_heap_request();
                } // else single-peer: absorb the clock jump silently
            }
        }

        self.time_machine.progress_time(elapsed_ms);

        // Step 5: backpressure. A peer that cannot keep up spends the
        // whole budget stepping but never blocks the embedder longer
        // than that.
        let budget = Duration::from_secs_f64((elapsed.as_secs_f64() * self.config.pacing_budget_fraction).max(0.0));
        let step_deadline = std::time::Instant::now() + budget;
        loop {
            let more_work = self.time_machine.step();
            self.time_machine.take_snapshot();
            if !more_work || std::time::Instant::now() >= step_deadline {
                break;
            }
        }

        // Step 6: history pruning, with the known 50ms cushion (see
        // DESIGN.md's open-question log).
        let earliest_safe = self
            .time_machine
            .current_simulation_time()
            .min(self.peer_table.min_last_received_message());
        let cushion_ms = self.config.pruning_cushion.as_secs_f64() * 1000.0;
        if earliest_safe.is_finite() {
            self.time_machine.remove_history_before(earliest_safe - cushion_ms);
        }

        // Step 7: keep-alives so idle peers still advance each other's
        // pruning watermark.
        let target_time = self.time_machine.target_time();
        let keep_alive_ms = self.config.keep_alive_interval.as_secs_f64() * 1000.0;
        for (peer, record) in self.peer_table.iter() {
            if target_time - record.last_sent_message > keep_alive_ms {
                self.room
                    .send_message(Message::TimeProgressed { time: target_time }.serialize(), Some(*peer));
            }
        }

        if elapsed_ms > 0.0 {
            self.local_offset.reset();
        }
        self.last_performance_now = Some(now);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tests::test_util::FakeTimeMachine;
    use std::sync::Mutex;

    #[derive(Default)]
    struct NullRoom {
        sent: Mutex<Vec<(Option<PeerId>, Bytes)>>,
    }

    impl Room for NullRoom {
        type Events = futures::stream::Empty<RoomEvent>;

        fn my_id(&self) -> PeerId {
            PeerId::new(1)
        }

        fn get_lowest_latency_peer(&self) -> Option<PeerId> {
            Some(PeerId::new(2))
        }

        fn send_message(&self, bytes: Bytes, peer: Option<PeerId>) {
            self.sent.lock().unwrap().push((peer, bytes));
        }

        fn disconnect(&self) {}

        fn take_events(&self) -> Self::Events {
            futures::stream::empty()
        }
    }

    fn fresh_inner(fixed_update_interval: Option<Duration>) -> Inner<FakeTimeMachine, NullRoom> {
        let time_machine = FakeTimeMachine::setup(b"fake-module", (), fixed_update_interval).unwrap();
        let (state_tx, _rx) = watch::channel(TangleState::Disconnected);
        Inner {
            time_machine,
            room: NullRoom::default(),
            peer_table: PeerTable::new(),
            tangle_state: TangleState::Disconnected,
            buffered_calls: VecDeque::new(),
            local_offset: tangle_core::LocalOffset::new(),
            last_performance_now: None,
            my_id: PeerId::new(1),
            config: TangleConfig {
                fixed_update_interval,
                ..TangleConfig::default()
            },
            state_tx,
            epoch: UNIX_EPOCH,
        }
    }

    #[test]
    fn divergence_guard_trips_and_requests_heap_when_behind() {
        let mut inner = fresh_inner(Some(Duration::from_millis(16)));
        inner.config.divergence_guard = Duration::from_millis(5);
        inner.peer_table.insert_joined(PeerId::new(2));
        inner.transition(TangleState::Connected);

        std::thread::sleep(Duration::from_millis(50));
        inner.run_pacing_tick();

        assert_eq!(inner.tangle_state, TangleState::RequestingHeap);
    }

    #[test]
    fn variable_step_peer_never_trips_the_divergence_guard() {
        // No fixed_update_interval means no divergence check at all:
        // a variable-step peer advances by however much wall-clock
        // elapsed, so there is nothing to fall behind.
        let mut inner = fresh_inner(None);
        inner.peer_table.insert_joined(PeerId::new(2));
        inner.transition(TangleState::Connected);

        std::thread::sleep(Duration::from_millis(20));
        inner.run_pacing_tick();

        assert_eq!(inner.tangle_state, TangleState::Connected);
    }

    #[test]
    fn set_heap_is_ignored_while_already_connected() {
        let mut inner = fresh_inner(None);
        inner.peer_table.insert_joined(PeerId::new(2));
        inner.transition(TangleState::Connected);
        inner.do_local_call("inc", &[]);

        let before = inner.time_machine.read_memory(0, 8).unwrap();
        inner.dispatch_set_heap(PeerId::new(2), Bytes::from(vec![0u8; 33]));
        let after = inner.time_machine.read_memory(0, 8).unwrap();

        assert_eq!(before, after);
        assert_eq!(inner.tangle_state, TangleState::Connected);
    }

    #[test]
    fn unknown_function_name_is_silently_dropped() {
        let mut inner = fresh_inner(None);
        inner.peer_table.insert_joined(PeerId::new(2));
        inner.transition(TangleState::Connected);

        inner.do_local_call("does_not_exist", &[]);

        assert!(inner.room.sent.lock().unwrap().is_empty());
    }

    #[test]
    fn set_program_is_dropped_whether_or_not_new_programs_are_accepted() {
        for accept in [false, true] {
            let mut inner = fresh_inner(None);
            inner.peer_table.insert_joined(PeerId::new(2));
            inner.config.accept_new_programs = accept;
            let before = inner.room.sent.lock().unwrap().len();

            inner.dispatch(
                PeerId::new(2),
                Message::SetProgram {
                    binary: Bytes::from_static(b"new"),
                }
                .serialize(),
            );

            assert_eq!(inner.room.sent.lock().unwrap().len(), before);
        }
    }
}
