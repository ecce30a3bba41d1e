use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::Mutex;

/// A single logical execution lane: a reentrancy-safe, single-threaded
/// cooperative scheduler over some owned state `S`.
///
/// Every mutating entry point on `Tangle` — a local call, an inbound
/// message, a peer-joined/left/state-change event, a `progress_time`
/// tick, a `resync` — is a `Job` submitted here. The contract:
///
/// - If no job is currently running and the caller did not request
///   `enqueue_only`, the job runs immediately, inline, on the caller's
///   task; once it returns, the pending queue is drained FIFO before
///   the lane is released.
/// - Otherwise (a job is already running, or the caller asked to only
///   enqueue) the job is appended to the pending queue and run later by
///   whichever job currently holds the lane.
///
/// No preemption, no OS thread or async task per submission: just an
/// atomic "someone is running" flag plus a plain FIFO.
pub struct Lane<S> {
    state: Mutex<S>,
    running: AtomicBool,
    pending: Mutex<VecDeque<Job<S>>>,
}

type Job<S> = Box<dyn FnOnce(&mut S) + Send>;

impl<S> Lane<S> {
    pub fn new(state: S) -> Self {
        Self {
            state: Mutex::new(state),
            running: AtomicBool::new(false),
            pending: Mutex::new(VecDeque::new()),
        }
    }

    /// Submits `job`. See the type docs for the enqueue contract.
    pub fn submit(&self, job: impl FnOnce(&mut S) + Send + 'static, enqueue_only: bool) {
        let job: Job<S> = Box::new(job);
        if enqueue_only || self.running.swap(true, Ordering::AcqRel) {
            self.pending.lock().push_back(job);
            // The lane might have gone idle between our `swap` and this
            // push (e.g. we requested enqueue_only on an idle lane) —
            // make sure an idle lane still drains it.
            self.try_drain();
            return;
        }
        self.run_then_drain(job);
    }

    /// Submits a job that computes a value the submitter needs back —
    /// `call_and_revert`, `read_memory`, `read_string`. Works whether
    /// the job ends up running inline or deferred behind a currently
    /// running job: the `oneshot` is filled either way, so `await`ing
    /// the receiver never blocks a worker thread.
    pub fn submit_for_result<T: Send + 'static>(
        &self,
        job: impl FnOnce(&mut S) -> T + Send + 'static,
    ) -> tokio::sync::oneshot::Receiver<T> {
        let (tx, rx) = tokio::sync::oneshot::channel();
        self.submit(
            move |state| {
                let _ = tx.send(job(state));
            },
            false,
        );
        rx
    }

    fn try_drain(&self) {
        if self.running.swap(true, Ordering::AcqRel) {
            // Someone else is running (or about to): they will drain.
            return;
        }
        self.drain_until_released();
    }

    fn run_then_drain(&self, job: Job<S>) {
        job(&mut self.state.lock());
        self.drain_until_released();
    }

    /// Drains `pending` and releases the lane, looping if a submitter
    /// raced the release.
    ///
    /// A single `drain_pending` followed by an unconditional
    /// `running.store(false, ..)` has a gap: a submitter's `swap` can
    /// observe `running == true` and defer its job to us, but only
    /// *after* our last empty pop inside `drain_pending` — we would
    /// then release the lane with that job still sitting unrun, and
    /// nothing is left to pick it up until some unrelated future
    /// `submit()` happens to find the lane idle. So every release is
    /// immediately followed by a re-check of `pending`: if it gained
    /// an entry in that window, we try to reclaim the lane (another
    /// thread may have beaten us to it, in which case draining is now
    /// its responsibility) and loop.
    fn drain_until_released(&self) {
        loop {
            self.drain_pending();
            self.running.store(false, Ordering::Release);
            if self.pending.lock().is_empty() {
                return;
            }
            if self.running.swap(true, Ordering::AcqRel) {
                return;
            }
        }
    }

    fn drain_pending(&self) {
        loop {
            let next = self.pending.lock().pop_front();
            match next {
                Some(job) => job(&mut self.state.lock()),
                None => break,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn idle_lane_runs_inline() {
        let lane = Lane::new(0i32);
        lane.submit(|s| *s += 1, false);
        assert_eq!(*lane.state.lock(), 1);
    }

    #[test]
    fn reentrant_submission_is_enqueued_and_drained_in_fifo_order() {
        let lane = Arc::new(Lane::new(Vec::<i32>::new()));
        let inner = lane.clone();
        lane.submit(
            move |s: &mut Vec<i32>| {
                s.push(1);
                // Reentrant submission from inside a running job: must
                // be deferred, not run out of order.
                inner.submit(|s| s.push(2), false);
                s.push(3);
            },
            false,
        );
        assert_eq!(*lane.state.lock(), vec![1, 3, 2]);
    }

    #[test]
    fn enqueue_only_defers_even_on_an_idle_lane_but_still_runs() {
        let lane = Lane::new(0i32);
        lane.submit(|s| *s += 1, true);
        assert_eq!(*lane.state.lock(), 1);
    }

    // Regression test for the release/re-check race: many real OS
    // threads hammer `submit` concurrently, which is exactly the
    // topology `Tangle::setup` creates (the event-loop task and an
    // embedder's own task can land on different Tokio worker
    // threads). Every increment must be observed; a lost job here
    // would mean a `submit_for_result` caller hangs forever waiting
    // on a `oneshot` that nobody ever fills.
    #[test]
    fn concurrent_submissions_are_never_dropped() {
        use std::sync::Barrier;
        use std::thread;

        let lane = Arc::new(Lane::new(0i64));
        const THREADS: usize = 8;
        const PER_THREAD: usize = 500;
        let barrier = Arc::new(Barrier::new(THREADS));

        let handles: Vec<_> = (0..THREADS)
            .map(|_| {
                let lane = lane.clone();
                let barrier = barrier.clone();
                thread::spawn(move || {
                    barrier.wait();
                    for _ in 0..PER_THREAD {
                        lane.submit(|s| *s += 1, false);
                    }
                })
            })
            .collect();

        for h in handles {
            h.join().unwrap();
        }

        assert_eq!(*lane.state.lock(), (THREADS * PER_THREAD) as i64);
    }

    // Same race, but through `submit_for_result`: a dropped job here
    // manifests as a caller awaiting `call_and_revert`/`read_memory`
    // that never resolves, which is the failure mode this fix targets.
    #[test]
    fn concurrent_submit_for_result_always_resolves() {
        use std::sync::Barrier;
        use std::thread;

        let lane = Arc::new(Lane::new(0i64));
        const THREADS: usize = 8;
        let barrier = Arc::new(Barrier::new(THREADS));

        let handles: Vec<_> = (0..THREADS)
            .map(|_| {
                let lane = lane.clone();
                let barrier = barrier.clone();
                thread::spawn(move || {
                    barrier.wait();
                    let rx = lane.submit_for_result(|s: &mut i64| {
                        *s += 1;
                        *s
                    });
                    futures::executor::block_on(rx).expect("job must eventually run and reply")
                })
            })
            .collect();

        let mut results: Vec<i64> = handles.into_iter().map(|h| h.join().unwrap()).collect();
        results.sort_unstable();
        assert_eq!(results, (1..=THREADS as i64).collect::<Vec<_>>());
    }
}
