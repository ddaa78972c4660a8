use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};
use rustc_hash::FxHashMap;
use serde::Serialize;
use tracing::{debug, error};

use crate::types::{HierarchyId, Result};

/// Callback that reconciles one hierarchy.
pub(crate) type ReconcileRunner = Arc<dyn Fn(HierarchyId) -> Result<()> + Send + Sync>;

/// Counters describing queue activity.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
pub struct QueueStats {
    /// Calls to `schedule`.
    pub requested: u64,
    /// Requests merged into one already pending.
    pub coalesced: u64,
    /// Jobs executed.
    pub runs: u64,
    /// Jobs that returned an error or panicked.
    pub failures: u64,
}

/// Merge-window queue of reconciliation requests keyed by hierarchy.
///
/// A request for a hierarchy that is already pending is folded into it; the
/// job runs once the first request's window has elapsed. The worker thread is
/// spawned on demand and exits when nothing is pending.
pub struct ReconcileQueue {
    state: Arc<Mutex<QueueState>>,
    wakeup: Arc<Condvar>,
    idle: Arc<Condvar>,
    window: Duration,
    runner: ReconcileRunner,
}

#[derive(Default)]
struct QueueState {
    pending: FxHashMap<HierarchyId, Instant>,
    worker_running: bool,
    in_flight: usize,
    stats: QueueStats,
}

impl ReconcileQueue {
    pub(crate) fn new(window: Duration, runner: ReconcileRunner) -> Self {
        Self {
            state: Arc::new(Mutex::new(QueueState::default())),
            wakeup: Arc::new(Condvar::new()),
            idle: Arc::new(Condvar::new()),
            window,
            runner,
        }
    }

    /// Requests a reconciliation. Returns false if one was already pending.
    pub fn schedule(&self, hierarchy: HierarchyId) -> bool {
        let mut state = self.state.lock();
        state.stats.requested += 1;
        if state.pending.contains_key(&hierarchy) {
            state.stats.coalesced += 1;
            debug!(hierarchy = %hierarchy, "tree.reconcile.queue.coalesced");
            return false;
        }
        state.pending.insert(hierarchy, Instant::now() + self.window);
        debug!(
            hierarchy = %hierarchy,
            pending = state.pending.len(),
            worker_running = state.worker_running,
            "tree.reconcile.queue.scheduled"
        );
        self.ensure_worker(&mut state);
        true
    }

    /// Runs everything pending now and blocks until the worker is idle.
    pub fn flush(&self) {
        let mut state = self.state.lock();
        if state.pending.is_empty() && state.in_flight == 0 {
            return;
        }
        let now = Instant::now();
        for deadline in state.pending.values_mut() {
            *deadline = now;
        }
        self.ensure_worker(&mut state);
        while !state.pending.is_empty() || state.in_flight > 0 {
            self.idle.wait(&mut state);
        }
    }

    /// Removes and returns every pending request without running it. A job
    /// the worker already picked up is not included.
    pub(crate) fn take_pending(&self) -> Vec<HierarchyId> {
        let mut state = self.state.lock();
        let mut out: Vec<HierarchyId> = state.pending.drain().map(|(hierarchy, _)| hierarchy).collect();
        out.sort();
        if state.in_flight == 0 {
            self.idle.notify_all();
        }
        out
    }

    /// Hierarchies waiting for their window to elapse.
    pub fn pending(&self) -> Vec<HierarchyId> {
        let mut out: Vec<HierarchyId> = self.state.lock().pending.keys().copied().collect();
        out.sort();
        out
    }

    /// Activity counters.
    pub fn stats(&self) -> QueueStats {
        self.state.lock().stats
    }

    fn ensure_worker(&self, state: &mut QueueState) {
        if state.worker_running {
            self.wakeup.notify_one();
            return;
        }
        state.worker_running = true;
        let shared = Arc::clone(&self.state);
        let wakeup = Arc::clone(&self.wakeup);
        let idle = Arc::clone(&self.idle);
        let runner = Arc::clone(&self.runner);
        thread::spawn(move || Self::worker_loop(shared, wakeup, idle, runner));
    }

    fn worker_loop(
        state: Arc<Mutex<QueueState>>,
        wakeup: Arc<Condvar>,
        idle: Arc<Condvar>,
        runner: ReconcileRunner,
    ) {
        loop {
            let due = {
                let mut guard = state.lock();
                loop {
                    let Some(next) = guard.pending.values().min().copied() else {
                        guard.worker_running = false;
                        idle.notify_all();
                        debug!("tree.reconcile.queue.worker_exit");
                        return;
                    };
                    if next <= Instant::now() {
                        break;
                    }
                    wakeup.wait_until(&mut guard, next);
                }
                let now = Instant::now();
                let mut due: Vec<HierarchyId> = guard
                    .pending
                    .iter()
                    .filter(|(_, deadline)| **deadline <= now)
                    .map(|(hierarchy, _)| *hierarchy)
                    .collect();
                due.sort();
                for hierarchy in &due {
                    guard.pending.remove(hierarchy);
                }
                guard.in_flight += due.len();
                due
            };
            for hierarchy in due {
                let outcome = panic::catch_unwind(AssertUnwindSafe(|| runner(hierarchy)));
                let failed = match outcome {
                    Ok(Ok(())) => false,
                    Ok(Err(err)) => {
                        error!(hierarchy = %hierarchy, error = %err, "tree.reconcile.queue.failed");
                        true
                    }
                    Err(_) => {
                        error!(hierarchy = %hierarchy, "tree.reconcile.queue.panicked");
                        true
                    }
                };
                let mut guard = state.lock();
                guard.in_flight -= 1;
                guard.stats.runs += 1;
                if failed {
                    guard.stats.failures += 1;
                }
            }
            idle.notify_all();
        }
    }
}

/// Background thread that calls a tick function at a fixed interval.
///
/// Dropping the handle stops the thread and joins it.
pub struct PeriodicReconcile {
    stop: Arc<(Mutex<bool>, Condvar)>,
    handle: Option<JoinHandle<()>>,
}

impl PeriodicReconcile {
    /// Starts ticking every `interval`. The thread also stops on its own once
    /// `tick` returns false.
    pub(crate) fn spawn<F>(interval: Duration, tick: F) -> Self
    where
        F: Fn() -> bool + Send + 'static,
    {
        let stop = Arc::new((Mutex::new(false), Condvar::new()));
        let signal = Arc::clone(&stop);
        let handle = thread::spawn(move || {
            let (stopped, cv) = &*signal;
            let mut guard = stopped.lock();
            loop {
                let deadline = Instant::now() + interval;
                while !*guard {
                    if cv.wait_until(&mut guard, deadline).timed_out() {
                        break;
                    }
                }
                if *guard {
                    break;
                }
                drop(guard);
                let keep_going = tick();
                guard = stopped.lock();
                if !keep_going {
                    break;
                }
            }
            debug!("tree.reconcile.periodic.stopped");
        });
        Self {
            stop,
            handle: Some(handle),
        }
    }

    /// Stops the thread and waits for it to exit.
    pub fn stop(mut self) {
        self.shutdown();
    }

    fn shutdown(&mut self) {
        {
            let (stopped, cv) = &*self.stop;
            *stopped.lock() = true;
            cv.notify_all();
        }
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for PeriodicReconcile {
    fn drop(&mut self) {
        self.shutdown();
    }
}
