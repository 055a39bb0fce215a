//! The worker registry.
//!
//! Local render threads and remote node connections register here under one
//! lock, so pausing, sample accounting and teardown treat them uniformly.
//! Pause is cooperative: the coordinator flips `paused` flags, workers call
//! [`WorkerRegistry::park_if_paused`] at the top of their claim loop and
//! acknowledge by setting `parked`, and the coordinator can wait for every
//! acknowledgement before touching shared render state.
//!
//! Lock order: anyone holding the registry lock may take the run-state lock
//! (the abort closures do), never the other way around.

use parking_lot::{Condvar, Mutex};
use std::time::Duration;

/// How long parked or waiting threads sleep between re-checks when no
/// notification arrives. Wakeups normally come from the condvar; this only
/// bounds the window of a notification racing a state change.
const PARK_RECHECK: Duration = Duration::from_millis(50);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerKind {
    Thread,
    Remote,
}

#[derive(Debug, Clone)]
pub struct WorkerSlot {
    pub kind: WorkerKind,
    pub paused: bool,
    /// The worker has seen its pause flag and is waiting in the pause loop.
    pub parked: bool,
    pub total_samples: u64,
}

pub struct WorkerRegistry {
    inner: Mutex<Vec<WorkerSlot>>,
    gate: Condvar,
}

impl WorkerRegistry {
    pub fn new() -> Self {
        WorkerRegistry {
            inner: Mutex::new(Vec::new()),
            gate: Condvar::new(),
        }
    }

    /// Add a worker for the upcoming render and get its id back.
    pub fn register(&self, kind: WorkerKind) -> usize {
        let mut inner = self.inner.lock();
        inner.push(WorkerSlot {
            kind,
            paused: false,
            parked: false,
            total_samples: 0,
        });
        inner.len() - 1
    }

    /// Forget all workers, between renders.
    pub fn clear(&self) {
        self.inner.lock().clear();
        self.gate.notify_all();
    }

    pub fn count(&self) -> usize {
        self.inner.lock().len()
    }

    pub fn count_of(&self, kind: WorkerKind) -> usize {
        self.inner.lock().iter().filter(|s| s.kind == kind).count()
    }

    /// Workers currently doing work, i.e. registered and not parked.
    pub fn active(&self) -> usize {
        self.inner.lock().iter().filter(|s| !s.parked).count()
    }

    /// Flip every worker's pause flag. Returns true when workers are paused
    /// after the call.
    pub fn toggle_pause_all(&self) -> bool {
        let mut inner = self.inner.lock();
        let mut paused_now = false;
        for slot in inner.iter_mut() {
            slot.paused = !slot.paused;
            paused_now |= slot.paused;
        }
        self.gate.notify_all();
        paused_now
    }

    pub fn set_paused_all(&self, paused: bool) {
        let mut inner = self.inner.lock();
        for slot in inner.iter_mut() {
            slot.paused = paused;
        }
        self.gate.notify_all();
    }

    pub fn all_paused(&self) -> bool {
        let inner = self.inner.lock();
        !inner.is_empty() && inner.iter().all(|s| s.paused)
    }

    /// Worker side of the pause protocol. Blocks while this worker's pause
    /// flag is set, marking it parked for the duration so the coordinator
    /// can see the acknowledgement. Returns when unpaused, when the worker
    /// was unregistered, or when `abort` reports the render is over.
    pub fn park_if_paused(&self, id: usize, abort: impl Fn() -> bool) {
        let mut inner = self.inner.lock();
        let mut was_parked = false;
        loop {
            let Some(slot) = inner.get_mut(id) else {
                return;
            };
            if !slot.paused || abort() {
                break;
            }
            if !slot.parked {
                slot.parked = true;
                was_parked = true;
                self.gate.notify_all();
            }
            self.gate.wait_for(&mut inner, PARK_RECHECK);
        }
        if was_parked {
            if let Some(slot) = inner.get_mut(id) {
                slot.parked = false;
            }
            self.gate.notify_all();
        }
    }

    /// Coordinator side: wait until every worker is parked. Bails out with
    /// false if `abort` reports the render left its running state before all
    /// acknowledgements arrived.
    pub fn wait_all_parked(&self, abort: impl Fn() -> bool) -> bool {
        let mut inner = self.inner.lock();
        loop {
            if inner.iter().all(|s| s.parked) {
                return true;
            }
            if abort() {
                return false;
            }
            self.gate.wait_for(&mut inner, PARK_RECHECK);
        }
    }

    pub fn add_samples(&self, id: usize, samples: u64) {
        if let Some(slot) = self.inner.lock().get_mut(id) {
            slot.total_samples += samples;
        }
    }

    pub fn zero_samples(&self) {
        for slot in self.inner.lock().iter_mut() {
            slot.total_samples = 0;
        }
    }

    pub fn samples_total(&self) -> u64 {
        self.inner.lock().iter().map(|s| s.total_samples).sum()
    }

    /// Wake anything blocked on the registry so it can re-check its exit
    /// condition; called on run-state transitions.
    pub fn wake_all(&self) {
        self.gate.notify_all();
    }
}

impl Default for WorkerRegistry {
    fn default() -> Self {
        WorkerRegistry::new()
    }
}
