//! Rolling-window backpressure.
//!
//! The downstream human-review step consumes completed items one at a time.
//! If the pool outpaces review, the ready set grows without bound and the
//! cache thrashes. The window bounds the ready-but-unconsumed population:
//!
//! ```text
//!         consumed-since-pause >= resume_threshold
//! Paused ----------------------------------------> Running
//!    ^                                                |
//!    |   ready >= min_queue_buffer && queue non-empty |
//!    +------------------------------------------------+
//! ```
//!
//! Transitions are edge-triggered: pause is evaluated on completion, resume
//! on consumption. The pool reads admission state through the shared
//! [`AdmissionGate`] without ever holding the window lock.

use crate::config::WindowConfig;
use crate::digest::Digest;
use std::collections::{HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tracing::debug;

/// Lock-free admission view shared with the pool's dispatch loop.
///
/// The window is the only writer; the pool only reads.
pub struct AdmissionGate {
    paused: AtomicBool,
    ready: AtomicUsize,
    max_ready_items: usize,
}

impl AdmissionGate {
    fn new(max_ready_items: usize) -> Self {
        Self {
            paused: AtomicBool::new(false),
            ready: AtomicUsize::new(0),
            max_ready_items,
        }
    }

    /// Whether the window currently blocks admission.
    pub fn paused(&self) -> bool {
        self.paused.load(Ordering::Acquire)
    }

    /// Tracked ready population (ready + consumed-not-yet-purged).
    pub fn ready_count(&self) -> usize {
        self.ready.load(Ordering::Acquire)
    }

    /// The hard admission cap.
    pub fn max_ready_items(&self) -> usize {
        self.max_ready_items
    }

    /// Whether a non-forced dispatch may proceed.
    pub fn admission_open(&self) -> bool {
        !self.paused() && self.ready_count() < self.max_ready_items
    }
}

/// A window state transition, returned to the caller for event publication
/// and cache-hint forwarding.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WindowTransition {
    /// Admission paused.
    Paused { ready: usize, queued: usize },
    /// Admission resumed; the listed digests were purged from tracking and
    /// should be forwarded to the cache as delete hints.
    Resumed { purged: Vec<Digest> },
}

/// Snapshot of window state for status reporting.
#[derive(Debug, Clone)]
pub struct WindowSnapshot {
    pub ready: usize,
    pub consumed: usize,
    pub paused: bool,
    pub max_ready_items: usize,
}

struct WindowState {
    /// Completed digests not yet marked consumed, oldest first.
    ready: VecDeque<Digest>,
    /// Fast membership for `ready`.
    ready_set: HashSet<Digest>,
    /// Consumed digests not yet purged from tracking, oldest first.
    consumed: VecDeque<Digest>,
    paused: bool,
    consumed_since_pause: usize,
}

/// The rolling window state machine.
pub struct RollingWindow {
    config: WindowConfig,
    state: Mutex<WindowState>,
    gate: Arc<AdmissionGate>,
}

impl RollingWindow {
    /// Create a window in the `Running` state.
    ///
    /// The configuration must already be validated.
    pub fn new(config: WindowConfig) -> Self {
        let gate = Arc::new(AdmissionGate::new(config.max_ready_items));
        Self {
            config,
            state: Mutex::new(WindowState {
                ready: VecDeque::new(),
                ready_set: HashSet::new(),
                consumed: VecDeque::new(),
                paused: false,
                consumed_since_pause: 0,
            }),
            gate,
        }
    }

    /// The admission gate handle for the pool.
    pub fn gate(&self) -> Arc<AdmissionGate> {
        Arc::clone(&self.gate)
    }

    /// Record a completed digest.
    ///
    /// `queued` is the pool's pending-queue length at the time of the
    /// completion; the pause edge only fires while more work is waiting.
    /// Duplicate digests (two paths with identical content) are tracked
    /// once.
    pub fn on_completed(&self, digest: Digest, queued: usize) -> Option<WindowTransition> {
        let mut state = self.state.lock().expect("window lock poisoned");

        if !state.ready_set.contains(&digest) && !state.consumed.contains(&digest) {
            state.ready_set.insert(digest.clone());
            state.ready.push_back(digest);
        }
        self.publish_gate(&state);

        if !state.paused && state.tracked() >= self.config.min_queue_buffer && queued > 0 {
            state.paused = true;
            state.consumed_since_pause = 0;
            self.publish_gate(&state);
            debug!(
                ready = state.tracked(),
                queued, "Rolling window paused admission"
            );
            return Some(WindowTransition::Paused {
                ready: state.tracked(),
                queued,
            });
        }
        None
    }

    /// Mark a ready digest as consumed by the downstream step.
    ///
    /// Unknown digests are ignored. While paused, each consumption counts
    /// toward the resume threshold; crossing it purges up to
    /// `resume_threshold` oldest consumed digests and resumes admission.
    pub fn mark_consumed(&self, digest: &Digest) -> Option<WindowTransition> {
        let mut state = self.state.lock().expect("window lock poisoned");

        if !state.ready_set.remove(digest) {
            return None;
        }
        state.ready.retain(|d| d != digest);
        state.consumed.push_back(digest.clone());

        if !state.paused {
            self.publish_gate(&state);
            return None;
        }

        state.consumed_since_pause += 1;
        if state.consumed_since_pause < self.config.resume_threshold {
            self.publish_gate(&state);
            return None;
        }

        // Resume edge: purge the oldest consumed digests from tracking and
        // hand them to the caller as cache hints.
        let purge_count = self.config.resume_threshold.min(state.consumed.len());
        let purged: Vec<Digest> = state.consumed.drain(..purge_count).collect();
        state.paused = false;
        state.consumed_since_pause = 0;
        self.publish_gate(&state);
        debug!(
            purged = purged.len(),
            remaining = state.tracked(),
            "Rolling window resumed admission"
        );
        Some(WindowTransition::Resumed { purged })
    }

    /// Drop a digest from tracking entirely (its entry disappeared).
    pub fn forget(&self, digest: &Digest) {
        let mut state = self.state.lock().expect("window lock poisoned");
        if state.ready_set.remove(digest) {
            state.ready.retain(|d| d != digest);
        }
        state.consumed.retain(|d| d != digest);
        self.publish_gate(&state);
    }

    /// Current state snapshot.
    pub fn snapshot(&self) -> WindowSnapshot {
        let state = self.state.lock().expect("window lock poisoned");
        WindowSnapshot {
            ready: state.ready.len(),
            consumed: state.consumed.len(),
            paused: state.paused,
            max_ready_items: self.config.max_ready_items,
        }
    }

    fn publish_gate(&self, state: &WindowState) {
        self.gate.ready.store(state.tracked(), Ordering::Release);
        self.gate.paused.store(state.paused, Ordering::Release);
    }
}

impl WindowState {
    /// Tracked population: ready plus consumed-not-yet-purged.
    fn tracked(&self) -> usize {
        self.ready.len() + self.consumed.len()
    }
}
