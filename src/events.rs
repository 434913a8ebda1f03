//! Core event bus.
//!
//! A single broadcast channel carrying every externally observable state
//! change. Events published by one component are delivered to each
//! subscriber in publication order; cross-component ordering is not
//! guaranteed. Delivery is at-least-once within the process lifetime and
//! subscribers must be idempotent.
//!
//! Publishing never blocks: slow subscribers lose the oldest undelivered
//! events (the bus is not a backpressure mechanism) and each subscription
//! tracks how many events it missed.

use crate::digest::Digest;
use crate::pipeline::{ErrorKind, PipelineStage};
use crate::pool::PoolStats;
use std::path::PathBuf;
use tokio::sync::broadcast;

/// Default bus capacity before drop-oldest kicks in.
const BUS_CAPACITY: usize = 256;

/// Everything the core announces to the outside world.
#[derive(Debug, Clone)]
pub enum CoreEvent {
    /// A task entered a new pipeline stage.
    TaskStageChanged { path: PathBuf, stage: PipelineStage },
    /// A task finished all mandatory stages and its artifact was admitted.
    TaskCompleted {
        path: PathBuf,
        digest: Digest,
        face_count: u32,
    },
    /// A task terminated with an error.
    TaskErrored {
        path: PathBuf,
        stage: PipelineStage,
        kind: ErrorKind,
        message: String,
    },
    /// A submitted file no longer exists on disk.
    FileMissing { path: PathBuf },
    /// A task short-circuited on a cache hit.
    AlreadyProcessed { path: PathBuf, digest: Digest },
    /// The rolling window paused admission.
    WindowPaused { ready: usize, queued: usize },
    /// The rolling window resumed admission.
    WindowResumed,
    /// Consumed digests were released to the cache as eviction hints.
    CacheHintCleared { digests: Vec<Digest> },
    /// A cache entry was physically removed.
    CacheEntryEvicted { digest: Digest, bytes: u64 },
    /// Pool counters changed (queue length, in-flight, pause flag).
    PoolStatsChanged { stats: PoolStats },
}

/// Cloneable publishing handle to the bus.
#[derive(Clone)]
pub struct EventBus {
    tx: broadcast::Sender<CoreEvent>,
}

impl EventBus {
    /// Create a bus with the default capacity.
    pub fn new() -> Self {
        Self::with_capacity(BUS_CAPACITY)
    }

    /// Create a bus with an explicit capacity.
    pub fn with_capacity(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx }
    }

    /// Publish an event.
    ///
    /// Never blocks; an event published with no live subscribers is simply
    /// dropped.
    pub fn publish(&self, event: CoreEvent) {
        let _ = self.tx.send(event);
    }

    /// Open a new subscription starting at the current position.
    pub fn subscribe(&self) -> EventSubscription {
        EventSubscription {
            rx: self.tx.subscribe(),
            dropped: 0,
        }
    }

    /// Number of live subscribers.
    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

/// A subscriber's receiving end.
pub struct EventSubscription {
    rx: broadcast::Receiver<CoreEvent>,
    dropped: u64,
}

impl EventSubscription {
    /// Receive the next event.
    ///
    /// Returns `None` once the bus is closed and drained. Events lost to
    /// drop-oldest are skipped transparently and counted in
    /// [`dropped_count`](Self::dropped_count).
    pub async fn recv(&mut self) -> Option<CoreEvent> {
        loop {
            match self.rx.recv().await {
                Ok(event) => return Some(event),
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    self.dropped += n;
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }

    /// Non-blocking receive.
    pub fn try_recv(&mut self) -> Option<CoreEvent> {
        loop {
            match self.rx.try_recv() {
                Ok(event) => return Some(event),
                Err(broadcast::error::TryRecvError::Lagged(n)) => {
                    self.dropped += n;
                }
                Err(_) => return None,
            }
        }
    }

    /// How many events this subscriber has missed to drop-oldest.
    pub fn dropped_count(&self) -> u64 {
        self.dropped
    }
}
