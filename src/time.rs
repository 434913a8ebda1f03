//! Monotonic time source for cache timestamps.
//!
//! Cache entries carry a `completed_at` timestamp used for LRU eviction
//! ordering. Timestamps are monotonic milliseconds within one process
//! lifetime; on restart they are re-seeded from filesystem mtime so that a
//! wall-clock jump across restarts cannot reorder eviction.

use std::sync::Arc;
use std::time::{Instant, SystemTime};

/// Injectable monotonic time source.
///
/// Production code uses [`MonotonicClock`]; tests substitute a manual clock
/// to make eviction ordering deterministic.
pub trait Clock: Send + Sync + 'static {
    /// Current monotonic time in milliseconds.
    ///
    /// Values must never decrease within one process lifetime.
    fn now(&self) -> u64;
}

/// Default clock anchored at process start.
///
/// `now()` counts milliseconds since the clock was created, offset so that
/// mtime-derived timestamps from a previous run sort strictly before
/// anything produced in this run.
pub struct MonotonicClock {
    origin: Instant,
    /// Added to every reading so re-seeded historical timestamps stay below
    /// fresh ones. See [`system_time_to_monotonic_ms`].
    offset_ms: u64,
}

impl MonotonicClock {
    /// Create a clock anchored at the current instant.
    pub fn new() -> Self {
        Self {
            origin: Instant::now(),
            offset_ms: MTIME_HORIZON_MS,
        }
    }

    /// Create a shared handle to a fresh clock.
    pub fn shared() -> Arc<dyn Clock> {
        Arc::new(Self::new())
    }
}

impl Default for MonotonicClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for MonotonicClock {
    fn now(&self) -> u64 {
        self.offset_ms + self.origin.elapsed().as_millis() as u64
    }
}

/// How far back mtime-derived timestamps may reach, in milliseconds.
///
/// One year is comfortably longer than any realistic cache age; older files
/// all collapse to 0 and tie-break on digest, which keeps ordering stable.
const MTIME_HORIZON_MS: u64 = 365 * 24 * 60 * 60 * 1000;

/// Map a file mtime onto the process-monotonic timeline.
///
/// Files modified `d` milliseconds before process start map to
/// `MTIME_HORIZON_MS - d` (clamped at 0), so older files receive smaller
/// timestamps and anything written after startup (via [`Clock::now`]) sorts
/// after every re-seeded value. Future mtimes clamp to the horizon.
pub fn system_time_to_monotonic_ms(mtime: SystemTime, process_start: SystemTime) -> u64 {
    match process_start.duration_since(mtime) {
        Ok(age) => MTIME_HORIZON_MS.saturating_sub(age.as_millis() as u64),
        // mtime in the future of process start: treat as just-written
        Err(_) => MTIME_HORIZON_MS,
    }
}
