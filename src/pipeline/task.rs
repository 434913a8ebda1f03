//! Task identity, stages and states.

use crate::cache::CacheEntry;
use crate::digest::Digest;
use crate::pipeline::error::ErrorKind;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};

/// Global counter for generating unique task IDs.
static TASK_ID_COUNTER: AtomicU64 = AtomicU64::new(1);

/// Unique identifier for one pipeline run.
///
/// IDs are monotonically increasing and unique within a process lifetime;
/// used to correlate log lines and events for the same run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TaskId(u64);

impl TaskId {
    /// Creates a new unique task ID.
    pub fn new() -> Self {
        Self(TASK_ID_COUNTER.fetch_add(1, Ordering::Relaxed))
    }

    /// Raw numeric value, for logging.
    #[inline]
    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl Default for TaskId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "task-{}", self.0)
    }
}

/// The four ordered pipeline stages. The set is closed.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum PipelineStage {
    /// Content digest computation.
    Hashing,
    /// RAW decode to a JPEG preview (advisory for RAW inputs only).
    DecodingRaw,
    /// Face detection on the best available input (mandatory).
    DetectingFaces,
    /// One thumbnail crop per detected face (mandatory, all-or-nothing).
    GeneratingThumbnails,
}

impl PipelineStage {
    /// All stages in pipeline order.
    pub const ALL: [PipelineStage; 4] = [
        PipelineStage::Hashing,
        PipelineStage::DecodingRaw,
        PipelineStage::DetectingFaces,
        PipelineStage::GeneratingThumbnails,
    ];
}

impl fmt::Display for PipelineStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            PipelineStage::Hashing => "hashing",
            PipelineStage::DecodingRaw => "decoding_raw",
            PipelineStage::DetectingFaces => "detecting_faces",
            PipelineStage::GeneratingThumbnails => "generating_thumbnails",
        };
        f.write_str(name)
    }
}

/// Per-path task state machine.
///
/// `Pending` and `Running` are in-flight; everything else is terminal.
#[derive(Debug, Clone)]
pub enum TaskState {
    /// Queued, not yet dispatched.
    Pending,
    /// Executing the given stage.
    Running(PipelineStage),
    /// All mandatory stages succeeded and the artifact was admitted.
    Completed { digest: Digest, entry: CacheEntry },
    /// The cache probe short-circuited: every required stage was cached.
    AlreadyProcessed { digest: Digest, entry: CacheEntry },
    /// A mandatory stage failed (or the run was cancelled).
    Errored {
        stage: PipelineStage,
        kind: ErrorKind,
        message: String,
    },
    /// The file disappeared before it could be hashed.
    MissingFile,
}

impl TaskState {
    /// Whether this state ends the task.
    pub fn is_terminal(&self) -> bool {
        !matches!(self, TaskState::Pending | TaskState::Running(_))
    }

    /// The digest, where one is known.
    pub fn digest(&self) -> Option<&Digest> {
        match self {
            TaskState::Completed { digest, .. } | TaskState::AlreadyProcessed { digest, .. } => {
                Some(digest)
            }
            _ => None,
        }
    }
}

/// What a finished worker reports back to the coordinator.
#[derive(Debug, Clone)]
pub struct TaskCompletion {
    pub task_id: TaskId,
    pub path: PathBuf,
    /// Digest learned during the run (set as soon as hashing succeeds, even
    /// for runs that later fail).
    pub digest: Option<Digest>,
    /// Terminal state of the run.
    pub state: TaskState,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn task_ids_are_unique_and_monotonic() {
        let a = TaskId::new();
        let b = TaskId::new();
        assert_ne!(a, b);
        assert!(b.as_u64() > a.as_u64());
    }

    #[test]
    fn task_id_display() {
        let id = TaskId::new();
        assert!(format!("{}", id).starts_with("task-"));
    }

    #[test]
    fn stage_order_is_pipeline_order() {
        assert!(PipelineStage::Hashing < PipelineStage::DecodingRaw);
        assert!(PipelineStage::DecodingRaw < PipelineStage::DetectingFaces);
        assert!(PipelineStage::DetectingFaces < PipelineStage::GeneratingThumbnails);
    }

    #[test]
    fn stage_serializes_as_snake_case() {
        let json = serde_json::to_string(&PipelineStage::DetectingFaces).unwrap();
        assert_eq!(json, "\"detecting_faces\"");

        let back: PipelineStage = serde_json::from_str("\"generating_thumbnails\"").unwrap();
        assert_eq!(back, PipelineStage::GeneratingThumbnails);
    }

    #[test]
    fn terminal_states_are_terminal() {
        assert!(!TaskState::Pending.is_terminal());
        assert!(!TaskState::Running(PipelineStage::Hashing).is_terminal());
        assert!(TaskState::MissingFile.is_terminal());
        assert!(TaskState::Errored {
            stage: PipelineStage::DetectingFaces,
            kind: ErrorKind::FaceDetectionFailed,
            message: "detector crashed".to_string(),
        }
        .is_terminal());
    }
}
