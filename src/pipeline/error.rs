//! Error taxonomy for task terminal states and published events.
//!
//! Stage-level errors never propagate above the worker; they are
//! materialized in the task's terminal state and published as events. The
//! kinds below are the exhaustive vocabulary those events use.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Classification of a task failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Submitted file does not exist.
    FileMissing,
    /// RAW decode failed; the pipeline continued on the original file.
    RawDecodeFailed,
    /// The face detector failed; terminal for the task.
    FaceDetectionFailed,
    /// A thumbnail crop failed; terminal (partial generation is not
    /// acceptable).
    ThumbnailFailed,
    /// Cache admission hit a full disk even after an eviction tick.
    StorageFull,
    /// A cache entry was unreadable; the caller saw a miss.
    StoreCorrupted,
    /// The run was cancelled between stages.
    Cancelled,
    /// Unexpected internal failure (e.g. a worker task panicked).
    Internal,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ErrorKind::FileMissing => "file_missing",
            ErrorKind::RawDecodeFailed => "raw_decode_failed",
            ErrorKind::FaceDetectionFailed => "face_detection_failed",
            ErrorKind::ThumbnailFailed => "thumbnail_failed",
            ErrorKind::StorageFull => "storage_full",
            ErrorKind::StoreCorrupted => "store_corrupted",
            ErrorKind::Cancelled => "cancelled",
            ErrorKind::Internal => "internal",
        };
        f.write_str(name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_matches_wire_names() {
        assert_eq!(ErrorKind::FaceDetectionFailed.to_string(), "face_detection_failed");
        assert_eq!(ErrorKind::Cancelled.to_string(), "cancelled");
        assert_eq!(ErrorKind::Internal.to_string(), "internal");
    }

    #[test]
    fn serde_round_trip() {
        let json = serde_json::to_string(&ErrorKind::StorageFull).unwrap();
        assert_eq!(json, "\"storage_full\"");
        let back: ErrorKind = serde_json::from_str(&json).unwrap();
        assert_eq!(back, ErrorKind::StorageFull);
    }
}
