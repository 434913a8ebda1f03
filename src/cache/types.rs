//! Core types for the cache store.

use crate::digest::Digest;
use crate::pipeline::PipelineStage;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::path::PathBuf;
use thiserror::Error;

/// Fixed per-entry overhead added to blob sizes when accounting against the
/// budget, amortizing the metadata record and directory entries.
pub const ENTRY_OVERHEAD_BYTES: u64 = 512;

/// A face bounding box in pixel coordinates.
///
/// Serialized as a `[x, y, w, h]` quadruple in metadata records. Order within
/// an entry is detector-output order and is never re-sorted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "[u32; 4]", into = "[u32; 4]")]
pub struct BBox {
    pub x: u32,
    pub y: u32,
    pub w: u32,
    pub h: u32,
}

impl BBox {
    pub fn new(x: u32, y: u32, w: u32, h: u32) -> Self {
        Self { x, y, w, h }
    }
}

impl From<[u32; 4]> for BBox {
    fn from(v: [u32; 4]) -> Self {
        Self {
            x: v[0],
            y: v[1],
            w: v[2],
            h: v[3],
        }
    }
}

impl From<BBox> for [u32; 4] {
    fn from(b: BBox) -> [u32; 4] {
        [b.x, b.y, b.w, b.h]
    }
}

/// Per-digest cache metadata record.
///
/// Persisted as `index/<digest>.json`. Unknown fields written by newer
/// versions are preserved on rewrite via the flattened `extra` map.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheEntry {
    /// Number of detected faces.
    pub face_count: u32,
    /// Detected bounding boxes, detector-output order.
    pub bboxes: Vec<BBox>,
    /// Stages that completed for this digest.
    pub stages_done: BTreeSet<PipelineStage>,
    /// Monotonic completion timestamp (process timeline; re-seeded from file
    /// mtime across restarts).
    pub completed_at: u64,
    /// Whether a decoded RAW preview blob exists.
    pub has_preview: bool,
    /// Total blob bytes on disk for this entry.
    pub size_bytes: u64,
    /// Fields this version does not understand, carried through rewrites.
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

impl CacheEntry {
    /// Whether thumbnails exist for every detected face.
    pub fn thumbnails_present(&self) -> bool {
        self.stages_done
            .contains(&PipelineStage::GeneratingThumbnails)
    }

    /// Budget charge for this entry (blobs plus fixed overhead).
    pub fn charged_bytes(&self) -> u64 {
        self.size_bytes + ENTRY_OVERHEAD_BYTES
    }

    /// Whether this entry covers every stage in `required`.
    pub fn covers(&self, required: &BTreeSet<PipelineStage>) -> bool {
        required.iter().all(|s| self.stages_done.contains(s))
    }
}

/// Artifact handed to [`CacheStore::admit`](super::CacheStore::admit).
///
/// Blob bytes live in memory until admission stages them onto disk.
#[derive(Debug, Clone, Default)]
pub struct Artifact {
    /// Decoded RAW preview (JPEG bytes), when the decode stage produced one.
    pub preview: Option<Vec<u8>>,
    /// Detected bounding boxes, detector-output order.
    pub bboxes: Vec<BBox>,
    /// One thumbnail blob per bounding box, same order.
    pub thumbnails: Vec<Vec<u8>>,
    /// Stages that completed.
    pub stages_done: BTreeSet<PipelineStage>,
}

impl Artifact {
    /// Total blob bytes.
    pub fn blob_bytes(&self) -> u64 {
        let preview = self.preview.as_ref().map(|p| p.len() as u64).unwrap_or(0);
        let thumbs: u64 = self.thumbnails.iter().map(|t| t.len() as u64).sum();
        preview + thumbs
    }
}

/// Outcome of a successful admission.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AdmitOutcome {
    /// No prior entry existed for the digest.
    Admitted,
    /// A prior entry existed and was replaced; its blobs were reclaimed.
    Replaced,
}

/// Approximate snapshot of store occupancy.
#[derive(Debug, Clone)]
pub struct CacheStatus {
    /// Number of entries.
    pub entries: usize,
    /// Charged bytes (blobs + per-entry overhead).
    pub bytes: u64,
    /// Soft budget in bytes.
    pub budget: u64,
    /// Occupancy as a percentage of the budget.
    pub pct: f64,
}

/// Cache store errors.
#[derive(Debug, Error)]
pub enum CacheError {
    /// I/O error during store operations
    #[error("cache I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Disk ran out of space while staging blobs
    #[error("storage full while admitting {digest}")]
    StorageFull { digest: Digest },

    /// Another process holds the store root
    #[error("cache root already locked: {0}")]
    AlreadyLocked(PathBuf),

    /// Metadata record could not be serialized or parsed
    #[error("metadata error for {digest}: {message}")]
    Metadata { digest: Digest, message: String },
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry_with_stages(stages: &[PipelineStage]) -> CacheEntry {
        CacheEntry {
            face_count: 2,
            bboxes: vec![BBox::new(0, 0, 10, 10), BBox::new(20, 20, 10, 10)],
            stages_done: stages.iter().copied().collect(),
            completed_at: 1000,
            has_preview: false,
            size_bytes: 100,
            extra: serde_json::Map::new(),
        }
    }

    #[test]
    fn bbox_serializes_as_quadruple() {
        let b = BBox::new(1, 2, 3, 4);
        let json = serde_json::to_string(&b).unwrap();
        assert_eq!(json, "[1,2,3,4]");

        let back: BBox = serde_json::from_str("[5,6,7,8]").unwrap();
        assert_eq!(back, BBox::new(5, 6, 7, 8));
    }

    #[test]
    fn entry_round_trips_through_json() {
        let entry = entry_with_stages(&[
            PipelineStage::DetectingFaces,
            PipelineStage::GeneratingThumbnails,
        ]);
        let json = serde_json::to_string(&entry).unwrap();
        let back: CacheEntry = serde_json::from_str(&json).unwrap();

        assert_eq!(back.face_count, 2);
        assert_eq!(back.bboxes, entry.bboxes);
        assert_eq!(back.stages_done, entry.stages_done);
        assert!(back.thumbnails_present());
    }

    #[test]
    fn unknown_fields_survive_rewrite() {
        let json = r#"{
            "face_count": 1,
            "bboxes": [[0, 0, 5, 5]],
            "stages_done": ["detecting_faces"],
            "completed_at": 42,
            "has_preview": false,
            "size_bytes": 9,
            "reviewer_note": "keep me"
        }"#;
        let entry: CacheEntry = serde_json::from_str(json).unwrap();
        assert_eq!(
            entry.extra.get("reviewer_note").and_then(|v| v.as_str()),
            Some("keep me")
        );

        let rewritten = serde_json::to_string(&entry).unwrap();
        assert!(rewritten.contains("reviewer_note"));
        assert!(rewritten.contains("keep me"));
    }

    #[test]
    fn thumbnails_present_tracks_stage() {
        let without = entry_with_stages(&[PipelineStage::DetectingFaces]);
        assert!(!without.thumbnails_present());

        let with = entry_with_stages(&[
            PipelineStage::DetectingFaces,
            PipelineStage::GeneratingThumbnails,
        ]);
        assert!(with.thumbnails_present());
    }

    #[test]
    fn covers_requires_all_stages() {
        let entry = entry_with_stages(&[PipelineStage::DetectingFaces]);
        let partial: BTreeSet<_> = [PipelineStage::DetectingFaces].into_iter().collect();
        let full: BTreeSet<_> = [
            PipelineStage::DetectingFaces,
            PipelineStage::GeneratingThumbnails,
        ]
        .into_iter()
        .collect();

        assert!(entry.covers(&partial));
        assert!(!entry.covers(&full));
    }

    #[test]
    fn artifact_blob_bytes_sums_all_blobs() {
        let artifact = Artifact {
            preview: Some(vec![0u8; 100]),
            bboxes: vec![BBox::new(0, 0, 1, 1)],
            thumbnails: vec![vec![0u8; 30], vec![0u8; 20]],
            stages_done: BTreeSet::new(),
        };
        assert_eq!(artifact.blob_bytes(), 150);
    }

    #[test]
    fn charged_bytes_adds_overhead() {
        let entry = entry_with_stages(&[]);
        assert_eq!(entry.charged_bytes(), 100 + ENTRY_OVERHEAD_BYTES);
    }
}
