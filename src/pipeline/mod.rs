//! The per-file preprocessing pipeline.
//!
//! Each submitted path runs through four ordered stages:
//!
//! ```text
//! Hashing → DecodingRaw → DetectingFaces → GeneratingThumbnails
//! ```
//!
//! The worker is an explicit per-stage state machine: blocking work happens
//! inside stages, cancellation is checked at the seams between them, and the
//! terminal [`TaskState`] is the single source of truth for a path in
//! flight. Face detection, RAW decoding and thumbnail cropping are injected
//! collaborators; the core owns none of their implementations.

mod context;
mod error;
mod task;
mod worker;

pub use context::{
    CropError, DecodeError, DetectError, DetectInput, FaceDetector, PipelineConfig,
    PipelineContext, RawDecoder, ThumbnailCropper,
};
pub use error::ErrorKind;
pub use task::{PipelineStage, TaskCompletion, TaskId, TaskState};
pub use worker::{required_stages, run_task};
