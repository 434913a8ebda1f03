//! Pipeline context and injected collaborator traits.
//!
//! The context holds shared handles every worker run needs: the hasher, the
//! cache store, the event bus and the external transform collaborators. It
//! is cheaply cloneable (everything is behind `Arc`) for passing into
//! spawned tasks.

use crate::cache::{BBox, CacheStore};
use crate::config::default_raw_extensions;
use crate::digest::ContentHasher;
use crate::events::EventBus;
use std::collections::HashSet;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Input handed to detection and cropping: the decoded preview when the RAW
/// decode produced one, otherwise the original file.
#[derive(Debug, Clone)]
pub enum DetectInput {
    /// Decoded preview bytes (JPEG).
    Preview(Arc<Vec<u8>>),
    /// Path to the original input file.
    Original(PathBuf),
}

/// Error from a RAW decoder.
#[derive(Debug, Clone)]
pub struct DecodeError {
    pub message: String,
}

impl DecodeError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

impl std::fmt::Display for DecodeError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl std::error::Error for DecodeError {}

/// Error from the face detector.
#[derive(Debug, Clone)]
pub struct DetectError {
    pub message: String,
}

impl DetectError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

impl std::fmt::Display for DetectError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl std::error::Error for DetectError {}

/// Error from the thumbnail cropper.
#[derive(Debug, Clone)]
pub struct CropError {
    pub message: String,
}

impl CropError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

impl std::fmt::Display for CropError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl std::error::Error for CropError {}

/// Decodes a RAW file into a JPEG preview blob.
///
/// Decoding is advisory: a failure is logged and the pipeline continues on
/// the original file.
pub trait RawDecoder: Send + Sync + 'static {
    /// Decode the file at `path` into preview bytes.
    fn decode(
        &self,
        path: PathBuf,
    ) -> impl Future<Output = Result<Vec<u8>, DecodeError>> + Send;
}

/// Detects faces in an image.
///
/// Returns bounding boxes in detector-output order; the order is preserved
/// end to end and thumbnails are addressed by index into it.
pub trait FaceDetector: Send + Sync + 'static {
    /// Detect faces in the given input.
    fn detect(
        &self,
        input: DetectInput,
    ) -> impl Future<Output = Result<Vec<BBox>, DetectError>> + Send;
}

/// Crops one face bounding box into a thumbnail blob.
pub trait ThumbnailCropper: Send + Sync + 'static {
    /// Crop `bbox` out of the input image.
    fn crop(
        &self,
        input: DetectInput,
        bbox: BBox,
    ) -> impl Future<Output = Result<Vec<u8>, CropError>> + Send;
}

/// Pipeline-level configuration.
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    /// Lowercase extensions treated as RAW inputs.
    pub raw_extensions: HashSet<String>,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            raw_extensions: default_raw_extensions(),
        }
    }
}

impl PipelineConfig {
    /// Whether the path's extension marks it as a RAW input.
    pub fn is_raw(&self, path: &Path) -> bool {
        path.extension()
            .and_then(|e| e.to_str())
            .map(|e| self.raw_extensions.contains(&e.to_ascii_lowercase()))
            .unwrap_or(false)
    }
}

/// Shared resources for worker runs.
pub struct PipelineContext<D, F, T>
where
    D: RawDecoder,
    F: FaceDetector,
    T: ThumbnailCropper,
{
    /// RAW decoder collaborator.
    pub decoder: Arc<D>,
    /// Face detector collaborator.
    pub detector: Arc<F>,
    /// Thumbnail cropper collaborator.
    pub cropper: Arc<T>,
    /// Streaming content hasher.
    pub hasher: ContentHasher,
    /// The artifact cache.
    pub store: Arc<CacheStore>,
    /// Event publishing handle.
    pub bus: EventBus,
    /// Pipeline configuration.
    pub config: PipelineConfig,
}

impl<D, F, T> Clone for PipelineContext<D, F, T>
where
    D: RawDecoder,
    F: FaceDetector,
    T: ThumbnailCropper,
{
    fn clone(&self) -> Self {
        Self {
            decoder: Arc::clone(&self.decoder),
            detector: Arc::clone(&self.detector),
            cropper: Arc::clone(&self.cropper),
            hasher: self.hasher.clone(),
            store: Arc::clone(&self.store),
            bus: self.bus.clone(),
            config: self.config.clone(),
        }
    }
}

impl<D, F, T> PipelineContext<D, F, T>
where
    D: RawDecoder,
    F: FaceDetector,
    T: ThumbnailCropper,
{
    /// Creates a new pipeline context.
    pub fn new(
        decoder: Arc<D>,
        detector: Arc<F>,
        cropper: Arc<T>,
        store: Arc<CacheStore>,
        bus: EventBus,
        config: PipelineConfig,
    ) -> Self {
        Self {
            decoder,
            detector,
            cropper,
            hasher: ContentHasher::new(),
            store,
            bus,
            config,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn raw_extension_detection_is_case_insensitive() {
        let config = PipelineConfig::default();
        assert!(config.is_raw(Path::new("/shoot/DSC_0001.NEF")));
        assert!(config.is_raw(Path::new("/shoot/img.cr2")));
        assert!(!config.is_raw(Path::new("/shoot/img.jpg")));
        assert!(!config.is_raw(Path::new("/shoot/noext")));
    }

    #[test]
    fn custom_raw_set_overrides_default() {
        let config = PipelineConfig {
            raw_extensions: ["dng".to_string()].into_iter().collect(),
        };
        assert!(config.is_raw(Path::new("a.dng")));
        assert!(!config.is_raw(Path::new("a.nef")));
    }
}
