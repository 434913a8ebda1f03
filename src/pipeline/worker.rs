//! The per-file pipeline worker.
//!
//! Drives a single path through the four stages, publishing a stage event at
//! every entry and materializing failures into the terminal [`TaskState`].
//! Cancellation is cooperative with stage granularity: the token is polled
//! between stages, never within one.

use super::context::{DetectInput, FaceDetector, PipelineContext, RawDecoder, ThumbnailCropper};
use super::error::ErrorKind;
use super::task::{PipelineStage, TaskCompletion, TaskId, TaskState};
use crate::cache::{Artifact, CacheEntry, CacheError};
use crate::digest::{Digest, HashError};
use crate::events::CoreEvent;
use std::collections::BTreeSet;
use std::path::PathBuf;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Stages a cache entry must cover for a probe hit.
///
/// Hashing is implied by being keyed on the digest and the RAW decode is
/// advisory, so completeness is judged on the mandatory stages alone,
/// regardless of file type.
pub fn required_stages() -> BTreeSet<PipelineStage> {
    [
        PipelineStage::DetectingFaces,
        PipelineStage::GeneratingThumbnails,
    ]
    .into_iter()
    .collect()
}

/// Run one path through the pipeline to a terminal state.
///
/// Idempotent: a second run over unchanged content short-circuits on the
/// cache probe without invoking the detector again.
pub async fn run_task<D, F, T>(
    task_id: TaskId,
    path: PathBuf,
    ctx: Arc<PipelineContext<D, F, T>>,
    cancel: CancellationToken,
) -> TaskCompletion
where
    D: RawDecoder,
    F: FaceDetector,
    T: ThumbnailCropper,
{
    let mut digest: Option<Digest> = None;
    let state = run_stages(task_id, &path, &ctx, &cancel, &mut digest).await;

    TaskCompletion {
        task_id,
        path,
        digest,
        state,
    }
}

async fn run_stages<D, F, T>(
    task_id: TaskId,
    path: &PathBuf,
    ctx: &Arc<PipelineContext<D, F, T>>,
    cancel: &CancellationToken,
    digest_out: &mut Option<Digest>,
) -> TaskState
where
    D: RawDecoder,
    F: FaceDetector,
    T: ThumbnailCropper,
{
    // Stage 1: Hashing
    enter_stage(ctx, path, PipelineStage::Hashing);
    let digest = {
        let hasher = ctx.hasher.clone();
        let hash_path = path.clone();
        let result = tokio::task::spawn_blocking(move || hasher.hash(&hash_path)).await;
        match result {
            Ok(Ok(digest)) => digest,
            Ok(Err(HashError::FileNotFound(_))) => {
                debug!(%task_id, path = %path.display(), "File missing at hash time");
                ctx.bus.publish(CoreEvent::FileMissing { path: path.clone() });
                return TaskState::MissingFile;
            }
            Ok(Err(HashError::Io { source, .. })) => {
                // An unreadable input is indistinguishable from a missing one
                // for the rest of the pipeline.
                warn!(%task_id, path = %path.display(), error = %source, "Input unreadable, treating as missing");
                ctx.bus.publish(CoreEvent::FileMissing { path: path.clone() });
                return TaskState::MissingFile;
            }
            Err(join_err) => {
                return errored(
                    ctx,
                    path,
                    PipelineStage::Hashing,
                    ErrorKind::Internal,
                    format!("hashing task failed: {join_err}"),
                );
            }
        }
    };
    *digest_out = Some(digest.clone());

    // Cache probe: short-circuit when every required stage is cached.
    let is_raw = ctx.config.is_raw(path);
    let probe = {
        let store = Arc::clone(&ctx.store);
        let d = digest.clone();
        tokio::task::spawn_blocking(move || store.lookup(&d)).await
    };
    if let Ok(Some(entry)) = probe {
        if entry.covers(&required_stages()) {
            debug!(%task_id, %digest, "Cache probe hit, skipping pipeline");
            ctx.bus.publish(CoreEvent::AlreadyProcessed {
                path: path.clone(),
                digest: digest.clone(),
            });
            return TaskState::AlreadyProcessed { digest, entry };
        }
    }

    if cancel.is_cancelled() {
        return cancelled(path, PipelineStage::DecodingRaw);
    }

    // Stage 2: DecodingRaw (advisory, RAW inputs only)
    let mut preview: Option<Vec<u8>> = None;
    let mut stages_done: BTreeSet<PipelineStage> = [PipelineStage::Hashing].into_iter().collect();
    if is_raw {
        enter_stage(ctx, path, PipelineStage::DecodingRaw);
        match ctx.decoder.decode(path.clone()).await {
            Ok(blob) => {
                stages_done.insert(PipelineStage::DecodingRaw);
                preview = Some(blob);
            }
            Err(e) => {
                // Advisory: later stages operate on the original input.
                warn!(%task_id, path = %path.display(), error = %e, "RAW decode failed, continuing on original");
            }
        }
    }

    if cancel.is_cancelled() {
        return cancelled(path, PipelineStage::DetectingFaces);
    }

    // Stage 3: DetectingFaces (mandatory)
    enter_stage(ctx, path, PipelineStage::DetectingFaces);
    let shared_preview = preview.map(Arc::new);
    let detect_input = match &shared_preview {
        Some(p) => DetectInput::Preview(Arc::clone(p)),
        None => DetectInput::Original(path.clone()),
    };
    let bboxes = match ctx.detector.detect(detect_input.clone()).await {
        Ok(bboxes) => bboxes,
        Err(e) => {
            return errored(
                ctx,
                path,
                PipelineStage::DetectingFaces,
                ErrorKind::FaceDetectionFailed,
                e.message,
            );
        }
    };
    stages_done.insert(PipelineStage::DetectingFaces);

    if cancel.is_cancelled() {
        return cancelled(path, PipelineStage::GeneratingThumbnails);
    }

    // Stage 4: GeneratingThumbnails (mandatory, all-or-nothing)
    enter_stage(ctx, path, PipelineStage::GeneratingThumbnails);
    let mut thumbnails = Vec::with_capacity(bboxes.len());
    for (i, bbox) in bboxes.iter().enumerate() {
        match ctx.cropper.crop(detect_input.clone(), *bbox).await {
            Ok(thumb) => thumbnails.push(thumb),
            Err(e) => {
                return errored(
                    ctx,
                    path,
                    PipelineStage::GeneratingThumbnails,
                    ErrorKind::ThumbnailFailed,
                    format!("crop {i} failed: {}", e.message),
                );
            }
        }
    }
    stages_done.insert(PipelineStage::GeneratingThumbnails);

    if cancel.is_cancelled() {
        return cancelled(path, PipelineStage::GeneratingThumbnails);
    }

    // Admission
    let artifact = Artifact {
        preview: shared_preview.as_ref().map(|p| (**p).clone()),
        bboxes,
        thumbnails,
        stages_done,
    };
    match admit_with_retry(ctx, &digest, artifact).await {
        Ok(entry) => {
            ctx.bus.publish(CoreEvent::TaskCompleted {
                path: path.clone(),
                digest: digest.clone(),
                face_count: entry.face_count,
            });
            TaskState::Completed { digest, entry }
        }
        Err((kind, message)) => errored(
            ctx,
            path,
            PipelineStage::GeneratingThumbnails,
            kind,
            message,
        ),
    }
}

/// Admit the artifact, running one synchronous eviction tick and retrying
/// once if the disk is full.
///
/// A failure carries the [`ErrorKind`] for the terminal state: `StorageFull`
/// when the disk stayed full through the retry, `Internal` for anything
/// unexpected (other I/O failures, a panicked blocking task).
async fn admit_with_retry<D, F, T>(
    ctx: &Arc<PipelineContext<D, F, T>>,
    digest: &Digest,
    artifact: Artifact,
) -> Result<CacheEntry, (ErrorKind, String)>
where
    D: RawDecoder,
    F: FaceDetector,
    T: ThumbnailCropper,
{
    let store = Arc::clone(&ctx.store);
    let d = digest.clone();
    let attempt = {
        let store = Arc::clone(&store);
        let d = d.clone();
        let artifact = artifact.clone();
        tokio::task::spawn_blocking(move || store.admit(&d, artifact)).await
    };

    match attempt {
        Ok(Ok(_)) => return Ok(load_admitted(ctx, digest, &artifact).await),
        Ok(Err(CacheError::StorageFull { .. })) => {}
        Ok(Err(e)) => return Err((ErrorKind::Internal, e.to_string())),
        Err(join_err) => return Err((ErrorKind::Internal, join_err.to_string())),
    }

    // Disk full: reclaim what the budget allows, then retry once.
    let report = {
        let store = Arc::clone(&store);
        tokio::task::spawn_blocking(move || store.tick_eviction())
            .await
            .unwrap_or_default()
    };
    for (evicted, bytes) in &report.evicted {
        ctx.bus.publish(CoreEvent::CacheEntryEvicted {
            digest: evicted.clone(),
            bytes: *bytes,
        });
    }

    let retry = {
        let store = Arc::clone(&store);
        let d = d.clone();
        let artifact = artifact.clone();
        tokio::task::spawn_blocking(move || store.admit(&d, artifact)).await
    };
    match retry {
        Ok(Ok(_)) => Ok(load_admitted(ctx, digest, &artifact).await),
        Ok(Err(e @ CacheError::StorageFull { .. })) => {
            Err((ErrorKind::StorageFull, e.to_string()))
        }
        Ok(Err(e)) => Err((ErrorKind::Internal, e.to_string())),
        Err(join_err) => Err((ErrorKind::Internal, join_err.to_string())),
    }
}

/// Fetch the just-admitted entry; falls back to a synthesized record when a
/// concurrent invalidation raced the lookup.
async fn load_admitted<D, F, T>(
    ctx: &Arc<PipelineContext<D, F, T>>,
    digest: &Digest,
    artifact: &Artifact,
) -> CacheEntry
where
    D: RawDecoder,
    F: FaceDetector,
    T: ThumbnailCropper,
{
    let store = Arc::clone(&ctx.store);
    let d = digest.clone();
    let looked_up = tokio::task::spawn_blocking(move || store.lookup(&d))
        .await
        .ok()
        .flatten();

    looked_up.unwrap_or_else(|| CacheEntry {
        face_count: artifact.bboxes.len() as u32,
        bboxes: artifact.bboxes.clone(),
        stages_done: artifact.stages_done.clone(),
        completed_at: 0,
        has_preview: artifact.preview.is_some(),
        size_bytes: artifact.blob_bytes(),
        extra: serde_json::Map::new(),
    })
}

fn enter_stage<D, F, T>(ctx: &Arc<PipelineContext<D, F, T>>, path: &PathBuf, stage: PipelineStage)
where
    D: RawDecoder,
    F: FaceDetector,
    T: ThumbnailCropper,
{
    ctx.bus.publish(CoreEvent::TaskStageChanged {
        path: path.clone(),
        stage,
    });
}

fn errored<D, F, T>(
    ctx: &Arc<PipelineContext<D, F, T>>,
    path: &PathBuf,
    stage: PipelineStage,
    kind: ErrorKind,
    message: String,
) -> TaskState
where
    D: RawDecoder,
    F: FaceDetector,
    T: ThumbnailCropper,
{
    ctx.bus.publish(CoreEvent::TaskErrored {
        path: path.clone(),
        stage,
        kind,
        message: message.clone(),
    });
    TaskState::Errored {
        stage,
        kind,
        message,
    }
}

// Cancellation is silent to users; the terminal state still records it.
fn cancelled(path: &PathBuf, stage: PipelineStage) -> TaskState {
    debug!(path = %path.display(), %stage, "Task cancelled between stages");
    TaskState::Errored {
        stage,
        kind: ErrorKind::Cancelled,
        message: "cancelled".to_string(),
    }
}
