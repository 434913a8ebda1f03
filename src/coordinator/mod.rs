//! The top-level pipeline coordinator.
//!
//! Owns the pool, the rolling window, the priority index, the event bus and
//! the cache store handle, and routes every external command. Ownership is
//! a strict DAG: components below the coordinator never hold references
//! upward; completions flow back over a channel and everything externally
//! observable goes out on the bus.
//!
//! The coordinator also reconciles path identity against content identity:
//! a `path -> last_known_digest` map, updated whenever a run learns a
//! digest, lets rename and delete handling find cache entries without
//! rehashing.

use crate::cache::{CacheError, CacheStatus, CacheStore};
use crate::config::{ConfigError, CoreConfig};
use crate::digest::Digest;
use crate::events::{CoreEvent, EventBus, EventSubscription};
use crate::pipeline::{
    FaceDetector, PipelineConfig, PipelineContext, RawDecoder, TaskCompletion, TaskState,
    ThumbnailCropper,
};
use crate::pool::{PoolStats, WorkerPool};
use crate::priority::PriorityIndex;
use crate::time::MonotonicClock;
use crate::window::{RollingWindow, WindowSnapshot, WindowTransition};
use dashmap::DashMap;
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{debug, info};

/// Where a batch of submissions lands in the queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnqueuePosition {
    /// Prepend, jumping ahead of pending work.
    Head,
    /// Append in the order given.
    Tail,
    /// Sort the batch lexicographically, then append.
    Sorted,
}

/// Combined status snapshot.
#[derive(Debug, Clone)]
pub struct StatusSnapshot {
    pub pool: PoolStats,
    pub window: WindowSnapshot,
    pub cache: CacheStatus,
}

/// Errors from constructing the coordinator.
#[derive(Debug, Error)]
pub enum CoordinatorError {
    /// Invalid configuration
    #[error(transparent)]
    Config(#[from] ConfigError),

    /// Cache store could not be opened
    #[error(transparent)]
    Cache(#[from] CacheError),
}

struct CoordShared<D, F, T>
where
    D: RawDecoder,
    F: FaceDetector,
    T: ThumbnailCropper,
{
    pool: WorkerPool<D, F, T>,
    window: Arc<RollingWindow>,
    priority: Arc<PriorityIndex>,
    store: Arc<CacheStore>,
    bus: EventBus,
    /// Path -> last known digest, updated at hash completion.
    path_digests: DashMap<PathBuf, Digest>,
    /// Stops the completion loop; the loop itself keeps the pool (and thus
    /// a completions sender) alive, so channel closure alone cannot end it.
    shutdown: tokio_util::sync::CancellationToken,
}

/// Top-level facade over the preprocessing core.
pub struct PipelineCoordinator<D, F, T>
where
    D: RawDecoder,
    F: FaceDetector,
    T: ThumbnailCropper,
{
    shared: Arc<CoordShared<D, F, T>>,
}

impl<D, F, T> PipelineCoordinator<D, F, T>
where
    D: RawDecoder,
    F: FaceDetector,
    T: ThumbnailCropper,
{
    /// Validate the configuration, open the cache store and start the
    /// dispatch and completion loops.
    ///
    /// Must be called within a tokio runtime.
    pub fn open(
        config: CoreConfig,
        decoder: D,
        detector: F,
        cropper: T,
    ) -> Result<Self, CoordinatorError> {
        Self::open_with_shared(
            config,
            Arc::new(decoder),
            Arc::new(detector),
            Arc::new(cropper),
        )
    }

    /// Like [`open`](Self::open), for callers that keep their own handles to
    /// the collaborators.
    pub fn open_with_shared(
        config: CoreConfig,
        decoder: Arc<D>,
        detector: Arc<F>,
        cropper: Arc<T>,
    ) -> Result<Self, CoordinatorError> {
        config.validate()?;

        let priority = Arc::new(PriorityIndex::new());
        let store = Arc::new(CacheStore::open(
            &config.cache,
            MonotonicClock::shared(),
            Arc::clone(&priority),
        )?);
        let bus = EventBus::new();
        let window = Arc::new(RollingWindow::new(config.window.clone()));

        let ctx = Arc::new(PipelineContext::new(
            decoder,
            detector,
            cropper,
            Arc::clone(&store),
            bus.clone(),
            PipelineConfig {
                raw_extensions: config.raw_extensions.clone(),
            },
        ));

        let (completion_tx, completion_rx) = mpsc::unbounded_channel();
        let pool = WorkerPool::new(ctx, window.gate(), config.max_workers, completion_tx);

        let shared = Arc::new(CoordShared {
            pool,
            window,
            priority,
            store,
            bus,
            path_digests: DashMap::new(),
            shutdown: tokio_util::sync::CancellationToken::new(),
        });

        tokio::spawn(run_completion_loop(
            completion_rx,
            Arc::clone(&shared),
        ));

        info!(
            max_workers = config.max_workers,
            budget_bytes = config.cache.budget_bytes,
            "Pipeline coordinator started"
        );

        Ok(Self { shared })
    }

    /// Submit a batch of paths.
    ///
    /// Deduplicates against the queue, in-flight runs and failed-terminal
    /// tracking; returns how many submissions were accepted.
    pub fn enqueue(&self, paths: Vec<PathBuf>, position: EnqueuePosition, force: bool) -> usize {
        let mut batch = paths;
        if position == EnqueuePosition::Sorted {
            batch.sort();
        }

        let mut accepted = 0;
        match position {
            EnqueuePosition::Head => {
                // Prepend in reverse so the batch keeps its order at the head.
                for path in batch.into_iter().rev() {
                    if self.shared.pool.enqueue(path, true, force) {
                        accepted += 1;
                    }
                }
            }
            EnqueuePosition::Tail | EnqueuePosition::Sorted => {
                for path in batch {
                    if self.shared.pool.enqueue(path, false, force) {
                        accepted += 1;
                    }
                }
            }
        }

        if accepted > 0 {
            self.publish_pool_stats();
        }
        accepted
    }

    /// Remove a pending path from the queue.
    ///
    /// No effect on in-flight runs (they cannot be preempted).
    pub fn remove(&self, path: &Path) -> bool {
        let removed = self.shared.pool.remove(path);
        if removed {
            self.publish_pool_stats();
        }
        removed
    }

    /// Mark a ready digest consumed by the downstream review step.
    ///
    /// On the resume edge, purged digests are forwarded to the cache as
    /// delete hints (priority digests are spared) and admission reopens.
    pub fn mark_consumed(&self, digest: &Digest) {
        let Some(transition) = self.shared.window.mark_consumed(digest) else {
            return;
        };
        let WindowTransition::Resumed { purged } = transition else {
            return;
        };

        self.shared.bus.publish(CoreEvent::WindowResumed);
        self.shared.bus.publish(CoreEvent::CacheHintCleared {
            digests: purged.clone(),
        });

        for (evicted, bytes) in self.shared.store.delete_many(&purged) {
            clear_terminals_for(&self.shared, &evicted);
            self.shared
                .bus
                .publish(CoreEvent::CacheEntryEvicted { digest: evicted, bytes });
        }

        self.shared.pool.kick();
        self.publish_pool_stats();
    }

    /// Replace the set of eviction-protected digests in one step.
    pub fn set_priority(&self, digests: HashSet<Digest>) {
        self.shared.priority.set(digests);
    }

    /// Invalidate any cached entry for the path's current digest and
    /// resubmit the path ahead of the queue, bypassing the window gates.
    pub fn force_reprocess(&self, path: &Path) -> bool {
        if let Some(digest) = self.shared.path_digests.get(path).map(|d| d.value().clone()) {
            if let Some(bytes) = self.shared.store.invalidate(&digest) {
                self.shared.window.forget(&digest);
                self.shared
                    .bus
                    .publish(CoreEvent::CacheEntryEvicted { digest, bytes });
            }
        }

        self.shared.pool.clear_terminal(path);
        let accepted = self.shared.pool.enqueue(path.to_path_buf(), true, true);
        if accepted {
            self.publish_pool_stats();
        }
        accepted
    }

    /// Migrate queued, in-flight and terminal references after a rename.
    ///
    /// Cache entries are keyed by digest and remain untouched.
    pub fn handle_rename(&self, old_path: &Path, new_path: &Path) {
        debug!(old = %old_path.display(), new = %new_path.display(), "Handling rename");
        self.shared.pool.migrate_path(old_path, new_path);
        if let Some((_, digest)) = self.shared.path_digests.remove(old_path) {
            self.shared
                .path_digests
                .insert(new_path.to_path_buf(), digest);
        }
    }

    /// Drop a deleted path from the queue and terminal tracking, and release
    /// its last-known digest to the cache unless priority-protected.
    pub fn handle_delete(&self, path: &Path) {
        debug!(path = %path.display(), "Handling delete");
        self.shared.pool.remove(path);
        self.shared.pool.clear_terminal(path);

        if let Some((_, digest)) = self.shared.path_digests.remove(path) {
            for (evicted, bytes) in self.shared.store.delete_many(&[digest]) {
                self.shared.window.forget(&evicted);
                clear_terminals_for(&self.shared, &evicted);
                self.shared
                    .bus
                    .publish(CoreEvent::CacheEntryEvicted { digest: evicted, bytes });
            }
        }
        self.publish_pool_stats();
    }

    /// Drop all pending submissions; in-flight runs continue to completion.
    pub fn clear_queue(&self) -> usize {
        let dropped = self.shared.pool.clear_queue();
        if dropped > 0 {
            self.publish_pool_stats();
        }
        dropped
    }

    /// Combined pool, window and cache snapshots.
    pub fn status(&self) -> StatusSnapshot {
        StatusSnapshot {
            pool: self.shared.pool.stats(),
            window: self.shared.window.snapshot(),
            cache: self.shared.store.status(),
        }
    }

    /// Open a new event subscription.
    pub fn subscribe(&self) -> EventSubscription {
        self.shared.bus.subscribe()
    }

    /// The digest last observed for a path, if any run has hashed it.
    pub fn last_known_digest(&self, path: &Path) -> Option<Digest> {
        self.shared.path_digests.get(path).map(|d| d.value().clone())
    }

    /// Direct store handle (blob paths for the review surface).
    pub fn store(&self) -> Arc<CacheStore> {
        Arc::clone(&self.shared.store)
    }

    /// Stop dispatching and cancel in-flight runs cooperatively.
    pub fn shutdown(&self) {
        self.shared.pool.shutdown();
        self.shared.shutdown.cancel();
    }

    fn publish_pool_stats(&self) {
        self.shared.bus.publish(CoreEvent::PoolStatsChanged {
            stats: self.shared.pool.stats(),
        });
    }
}

impl<D, F, T> Drop for PipelineCoordinator<D, F, T>
where
    D: RawDecoder,
    F: FaceDetector,
    T: ThumbnailCropper,
{
    fn drop(&mut self) {
        self.shared.pool.shutdown();
        self.shared.shutdown.cancel();
    }
}

/// Drain worker completions: reconcile identity, drive the window, enforce
/// the budget, publish stats, keep the dispatcher moving.
async fn run_completion_loop<D, F, T>(
    mut completions: mpsc::UnboundedReceiver<TaskCompletion>,
    shared: Arc<CoordShared<D, F, T>>,
) where
    D: RawDecoder,
    F: FaceDetector,
    T: ThumbnailCropper,
{
    loop {
        tokio::select! {
            _ = shared.shutdown.cancelled() => break,
            maybe = completions.recv() => match maybe {
                Some(completion) => handle_completion(&shared, completion).await,
                None => break,
            },
        }
    }
    debug!("Completion loop drained");
}

async fn handle_completion<D, F, T>(shared: &Arc<CoordShared<D, F, T>>, completion: TaskCompletion)
where
    D: RawDecoder,
    F: FaceDetector,
    T: ThumbnailCropper,
{
    if let Some(digest) = &completion.digest {
        shared
            .path_digests
            .insert(completion.path.clone(), digest.clone());
    }

    match &completion.state {
        TaskState::Completed { digest, .. } | TaskState::AlreadyProcessed { digest, .. } => {
            let queued = shared.pool.queued_len();
            if let Some(WindowTransition::Paused { ready, queued }) =
                shared.window.on_completed(digest.clone(), queued)
            {
                shared
                    .bus
                    .publish(CoreEvent::WindowPaused { ready, queued });
            }

            // Budget enforcement piggybacks on admissions: a no-op atomic
            // check while under budget.
            let store = Arc::clone(&shared.store);
            let report = tokio::task::spawn_blocking(move || store.tick_eviction())
                .await
                .unwrap_or_default();
            for (evicted, bytes) in report.evicted {
                clear_terminals_for(shared, &evicted);
                shared
                    .bus
                    .publish(CoreEvent::CacheEntryEvicted { digest: evicted, bytes });
            }
        }
        TaskState::MissingFile => {
            // Release the vanished file's cache entry unless protected.
            if let Some(digest) = shared
                .path_digests
                .get(&completion.path)
                .map(|d| d.value().clone())
            {
                for (evicted, bytes) in shared.store.delete_many(&[digest]) {
                    shared.window.forget(&evicted);
                    clear_terminals_for(shared, &evicted);
                    shared
                        .bus
                        .publish(CoreEvent::CacheEntryEvicted { digest: evicted, bytes });
                }
            }
        }
        TaskState::Errored { .. } => {}
        TaskState::Pending | TaskState::Running(_) => {
            // Workers only report terminal states.
            debug!(path = %completion.path.display(), "Ignoring non-terminal completion");
        }
    }

    shared.bus.publish(CoreEvent::PoolStatsChanged {
        stats: shared.pool.stats(),
    });
    shared.pool.kick();
}

/// Re-open submission for every path whose last-known digest was evicted.
fn clear_terminals_for<D, F, T>(shared: &Arc<CoordShared<D, F, T>>, digest: &Digest)
where
    D: RawDecoder,
    F: FaceDetector,
    T: ThumbnailCropper,
{
    let paths: Vec<PathBuf> = shared
        .path_digests
        .iter()
        .filter(|entry| entry.value() == digest)
        .map(|entry| entry.key().clone())
        .collect();
    for path in paths {
        shared.pool.clear_terminal(&path);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::BBox;
    use crate::config::WindowConfig;
    use crate::pipeline::{CropError, DecodeError, DetectError, DetectInput};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;
    use tempfile::TempDir;

    struct NoopDecoder;

    impl RawDecoder for NoopDecoder {
        async fn decode(&self, _path: PathBuf) -> Result<Vec<u8>, DecodeError> {
            Ok(vec![0u8; 16])
        }
    }

    struct CountingDetector {
        calls: AtomicUsize,
    }

    impl FaceDetector for CountingDetector {
        async fn detect(&self, _input: DetectInput) -> Result<Vec<BBox>, DetectError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(vec![BBox::new(0, 0, 10, 10), BBox::new(20, 0, 10, 10)])
        }
    }

    struct NoopCropper;

    impl ThumbnailCropper for NoopCropper {
        async fn crop(&self, _input: DetectInput, _bbox: BBox) -> Result<Vec<u8>, CropError> {
            Ok(vec![0u8; 8])
        }
    }

    fn coordinator(
        temp: &TempDir,
    ) -> PipelineCoordinator<NoopDecoder, CountingDetector, NoopCropper> {
        let config = CoreConfig::default()
            .with_cache_root(temp.path().join("cache"))
            .with_max_workers(2);
        PipelineCoordinator::open(
            config,
            NoopDecoder,
            CountingDetector {
                calls: AtomicUsize::new(0),
            },
            NoopCropper,
        )
        .unwrap()
    }

    /// The digest mapping is written by the completion loop, which may lag
    /// the worker's terminal event; poll briefly instead of asserting
    /// immediately.
    async fn wait_digest(
        coord: &PipelineCoordinator<NoopDecoder, CountingDetector, NoopCropper>,
        path: &Path,
    ) -> Digest {
        for _ in 0..500 {
            if let Some(d) = coord.last_known_digest(path) {
                return d;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("digest never recorded for {}", path.display());
    }

    async fn wait_for_terminal(
        sub: &mut EventSubscription,
        path: &Path,
    ) -> CoreEvent {
        loop {
            let event = tokio::time::timeout(Duration::from_secs(5), sub.recv())
                .await
                .expect("timed out waiting for event")
                .expect("bus closed");
            match &event {
                CoreEvent::TaskCompleted { path: p, .. }
                | CoreEvent::TaskErrored { path: p, .. }
                | CoreEvent::FileMissing { path: p }
                | CoreEvent::AlreadyProcessed { path: p, .. }
                    if p == path =>
                {
                    return event;
                }
                _ => {}
            }
        }
    }

    #[tokio::test]
    async fn invalid_config_is_rejected_at_open() {
        let temp = TempDir::new().unwrap();
        let config = CoreConfig::default()
            .with_cache_root(temp.path().join("cache"))
            .with_window(WindowConfig {
                max_ready_items: 1,
                min_queue_buffer: 5,
                resume_threshold: 2,
            });
        let result = PipelineCoordinator::open(
            config,
            NoopDecoder,
            CountingDetector {
                calls: AtomicUsize::new(0),
            },
            NoopCropper,
        );
        assert!(matches!(result, Err(CoordinatorError::Config(_))));
    }

    #[tokio::test]
    async fn enqueue_runs_to_completion_and_records_digest() {
        let temp = TempDir::new().unwrap();
        let coord = coordinator(&temp);
        let mut sub = coord.subscribe();

        let dir = temp.path().join("photos");
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("a.jpg");
        std::fs::write(&path, b"photo a").unwrap();

        assert_eq!(
            coord.enqueue(vec![path.clone()], EnqueuePosition::Tail, false),
            1
        );
        let event = wait_for_terminal(&mut sub, &path).await;
        assert!(matches!(event, CoreEvent::TaskCompleted { .. }));
        wait_digest(&coord, &path).await;
    }

    #[tokio::test]
    async fn sorted_position_sorts_batch() {
        let temp = TempDir::new().unwrap();
        let coord = coordinator(&temp);

        let dir = temp.path().join("photos");
        std::fs::create_dir_all(&dir).unwrap();
        let b = dir.join("b.jpg");
        let a = dir.join("a.jpg");
        std::fs::write(&b, b"bb").unwrap();
        std::fs::write(&a, b"aa").unwrap();

        let accepted = coord.enqueue(vec![b, a], EnqueuePosition::Sorted, false);
        assert_eq!(accepted, 2);
    }

    #[tokio::test]
    async fn duplicate_enqueue_is_deduplicated() {
        let temp = TempDir::new().unwrap();
        let coord = coordinator(&temp);

        let dir = temp.path().join("photos");
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("a.jpg");
        std::fs::write(&path, b"photo").unwrap();

        let first = coord.enqueue(
            vec![path.clone(), path.clone()],
            EnqueuePosition::Tail,
            false,
        );
        assert_eq!(first, 1);
    }

    #[tokio::test]
    async fn status_reports_all_three_components() {
        let temp = TempDir::new().unwrap();
        let coord = coordinator(&temp);

        let status = coord.status();
        assert_eq!(status.pool.max_workers, 2);
        assert_eq!(status.window.ready, 0);
        assert_eq!(status.cache.entries, 0);
    }

    #[tokio::test]
    async fn handle_rename_migrates_digest_mapping() {
        let temp = TempDir::new().unwrap();
        let coord = coordinator(&temp);
        let mut sub = coord.subscribe();

        let dir = temp.path().join("photos");
        std::fs::create_dir_all(&dir).unwrap();
        let old = dir.join("old.jpg");
        std::fs::write(&old, b"content").unwrap();

        coord.enqueue(vec![old.clone()], EnqueuePosition::Tail, false);
        wait_for_terminal(&mut sub, &old).await;
        let digest = wait_digest(&coord, &old).await;

        let new = dir.join("new.jpg");
        std::fs::rename(&old, &new).unwrap();
        coord.handle_rename(&old, &new);

        assert!(coord.last_known_digest(&old).is_none());
        assert_eq!(coord.last_known_digest(&new), Some(digest));
    }

    #[tokio::test]
    async fn handle_delete_releases_cache_entry() {
        let temp = TempDir::new().unwrap();
        let coord = coordinator(&temp);
        let mut sub = coord.subscribe();

        let dir = temp.path().join("photos");
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("a.jpg");
        std::fs::write(&path, b"doomed photo").unwrap();

        coord.enqueue(vec![path.clone()], EnqueuePosition::Tail, false);
        wait_for_terminal(&mut sub, &path).await;
        let digest = wait_digest(&coord, &path).await;
        assert!(coord.store().contains(&digest));

        std::fs::remove_file(&path).unwrap();
        coord.handle_delete(&path);

        assert!(!coord.store().contains(&digest));
        assert!(coord.last_known_digest(&path).is_none());
    }

    #[tokio::test]
    async fn handle_delete_spares_priority_digest() {
        let temp = TempDir::new().unwrap();
        let coord = coordinator(&temp);
        let mut sub = coord.subscribe();

        let dir = temp.path().join("photos");
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("a.jpg");
        std::fs::write(&path, b"protected photo").unwrap();

        coord.enqueue(vec![path.clone()], EnqueuePosition::Tail, false);
        wait_for_terminal(&mut sub, &path).await;
        let digest = wait_digest(&coord, &path).await;

        coord.set_priority([digest.clone()].into_iter().collect());
        coord.handle_delete(&path);

        assert!(coord.store().contains(&digest));
    }

    #[tokio::test]
    async fn force_reprocess_invalidates_and_reruns() {
        let temp = TempDir::new().unwrap();
        let coord = coordinator(&temp);
        let mut sub = coord.subscribe();

        let dir = temp.path().join("photos");
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("a.jpg");
        std::fs::write(&path, b"photo").unwrap();

        coord.enqueue(vec![path.clone()], EnqueuePosition::Tail, false);
        let first = wait_for_terminal(&mut sub, &path).await;
        assert!(matches!(first, CoreEvent::TaskCompleted { .. }));

        assert!(coord.force_reprocess(&path));
        let second = wait_for_terminal(&mut sub, &path).await;
        // The entry was invalidated, so the rerun is a full completion, not
        // a cache hit.
        assert!(matches!(second, CoreEvent::TaskCompleted { .. }));
    }
}
