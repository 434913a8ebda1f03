//! Bounded worker pool.
//!
//! Maintains a FIFO queue of pending paths and at most `max_workers`
//! concurrent pipeline runs. Dispatch is driven by a single loop task woken
//! on every queue change, worker completion and resume signal; it never
//! holds a lock across a spawn. Completions are reported to the coordinator
//! over an unbounded channel; the pool never calls upward into the window.

use crate::pipeline::{
    run_task, FaceDetector, PipelineContext, RawDecoder, TaskCompletion, TaskId, TaskState,
    ThumbnailCropper,
};
use crate::window::AdmissionGate;
use std::collections::{HashMap, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::{mpsc, Notify};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

/// Pool counters for status reporting and `PoolStatsChanged` events.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PoolStats {
    pub queued: usize,
    pub in_flight: usize,
    pub max_workers: usize,
    pub paused: bool,
}

/// One pending submission.
#[derive(Debug, Clone)]
struct QueuedTask {
    path: PathBuf,
    /// Forced submissions bypass the pause and ready gates.
    force: bool,
}

struct PoolShared<D, F, T>
where
    D: RawDecoder,
    F: FaceDetector,
    T: ThumbnailCropper,
{
    ctx: Arc<PipelineContext<D, F, T>>,
    gate: Arc<AdmissionGate>,
    /// Pending submissions, FIFO with priority prepends.
    queue: Mutex<VecDeque<QueuedTask>>,
    /// Spawn key -> current name (diverges after a rename mid-flight).
    in_flight: Mutex<HashMap<PathBuf, PathBuf>>,
    in_flight_count: AtomicUsize,
    /// Failed-terminal paths; resubmission is ignored until cleared.
    terminal: Mutex<HashMap<PathBuf, ()>>,
    completions: mpsc::UnboundedSender<TaskCompletion>,
    dispatch_wake: Notify,
    max_workers: usize,
    shutdown: CancellationToken,
}

/// The worker pool handle.
///
/// Cheaply cloneable; clones share the queue, workers and dispatch loop.
pub struct WorkerPool<D, F, T>
where
    D: RawDecoder,
    F: FaceDetector,
    T: ThumbnailCropper,
{
    shared: Arc<PoolShared<D, F, T>>,
}

impl<D, F, T> Clone for WorkerPool<D, F, T>
where
    D: RawDecoder,
    F: FaceDetector,
    T: ThumbnailCropper,
{
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl<D, F, T> WorkerPool<D, F, T>
where
    D: RawDecoder,
    F: FaceDetector,
    T: ThumbnailCropper,
{
    /// Create a pool and start its dispatch loop.
    ///
    /// Completions are delivered to `completions` in the order workers
    /// finish.
    pub fn new(
        ctx: Arc<PipelineContext<D, F, T>>,
        gate: Arc<AdmissionGate>,
        max_workers: usize,
        completions: mpsc::UnboundedSender<TaskCompletion>,
    ) -> Self {
        let shared = Arc::new(PoolShared {
            ctx,
            gate,
            queue: Mutex::new(VecDeque::new()),
            in_flight: Mutex::new(HashMap::new()),
            in_flight_count: AtomicUsize::new(0),
            terminal: Mutex::new(HashMap::new()),
            completions,
            dispatch_wake: Notify::new(),
            max_workers,
            shutdown: CancellationToken::new(),
        });

        tokio::spawn(run_dispatch_loop(Arc::clone(&shared)));

        Self { shared }
    }

    /// Append a path to the queue tail.
    ///
    /// Ignored (returns `false`) when the path is already queued, in flight
    /// or recently failed-terminal.
    pub fn submit(&self, path: PathBuf) -> bool {
        self.enqueue(path, false, false)
    }

    /// Prepend a path to the queue head.
    ///
    /// With `force`, the submission also bypasses the window pause and
    /// ready-count gates (user-initiated navigation).
    pub fn submit_priority(&self, path: PathBuf, force: bool) -> bool {
        self.enqueue(path, true, force)
    }

    /// General submission: `front` prepends, `force` bypasses the window
    /// gates regardless of position.
    pub fn enqueue(&self, path: PathBuf, front: bool, force: bool) -> bool {
        if self.is_queued(&path) || self.is_in_flight(&path) || self.is_terminal(&path) {
            trace!(path = %path.display(), "Submission ignored (duplicate or terminal)");
            return false;
        }

        {
            let mut queue = self.shared.queue.lock().expect("pool queue lock poisoned");
            let task = QueuedTask { path, force };
            if front {
                queue.push_front(task);
            } else {
                queue.push_back(task);
            }
        }
        self.kick();
        true
    }

    /// Remove a pending path. No effect if already in flight.
    pub fn remove(&self, path: &Path) -> bool {
        let mut queue = self.shared.queue.lock().expect("pool queue lock poisoned");
        let before = queue.len();
        queue.retain(|q| q.path != path);
        before != queue.len()
    }

    /// Drop all pending submissions; in-flight runs continue to completion.
    pub fn clear_queue(&self) -> usize {
        let mut queue = self.shared.queue.lock().expect("pool queue lock poisoned");
        let dropped = queue.len();
        queue.clear();
        dropped
    }

    /// Current counters.
    pub fn stats(&self) -> PoolStats {
        PoolStats {
            queued: self.queued_len(),
            in_flight: self.shared.in_flight_count.load(Ordering::Acquire),
            max_workers: self.shared.max_workers,
            paused: self.shared.gate.paused(),
        }
    }

    /// Pending-queue length.
    pub fn queued_len(&self) -> usize {
        self.shared.queue.lock().expect("pool queue lock poisoned").len()
    }

    /// Whether a path is currently queued.
    pub fn is_queued(&self, path: &Path) -> bool {
        self.shared
            .queue
            .lock()
            .expect("pool queue lock poisoned")
            .iter()
            .any(|q| q.path == path)
    }

    /// Whether a path is currently in flight (by its current name).
    pub fn is_in_flight(&self, path: &Path) -> bool {
        self.shared
            .in_flight
            .lock()
            .expect("pool in-flight lock poisoned")
            .values()
            .any(|current| current == path)
    }

    /// Whether a path sits in the failed-terminal set.
    pub fn is_terminal(&self, path: &Path) -> bool {
        self.shared
            .terminal
            .lock()
            .expect("pool terminal lock poisoned")
            .contains_key(path)
    }

    /// Forget a failed-terminal marker, re-opening the path for submission.
    pub fn clear_terminal(&self, path: &Path) -> bool {
        self.shared
            .terminal
            .lock()
            .expect("pool terminal lock poisoned")
            .remove(path)
            .is_some()
    }

    /// Migrate every queued, in-flight and terminal reference from
    /// `old_path` to `new_path`.
    pub fn migrate_path(&self, old_path: &Path, new_path: &Path) {
        {
            let mut queue = self.shared.queue.lock().expect("pool queue lock poisoned");
            for task in queue.iter_mut() {
                if task.path == old_path {
                    task.path = new_path.to_path_buf();
                }
            }
        }
        {
            let mut in_flight = self
                .shared
                .in_flight
                .lock()
                .expect("pool in-flight lock poisoned");
            for current in in_flight.values_mut() {
                if current.as_path() == old_path {
                    *current = new_path.to_path_buf();
                }
            }
        }
        {
            let mut terminal = self
                .shared
                .terminal
                .lock()
                .expect("pool terminal lock poisoned");
            if terminal.remove(old_path).is_some() {
                terminal.insert(new_path.to_path_buf(), ());
            }
        }
    }

    /// Wake the dispatch loop (queue change, resume signal).
    pub fn kick(&self) {
        self.shared.dispatch_wake.notify_one();
    }

    /// Cancel in-flight runs (cooperatively) and stop dispatching.
    pub fn shutdown(&self) {
        self.shared.shutdown.cancel();
        self.shared.dispatch_wake.notify_one();
    }

}

/// The dispatch loop: wake, drain eligible work, repeat.
async fn run_dispatch_loop<D, F, T>(shared: Arc<PoolShared<D, F, T>>)
where
    D: RawDecoder,
    F: FaceDetector,
    T: ThumbnailCropper,
{
    loop {
        dispatch_eligible(&shared);
        tokio::select! {
            _ = shared.shutdown.cancelled() => {
                debug!("Pool dispatch loop shutting down");
                break;
            }
            _ = shared.dispatch_wake.notified() => {}
        }
    }
}

/// Spawn workers while capacity and admission allow.
///
/// Locks are released before every spawn.
fn dispatch_eligible<D, F, T>(shared: &Arc<PoolShared<D, F, T>>)
where
    D: RawDecoder,
    F: FaceDetector,
    T: ThumbnailCropper,
{
    loop {
        if shared.in_flight_count.load(Ordering::Acquire) >= shared.max_workers {
            return;
        }

        let Some(task) = pop_eligible(shared) else {
            return;
        };

        spawn_worker(shared, task);
    }
}

/// Pop the next dispatchable task.
///
/// With the gate open this is strict FIFO from the head. With the gate
/// closed only force-flagged tasks are dispatchable; the first one found is
/// pulled out of order (it has jumped ahead by definition).
fn pop_eligible<D, F, T>(shared: &Arc<PoolShared<D, F, T>>) -> Option<QueuedTask>
where
    D: RawDecoder,
    F: FaceDetector,
    T: ThumbnailCropper,
{
    let mut queue = shared.queue.lock().expect("pool queue lock poisoned");
    if queue.is_empty() {
        return None;
    }

    if shared.gate.admission_open() {
        return queue.pop_front();
    }

    let forced_at = queue.iter().position(|q| q.force)?;
    queue.remove(forced_at)
}

fn spawn_worker<D, F, T>(shared: &Arc<PoolShared<D, F, T>>, task: QueuedTask)
where
    D: RawDecoder,
    F: FaceDetector,
    T: ThumbnailCropper,
{
    let path = task.path.clone();
    {
        let mut in_flight = shared
            .in_flight
            .lock()
            .expect("pool in-flight lock poisoned");
        in_flight.insert(path.clone(), path.clone());
    }
    shared.in_flight_count.fetch_add(1, Ordering::AcqRel);

    let ctx = Arc::clone(&shared.ctx);
    let cancel = shared.shutdown.child_token();
    let shared = Arc::clone(shared);
    let task_id = TaskId::new();
    trace!(%task_id, path = %path.display(), "Dispatching worker");

    tokio::spawn(async move {
        let completion = run_task(task_id, path, ctx, cancel).await;
        on_worker_done(&shared, completion);
    });
}

/// Bookkeeping when a worker finishes: translate renamed paths, record
/// failed terminals, forward the completion, wake the dispatcher.
fn on_worker_done<D, F, T>(shared: &Arc<PoolShared<D, F, T>>, mut completion: TaskCompletion)
where
    D: RawDecoder,
    F: FaceDetector,
    T: ThumbnailCropper,
{
    let current_name = {
        let mut in_flight = shared
            .in_flight
            .lock()
            .expect("pool in-flight lock poisoned");
        in_flight.remove(&completion.path)
    };
    shared.in_flight_count.fetch_sub(1, Ordering::AcqRel);

    if let Some(current) = current_name {
        if current != completion.path {
            debug!(
                old = %completion.path.display(),
                new = %current.display(),
                "Completion re-addressed after rename"
            );
            completion.path = current;
        }
    }

    let failed = matches!(
        completion.state,
        TaskState::Errored { .. } | TaskState::MissingFile
    );
    if failed {
        shared
            .terminal
            .lock()
            .expect("pool terminal lock poisoned")
            .insert(completion.path.clone(), ());
    }

    let _ = shared.completions.send(completion);
    shared.dispatch_wake.notify_one();
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::{BBox, CacheStore};
    use crate::config::{CacheConfig, WindowConfig};
    use crate::digest::digest_of_bytes;
    use crate::events::EventBus;
    use crate::pipeline::{
        CropError, DecodeError, DetectError, DetectInput, PipelineConfig,
    };
    use crate::priority::PriorityIndex;
    use crate::time::MonotonicClock;
    use crate::window::RollingWindow;
    use std::sync::Mutex as StdMutex;
    use std::time::Duration;
    use tempfile::TempDir;

    /// Detector that records invocation order and can stall until released.
    struct RecordingDetector {
        order: StdMutex<Vec<PathBuf>>,
        delay: Duration,
    }

    impl FaceDetector for RecordingDetector {
        async fn detect(&self, input: DetectInput) -> Result<Vec<BBox>, DetectError> {
            if let DetectInput::Original(path) = &input {
                self.order.lock().unwrap().push(path.clone());
            }
            if !self.delay.is_zero() {
                tokio::time::sleep(self.delay).await;
            }
            Ok(vec![BBox::new(0, 0, 10, 10)])
        }
    }

    struct NoopDecoder;

    impl RawDecoder for NoopDecoder {
        async fn decode(&self, _path: PathBuf) -> Result<Vec<u8>, DecodeError> {
            Ok(vec![0u8; 8])
        }
    }

    struct NoopCropper;

    impl ThumbnailCropper for NoopCropper {
        async fn crop(&self, _input: DetectInput, _bbox: BBox) -> Result<Vec<u8>, CropError> {
            Ok(vec![0u8; 4])
        }
    }

    struct Harness {
        _temp: TempDir,
        pool: WorkerPool<NoopDecoder, RecordingDetector, NoopCropper>,
        completions: mpsc::UnboundedReceiver<TaskCompletion>,
        dir: PathBuf,
        detector: Arc<RecordingDetector>,
        window: RollingWindow,
    }

    fn harness(max_workers: usize, detect_delay: Duration) -> Harness {
        let temp = TempDir::new().unwrap();
        let store = CacheStore::open(
            &CacheConfig {
                root: temp.path().join("cache"),
                budget_bytes: 1 << 30,
            },
            MonotonicClock::shared(),
            Arc::new(PriorityIndex::new()),
        )
        .unwrap();

        let detector = Arc::new(RecordingDetector {
            order: StdMutex::new(Vec::new()),
            delay: detect_delay,
        });
        let ctx = Arc::new(PipelineContext::new(
            Arc::new(NoopDecoder),
            Arc::clone(&detector),
            Arc::new(NoopCropper),
            Arc::new(store),
            EventBus::new(),
            PipelineConfig::default(),
        ));

        let window = RollingWindow::new(WindowConfig::default());
        let (tx, rx) = mpsc::unbounded_channel();
        let pool = WorkerPool::new(ctx, window.gate(), max_workers, tx);

        let dir = temp.path().join("photos");
        std::fs::create_dir_all(&dir).unwrap();

        Harness {
            _temp: temp,
            pool,
            completions: rx,
            dir,
            detector,
            window,
        }
    }

    fn make_file(dir: &Path, name: &str) -> PathBuf {
        let path = dir.join(name);
        std::fs::write(&path, name.as_bytes()).unwrap();
        path
    }

    async fn drain_n(
        rx: &mut mpsc::UnboundedReceiver<TaskCompletion>,
        n: usize,
    ) -> Vec<TaskCompletion> {
        let mut out = Vec::with_capacity(n);
        for _ in 0..n {
            let c = tokio::time::timeout(Duration::from_secs(5), rx.recv())
                .await
                .expect("timed out waiting for completion")
                .expect("completion channel closed");
            out.push(c);
        }
        out
    }

    #[tokio::test]
    async fn submits_run_and_complete() {
        let mut h = harness(2, Duration::ZERO);
        let a = make_file(&h.dir, "a.jpg");

        assert!(h.pool.submit(a.clone()));
        let done = drain_n(&mut h.completions, 1).await;

        assert_eq!(done[0].path, a);
        assert!(matches!(done[0].state, TaskState::Completed { .. }));
    }

    #[tokio::test]
    async fn duplicate_submission_is_ignored() {
        let h = harness(1, Duration::from_millis(200));
        let a = make_file(&h.dir, "a.jpg");
        let b = make_file(&h.dir, "b.jpg");

        assert!(h.pool.submit(a.clone()));
        assert!(h.pool.submit(b.clone()));
        // Either queued or in flight by now; both re-submissions bounce.
        assert!(!h.pool.submit(a.clone()));
        assert!(!h.pool.submit(b));
    }

    #[tokio::test]
    async fn serial_pool_preserves_fifo_order() {
        let mut h = harness(1, Duration::from_millis(10));
        let paths: Vec<PathBuf> = (0..5)
            .map(|i| make_file(&h.dir, &format!("{i}.jpg")))
            .collect();

        for p in &paths {
            h.pool.submit(p.clone());
        }
        drain_n(&mut h.completions, 5).await;

        let order = h.detector.order.lock().unwrap().clone();
        assert_eq!(order, paths);
    }

    #[tokio::test]
    async fn priority_submission_jumps_queue() {
        let mut h = harness(1, Duration::from_millis(30));
        let first = make_file(&h.dir, "first.jpg");
        let second = make_file(&h.dir, "second.jpg");
        let urgent = make_file(&h.dir, "urgent.jpg");

        // first starts immediately; second waits; urgent jumps ahead of it.
        h.pool.submit(first);
        h.pool.submit(second.clone());
        h.pool.submit_priority(urgent.clone(), false);

        drain_n(&mut h.completions, 3).await;
        let order = h.detector.order.lock().unwrap().clone();
        let urgent_pos = order.iter().position(|p| p == &urgent).unwrap();
        let second_pos = order.iter().position(|p| p == &second).unwrap();
        assert!(urgent_pos < second_pos);
    }

    #[tokio::test]
    async fn max_workers_bounds_concurrency() {
        let mut h = harness(2, Duration::from_millis(100));
        for i in 0..6 {
            h.pool.submit(make_file(&h.dir, &format!("{i}.jpg")));
        }

        tokio::time::sleep(Duration::from_millis(30)).await;
        let stats = h.pool.stats();
        assert!(stats.in_flight <= 2);
        assert_eq!(stats.max_workers, 2);

        drain_n(&mut h.completions, 6).await;
    }

    #[tokio::test]
    async fn remove_unqueues_pending_but_not_in_flight() {
        let mut h = harness(1, Duration::from_millis(100));
        let running = make_file(&h.dir, "running.jpg");
        let waiting = make_file(&h.dir, "waiting.jpg");

        h.pool.submit(running.clone());
        h.pool.submit(waiting.clone());
        tokio::time::sleep(Duration::from_millis(30)).await;

        assert!(h.pool.remove(&waiting));
        assert!(!h.pool.remove(&running)); // already in flight

        let done = drain_n(&mut h.completions, 1).await;
        assert_eq!(done[0].path, running);
        assert_eq!(h.pool.queued_len(), 0);
    }

    #[tokio::test]
    async fn clear_queue_drops_pending_only() {
        let mut h = harness(1, Duration::from_millis(100));
        let running = make_file(&h.dir, "running.jpg");
        h.pool.submit(running.clone());
        tokio::time::sleep(Duration::from_millis(30)).await;
        for i in 0..3 {
            h.pool.submit(make_file(&h.dir, &format!("{i}.jpg")));
        }

        let dropped = h.pool.clear_queue();
        assert_eq!(dropped, 3);

        // The in-flight run still completes.
        let done = drain_n(&mut h.completions, 1).await;
        assert_eq!(done[0].path, running);
    }

    #[tokio::test]
    async fn missing_file_becomes_failed_terminal_and_blocks_resubmission() {
        let mut h = harness(1, Duration::ZERO);
        let ghost = h.dir.join("ghost.jpg");

        h.pool.submit(ghost.clone());
        let done = drain_n(&mut h.completions, 1).await;
        assert!(matches!(done[0].state, TaskState::MissingFile));

        assert!(h.pool.is_terminal(&ghost));
        assert!(!h.pool.submit(ghost.clone()));

        h.pool.clear_terminal(&ghost);
        assert!(h.pool.submit(ghost));
    }

    #[tokio::test]
    async fn completed_paths_may_be_resubmitted() {
        let mut h = harness(1, Duration::ZERO);
        let a = make_file(&h.dir, "a.jpg");

        h.pool.submit(a.clone());
        drain_n(&mut h.completions, 1).await;

        assert!(!h.pool.is_terminal(&a));
        assert!(h.pool.submit(a.clone()));
        let second = drain_n(&mut h.completions, 1).await;
        assert!(matches!(
            second[0].state,
            TaskState::AlreadyProcessed { .. }
        ));
    }

    #[tokio::test]
    async fn paused_gate_blocks_dispatch_until_kick() {
        let mut h = harness(2, Duration::ZERO);

        // Drive the window into pause through its public API.
        for i in 0..WindowConfig::default().min_queue_buffer {
            h.window
                .on_completed(digest_of_bytes(format!("x{i}").as_bytes()), 1);
        }
        assert!(h.window.gate().paused());

        let a = make_file(&h.dir, "a.jpg");
        h.pool.submit(a.clone());
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(h.pool.stats().in_flight, 0);
        assert_eq!(h.pool.queued_len(), 1);

        // Resume: consume enough items, then kick the dispatcher.
        for i in 0..WindowConfig::default().resume_threshold {
            h.window
                .mark_consumed(&digest_of_bytes(format!("x{i}").as_bytes()));
        }
        assert!(!h.window.gate().paused());
        h.pool.kick();

        let done = drain_n(&mut h.completions, 1).await;
        assert_eq!(done[0].path, a);
    }

    #[tokio::test]
    async fn forced_submission_bypasses_pause() {
        let mut h = harness(2, Duration::ZERO);
        for i in 0..WindowConfig::default().min_queue_buffer {
            h.window
                .on_completed(digest_of_bytes(format!("x{i}").as_bytes()), 1);
        }
        assert!(h.window.gate().paused());

        let urgent = make_file(&h.dir, "urgent.jpg");
        h.pool.submit_priority(urgent.clone(), true);

        let done = drain_n(&mut h.completions, 1).await;
        assert_eq!(done[0].path, urgent);
    }

    #[tokio::test]
    async fn rename_migrates_queue_and_completion_addressing() {
        let mut h = harness(1, Duration::from_millis(120));
        let running_old = make_file(&h.dir, "old.jpg");
        let queued_old = make_file(&h.dir, "queued-old.jpg");

        h.pool.submit(running_old.clone());
        h.pool.submit(queued_old.clone());
        tokio::time::sleep(Duration::from_millis(40)).await;

        // Rename the in-flight file and the queued file.
        let running_new = h.dir.join("new.jpg");
        let queued_new = h.dir.join("queued-new.jpg");
        std::fs::rename(&running_old, &running_new).unwrap();
        std::fs::rename(&queued_old, &queued_new).unwrap();
        h.pool.migrate_path(&running_old, &running_new);
        h.pool.migrate_path(&queued_old, &queued_new);

        let done = drain_n(&mut h.completions, 2).await;
        // The in-flight run reports under its new name.
        assert_eq!(done[0].path, running_new);
        // The queued entry was rewritten before dispatch.
        assert_eq!(done[1].path, queued_new);
        assert!(matches!(done[1].state, TaskState::Completed { .. }));
    }

    #[tokio::test]
    async fn stats_reflect_queue_and_flight() {
        let h = harness(1, Duration::from_millis(100));
        let stats = h.pool.stats();
        assert_eq!(
            stats,
            PoolStats {
                queued: 0,
                in_flight: 0,
                max_workers: 1,
                paused: false,
            }
        );
    }
}
