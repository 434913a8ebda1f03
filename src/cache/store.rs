//! The persistent cache store.
//!
//! All operations are synchronous blocking I/O; async callers wrap them in
//! `spawn_blocking`. Readers never block admissions of other digests: the
//! in-memory index is a sharded concurrent map and admission serializes on a
//! per-digest mutex only.

use super::eviction::{order_candidates, EvictionCandidate, EvictionReport};
use super::layout::CacheLayout;
use super::types::{AdmitOutcome, Artifact, CacheEntry, CacheError, CacheStatus};
use crate::config::CacheConfig;
use crate::digest::Digest;
use crate::priority::PriorityIndex;
use crate::time::{system_time_to_monotonic_ms, Clock};
use dashmap::DashMap;
use std::collections::HashSet;
use std::fs;
use std::io::Write;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::SystemTime;
use tracing::{debug, info, warn};

/// ENOSPC; staging failures with this code surface as `StorageFull`.
const ENOSPC: i32 = 28;

/// Holds the exclusive root lockfile; removed on drop.
struct RootLock {
    path: std::path::PathBuf,
}

impl Drop for RootLock {
    fn drop(&mut self) {
        let _ = fs::remove_file(&self.path);
    }
}

/// Durable content-addressed artifact store with priority-pinned LRU
/// eviction.
pub struct CacheStore {
    layout: CacheLayout,
    budget_bytes: u64,
    /// In-memory mirror of `index/*.json`.
    index: DashMap<Digest, CacheEntry>,
    /// Per-digest admission serialization.
    admissions: DashMap<Digest, Arc<Mutex<()>>>,
    /// Charged bytes across all entries.
    total_bytes: AtomicU64,
    /// One eviction tick at a time.
    eviction_tick: Mutex<()>,
    clock: Arc<dyn Clock>,
    priority: Arc<PriorityIndex>,
    _lock: RootLock,
}

impl CacheStore {
    /// Open (or create) a store rooted at `config.root`.
    ///
    /// Acquires the exclusive root lockfile, reaps orphaned staging files,
    /// and rebuilds the in-memory index from `index/*.json`, dropping
    /// entries whose blobs are missing or size-mismatched. `completed_at`
    /// values are re-seeded from metadata-file mtime so eviction order
    /// survives restarts without wall-clock trust.
    ///
    /// # Errors
    ///
    /// [`CacheError::AlreadyLocked`] when another process holds the root;
    /// [`CacheError::Io`] for filesystem failures.
    pub fn open(
        config: &CacheConfig,
        clock: Arc<dyn Clock>,
        priority: Arc<PriorityIndex>,
    ) -> Result<Self, CacheError> {
        let layout = CacheLayout::new(&config.root);
        layout.ensure_dirs()?;
        let lock = Self::acquire_lock(&layout)?;

        let store = Self {
            layout,
            budget_bytes: config.budget_bytes,
            index: DashMap::new(),
            admissions: DashMap::new(),
            total_bytes: AtomicU64::new(0),
            eviction_tick: Mutex::new(()),
            clock,
            priority,
            _lock: lock,
        };

        store.reap_staging_files();
        store.rebuild_index()?;

        info!(
            root = %store.layout.root().display(),
            entries = store.index.len(),
            bytes = store.total_bytes.load(Ordering::Relaxed),
            budget = store.budget_bytes,
            "Cache store opened"
        );

        Ok(store)
    }

    /// Look up the entry for a digest.
    ///
    /// O(1) on the happy path and never blocked by writers of other digests.
    /// An entry whose blobs turn out to be missing is treated as corrupted:
    /// it is deleted and the lookup reports a miss.
    pub fn lookup(&self, digest: &Digest) -> Option<CacheEntry> {
        let entry = self.index.get(digest).map(|e| e.value().clone())?;

        if !self.blobs_intact(digest, &entry) {
            warn!(%digest, "Cache entry blobs missing or unreadable, dropping entry");
            self.remove_unchecked(digest);
            return None;
        }

        Some(entry)
    }

    /// Whether an entry exists (no blob verification).
    pub fn contains(&self, digest: &Digest) -> bool {
        self.index.contains_key(digest)
    }

    /// Admit an artifact for a digest.
    ///
    /// Staged-write protocol: every blob is written to `tmp/`, fsynced, then
    /// renamed into its content-addressed location; the metadata record is
    /// written last. A crash at any point leaves the previous entry intact
    /// or no entry for the digest. Concurrent admissions of the same digest
    /// serialize; the loser observes `Replaced`.
    ///
    /// # Errors
    ///
    /// [`CacheError::StorageFull`] when the disk runs out of space while
    /// staging (the caller may retry after an eviction tick); other I/O
    /// failures as [`CacheError::Io`].
    pub fn admit(&self, digest: &Digest, artifact: Artifact) -> Result<AdmitOutcome, CacheError> {
        if artifact
            .stages_done
            .contains(&crate::pipeline::PipelineStage::GeneratingThumbnails)
        {
            assert_eq!(
                artifact.thumbnails.len(),
                artifact.bboxes.len(),
                "artifact invariant: thumbnail count must equal bbox count"
            );
        }

        let guard = self.admission_guard(digest);
        let _held = guard.lock().expect("admission lock poisoned");

        let previous = self.index.get(digest).map(|e| e.value().clone());
        let outcome = if previous.is_some() {
            // Retract the metadata record first: a crash mid-replacement
            // must not leave a record pointing at mixed-generation blobs.
            let _ = fs::remove_file(self.layout.index_path(digest));
            AdmitOutcome::Replaced
        } else {
            AdmitOutcome::Admitted
        };

        match self.write_blobs(digest, &artifact, previous.as_ref()) {
            Ok(()) => {}
            Err(e) => {
                // The previous in-memory entry no longer matches disk. The
                // admission guard is already held here.
                if previous.is_some() {
                    self.remove_entry_inner(digest);
                }
                return Err(e);
            }
        }

        let entry = CacheEntry {
            face_count: artifact.bboxes.len() as u32,
            bboxes: artifact.bboxes.clone(),
            stages_done: artifact.stages_done.clone(),
            completed_at: self.clock.now(),
            has_preview: artifact.preview.is_some(),
            size_bytes: artifact.blob_bytes(),
            extra: previous.map(|p| p.extra).unwrap_or_default(),
        };
        self.write_metadata(digest, &entry)?;

        let charged = entry.charged_bytes();
        if let Some(old) = self.index.insert(digest.clone(), entry) {
            self.total_bytes
                .fetch_sub(old.charged_bytes(), Ordering::Relaxed);
        }
        self.total_bytes.fetch_add(charged, Ordering::Relaxed);

        debug!(%digest, ?outcome, charged, "Artifact admitted");
        Ok(outcome)
    }

    /// Hint-delete a set of digests.
    ///
    /// The hint path honors the priority rule: digests in the priority set
    /// are spared. Idempotent; absent digests are ignored. Returns the
    /// digests actually removed with the charged bytes each reclaimed.
    pub fn delete_many(&self, digests: &[Digest]) -> Vec<(Digest, u64)> {
        let protected = self.priority.snapshot();
        let mut removed = Vec::new();

        for digest in digests {
            if protected.contains(digest) {
                debug!(%digest, "Delete hint spared priority digest");
                continue;
            }
            if let Some(bytes) = self.remove_unchecked(digest) {
                removed.push((digest.clone(), bytes));
            }
        }

        removed
    }

    /// Unconditionally remove an entry, priority or not.
    ///
    /// Used by forced reprocessing and corrupted-entry cleanup. Returns the
    /// charged bytes reclaimed, or `None` if no entry existed.
    pub fn invalidate(&self, digest: &Digest) -> Option<u64> {
        self.remove_unchecked(digest)
    }

    /// Replace the priority set in one step.
    pub fn set_priority(&self, digests: HashSet<Digest>) {
        self.priority.set(digests);
    }

    /// Run one eviction pass.
    ///
    /// Removes entries in strict order (non-priority oldest first, digest
    /// tiebreak; priority entries only once no non-priority candidate
    /// remains) until charged bytes fit the soft budget. The candidate list
    /// is decided once per tick; deletions take short per-entry writes.
    pub fn tick_eviction(&self) -> EvictionReport {
        let _tick = self.eviction_tick.lock().expect("eviction lock poisoned");
        let mut report = EvictionReport::default();

        if self.total_bytes.load(Ordering::Relaxed) <= self.budget_bytes {
            return report;
        }

        let protected = self.priority.snapshot();
        let candidates: Vec<EvictionCandidate> = self
            .index
            .iter()
            .map(|e| EvictionCandidate {
                digest: e.key().clone(),
                completed_at: e.value().completed_at,
                charged_bytes: e.value().charged_bytes(),
                priority: protected.contains(e.key()),
            })
            .collect();

        for candidate in order_candidates(candidates) {
            if self.total_bytes.load(Ordering::Relaxed) <= self.budget_bytes {
                break;
            }
            if let Some(bytes) = self.remove_unchecked(&candidate.digest) {
                report.record(candidate.digest, bytes);
            }
        }

        if !report.evicted.is_empty() {
            info!(
                evicted = report.evicted.len(),
                bytes_reclaimed = report.bytes_reclaimed,
                remaining_bytes = self.total_bytes.load(Ordering::Relaxed),
                "Cache eviction tick complete"
            );
        }

        report
    }

    /// Approximate occupancy snapshot.
    pub fn status(&self) -> CacheStatus {
        let bytes = self.total_bytes.load(Ordering::Relaxed);
        let pct = if self.budget_bytes == 0 {
            100.0
        } else {
            (bytes as f64 / self.budget_bytes as f64) * 100.0
        };
        CacheStatus {
            entries: self.index.len(),
            bytes,
            budget: self.budget_bytes,
            pct,
        }
    }

    /// Charged bytes across all entries.
    pub fn total_bytes(&self) -> u64 {
        self.total_bytes.load(Ordering::Relaxed)
    }

    /// Number of entries.
    pub fn entry_count(&self) -> usize {
        self.index.len()
    }

    /// Whether a digest is currently eviction-protected.
    pub fn is_priority(&self, digest: &Digest) -> bool {
        self.priority.contains(digest)
    }

    /// The layout, for callers that need to open blob paths.
    pub fn layout(&self) -> &CacheLayout {
        &self.layout
    }

    // ------------------------------------------------------------------
    // Internals
    // ------------------------------------------------------------------

    fn admission_guard(&self, digest: &Digest) -> Arc<Mutex<()>> {
        self.admissions
            .entry(digest.clone())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    fn acquire_lock(layout: &CacheLayout) -> Result<RootLock, CacheError> {
        let lock_path = layout.lock_path();
        match fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&lock_path)
        {
            Ok(mut f) => {
                let _ = writeln!(f, "pid={}", std::process::id());
                Ok(RootLock { path: lock_path })
            }
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                Err(CacheError::AlreadyLocked(lock_path))
            }
            Err(e) => Err(CacheError::Io(e)),
        }
    }

    /// Delete leftover `tmp/*.partial` files from interrupted admissions.
    fn reap_staging_files(&self) {
        let Ok(entries) = fs::read_dir(self.layout.tmp_dir()) else {
            return;
        };
        let mut reaped = 0usize;
        for entry in entries.flatten() {
            let name = entry.file_name();
            let Some(name) = name.to_str() else { continue };
            if CacheLayout::is_partial_name(name) && fs::remove_file(entry.path()).is_ok() {
                reaped += 1;
            }
        }
        if reaped > 0 {
            info!(reaped, "Reaped orphaned staging files");
        }
    }

    /// Rebuild the in-memory index from `index/*.json`.
    fn rebuild_index(&self) -> Result<(), CacheError> {
        let process_start = SystemTime::now();
        let mut dropped = 0usize;

        for dir_entry in fs::read_dir(self.layout.index_dir())?.flatten() {
            let name = dir_entry.file_name();
            let Some(name) = name.to_str() else { continue };
            let Some(digest) = CacheLayout::digest_from_index_name(name) else {
                continue;
            };

            let record = fs::read_to_string(dir_entry.path())
                .ok()
                .and_then(|text| serde_json::from_str::<CacheEntry>(&text).ok());
            let Some(mut entry) = record else {
                warn!(%digest, "Unreadable metadata record, deleting entry");
                self.delete_entry_files(&digest);
                dropped += 1;
                continue;
            };

            if !self.blobs_match_sizes(&digest, &entry) {
                warn!(%digest, "Blob set does not match metadata, deleting entry");
                self.delete_entry_files(&digest);
                dropped += 1;
                continue;
            }

            // Monotonic timestamps do not survive the process; reorder-safe
            // re-seed from the metadata file's mtime.
            if let Ok(meta) = dir_entry.metadata() {
                if let Ok(mtime) = meta.modified() {
                    entry.completed_at = system_time_to_monotonic_ms(mtime, process_start);
                }
            }

            self.total_bytes
                .fetch_add(entry.charged_bytes(), Ordering::Relaxed);
            self.index.insert(digest, entry);
        }

        debug!(
            entries = self.index.len(),
            dropped, "Cache index rebuilt from disk"
        );
        Ok(())
    }

    /// Light intactness check used on lookups: every blob the metadata
    /// promises must exist.
    fn blobs_intact(&self, digest: &Digest, entry: &CacheEntry) -> bool {
        if entry.has_preview && !self.layout.preview_path(digest).is_file() {
            return false;
        }
        if entry.thumbnails_present() {
            let thumbs = self.layout.thumbs_dir(digest);
            for i in 0..entry.face_count as usize {
                if !self.layout.thumb_path(digest, i).is_file() {
                    return false;
                }
            }
            if entry.face_count > 0 && !thumbs.is_dir() {
                return false;
            }
        }
        true
    }

    /// Full startup check: existence plus size accounting.
    fn blobs_match_sizes(&self, digest: &Digest, entry: &CacheEntry) -> bool {
        if !self.blobs_intact(digest, entry) {
            return false;
        }
        let mut actual = 0u64;
        if entry.has_preview {
            match fs::metadata(self.layout.preview_path(digest)) {
                Ok(m) => actual += m.len(),
                Err(_) => return false,
            }
        }
        if entry.thumbnails_present() {
            for i in 0..entry.face_count as usize {
                match fs::metadata(self.layout.thumb_path(digest, i)) {
                    Ok(m) => actual += m.len(),
                    Err(_) => return false,
                }
            }
        }
        actual == entry.size_bytes
    }

    /// Stage, fsync and rename every blob of an artifact into place.
    fn write_blobs(
        &self,
        digest: &Digest,
        artifact: &Artifact,
        previous: Option<&CacheEntry>,
    ) -> Result<(), CacheError> {
        fs::create_dir_all(self.layout.shard_dir(digest)).map_err(|e| self.map_io(digest, e))?;

        match &artifact.preview {
            Some(preview) => {
                self.stage_and_rename(digest, preview, &self.layout.preview_path(digest))?;
            }
            None => {
                if previous.is_some_and(|p| p.has_preview) {
                    let _ = fs::remove_file(self.layout.preview_path(digest));
                }
            }
        }

        if !artifact.thumbnails.is_empty() {
            fs::create_dir_all(self.layout.thumbs_dir(digest))
                .map_err(|e| self.map_io(digest, e))?;
        }
        for (i, thumb) in artifact.thumbnails.iter().enumerate() {
            self.stage_and_rename(digest, thumb, &self.layout.thumb_path(digest, i))?;
        }

        // A replacement with fewer faces must not leave stale crops behind.
        if let Some(prev) = previous {
            for i in artifact.thumbnails.len()..prev.face_count as usize {
                let _ = fs::remove_file(self.layout.thumb_path(digest, i));
            }
            if artifact.thumbnails.is_empty() && prev.thumbnails_present() {
                let _ = fs::remove_dir(self.layout.thumbs_dir(digest));
            }
        }

        Ok(())
    }

    /// Write one blob via the staging protocol.
    fn stage_and_rename(
        &self,
        digest: &Digest,
        bytes: &[u8],
        dest: &Path,
    ) -> Result<(), CacheError> {
        let stage = self.layout.stage_path(digest);

        let result = (|| -> std::io::Result<()> {
            let mut f = fs::File::create(&stage)?;
            f.write_all(bytes)?;
            f.sync_all()?;
            fs::rename(&stage, dest)
        })();

        if let Err(e) = result {
            let _ = fs::remove_file(&stage);
            return Err(self.map_io(digest, e));
        }
        Ok(())
    }

    /// Write the metadata record last, via the same staging protocol.
    fn write_metadata(&self, digest: &Digest, entry: &CacheEntry) -> Result<(), CacheError> {
        let text = serde_json::to_string_pretty(entry).map_err(|e| CacheError::Metadata {
            digest: digest.clone(),
            message: e.to_string(),
        })?;
        self.stage_and_rename(digest, text.as_bytes(), &self.layout.index_path(digest))
    }

    fn map_io(&self, digest: &Digest, e: std::io::Error) -> CacheError {
        if e.raw_os_error() == Some(ENOSPC) {
            CacheError::StorageFull {
                digest: digest.clone(),
            }
        } else {
            CacheError::Io(e)
        }
    }

    /// Remove an entry and its files; returns reclaimed charged bytes.
    ///
    /// Serializes against admissions of the same digest.
    fn remove_unchecked(&self, digest: &Digest) -> Option<u64> {
        let guard = self.admission_guard(digest);
        let _held = guard.lock().expect("admission lock poisoned");
        self.remove_entry_inner(digest)
    }

    /// Removal body; caller must hold the digest's admission guard.
    fn remove_entry_inner(&self, digest: &Digest) -> Option<u64> {
        let (_, entry) = self.index.remove(digest)?;
        let bytes = entry.charged_bytes();
        self.total_bytes.fetch_sub(bytes, Ordering::Relaxed);
        self.delete_entry_files(digest);
        Some(bytes)
    }

    /// Best-effort removal of all on-disk traces of a digest.
    ///
    /// Metadata goes first so a crash mid-way leaves "no entry" rather than
    /// a record pointing at missing blobs.
    fn delete_entry_files(&self, digest: &Digest) {
        let _ = fs::remove_file(self.layout.index_path(digest));
        let _ = fs::remove_file(self.layout.preview_path(digest));
        let _ = fs::remove_dir_all(self.layout.thumbs_dir(digest));
    }
}
