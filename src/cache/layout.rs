//! Cache path construction.
//!
//! Blob paths fan out on the first two hex characters of the digest so a
//! large cache never puts millions of files in one directory.

use crate::digest::Digest;
use std::path::{Path, PathBuf};

/// Filename prefix marker for staged in-flight writes.
const PARTIAL_SUFFIX: &str = ".partial";

/// Computes every on-disk location for a cache root.
#[derive(Debug, Clone)]
pub struct CacheLayout {
    root: PathBuf,
}

impl CacheLayout {
    /// Create a layout rooted at `root`.
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// The cache root directory.
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// `<root>/blobs`
    pub fn blobs_dir(&self) -> PathBuf {
        self.root.join("blobs")
    }

    /// `<root>/index`
    pub fn index_dir(&self) -> PathBuf {
        self.root.join("index")
    }

    /// `<root>/tmp`
    pub fn tmp_dir(&self) -> PathBuf {
        self.root.join("tmp")
    }

    /// `<root>/lock`
    pub fn lock_path(&self) -> PathBuf {
        self.root.join("lock")
    }

    /// Shard directory for a digest: `<root>/blobs/<first-2-hex>`.
    pub fn shard_dir(&self, digest: &Digest) -> PathBuf {
        self.blobs_dir().join(digest.shard())
    }

    /// Decoded preview blob: `<root>/blobs/<2-hex>/<digest>.preview.jpg`.
    pub fn preview_path(&self, digest: &Digest) -> PathBuf {
        self.shard_dir(digest)
            .join(format!("{}.preview.jpg", digest))
    }

    /// Thumbnail directory: `<root>/blobs/<2-hex>/<digest>.thumbs`.
    pub fn thumbs_dir(&self, digest: &Digest) -> PathBuf {
        self.shard_dir(digest).join(format!("{}.thumbs", digest))
    }

    /// One thumbnail blob, addressed by `(digest, face_index)`.
    pub fn thumb_path(&self, digest: &Digest, face_index: usize) -> PathBuf {
        self.thumbs_dir(digest).join(format!("{}.jpg", face_index))
    }

    /// Metadata record: `<root>/index/<digest>.json`.
    pub fn index_path(&self, digest: &Digest) -> PathBuf {
        self.index_dir().join(format!("{}.json", digest))
    }

    /// Fresh staging path: `<root>/tmp/<digest>.<uuid>.partial`.
    ///
    /// Staged files live under the cache root so the final rename never
    /// crosses a filesystem boundary.
    pub fn stage_path(&self, digest: &Digest) -> PathBuf {
        self.tmp_dir()
            .join(format!("{}.{}{}", digest, uuid::Uuid::new_v4(), PARTIAL_SUFFIX))
    }

    /// Whether a tmp-directory file name is a staged partial write.
    pub fn is_partial_name(name: &str) -> bool {
        name.ends_with(PARTIAL_SUFFIX)
    }

    /// Parse the digest out of an index filename (`<digest>.json`).
    pub fn digest_from_index_name(name: &str) -> Option<Digest> {
        let hex = name.strip_suffix(".json")?;
        Digest::from_hex(hex).ok()
    }

    /// Create the directory skeleton (root, blobs, index, tmp).
    pub fn ensure_dirs(&self) -> std::io::Result<()> {
        std::fs::create_dir_all(self.blobs_dir())?;
        std::fs::create_dir_all(self.index_dir())?;
        std::fs::create_dir_all(self.tmp_dir())?;
        Ok(())
    }
}
