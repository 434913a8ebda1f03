//! Content digests and file hashing.
//!
//! A [`Digest`] is the identity of a file's *content*: the lowercase hex
//! SHA-1 of the full byte stream. Two paths may share a digest (copies); a
//! single path's digest may change (edit). All persistent state in the cache
//! keys on digests, never on paths.

use serde::{Deserialize, Serialize};
use sha1::{Digest as _, Sha1};
use std::fmt;
use std::io::Read;
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Read chunk size for streaming hashing.
///
/// Bounded so memory usage is independent of file size.
const HASH_CHUNK_SIZE: usize = 64 * 1024;

/// Opaque 40-character lowercase hexadecimal content digest.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Digest(String);

impl Digest {
    /// Parse a digest from a hex string.
    ///
    /// Accepts exactly 40 lowercase hexadecimal characters.
    pub fn from_hex(hex: impl Into<String>) -> Result<Self, DigestParseError> {
        let hex = hex.into();
        if hex.len() != 40 {
            return Err(DigestParseError::BadLength(hex.len()));
        }
        if !hex.bytes().all(|b| b.is_ascii_digit() || (b'a'..=b'f').contains(&b)) {
            return Err(DigestParseError::BadCharacter(hex));
        }
        Ok(Self(hex))
    }

    /// The digest as a hex string slice.
    #[inline]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// First two hex characters, used for the blob fan-out directories.
    #[inline]
    pub fn shard(&self) -> &str {
        &self.0[..2]
    }
}

impl fmt::Display for Digest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl TryFrom<String> for Digest {
    type Error = DigestParseError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::from_hex(value)
    }
}

impl From<Digest> for String {
    fn from(d: Digest) -> String {
        d.0
    }
}

/// Errors from parsing a digest string.
#[derive(Debug, Error)]
pub enum DigestParseError {
    /// Digest string has the wrong length (expected 40)
    #[error("digest must be 40 hex characters, got {0}")]
    BadLength(usize),

    /// Digest string contains non-hex or uppercase characters
    #[error("digest contains invalid characters: {0:?}")]
    BadCharacter(String),
}

/// Errors from hashing a file.
#[derive(Debug, Error)]
pub enum HashError {
    /// The file does not exist
    #[error("file not found: {0}")]
    FileNotFound(PathBuf),

    /// I/O failure during reading (truncation, permission denial)
    #[error("I/O error hashing {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Streaming file hasher.
///
/// Computes SHA-1 over the full byte stream in bounded chunks. Deterministic:
/// equal bytes produce equal digests regardless of chunking.
#[derive(Debug, Clone)]
pub struct ContentHasher {
    chunk_size: usize,
}

impl ContentHasher {
    /// Create a hasher with the default 64 KiB chunk size.
    pub fn new() -> Self {
        Self {
            chunk_size: HASH_CHUNK_SIZE,
        }
    }

    /// Create a hasher with a custom chunk size (tests exercise chunking
    /// boundaries with small values).
    pub fn with_chunk_size(chunk_size: usize) -> Self {
        assert!(chunk_size > 0, "chunk size must be non-zero");
        Self { chunk_size }
    }

    /// Hash the full contents of a file.
    ///
    /// This is blocking I/O; async callers wrap it in `spawn_blocking`.
    ///
    /// # Errors
    ///
    /// [`HashError::FileNotFound`] for absent paths, [`HashError::Io`] on any
    /// read failure. Never returns a partial digest.
    pub fn hash(&self, path: &Path) -> Result<Digest, HashError> {
        let mut file = match std::fs::File::open(path) {
            Ok(f) => f,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(HashError::FileNotFound(path.to_path_buf()));
            }
            Err(e) => {
                return Err(HashError::Io {
                    path: path.to_path_buf(),
                    source: e,
                });
            }
        };

        let mut hasher = Sha1::new();
        let mut buf = vec![0u8; self.chunk_size];
        loop {
            let n = file.read(&mut buf).map_err(|e| HashError::Io {
                path: path.to_path_buf(),
                source: e,
            })?;
            if n == 0 {
                break;
            }
            hasher.update(&buf[..n]);
        }

        let hex = format!("{:x}", hasher.finalize());
        Ok(Digest(hex))
    }
}

impl Default for ContentHasher {
    fn default() -> Self {
        Self::new()
    }
}

/// Hash a byte slice directly.
///
/// Used by tests to predict digests for fixture files.
pub fn digest_of_bytes(bytes: &[u8]) -> Digest {
    let mut hasher = Sha1::new();
    hasher.update(bytes);
    Digest(format!("{:x}", hasher.finalize()))
}
