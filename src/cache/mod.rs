//! Content-addressed persistent artifact cache.
//!
//! Durable mapping from content [`Digest`](crate::digest::Digest) to
//! [`CacheEntry`], with artifact blobs stored in a content-addressed
//! directory layout:
//!
//! ```text
//! <root>/
//!   blobs/<first-2-hex>/<digest>.preview.jpg      # optional decoded preview
//!   blobs/<first-2-hex>/<digest>.thumbs/<n>.jpg   # one per face index
//!   index/<digest>.json                           # CacheEntry metadata
//!   lock                                          # exclusive at startup
//!   tmp/<digest>.<uuid>.partial                   # in-flight writes
//! ```
//!
//! Admission is atomic (staged writes, rename, metadata last); eviction is
//! LRU by `completed_at` with priority digests evicted last; the total size
//! budget is soft.

mod eviction;
mod layout;
mod store;
mod types;

pub use eviction::{order_candidates, EvictionCandidate, EvictionReport};
pub use layout::CacheLayout;
pub use store::CacheStore;
pub use types::{
    AdmitOutcome, Artifact, BBox, CacheEntry, CacheError, CacheStatus, ENTRY_OVERHEAD_BYTES,
};
