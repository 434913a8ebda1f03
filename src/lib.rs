//! faceprep - preprocessing and cache coordination core for a desktop
//! face-recognition assistant.
//!
//! This library accepts a stream of image file paths, drives each through a
//! multi-stage preprocessing pipeline (content hash, RAW decode, face
//! detection, thumbnail generation), coordinates a bounded pool of concurrent
//! workers, applies rolling-window backpressure against the downstream human
//! review step, and maintains a content-addressed persistent cache with
//! priority-pinned LRU eviction.
//!
//! # High-Level API
//!
//! For most use cases, the [`coordinator`] module provides the facade:
//!
//! ```ignore
//! use faceprep::config::CoreConfig;
//! use faceprep::coordinator::{EnqueuePosition, PipelineCoordinator};
//!
//! let config = CoreConfig::default().with_cache_root(cache_dir);
//! let coordinator = PipelineCoordinator::open(config, decoder, detector, cropper)?;
//!
//! let mut events = coordinator.subscribe();
//! coordinator.enqueue(paths, EnqueuePosition::Sorted, false);
//! ```
//!
//! The face detector, RAW decoder and thumbnail cropper are injected
//! collaborators (see [`pipeline`]); the core owns none of their
//! implementations.

pub mod cache;
pub mod config;
pub mod coordinator;
pub mod digest;
pub mod events;
pub mod logging;
pub mod pipeline;
pub mod pool;
pub mod priority;
pub mod time;
pub mod window;

/// Version of the faceprep library.
///
/// Defined in `Cargo.toml` and injected at compile time.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
