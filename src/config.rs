//! Core configuration.
//!
//! One configuration struct per component plus a top-level [`CoreConfig`]
//! that the coordinator consumes. Watermark relationships are validated at
//! configuration time; a misconfigured window is a startup error, never a
//! runtime surprise.

use std::collections::HashSet;
use std::path::PathBuf;
use thiserror::Error;

/// Default soft cache budget: 1 GiB.
pub const DEFAULT_CACHE_BUDGET_BYTES: u64 = 1024 * 1024 * 1024;

/// Default maximum concurrent pipeline workers.
pub const DEFAULT_MAX_WORKERS: usize = 3;

/// Rolling-window watermarks.
///
/// Invariant: `max_ready_items >= min_queue_buffer > resume_threshold >= 1`.
#[derive(Debug, Clone)]
pub struct WindowConfig {
    /// Hard admission cap. The pool will not dispatch new work while the
    /// tracked ready population is at or above this value.
    pub max_ready_items: usize,
    /// Pause watermark. Admission pauses when the ready population reaches
    /// this value while the queue is non-empty.
    pub min_queue_buffer: usize,
    /// Resume watermark. A paused window resumes after this many items have
    /// been consumed since the pause.
    pub resume_threshold: usize,
}

impl Default for WindowConfig {
    fn default() -> Self {
        Self {
            max_ready_items: 15,
            min_queue_buffer: 10,
            resume_threshold: 5,
        }
    }
}

impl WindowConfig {
    /// Check the watermark invariant.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.resume_threshold < 1 {
            return Err(ConfigError::Window(
                "resume_threshold must be at least 1".to_string(),
            ));
        }
        if self.min_queue_buffer <= self.resume_threshold {
            return Err(ConfigError::Window(format!(
                "min_queue_buffer ({}) must exceed resume_threshold ({})",
                self.min_queue_buffer, self.resume_threshold
            )));
        }
        if self.max_ready_items < self.min_queue_buffer {
            return Err(ConfigError::Window(format!(
                "max_ready_items ({}) must be at least min_queue_buffer ({})",
                self.max_ready_items, self.min_queue_buffer
            )));
        }
        Ok(())
    }
}

/// Cache store configuration.
#[derive(Debug, Clone)]
pub struct CacheConfig {
    /// Cache directory root.
    pub root: PathBuf,
    /// Soft total size budget in bytes.
    pub budget_bytes: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            root: PathBuf::from(".faceprep-cache"),
            budget_bytes: DEFAULT_CACHE_BUDGET_BYTES,
        }
    }
}

/// Complete core configuration.
#[derive(Debug, Clone)]
pub struct CoreConfig {
    /// Maximum concurrent pipeline workers.
    pub max_workers: usize,
    /// Rolling-window watermarks.
    pub window: WindowConfig,
    /// Cache store settings.
    pub cache: CacheConfig,
    /// Lowercase extensions treated as RAW inputs (decoded before detection).
    pub raw_extensions: HashSet<String>,
}

impl Default for CoreConfig {
    fn default() -> Self {
        Self {
            max_workers: DEFAULT_MAX_WORKERS,
            window: WindowConfig::default(),
            cache: CacheConfig::default(),
            raw_extensions: default_raw_extensions(),
        }
    }
}

/// The default RAW extension set.
pub fn default_raw_extensions() -> HashSet<String> {
    ["nef", "cr2", "arw", "raw"]
        .iter()
        .map(|s| s.to_string())
        .collect()
}

impl CoreConfig {
    /// Set the cache root directory.
    pub fn with_cache_root(mut self, root: impl Into<PathBuf>) -> Self {
        self.cache.root = root.into();
        self
    }

    /// Set the soft cache budget in bytes.
    pub fn with_cache_budget(mut self, bytes: u64) -> Self {
        self.cache.budget_bytes = bytes;
        self
    }

    /// Set the maximum concurrent workers.
    pub fn with_max_workers(mut self, workers: usize) -> Self {
        self.max_workers = workers;
        self
    }

    /// Set the window watermarks.
    pub fn with_window(mut self, window: WindowConfig) -> Self {
        self.window = window;
        self
    }

    /// Validate the whole configuration.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_workers < 1 {
            return Err(ConfigError::Pool(
                "max_workers must be at least 1".to_string(),
            ));
        }
        self.window.validate()
    }
}

/// Configuration errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Invalid window watermarks
    #[error("invalid window configuration: {0}")]
    Window(String),

    /// Invalid pool settings
    #[error("invalid pool configuration: {0}")]
    Pool(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_is_valid() {
        assert!(CoreConfig::default().validate().is_ok());
    }

    #[test]
    fn default_window_watermarks() {
        let w = WindowConfig::default();
        assert_eq!(w.max_ready_items, 15);
        assert_eq!(w.min_queue_buffer, 10);
        assert_eq!(w.resume_threshold, 5);
    }

    #[test]
    fn window_rejects_zero_resume_threshold() {
        let w = WindowConfig {
            max_ready_items: 4,
            min_queue_buffer: 3,
            resume_threshold: 0,
        };
        assert!(w.validate().is_err());
    }

    #[test]
    fn window_rejects_buffer_not_above_resume() {
        let w = WindowConfig {
            max_ready_items: 10,
            min_queue_buffer: 5,
            resume_threshold: 5,
        };
        assert!(w.validate().is_err());
    }

    #[test]
    fn window_rejects_cap_below_buffer() {
        let w = WindowConfig {
            max_ready_items: 4,
            min_queue_buffer: 5,
            resume_threshold: 2,
        };
        assert!(w.validate().is_err());
    }

    #[test]
    fn window_accepts_equal_cap_and_buffer() {
        let w = WindowConfig {
            max_ready_items: 5,
            min_queue_buffer: 5,
            resume_threshold: 2,
        };
        assert!(w.validate().is_ok());
    }

    #[test]
    fn config_rejects_zero_workers() {
        let c = CoreConfig::default().with_max_workers(0);
        assert!(c.validate().is_err());
    }

    #[test]
    fn raw_extensions_default_set() {
        let exts = default_raw_extensions();
        assert!(exts.contains("nef"));
        assert!(exts.contains("cr2"));
        assert!(exts.contains("arw"));
        assert!(exts.contains("raw"));
        assert!(!exts.contains("jpg"));
    }

    #[test]
    fn builder_methods_apply() {
        let c = CoreConfig::default()
            .with_cache_root("/tmp/x")
            .with_cache_budget(42)
            .with_max_workers(1);
        assert_eq!(c.cache.root, PathBuf::from("/tmp/x"));
        assert_eq!(c.cache.budget_bytes, 42);
        assert_eq!(c.max_workers, 1);
    }
}
