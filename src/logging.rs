//! Tracing subscriber setup for hosts embedding the core.
//!
//! The core itself only emits `tracing` events; a host that wants them on
//! disk or on a console calls [`init`] once at startup. Console output is
//! always installed; a log file is optional and appended to, so records
//! from earlier sessions survive for post-mortem reading of pipeline and
//! eviction activity. Filtering follows `RUST_LOG`, defaulting to `info`
//! for this crate.

use std::fs;
use std::io;
use std::path::Path;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

/// Keeps the background log-file writer alive.
///
/// Dropping the guard flushes buffered records and closes the file.
pub struct LogGuard {
    _writer: WorkerGuard,
}

/// Install the global tracing subscriber.
///
/// Pass a file path to mirror events into that file (created along with its
/// parent directory if needed, appended across sessions, no ANSI escapes).
/// Returns the guard for the file writer, or `None` when logging is
/// console-only.
///
/// # Errors
///
/// Fails only when the log file or its directory cannot be created.
pub fn init(log_file: Option<&Path>) -> io::Result<Option<LogGuard>> {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("faceprep=info"));
    let console = tracing_subscriber::fmt::layer().with_target(false).compact();
    let base = tracing_subscriber::registry().with(filter).with(console);

    let Some(path) = log_file else {
        base.init();
        return Ok(None);
    };

    if let Some(dir) = path.parent() {
        if !dir.as_os_str().is_empty() {
            fs::create_dir_all(dir)?;
        }
    }
    let sink = fs::OpenOptions::new().create(true).append(true).open(path)?;
    let (writer, guard) = tracing_appender::non_blocking(sink);
    base.with(
        tracing_subscriber::fmt::layer()
            .with_writer(writer)
            .with_ansi(false),
    )
    .init();

    Ok(Some(LogGuard { _writer: guard }))
}
