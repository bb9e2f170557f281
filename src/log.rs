//! Structured logging setup.
//!
//! Library code logs through `tracing` macros with structured fields
//! (`deployment`, `task`, `resource`, `platform`, `attempt`). This module
//! installs the process-wide subscriber:
//!
//! - ERROR: a deployment could not be persisted or a run aborted
//! - WARN: a task failed, was retried or was skipped
//! - INFO: deployment lifecycle (submitted, finished, torn down)
//! - DEBUG: per-task dispatch and platform calls
//! - TRACE: scheduler loop internals
//!
//! Debug mode is enabled by `init_with_debug(true)` or `GLASSDOME_DEBUG=1`.
//! `GLASSDOME_LOG_FORMAT=json` switches to JSON lines. Output goes to
//! `~/.glassdome/glassdome.log` (truncated at startup), or stderr when the
//! home directory is unavailable. `RUST_LOG` overrides the level filter.

use std::fs::File;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, OnceLock};

use tracing_subscriber::fmt::writer::BoxMakeWriter;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use crate::config::LogConfig;

static LOG_INIT: OnceLock<Option<PathBuf>> = OnceLock::new();
static DEBUG_ENABLED: AtomicBool = AtomicBool::new(false);

/// Initialize logging with settings from the environment.
pub fn init() {
    init_with_debug(false);
}

/// Initialize logging from the `[log]` config section.
pub fn init_from_config(config: &LogConfig) {
    install(config.debug, config.json);
}

/// Initialize logging with explicit debug mode setting.
pub fn init_with_debug(debug: bool) {
    install(debug, false);
}

fn install(debug: bool, json: bool) {
    let debug_enabled = debug || env_flag("GLASSDOME_DEBUG");
    DEBUG_ENABLED.store(debug_enabled, Ordering::SeqCst);
    let json = json
        || std::env::var("GLASSDOME_LOG_FORMAT")
            .map(|v| v.eq_ignore_ascii_case("json"))
            .unwrap_or(false);

    LOG_INIT.get_or_init(|| {
        let default_level = if debug_enabled { "glassdome=debug" } else { "info" };
        let env_filter =
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));

        let log_file = open_log_file();
        let (writer, ansi, path) = match log_file {
            Some((path, file)) => (BoxMakeWriter::new(Mutex::new(file)), false, Some(path)),
            None => (BoxMakeWriter::new(std::io::stderr), true, None),
        };

        let result = if json {
            tracing_subscriber::registry()
                .with(env_filter)
                .with(fmt::layer().json().with_writer(writer))
                .try_init()
        } else {
            tracing_subscriber::registry()
                .with(env_filter)
                .with(fmt::layer().compact().with_ansi(ansi).with_writer(writer))
                .try_init()
        };

        if let Err(err) = result {
            eprintln!("tracing init skipped: {err}");
        }
        path
    });
}

fn env_flag(name: &str) -> bool {
    std::env::var(name)
        .map(|v| v == "1" || v.eq_ignore_ascii_case("true"))
        .unwrap_or(false)
}

fn open_log_file() -> Option<(PathBuf, File)> {
    let dir = dirs::home_dir()?.join(".glassdome");
    std::fs::create_dir_all(&dir).ok()?;
    let path = dir.join("glassdome.log");
    // Truncate on startup
    let file = File::create(&path).ok()?;
    Some((path, file))
}

/// Check if debug mode is enabled.
pub fn is_debug() -> bool {
    DEBUG_ENABLED.load(Ordering::Relaxed)
}

/// Path of the log file, if logging was initialized to a file.
pub fn log_path() -> Option<PathBuf> {
    LOG_INIT.get().cloned().flatten()
}
