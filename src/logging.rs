// src/logging.rs
//
// Process-wide log setup. Driver code only emits `tracing` events; the
// embedding application decides where they go by calling `init_logging` (or
// installing its own subscriber). Raw frame dumps use `TRANSPORT_TARGET` at
// TRACE level, so `RUST_LOG=canhacker::transport=trace` shows the wire.

use serde::{Deserialize, Serialize};
use std::fs::File;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use crate::io::IoError;

/// Target of the raw frame trace events.
pub const TRANSPORT_TARGET: &str = "canhacker::transport";

/// Name of the symlink pointing at the newest log file.
const LATEST_LOG_LINK: &str = "canhacker.log";

fn default_level() -> String { "info".to_string() }
fn default_ansi() -> bool { true }

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogConfig {
    /// Filter directives used when `RUST_LOG` is unset (e.g. `info,canhacker::transport=trace`)
    #[serde(default = "default_level")]
    pub level: String,
    /// Also write a timestamped log file into this directory
    #[serde(default)]
    pub file_dir: Option<PathBuf>,
    /// Colourised stderr output
    #[serde(default = "default_ansi")]
    pub ansi: bool,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: default_level(),
            file_dir: None,
            ansi: default_ansi(),
        }
    }
}

/// `YYYYmmdd-HHMMSS-canhacker.log` for the current local time.
pub fn log_file_name() -> String {
    chrono::Local::now()
        .format("%Y%m%d-%H%M%S-canhacker.log")
        .to_string()
}

/// Create a new timestamped log file in `dir` and point the
/// `canhacker.log` symlink at it (Unix only).
pub fn open_log_file(dir: &Path) -> Result<(File, PathBuf), IoError> {
    std::fs::create_dir_all(dir)
        .map_err(|e| IoError::configuration(format!("Failed to create log dir: {}", e)))?;

    let filename = log_file_name();
    let log_path = dir.join(&filename);
    let file = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(&log_path)
        .map_err(|e| IoError::configuration(format!("Failed to create log file: {}", e)))?;

    #[cfg(unix)]
    {
        let symlink_path = dir.join(LATEST_LOG_LINK);
        let _ = std::fs::remove_file(&symlink_path);
        if let Err(e) = std::os::unix::fs::symlink(&filename, &symlink_path) {
            eprintln!("Failed to create {} symlink: {}", LATEST_LOG_LINK, e);
        }
    }

    Ok((file, log_path))
}

/// Install the global subscriber. `RUST_LOG` overrides `config.level`.
///
/// Returns the log file path when file logging is enabled. Fails if a global
/// subscriber is already installed.
pub fn init_logging(config: &LogConfig) -> Result<Option<PathBuf>, IoError> {
    let env_filter = match EnvFilter::try_from_default_env() {
        Ok(filter) => filter,
        Err(_) => EnvFilter::try_new(&config.level).map_err(|e| {
            IoError::configuration(format!("Invalid log level '{}': {}", config.level, e))
        })?,
    };

    let stderr_layer = fmt::layer()
        .with_ansi(config.ansi)
        .with_writer(std::io::stderr);
    let registry = tracing_subscriber::registry().with(env_filter).with(stderr_layer);

    match &config.file_dir {
        Some(dir) => {
            let (file, log_path) = open_log_file(dir)?;
            let file_layer = fmt::layer().with_ansi(false).with_writer(Mutex::new(file));
            registry
                .with(file_layer)
                .try_init()
                .map_err(|e| IoError::configuration(format!("Failed to install logger: {}", e)))?;
            tracing::info!(path = %log_path.display(), "file logging started");
            Ok(Some(log_path))
        }
        None => {
            registry
                .try_init()
                .map_err(|e| IoError::configuration(format!("Failed to install logger: {}", e)))?;
            Ok(None)
        }
    }
}

// ============================================================================
// Test capture
// ============================================================================
