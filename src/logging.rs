//! Console or rolling-file logging.
//!
//! The filter always comes from `RUST_LOG`. File logs rotate through
//! `tracing-appender` and old files beyond `max_log_files` are pruned at startup.

use std::io;
use std::path::{Path, PathBuf};
use tracing::{info, warn};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::EnvFilter;
use tracing_subscriber::fmt::Layer;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

const LOG_SUFFIX: &str = "log";

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum RotationPeriod {
    Minutely,
    Hourly,
    #[default]
    Daily,
    Never,
}

impl std::str::FromStr for RotationPeriod {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "minutely" | "minute" => Ok(RotationPeriod::Minutely),
            "hourly" | "hour" => Ok(RotationPeriod::Hourly),
            "daily" | "day" => Ok(RotationPeriod::Daily),
            "never" | "none" => Ok(RotationPeriod::Never),
            _ => Err(format!(
                "Invalid rotation period '{}'. Valid options: minutely, hourly, daily, never",
                s
            )),
        }
    }
}

impl From<RotationPeriod> for Rotation {
    fn from(period: RotationPeriod) -> Self {
        match period {
            RotationPeriod::Minutely => Rotation::MINUTELY,
            RotationPeriod::Hourly => Rotation::HOURLY,
            RotationPeriod::Daily => Rotation::DAILY,
            RotationPeriod::Never => Rotation::NEVER,
        }
    }
}

/// Where and how log files are written.
#[derive(Debug, Clone)]
pub struct LogConfig {
    pub log_dir: PathBuf,
    pub log_prefix: String,
    pub rotation: RotationPeriod,
    /// Files kept after pruning, 0 keeps everything.
    pub max_log_files: usize,
}

impl LogConfig {
    pub fn new(log_dir: impl Into<PathBuf>, rotation: RotationPeriod) -> Self {
        Self {
            log_dir: log_dir.into(),
            rotation,
            ..Self::default()
        }
    }
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            log_dir: PathBuf::from("."),
            log_prefix: "settingsd".to_string(),
            rotation: RotationPeriod::Daily,
            max_log_files: 7,
        }
    }
}

/// Keeps the background log writer alive. Dropping it flushes pending lines.
pub struct LogGuard {
    _guard: Option<WorkerGuard>,
}

impl From<WorkerGuard> for LogGuard {
    fn from(guard: WorkerGuard) -> Self {
        Self {
            _guard: Some(guard),
        }
    }
}

pub fn setup_console_logging() -> LogGuard {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    LogGuard { _guard: None }
}

/// Installs a non-blocking rolling file writer as the global subscriber.
pub fn setup_file_logging(config: &LogConfig) -> io::Result<LogGuard> {
    std::fs::create_dir_all(&config.log_dir)?;
    let pruned = if config.max_log_files > 0 {
        cleanup_old_logs(&config.log_dir, &config.log_prefix, config.max_log_files)?
    } else {
        Vec::new()
    };

    let file_appender = RollingFileAppender::builder()
        .rotation(config.rotation.into())
        .filename_prefix(&config.log_prefix)
        .filename_suffix(LOG_SUFFIX)
        .max_log_files(config.max_log_files)
        .build(&config.log_dir)
        .map_err(io::Error::other)?;
    let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);

    let file_layer = Layer::default()
        .with_writer(non_blocking)
        .with_ansi(false)
        .with_target(true)
        .with_file(true)
        .with_line_number(true);

    tracing_subscriber::registry()
        .with(EnvFilter::from_default_env())
        .with(file_layer)
        .init();

    info!(
        "Logging to {:?} ({:?} rotation)",
        config.log_dir, config.rotation
    );
    for (path, result) in pruned {
        match result {
            Ok(()) => info!("Removed old log file {:?}", path),
            Err(e) => warn!("Failed to remove old log file {:?}: {}", path, e),
        }
    }

    Ok(guard.into())
}

/// Deletes all but the `keep` newest `{prefix}*.log` files in `log_dir`.
///
/// Runs before any subscriber exists, so the outcome of each removal is
/// returned for logging afterwards.
fn cleanup_old_logs(
    log_dir: &Path,
    prefix: &str,
    keep: usize,
) -> io::Result<Vec<(PathBuf, io::Result<()>)>> {
    let mut log_files: Vec<_> = std::fs::read_dir(log_dir)?
        .filter_map(|entry| entry.ok())
        .filter(|entry| {
            entry.file_name().to_str().is_some_and(|name| {
                name.starts_with(prefix) && name.ends_with(&format!(".{}", LOG_SUFFIX))
            })
        })
        .filter_map(|entry| {
            let modified = entry.metadata().and_then(|m| m.modified()).ok()?;
            Some((entry.path(), modified))
        })
        .collect();

    // Newest first
    log_files.sort_by(|a, b| b.1.cmp(&a.1));

    Ok(log_files
        .into_iter()
        .skip(keep)
        .map(|(path, _)| {
            let result = std::fs::remove_file(&path);
            (path, result)
        })
        .collect())
}
