//! Device restart triggered by `/reset`.

use parking_lot::Mutex;
use tracing::{error, info};

use crate::logging::LogGuard;

/// Exit status used when the process cannot re-execute itself in place.
pub const RESTART_EXIT_CODE: i32 = 3;

/// The only query that confirms a restart.
pub const RESET_CONFIRMATION: &str = "ok=1";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResetRequest {
    Confirmed,
    Invalid,
}

impl ResetRequest {
    pub fn from_query(query: Option<&str>) -> Self {
        if query == Some(RESET_CONFIRMATION) {
            ResetRequest::Confirmed
        } else {
            ResetRequest::Invalid
        }
    }
}

/// Restarts the whole device. Never returns control to the caller's request.
pub trait Restarter: Send + Sync {
    fn restart(&self);
}

/// Restarts the running service by re-executing its own binary.
///
/// If the binary cannot be re-executed the process exits with
/// [`RESTART_EXIT_CODE`] and is expected to be brought back by its supervisor.
/// The log guard is dropped first, `exec` never runs destructors.
#[derive(Default)]
pub struct ProcessRestarter {
    log_guard: Mutex<Option<LogGuard>>,
}

impl ProcessRestarter {
    pub fn new(log_guard: LogGuard) -> Self {
        Self {
            log_guard: Mutex::new(Some(log_guard)),
        }
    }

    /// Flushes buffered log lines. Later lines only reach the console.
    fn flush_logs(&self) {
        drop(self.log_guard.lock().take());
    }
}

impl Restarter for ProcessRestarter {
    fn restart(&self) {
        info!("Restarting now");
        self.flush_logs();
        match std::env::current_exe() {
            Ok(exe) => {
                let err = reexec(&exe);
                error!("Failed to re-execute {:?}: {}", exe, err);
            }
            Err(e) => error!("Cannot locate own executable: {}", e),
        }
        std::process::exit(RESTART_EXIT_CODE);
    }
}

#[cfg(unix)]
fn reexec(exe: &std::path::Path) -> std::io::Error {
    use std::os::unix::process::CommandExt;

    std::process::Command::new(exe)
        .args(std::env::args_os().skip(1))
        .exec()
}

#[cfg(not(unix))]
fn reexec(exe: &std::path::Path) -> std::io::Error {
    match std::process::Command::new(exe)
        .args(std::env::args_os().skip(1))
        .spawn()
    {
        Ok(_) => std::process::exit(0),
        Err(e) => e,
    }
}
