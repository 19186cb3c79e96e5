use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;
use tracing::warn;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Invalid configuration file {path:?}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServiceConfig {
    /// HTTP port of the settings server.
    pub port: u16,
    /// Directory emulating the flash partition.
    pub data_dir: PathBuf,
    /// How often the stored relay states are pushed to the hardware.
    pub poll_interval_secs: u64,
    /// Delay between the `/reset` acknowledgment and the restart.
    pub restart_delay_ms: u64,
    /// Expose Prometheus metrics on `/metrics`.
    pub metrics: bool,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        ServiceConfig {
            port: 80,
            data_dir: PathBuf::from("nvs"),
            poll_interval_secs: 3,
            restart_delay_ms: 500,
            metrics: false,
        }
    }
}

impl ServiceConfig {
    /// Reads a JSON configuration file.
    ///
    /// A file that cannot be read falls back to the defaults, a file that
    /// cannot be parsed is an error.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        match std::fs::read_to_string(path) {
            Ok(content) => serde_json::from_str(&content).map_err(|source| ConfigError::Parse {
                path: path.to_path_buf(),
                source,
            }),
            Err(e) => {
                warn!(
                    "Failed to read config file {:?} ({}), using default settings",
                    path, e
                );
                Ok(ServiceConfig::default())
            }
        }
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs.max(1))
    }

    pub fn restart_delay(&self) -> Duration {
        Duration::from_millis(self.restart_delay_ms)
    }
}
