use std::{
    num::{NonZeroU64, NonZeroUsize},
    path::{Path, PathBuf},
    time::Duration,
};

use crate::collector::SupervisorConfig;
use crate::collector::supervisor::DEFAULT_SKIP_LABEL;

fn default_checkpoint_interval() -> NonZeroU64 {
    NonZeroU64::new(5).expect("non-zero literal")
}

fn default_queue_capacity() -> NonZeroUsize {
    NonZeroUsize::new(1000).expect("non-zero literal")
}

fn default_checkpoint_path() -> PathBuf {
    PathBuf::from("log-cursors.json")
}

fn default_skip_label() -> String {
    DEFAULT_SKIP_LABEL.to_string()
}

fn default_true() -> bool {
    true
}

fn default_tombstone_ttl() -> u64 {
    300
}

fn default_cursor_ttl() -> u64 {
    7 * 24 * 60 * 60
}

#[derive(Debug, Clone, serde::Deserialize)]
pub struct LogshipConfig {
    /// Seconds between two cursor saves.
    #[serde(default = "default_checkpoint_interval")]
    pub checkpoint_interval: NonZeroU64,
    /// Records buffered between the workers and the shipper.
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: NonZeroUsize,
    /// Cursor file. Empty keeps cursors in memory only.
    #[serde(default = "default_checkpoint_path")]
    pub checkpoint_path: PathBuf,
    /// Containers with this label are not streamed. Empty disables the check.
    #[serde(default = "default_skip_label")]
    pub skip_label: String,
    #[serde(default = "default_true")]
    pub resync_on_queue_start: bool,
    /// Seconds a container death shadows older start events.
    #[serde(default = "default_tombstone_ttl")]
    pub tombstone_ttl: u64,
    /// Seconds an unused cursor is kept. Zero keeps cursors forever.
    #[serde(default = "default_cursor_ttl")]
    pub cursor_ttl: u64,
}

impl Default for LogshipConfig {
    fn default() -> Self {
        Self {
            checkpoint_interval: default_checkpoint_interval(),
            queue_capacity: default_queue_capacity(),
            checkpoint_path: default_checkpoint_path(),
            skip_label: default_skip_label(),
            resync_on_queue_start: default_true(),
            tombstone_ttl: default_tombstone_ttl(),
            cursor_ttl: default_cursor_ttl(),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("TOML error: {0}")]
    Toml(#[from] toml::de::Error),
}

impl LogshipConfig {
    fn try_init_from_string(config: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(config)?)
    }

    /// Reads the config file. A missing file means all defaults.
    pub fn try_init(path: &Path) -> Result<Self, ConfigError> {
        match std::fs::read_to_string(path) {
            Ok(config) => Self::try_init_from_string(&config),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                log::warn!("Config file {path:?} not found, using defaults");
                Ok(Self::default())
            }
            Err(e) => Err(e.into()),
        }
    }

    pub fn supervisor_config(&self) -> SupervisorConfig {
        SupervisorConfig {
            checkpoint_interval: Duration::from_secs(self.checkpoint_interval.get()),
            skip_label: Some(self.skip_label.clone()).filter(|label| !label.is_empty()),
            resync_on_queue_start: self.resync_on_queue_start,
            tombstone_ttl: Duration::from_secs(self.tombstone_ttl),
            cursor_ttl: Some(self.cursor_ttl)
                .filter(|ttl| *ttl > 0)
                .map(Duration::from_secs),
        }
    }
}
