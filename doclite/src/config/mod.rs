use crate::error::Result;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Store configuration, usually loaded from a `doclite.yaml` file.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Directory holding the backing file
    pub data_dir: PathBuf,
    /// Backing file name; a distinct name is a distinct store
    pub name: String,
    /// Bounded attempts when opening the backing file
    pub open_attempts: u32,
    /// Linear backoff step between open attempts
    pub open_backoff_ms: u64,
    /// Additional attempts after the engine crashed mid-operation
    pub crash_retries: u32,
    pub journal_mode: JournalMode,
    pub synchronous: Synchronous,
    /// Capacity of the change notification channel
    pub listener_buffer: usize,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            data_dir: PathBuf::from("."),
            name: "doclite.db".to_string(),
            open_attempts: 10,
            open_backoff_ms: 100,
            crash_retries: 2,
            journal_mode: JournalMode::Delete,
            synchronous: Synchronous::Normal,
            listener_buffer: 256,
        }
    }
}

impl Config {
    pub fn new(data_dir: impl Into<PathBuf>, name: &str) -> Self {
        Config {
            data_dir: data_dir.into(),
            name: name.to_string(),
            ..Config::default()
        }
    }

    /// Parse a YAML config file
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_yaml_str(&content)
    }

    /// Parse a YAML config string. Missing keys keep their defaults.
    pub fn from_yaml_str(content: &str) -> Result<Self> {
        if content.trim().is_empty() {
            return Ok(Config::default());
        }
        let config: Config = serde_yaml::from_str(content)?;
        Ok(config)
    }

    /// Full path of the backing file
    pub fn db_path(&self) -> PathBuf {
        self.data_dir.join(&self.name)
    }

    pub(crate) fn backoff(&self, attempt: u32) -> Duration {
        Duration::from_millis(self.open_backoff_ms * u64::from(attempt))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JournalMode {
    Delete,
    Truncate,
    Persist,
    Memory,
    Wal,
    Off,
}

impl JournalMode {
    pub fn as_sql(&self) -> &'static str {
        match self {
            JournalMode::Delete => "DELETE",
            JournalMode::Truncate => "TRUNCATE",
            JournalMode::Persist => "PERSIST",
            JournalMode::Memory => "MEMORY",
            JournalMode::Wal => "WAL",
            JournalMode::Off => "OFF",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Synchronous {
    Off,
    Normal,
    Full,
    Extra,
}

impl Synchronous {
    pub fn as_sql(&self) -> &'static str {
        match self {
            Synchronous::Off => "OFF",
            Synchronous::Normal => "NORMAL",
            Synchronous::Full => "FULL",
            Synchronous::Extra => "EXTRA",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = Config::default();
        assert_eq!(config.name, "doclite.db");
        assert_eq!(config.open_attempts, 10);
        assert_eq!(config.crash_retries, 2);
        assert_eq!(config.journal_mode, JournalMode::Delete);
        assert_eq!(config.synchronous, Synchronous::Normal);
    }

    #[test]
    fn test_partial_yaml_keeps_defaults() {
        let config = Config::from_yaml_str(
            "data_dir: /tmp/stores\nname: app.db\njournal_mode: wal\n",
        )
        .unwrap();
        assert_eq!(config.data_dir, PathBuf::from("/tmp/stores"));
        assert_eq!(config.name, "app.db");
        assert_eq!(config.journal_mode, JournalMode::Wal);
        assert_eq!(config.open_backoff_ms, 100);
        assert_eq!(config.db_path(), PathBuf::from("/tmp/stores/app.db"));
    }

    #[test]
    fn test_empty_yaml() {
        let config = Config::from_yaml_str("").unwrap();
        assert_eq!(config.name, "doclite.db");
    }

    #[test]
    fn test_unknown_journal_mode_rejected() {
        assert!(Config::from_yaml_str("journal_mode: sideways").is_err());
    }

    #[test]
    fn test_linear_backoff() {
        let config = Config::default();
        assert_eq!(config.backoff(0), Duration::ZERO);
        assert_eq!(config.backoff(3), Duration::from_millis(300));
    }
}
