//! Orchestrator configuration, errors and status types.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::queue::{ItemId, QueueError};
use crate::store::StoreError;
use crate::transcode::{CommanderConfig, CommanderError, CommanderStatus};

/// Orchestrator wiring configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrchestratorConfig {
    /// Directory watched for new source files.
    pub import_path: PathBuf,
    /// Directory receiving encoder outputs.
    pub output_path: PathBuf,
    /// Container used for items matching no workflow.
    #[serde(default = "default_container")]
    pub default_container: String,
    /// Seconds between import directory scans.
    #[serde(default = "default_ingest_interval")]
    pub ingest_interval_secs: u64,
    /// Seconds between status snapshots.
    #[serde(default = "default_update_interval")]
    pub update_interval_secs: u64,
    /// Worker counts per stage. Persist defaults to one worker to
    /// serialize database writes.
    #[serde(default = "default_parse_workers")]
    pub title_workers: usize,
    #[serde(default = "default_parse_workers")]
    pub metadata_workers: usize,
    #[serde(default = "default_persist_workers")]
    pub persist_workers: usize,
    #[serde(default)]
    pub commander: CommanderConfig,
}

fn default_container() -> String {
    "mp4".to_string()
}

fn default_ingest_interval() -> u64 {
    5
}

fn default_update_interval() -> u64 {
    2
}

fn default_parse_workers() -> usize {
    2
}

fn default_persist_workers() -> usize {
    1
}

impl OrchestratorConfig {
    /// Minimal config rooted at the given directories.
    pub fn new(import_path: impl Into<PathBuf>, output_path: impl Into<PathBuf>) -> Self {
        Self {
            import_path: import_path.into(),
            output_path: output_path.into(),
            default_container: default_container(),
            ingest_interval_secs: default_ingest_interval(),
            update_interval_secs: default_update_interval(),
            title_workers: default_parse_workers(),
            metadata_workers: default_parse_workers(),
            persist_workers: default_persist_workers(),
            commander: CommanderConfig::default(),
        }
    }
}

/// Orchestration failures.
#[derive(Debug, Error)]
pub enum OrchestratorError {
    /// No item with the given id.
    #[error("no item with id {0}")]
    ItemNotFound(ItemId),

    /// Unrecoverable startup failure (missing binary, bad wiring).
    #[error("startup failure: {0}")]
    Startup(String),

    #[error(transparent)]
    Queue(#[from] QueueError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Commander(#[from] CommanderError),
}

/// Per-stage item counts.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct StageCounts {
    pub import: usize,
    pub title: usize,
    pub metadata: usize,
    pub persist: usize,
    pub transcode: usize,
    pub completed: usize,
}

/// Snapshot emitted to the status callback on every update tick.
#[derive(Debug, Clone, Serialize)]
pub struct StatusSnapshot {
    pub running: bool,
    pub queue_length: usize,
    pub stages: StageCounts,
    /// Items currently parked with a trouble.
    pub troubled: usize,
    pub commander: CommanderStatus,
    pub workers: usize,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_defaults() {
        let config = OrchestratorConfig::new("/import", "/output");
        assert_eq!(config.ingest_interval_secs, 5);
        assert_eq!(config.update_interval_secs, 2);
        assert_eq!(config.title_workers, 2);
        assert_eq!(config.persist_workers, 1);
        assert_eq!(config.default_container, "mp4");
    }

    #[test]
    fn test_config_deserializes_with_defaults() {
        let yaml = "import_path: /import\noutput_path: /output\n";
        let config: OrchestratorConfig = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(config.ingest_interval_secs, 5);
        assert_eq!(config.commander.max_concurrent_encoders, 2);
    }
}
