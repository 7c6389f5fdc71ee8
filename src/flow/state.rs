//! Run Progress Checkpoint
//!
//! A coarse, persisted snapshot of a run's progress so the progress bar and
//! ETA survive an application restart mid-run.
//!
//! Checkpoints are stored as `checkpoint.json` in the run's directory.

use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// File name of the checkpoint inside a run directory.
pub const CHECKPOINT_FILE: &str = "checkpoint.json";

/// Persisted progress for a single run.
#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq)]
pub struct RunCheckpoint {
    /// Completed task count
    #[serde(default)]
    pub completed: u32,

    /// Total task count
    #[serde(default)]
    pub total: u32,

    /// Concurrency hint (max forks) last seen in the log
    #[serde(default)]
    pub concurrency: Option<u32>,

    /// Last external command seen in the log
    #[serde(default)]
    pub last_command: Option<String>,

    /// When the checkpoint was written
    #[serde(default)]
    pub last_updated: Option<DateTime<Utc>>,

    /// Run status at the time of writing
    #[serde(default)]
    pub status: Option<String>,
}

impl RunCheckpoint {
    /// Creates a checkpoint from a progress count.
    pub fn new(completed: u32, total: u32) -> Self {
        Self {
            completed,
            total,
            ..Self::default()
        }
    }

    /// Returns the checkpoint path inside a run directory.
    pub fn path_in(run_dir: &Path) -> PathBuf {
        run_dir.join(CHECKPOINT_FILE)
    }

    /// Serializes the checkpoint as pretty JSON.
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string_pretty(self)
    }

    /// Parses a checkpoint from JSON.
    pub fn from_json(content: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(content)
    }

    /// True when the checkpoint carries usable progress.
    pub fn has_progress(&self) -> bool {
        self.total > 0
    }

    /// True when this checkpoint differs from `other` in anything but the
    /// write timestamp.
    pub fn differs_from(&self, other: &RunCheckpoint) -> bool {
        self.completed != other.completed
            || self.total != other.total
            || self.concurrency != other.concurrency
            || self.last_command != other.last_command
            || self.status != other.status
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_checkpoint_creation() {
        let checkpoint = RunCheckpoint::new(3, 10);
        assert_eq!(checkpoint.completed, 3);
        assert_eq!(checkpoint.total, 10);
        assert!(checkpoint.has_progress());
        assert!(!RunCheckpoint::default().has_progress());
    }

    #[test]
    fn test_checkpoint_tolerates_missing_fields() {
        let checkpoint = RunCheckpoint::from_json(r#"{"completed": 2}"#).unwrap();
        assert_eq!(checkpoint.completed, 2);
        assert_eq!(checkpoint.total, 0);
        assert!(checkpoint.concurrency.is_none());
    }

    #[test]
    fn test_checkpoint_written_to_run_dir() {
        use tempfile::tempdir;

        let temp_dir = tempdir().unwrap();
        let mut checkpoint = RunCheckpoint::new(4, 8);
        checkpoint.concurrency = Some(2);
        checkpoint.last_command = Some("nextflow run main.nf".to_string());

        let path = RunCheckpoint::path_in(temp_dir.path());
        std::fs::write(&path, checkpoint.to_json().unwrap()).unwrap();

        let content = std::fs::read_to_string(&path).unwrap();
        let loaded = RunCheckpoint::from_json(&content).unwrap();
        assert_eq!(loaded, checkpoint);
        assert!(path.ends_with(CHECKPOINT_FILE));
    }

    #[test]
    fn test_differs_ignores_timestamp() {
        let a = RunCheckpoint::new(1, 5);
        let mut b = a.clone();
        b.last_updated = Some(Utc::now());
        assert!(!a.differs_from(&b));

        b.completed = 2;
        assert!(a.differs_from(&b));
    }
}
