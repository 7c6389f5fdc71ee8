//! Directory-backed host.
//!
//! Each session or run lives in its own directory under a root:
//!
//! ```text
//! <root>/<id>/
//!   flow.yaml        step definitions
//!   progress.json    [{ "email": ..., "steps": [...] }, ...]
//!   activity.jsonl   one activity entry per line
//!   telemetry.json   { "<step_id>": { "channels": [...], "peers": [...] } }
//!   run.log          execution log
//!   status           run status, plain text
//!   checkpoint.json  persisted run progress
//! ```
//!
//! Optional files that are missing read as empty.

use std::collections::HashMap;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use log::debug;
use tokio::fs;

use crate::flow::model::{ActivityLogEntry, Flow, ParticipantProgress};
use crate::flow::parser::parse_flow;
use crate::flow::state::{RunCheckpoint, CHECKPOINT_FILE};
use crate::monitoring::transport::TransportSnapshot;

use super::{HostError, RunHost, RunLogTail};

pub const FLOW_FILE: &str = "flow.yaml";
pub const PROGRESS_FILE: &str = "progress.json";
pub const ACTIVITY_FILE: &str = "activity.jsonl";
pub const TELEMETRY_FILE: &str = "telemetry.json";
pub const LOG_FILE: &str = "run.log";
pub const STATUS_FILE: &str = "status";

/// Serves host queries from the filesystem.
#[derive(Debug, Clone)]
pub struct DirHost {
    root: PathBuf,
}

impl DirHost {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Directory of a session or run.
    pub fn dir_for(&self, id: &str) -> PathBuf {
        self.root.join(id)
    }

    fn file(&self, id: &str, name: &str) -> PathBuf {
        self.dir_for(id).join(name)
    }
}

/// Reads a file, mapping "does not exist" to `None`.
async fn read_optional(path: &Path) -> Result<Option<String>, HostError> {
    match fs::read_to_string(path).await {
        Ok(content) => Ok(Some(content)),
        Err(err) if err.kind() == ErrorKind::NotFound => Ok(None),
        Err(err) => Err(err.into()),
    }
}

async fn read_required(path: &Path) -> Result<String, HostError> {
    read_optional(path)
        .await?
        .ok_or_else(|| HostError::NotFound(path.display().to_string()))
}

fn tail_lines(text: &str, lines: usize) -> String {
    let all: Vec<&str> = text.lines().collect();
    all[all.len().saturating_sub(lines)..].join("\n")
}

impl RunHost for DirHost {
    async fn fetch_flow(&self, session_id: &str) -> Result<Flow, HostError> {
        let content = read_required(&self.file(session_id, FLOW_FILE)).await?;
        Ok(parse_flow(&content, None)?)
    }

    async fn fetch_log_tail(&self, run_id: &str, lines: usize) -> Result<RunLogTail, HostError> {
        let text = read_required(&self.file(run_id, LOG_FILE)).await?;
        let status = read_optional(&self.file(run_id, STATUS_FILE))
            .await?
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty());

        Ok(RunLogTail {
            text: tail_lines(&text, lines),
            status,
        })
    }

    async fn fetch_progress(
        &self,
        session_id: &str,
    ) -> Result<Vec<ParticipantProgress>, HostError> {
        match read_optional(&self.file(session_id, PROGRESS_FILE)).await? {
            Some(content) if !content.trim().is_empty() => Ok(serde_json::from_str(&content)?),
            _ => Ok(Vec::new()),
        }
    }

    async fn fetch_activity(&self, session_id: &str) -> Result<Vec<ActivityLogEntry>, HostError> {
        let Some(content) = read_optional(&self.file(session_id, ACTIVITY_FILE)).await? else {
            return Ok(Vec::new());
        };

        let mut entries = Vec::new();
        for (index, line) in content.lines().enumerate() {
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str::<ActivityLogEntry>(line) {
                Ok(entry) => entries.push(entry),
                Err(err) => debug!("Skipping activity line {}: {}", index + 1, err),
            }
        }
        Ok(entries)
    }

    async fn fetch_transport(
        &self,
        session_id: &str,
        step_id: &str,
    ) -> Result<TransportSnapshot, HostError> {
        let Some(content) = read_optional(&self.file(session_id, TELEMETRY_FILE)).await? else {
            return Ok(TransportSnapshot::default());
        };
        let mut by_step: HashMap<String, TransportSnapshot> = serde_json::from_str(&content)?;
        Ok(by_step.remove(step_id).unwrap_or_default())
    }

    async fn load_checkpoint(&self, run_id: &str) -> Result<Option<RunCheckpoint>, HostError> {
        match read_optional(&self.file(run_id, CHECKPOINT_FILE)).await? {
            Some(content) => Ok(Some(RunCheckpoint::from_json(&content)?)),
            None => Ok(None),
        }
    }

    async fn save_checkpoint(
        &self,
        run_id: &str,
        checkpoint: &RunCheckpoint,
    ) -> Result<(), HostError> {
        let dir = self.dir_for(run_id);
        fs::create_dir_all(&dir).await?;
        fs::write(RunCheckpoint::path_in(&dir), checkpoint.to_json()?).await?;
        debug!(
            "Saved checkpoint for {} at {}/{}",
            run_id, checkpoint.completed, checkpoint.total
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::flow::model::ActivityEvent;
    use crate::reconcile::status::CanonicalStatus;
    use tempfile::tempdir;

    const FLOW: &str = "\
name: demo
participants: [a@x.org, b@y.org]
steps:
  - id: compute
    targets: [a@x.org, b@y.org]
    shares_output: true
  - id: gate
    barrier: true
    depends_on: [compute]
    targets: [a@x.org, b@y.org]
";

    fn write(dir: &Path, name: &str, content: &str) {
        std::fs::create_dir_all(dir).unwrap();
        std::fs::write(dir.join(name), content).unwrap();
    }

    #[tokio::test]
    async fn test_fetch_flow() {
        let root = tempdir().unwrap();
        let host = DirHost::new(root.path());
        write(&host.dir_for("s1"), FLOW_FILE, FLOW);

        let flow = host.fetch_flow("s1").await.unwrap();
        assert_eq!(flow.name, "demo");
        assert_eq!(flow.steps.len(), 2);
        assert_eq!(flow.get_step("compute").unwrap().dependents, vec!["gate"]);
    }

    #[tokio::test]
    async fn test_missing_flow_is_not_found() {
        let root = tempdir().unwrap();
        let host = DirHost::new(root.path());

        let result = host.fetch_flow("nope").await;
        assert!(matches!(result, Err(HostError::NotFound(_))));
    }

    #[tokio::test]
    async fn test_optional_files_read_empty() {
        let root = tempdir().unwrap();
        let host = DirHost::new(root.path());

        assert!(host.fetch_progress("s1").await.unwrap().is_empty());
        assert!(host.fetch_activity("s1").await.unwrap().is_empty());
        assert_eq!(
            host.fetch_transport("s1", "compute").await.unwrap(),
            TransportSnapshot::default()
        );
        assert!(host.load_checkpoint("r1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_fetch_progress() {
        let root = tempdir().unwrap();
        let host = DirHost::new(root.path());
        write(
            &host.dir_for("s1"),
            PROGRESS_FILE,
            r#"[{"email": "b@y.org", "steps": [{"step_id": "compute", "status": "in-progress"}]}]"#,
        );

        let progress = host.fetch_progress("s1").await.unwrap();
        assert_eq!(progress[0].steps[0].status, CanonicalStatus::Running);
    }

    #[tokio::test]
    async fn test_fetch_progress_with_epoch_timestamp() {
        let root = tempdir().unwrap();
        let host = DirHost::new(root.path());
        write(
            &host.dir_for("s1"),
            PROGRESS_FILE,
            r#"[{"email": "b@y.org", "steps": [
                {"step_id": "compute", "status": "shared", "timestamp": 1740830400},
                {"step_id": "gate", "status": "pending", "timestamp": "soon"}
            ]}]"#,
        );

        let progress = host.fetch_progress("s1").await.unwrap();
        let steps = &progress[0].steps;
        assert_eq!(steps[0].timestamp.map(|ts| ts.timestamp()), Some(1740830400));
        assert_eq!(steps[1].timestamp, None);
    }

    #[tokio::test]
    async fn test_fetch_activity_mixed_timestamps() {
        let root = tempdir().unwrap();
        let host = DirHost::new(root.path());
        write(
            &host.dir_for("s1"),
            ACTIVITY_FILE,
            "{\"participant\":\"b@y.org\",\"step\":\"compute\",\"event\":\"step_started\",\"timestamp\":1740830400}\n\
             {\"participant\":\"b@y.org\",\"step\":\"compute\",\"event\":\"step_completed\",\"timestamp\":\"2025-03-01T12:05:00Z\"}\n\
             {\"participant\":\"b@y.org\",\"step\":\"compute\",\"event\":\"step_shared\"}\n",
        );

        let entries = host.fetch_activity("s1").await.unwrap();
        assert_eq!(entries.len(), 3);
        assert_eq!(entries[0].timestamp.map(|ts| ts.timestamp()), Some(1740830400));
        assert!(entries[1].timestamp.is_some());
        assert_eq!(entries[2].event, ActivityEvent::StepShared);
        assert_eq!(entries[2].timestamp, None);
    }

    #[tokio::test]
    async fn test_fetch_activity_skips_bad_lines() {
        let root = tempdir().unwrap();
        let host = DirHost::new(root.path());
        write(
            &host.dir_for("s1"),
            ACTIVITY_FILE,
            "{\"participant\":\"b@y.org\",\"step\":\"compute\",\"event\":\"step_shared\",\"timestamp\":\"2025-03-01T12:00:00Z\"}\n\
             not json\n\
             \n\
             {\"participant\":\"b@y.org\",\"event\":\"renamed_thing\",\"timestamp\":\"2025-03-01T12:00:05Z\"}\n",
        );

        let entries = host.fetch_activity("s1").await.unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].event, ActivityEvent::StepShared);
        assert_eq!(entries[1].event, ActivityEvent::Unknown);
    }

    #[tokio::test]
    async fn test_log_tail_and_status() {
        let root = tempdir().unwrap();
        let host = DirHost::new(root.path());
        let dir = host.dir_for("r1");
        write(&dir, LOG_FILE, "one\ntwo\nthree\n");
        write(&dir, STATUS_FILE, "success\n");

        let tail = host.fetch_log_tail("r1", 2).await.unwrap();
        assert_eq!(tail.text, "two\nthree");
        assert_eq!(tail.status.as_deref(), Some("success"));
    }

    #[tokio::test]
    async fn test_fetch_transport_by_step() {
        let root = tempdir().unwrap();
        let host = DirHost::new(root.path());
        write(
            &host.dir_for("s1"),
            TELEMETRY_FILE,
            r#"{"compute": {"peers": [{"peer_email": "b@y.org", "tx_bytes": 10, "rx_bytes": 5, "observed_at": "2025-03-01T12:00:00Z"}]}}"#,
        );

        let snapshot = host.fetch_transport("s1", "compute").await.unwrap();
        assert_eq!(snapshot.peers.len(), 1);
        assert!(host.fetch_transport("s1", "gate").await.unwrap().peers.is_empty());
    }

    #[tokio::test]
    async fn test_checkpoint_round_trip() {
        let root = tempdir().unwrap();
        let host = DirHost::new(root.path());
        let mut checkpoint = RunCheckpoint::new(3, 8);
        checkpoint.last_command = Some("nextflow run main.nf".to_string());

        host.save_checkpoint("r1", &checkpoint).await.unwrap();
        let loaded = host.load_checkpoint("r1").await.unwrap().unwrap();
        assert_eq!(loaded, checkpoint);
    }
}
