//! Host Module
//!
//! The engine performs no I/O itself. Everything it consumes arrives through
//! the [`RunHost`] trait, queried by the [`Poller`] on a fixed cadence.
//!
//! # Structure
//!
//! - [`RunHost`]: asynchronous queries the host environment answers
//! - [`dir`]: a host backed by a directory per session or run
//! - [`poller`]: single-threaded cooperative polling with in-flight guards

pub mod dir;
pub mod poller;

use thiserror::Error;

use crate::flow::model::{ActivityLogEntry, Flow, ParticipantProgress};
use crate::flow::parser::FlowError;
use crate::flow::state::RunCheckpoint;
use crate::monitoring::transport::TransportSnapshot;

pub use dir::DirHost;
pub use poller::{PollOutcome, Poller};

/// Errors returned by host queries. The poller logs these and keeps the
/// previous state.
#[derive(Debug, Error)]
pub enum HostError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("malformed JSON: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("malformed YAML: {0}")]
    Yaml(#[from] serde_yaml::Error),
}

impl From<FlowError> for HostError {
    fn from(err: FlowError) -> Self {
        match err {
            FlowError::Read { source, .. } => HostError::Io(source),
            FlowError::Parse(err) => HostError::Yaml(err),
        }
    }
}

/// Bounded tail of a run's execution log.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RunLogTail {
    pub text: String,
    /// Raw run status as the host reports it, if any
    pub status: Option<String>,
}

/// Queries the engine needs answered by its environment.
///
/// Implementations are driven from a single thread and need not be `Send`.
#[allow(async_fn_in_trait)]
pub trait RunHost {
    /// Step definitions of a session.
    async fn fetch_flow(&self, session_id: &str) -> Result<Flow, HostError>;

    /// The last `lines` lines of a run's log plus its status.
    async fn fetch_log_tail(&self, run_id: &str, lines: usize) -> Result<RunLogTail, HostError>;

    /// Per-participant progress snapshots of a session.
    async fn fetch_progress(&self, session_id: &str)
        -> Result<Vec<ParticipantProgress>, HostError>;

    /// The session's shared activity log.
    async fn fetch_activity(&self, session_id: &str) -> Result<Vec<ActivityLogEntry>, HostError>;

    /// Channel state and byte counters for one step of a session.
    async fn fetch_transport(
        &self,
        session_id: &str,
        step_id: &str,
    ) -> Result<TransportSnapshot, HostError>;

    /// The persisted checkpoint of a run, if one exists.
    async fn load_checkpoint(&self, run_id: &str) -> Result<Option<RunCheckpoint>, HostError>;

    /// Persists a run checkpoint.
    async fn save_checkpoint(&self, run_id: &str, checkpoint: &RunCheckpoint)
        -> Result<(), HostError>;
}
