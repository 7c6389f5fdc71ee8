//! Flow Definition Module
//!
//! Data structures and loading for the flows whose progress is reconciled.
//!
//! # Structure
//!
//! - [`model`]: Core data structures (Step, Flow, records, activity log)
//! - [`parser`]: YAML parsing and loading
//! - [`validator`]: Structural anomaly detection (never fatal)
//! - [`state`]: Persisted run progress checkpoint

pub mod model;
pub mod parser;
pub mod state;
pub mod validator;

pub use model::{
    ActivityEvent, ActivityLogEntry, Flow, ParticipantProgress, ParticipantStepRecord,
    ProgressEntry, Step,
};
pub use parser::{load_flow, parse_flow, FlowError};
pub use state::RunCheckpoint;
pub use validator::{find_anomalies, FlowAnomaly};
