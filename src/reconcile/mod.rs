//! Reconciliation Module
//!
//! Turns noisy, partial and out-of-order status reports into a stable view.
//!
//! # Structure
//!
//! - [`status`]: canonical status vocabulary and rank table
//! - [`merge`]: per-(step, participant) store that never moves backwards
//! - [`resolver`]: completion, barriers, next action and blockers
//! - [`engine`]: [`ReconciliationEngine`], owner of all cached state

pub mod engine;
pub mod merge;
pub mod resolver;
pub mod status;

pub use engine::{
    ParticipantView, PeerView, ReconciliationEngine, RunView, SessionView, StepView,
    TransportView,
};
pub use merge::{MergeOutcome, MergeStore};
pub use resolver::{downstream_started, Resolver, RunOutcome};
pub use status::{normalize, CanonicalStatus};
