//! FlowTrack - Run Progress Reconciliation Engine
//!
//! Turns noisy, partial and out-of-order status information about a running
//! flow into a stable, monotonic view: per-step status, completion, what to
//! run next, who is blocking, timers, ETA and peer throughput.
//!
//! Two sources are supported:
//!
//! - single-operator runs, known only through an unstructured execution log
//! - multi-party sessions, where several participants report per-step
//!   progress and share an append-only activity log
//!
//! # Architecture
//!
//! - [`flow`]: Step DAG, YAML loading, structural checks, run checkpoints
//! - [`reconcile`]: Status vocabulary, monotonic merge, completion resolver
//!   and the [`ReconciliationEngine`] that owns all cached state
//! - [`monitoring`]: Step timers, log progress and ETA, transport rates,
//!   display labels
//! - [`host`]: The asynchronous [`RunHost`] seam, a directory-backed host
//!   and the single-threaded [`Poller`]
//! - [`config`]: Engine tunables
//!
//! # Example
//!
//! ```
//! use chrono::Utc;
//! use flowtrack::flow::{Flow, Step};
//! use flowtrack::reconcile::{CanonicalStatus, ReconciliationEngine};
//!
//! let flow = Flow::from_steps(vec![
//!     Step::new("compute").with_targets(&["a@x.org", "b@y.org"]),
//! ]);
//!
//! let mut engine = ReconciliationEngine::default();
//! engine.open_session("s1", Some("a@x.org"));
//! engine.update_flow("s1", flow, Utc::now());
//!
//! let view = engine.session_view("s1", Utc::now()).unwrap();
//! assert_eq!(view.steps[0].status, CanonicalStatus::Pending);
//! assert_eq!(view.next_action.as_deref(), Some("compute"));
//! ```

pub mod config;
pub mod flow;
pub mod host;
pub mod monitoring;
pub mod reconcile;

// Re-export commonly used types
pub use config::EngineConfig;
pub use flow::{load_flow, Flow, Step};
pub use host::{DirHost, HostError, PollOutcome, Poller, RunHost};
pub use monitoring::progress::select_step_log_lines;
pub use reconcile::{normalize, CanonicalStatus, ReconciliationEngine};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Application name
pub const APP_NAME: &str = "FlowTrack";

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_library_version() {
        assert!(!VERSION.is_empty());
        assert!(VERSION.contains('.'));
    }

    #[test]
    fn test_app_name() {
        assert_eq!(APP_NAME, "FlowTrack");
    }

    #[test]
    fn test_module_exports_step() {
        let step = Step::new("compute").with_targets(&["a@x.org"]);
        assert_eq!(step.id, "compute");
        assert!(step.targets("A@X.org"));
    }

    #[test]
    fn test_module_exports_normalize() {
        assert_eq!(normalize("in_progress"), CanonicalStatus::Running);
    }
}
