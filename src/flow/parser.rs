//! Flow Parser
//!
//! Loads flow definitions from YAML (or JSON, which is a YAML subset),
//! derives each step's dependents, marks the local participant's steps and
//! reports structural anomalies without rejecting the flow.

use std::fs;
use std::path::Path;

use log::{debug, info};
use thiserror::Error;

use super::model::Flow;
use super::validator::report_anomalies;

/// Errors that prevent a flow definition from being read at all.
#[derive(Debug, Error)]
pub enum FlowError {
    #[error("failed to read flow file '{path}': {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse flow definition: {0}")]
    Parse(#[from] serde_yaml::Error),
}

/// Parses a flow definition from YAML text.
///
/// When `local_email` is given, every step that targets it is marked as the
/// local participant's action.
pub fn parse_flow(content: &str, local_email: Option<&str>) -> Result<Flow, FlowError> {
    let mut flow: Flow = serde_yaml::from_str(content)?;

    debug!("Parsed flow '{}' with {} steps", flow.name, flow.steps.len());

    for step in &mut flow.steps {
        if step.name.trim().is_empty() {
            step.name = step.id.clone();
        }
    }

    if let Some(me) = local_email {
        mark_local_steps(&mut flow, me);
    }

    flow.refresh_dependents();
    report_anomalies(&flow);

    Ok(flow)
}

/// Loads a flow definition from a file.
///
/// # Example
///
/// ```rust,no_run
/// use flowtrack::flow::load_flow;
///
/// fn main() -> Result<(), Box<dyn std::error::Error>> {
///     let flow = load_flow("session/flow.yaml", Some("alice@lab.org"))?;
///     println!("Loaded {} steps", flow.steps.len());
///     Ok(())
/// }
/// ```
pub fn load_flow(path: impl AsRef<Path>, local_email: Option<&str>) -> Result<Flow, FlowError> {
    let path = path.as_ref();
    info!("Loading flow from: {}", path.display());

    let content = fs::read_to_string(path).map_err(|source| FlowError::Read {
        path: path.display().to_string(),
        source,
    })?;

    parse_flow(&content, local_email)
}

/// Marks steps that target the local participant as theirs.
///
/// Steps already flagged `my_action` in the definition are left alone.
pub fn mark_local_steps(flow: &mut Flow, local_email: &str) {
    let mut marked = 0;
    for step in &mut flow.steps {
        if !step.my_action && step.targets(local_email) {
            step.my_action = true;
            marked += 1;
        }
    }
    if marked > 0 {
        debug!("Marked {} steps as actions for {}", marked, local_email);
    }
}
