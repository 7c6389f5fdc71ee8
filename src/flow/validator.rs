//! Flow Structural Checks
//!
//! A flow definition comes from the remote backend and may be malformed.
//! Nothing here rejects a flow: the reconciler fails open on bad references
//! so the UI never deadlocks. Instead every anomaly is collected and logged
//! so the host can surface it.

use std::collections::{HashMap, HashSet, VecDeque};
use std::fmt;

use log::{debug, warn};

use super::model::{email_key, Flow};

/// A structural problem found in a flow definition.
#[derive(Debug, Clone, PartialEq)]
pub enum FlowAnomaly {
    DuplicateStepId(String),
    EmptyStepId,
    UnknownDependency { step: String, reference: String },
    CyclicDependency(Vec<String>),
    BarrierWithoutDependencies(String),
    UnknownTarget { step: String, email: String },
}

impl fmt::Display for FlowAnomaly {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::DuplicateStepId(id) => write!(f, "Duplicate step ID: '{}'", id),
            Self::EmptyStepId => write!(f, "Step has empty or whitespace-only ID"),
            Self::UnknownDependency { step, reference } => write!(
                f,
                "Step '{}' depends on unknown step '{}' (treated as satisfied)",
                step, reference
            ),
            Self::CyclicDependency(steps) => {
                write!(f, "Steps depend on each other in a loop: {}", steps.join(", "))
            }
            Self::BarrierWithoutDependencies(step) => {
                write!(f, "Barrier step '{}' has nothing to wait for", step)
            }
            Self::UnknownTarget { step, email } => {
                write!(f, "Step '{}' targets '{}' who is not in the roster", step, email)
            }
        }
    }
}

/// Collects every structural anomaly in a flow.
pub fn find_anomalies(flow: &Flow) -> Vec<FlowAnomaly> {
    let mut anomalies = Vec::new();

    let mut seen_ids: HashSet<&str> = HashSet::new();
    for step in &flow.steps {
        if step.id.trim().is_empty() {
            anomalies.push(FlowAnomaly::EmptyStepId);
            continue;
        }
        if !seen_ids.insert(step.id.as_str()) {
            anomalies.push(FlowAnomaly::DuplicateStepId(step.id.clone()));
        }
    }

    let roster: HashSet<String> = flow.participants.iter().map(|p| email_key(p)).collect();

    for step in &flow.steps {
        for dep in &step.depends_on {
            if !seen_ids.contains(dep.as_str()) {
                anomalies.push(FlowAnomaly::UnknownDependency {
                    step: step.id.clone(),
                    reference: dep.clone(),
                });
            }
        }

        if step.is_barrier && step.depends_on.is_empty() {
            anomalies.push(FlowAnomaly::BarrierWithoutDependencies(step.id.clone()));
        }

        if !roster.is_empty() {
            for email in &step.target_emails {
                if !roster.contains(&email_key(email)) {
                    anomalies.push(FlowAnomaly::UnknownTarget {
                        step: step.id.clone(),
                        email: email.clone(),
                    });
                }
            }
        }
    }

    let stuck = steps_in_cycles(flow);
    if !stuck.is_empty() {
        anomalies.push(FlowAnomaly::CyclicDependency(stuck));
    }

    anomalies
}

/// Logs every anomaly at warn level and returns how many were found.
pub fn report_anomalies(flow: &Flow) -> usize {
    let anomalies = find_anomalies(flow);
    for anomaly in &anomalies {
        warn!("Flow '{}': {}", flow.name, anomaly);
    }
    if anomalies.is_empty() {
        debug!("Flow '{}' has {} steps, no anomalies", flow.name, flow.steps.len());
    }
    anomalies.len()
}

/// Runs Kahn's algorithm over known edges and returns the steps that never
/// reach in-degree zero, in declaration order.
fn steps_in_cycles(flow: &Flow) -> Vec<String> {
    let known: HashSet<&str> = flow.steps.iter().map(|s| s.id.as_str()).collect();

    let mut in_degree: HashMap<&str, usize> = HashMap::new();
    let mut successors: HashMap<&str, Vec<&str>> = HashMap::new();
    for step in &flow.steps {
        let deps: HashSet<&str> = step
            .depends_on
            .iter()
            .map(|d| d.as_str())
            .filter(|d| known.contains(d))
            .collect();
        in_degree.insert(step.id.as_str(), deps.len());
        for dep in deps {
            successors.entry(dep).or_default().push(step.id.as_str());
        }
    }

    let mut queue: VecDeque<&str> = in_degree
        .iter()
        .filter(|(_, degree)| **degree == 0)
        .map(|(id, _)| *id)
        .collect();

    let mut visited: HashSet<&str> = HashSet::new();
    while let Some(current) = queue.pop_front() {
        visited.insert(current);
        for &next in successors.get(current).into_iter().flatten() {
            if let Some(degree) = in_degree.get_mut(next) {
                *degree = degree.saturating_sub(1);
                if *degree == 0 {
                    queue.push_back(next);
                }
            }
        }
    }

    flow.steps
        .iter()
        .filter(|s| !visited.contains(s.id.as_str()))
        .map(|s| s.id.clone())
        .collect()
}
