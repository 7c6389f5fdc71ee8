//! Flow Data Model
//!
//! Core data structures describing a flow run as seen from one participant:
//! the step DAG, per-participant progress records and the shared activity log.
//!
//! # Example YAML Format
//!
//! ```yaml
//! name: gwas-join
//! participants:
//!   - alice@lab.org
//!   - bob@clinic.org
//! steps:
//!   - id: compute_counts
//!     name: Compute allele counts
//!     targets: [alice@lab.org, bob@clinic.org]
//!     my_action: true
//!     shares_output: true
//!
//!   - id: wait_for_counts
//!     barrier: true
//!     depends_on: [compute_counts]
//!     targets: [alice@lab.org, bob@clinic.org]
//!
//!   - id: aggregate
//!     depends_on: [wait_for_counts]
//!     targets: [alice@lab.org]
//! ```

use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;

use crate::reconcile::status::CanonicalStatus;

/// Canonical form of a participant identity used for map keys.
pub fn email_key(email: &str) -> String {
    email.trim().to_ascii_lowercase()
}

/// A single node of a flow's DAG.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct Step {
    /// Unique identifier within the flow
    pub id: String,

    /// Display name (falls back to the id)
    #[serde(default)]
    pub name: String,

    /// IDs of steps that must complete before this one
    #[serde(default)]
    pub depends_on: Vec<String>,

    /// IDs of steps that depend on this one (auto-populated)
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub dependents: Vec<String>,

    /// Requires every target to finish before it counts as complete
    #[serde(default, alias = "barrier")]
    pub is_barrier: bool,

    /// Output must be shared, not merely produced, to count as done
    #[serde(default)]
    pub shares_output: bool,

    /// Participants expected to act on this step, in roster order
    #[serde(default, alias = "targets")]
    pub target_emails: Vec<String>,

    /// Status reported by the local participant's own execution
    #[serde(default)]
    pub status: CanonicalStatus,

    /// Whether the local participant runs this step
    #[serde(default)]
    pub my_action: bool,

    /// Whether the local participant already shared this step's outputs
    #[serde(default)]
    pub outputs_shared: bool,
}

impl Step {
    /// Creates a plain step with no dependencies or targets.
    ///
    /// # Example
    ///
    /// ```
    /// use flowtrack::flow::Step;
    ///
    /// let step = Step::new("aggregate")
    ///     .depends_on("wait_for_counts")
    ///     .with_targets(&["alice@lab.org"])
    ///     .mine();
    /// assert!(step.my_action);
    /// ```
    pub fn new(id: impl Into<String>) -> Self {
        let id = id.into().trim().to_string();
        Self {
            name: id.clone(),
            id,
            depends_on: Vec::new(),
            dependents: Vec::new(),
            is_barrier: false,
            shares_output: false,
            target_emails: Vec::new(),
            status: CanonicalStatus::Pending,
            my_action: false,
            outputs_shared: false,
        }
    }

    /// Sets the display name.
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    /// Adds a dependency on another step.
    pub fn depends_on(mut self, step_id: impl Into<String>) -> Self {
        self.depends_on.push(step_id.into());
        self
    }

    /// Sets the participants expected to act on this step.
    pub fn with_targets(mut self, emails: &[&str]) -> Self {
        self.target_emails = emails.iter().map(|e| e.to_string()).collect();
        self
    }

    /// Marks the step as a barrier.
    pub fn barrier(mut self) -> Self {
        self.is_barrier = true;
        self
    }

    /// Marks the step as one whose output must be shared.
    pub fn sharing_output(mut self) -> Self {
        self.shares_output = true;
        self
    }

    /// Marks the step as run by the local participant.
    pub fn mine(mut self) -> Self {
        self.my_action = true;
        self
    }

    /// Sets the local status.
    pub fn with_status(mut self, status: CanonicalStatus) -> Self {
        self.status = status;
        self
    }

    /// Returns true if `email` is one of this step's targets.
    pub fn targets(&self, email: &str) -> bool {
        self.target_emails
            .iter()
            .any(|t| t.trim().eq_ignore_ascii_case(email.trim()))
    }
}

/// A flow run's step definitions plus its roster.
#[derive(Serialize, Deserialize, Debug, Clone, Default)]
pub struct Flow {
    /// Flow name
    #[serde(default)]
    pub name: String,

    /// Every participant in the run
    #[serde(default)]
    pub participants: Vec<String>,

    /// Steps in declaration order
    pub steps: Vec<Step>,
}

impl Flow {
    /// Creates a flow from a list of steps, populating dependents.
    pub fn from_steps(steps: Vec<Step>) -> Self {
        let mut flow = Self {
            name: String::new(),
            participants: Vec::new(),
            steps,
        };
        flow.refresh_dependents();
        flow
    }

    /// Sets the roster.
    pub fn with_participants(mut self, emails: &[&str]) -> Self {
        self.participants = emails.iter().map(|e| e.to_string()).collect();
        self
    }

    /// Gets a step by ID.
    pub fn get_step(&self, id: &str) -> Option<&Step> {
        self.steps.iter().find(|s| s.id == id)
    }

    /// Gets a mutable reference to a step by ID.
    pub fn get_step_mut(&mut self, id: &str) -> Option<&mut Step> {
        self.steps.iter_mut().find(|s| s.id == id)
    }

    /// Rebuilds every step's `dependents` list from `depends_on`.
    pub fn refresh_dependents(&mut self) {
        let edges: Vec<(String, String)> = self
            .steps
            .iter()
            .flat_map(|s| s.depends_on.iter().map(move |d| (d.clone(), s.id.clone())))
            .collect();

        for step in &mut self.steps {
            step.dependents.clear();
        }
        for (dep, dependent) in edges {
            if let Some(step) = self.get_step_mut(&dep) {
                if !step.dependents.contains(&dependent) {
                    step.dependents.push(dependent);
                }
            }
        }
    }

    /// Returns the number of steps.
    pub fn len(&self) -> usize {
        self.steps.len()
    }

    /// Returns true if the flow has no steps.
    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }
}

/// One participant's status for one step.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct ParticipantStepRecord {
    pub step_id: String,
    pub participant: String,
    pub status: CanonicalStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output_dir: Option<String>,
    /// When the participant reported this status, if known
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reported_at: Option<DateTime<Utc>>,
}

impl ParticipantStepRecord {
    pub fn new(
        step_id: impl Into<String>,
        participant: impl Into<String>,
        status: CanonicalStatus,
    ) -> Self {
        Self {
            step_id: step_id.into(),
            participant: participant.into(),
            status,
            output_dir: None,
            reported_at: None,
        }
    }

    pub fn with_output_dir(mut self, dir: impl Into<String>) -> Self {
        self.output_dir = Some(dir.into());
        self
    }

    pub fn reported_at(mut self, at: DateTime<Utc>) -> Self {
        self.reported_at = Some(at);
        self
    }
}

/// A participant's progress snapshot as returned by the host.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct ParticipantProgress {
    pub email: String,
    #[serde(default)]
    pub steps: Vec<ProgressEntry>,
}

/// One step entry inside a [`ParticipantProgress`] snapshot.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct ProgressEntry {
    pub step_id: String,
    pub status: CanonicalStatus,
    #[serde(default)]
    pub output_dir: Option<String>,
    #[serde(default, deserialize_with = "lenient_timestamp")]
    pub timestamp: Option<DateTime<Utc>>,
}

/// Reads a timestamp written as an RFC 3339 string or as epoch seconds.
/// Anything else, including a malformed string, reads as `None`.
fn lenient_timestamp<'de, D>(deserializer: D) -> Result<Option<DateTime<Utc>>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Option::<Value>::deserialize(deserializer)?;
    Ok(value.as_ref().and_then(parse_timestamp))
}

fn parse_timestamp(value: &Value) -> Option<DateTime<Utc>> {
    let secs = value
        .as_i64()
        .or_else(|| value.as_u64().and_then(|secs| i64::try_from(secs).ok()));
    if let Some(secs) = secs {
        return Utc.timestamp_opt(secs, 0).single();
    }
    DateTime::parse_from_rfc3339(value.as_str()?.trim())
        .ok()
        .map(|dt| dt.with_timezone(&Utc))
}

/// Kind of an activity-log event.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum ActivityEvent {
    Joined,
    StepStarted,
    StepCompleted,
    StepShared,
    BarrierCompleted,
    /// Anything newer than this client understands
    #[serde(other)]
    Unknown,
}

impl ActivityEvent {
    /// Status implied by this event for the event's step, if any.
    pub fn implied_status(self) -> Option<CanonicalStatus> {
        match self {
            Self::StepStarted => Some(CanonicalStatus::Running),
            Self::StepCompleted | Self::BarrierCompleted => Some(CanonicalStatus::Completed),
            Self::StepShared => Some(CanonicalStatus::Shared),
            Self::Joined | Self::Unknown => None,
        }
    }
}

/// An entry of the shared, append-only activity log.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct ActivityLogEntry {
    pub participant: String,
    #[serde(default, alias = "step")]
    pub step_id: Option<String>,
    pub event: ActivityEvent,
    #[serde(default, deserialize_with = "lenient_timestamp")]
    pub timestamp: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl ActivityLogEntry {
    pub fn new(
        participant: impl Into<String>,
        step_id: Option<&str>,
        event: ActivityEvent,
        timestamp: DateTime<Utc>,
    ) -> Self {
        Self {
            participant: participant.into(),
            step_id: step_id.map(|s| s.to_string()),
            event,
            timestamp: Some(timestamp),
            message: None,
        }
    }

    /// The step id, ignoring placeholder values some writers emit.
    pub fn step(&self) -> Option<&str> {
        let trimmed = self.step_id.as_deref()?.trim();
        if trimmed.is_empty()
            || trimmed.eq_ignore_ascii_case("null")
            || trimmed.eq_ignore_ascii_case("undefined")
        {
            None
        } else {
            Some(trimmed)
        }
    }

    /// Identity used to drop duplicate entries.
    pub fn dedup_key(&self) -> (String, ActivityEvent, String, Option<i64>) {
        (
            email_key(&self.participant),
            self.event,
            self.step().unwrap_or_default().to_string(),
            self.timestamp.map(|ts| ts.timestamp_millis()),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_flow() -> Flow {
        Flow::from_steps(vec![
            Step::new("a").mine(),
            Step::new("b").depends_on("a"),
            Step::new("c").depends_on("a").depends_on("b"),
        ])
    }

    #[test]
    fn test_step_creation() {
        let step = Step::new(" share ")
            .with_name("Share results")
            .sharing_output()
            .with_targets(&["a@x.org"]);

        assert_eq!(step.id, "share");
        assert_eq!(step.name, "Share results");
        assert!(step.shares_output);
        assert!(step.targets("A@X.org"));
        assert_eq!(step.status, CanonicalStatus::Pending);
    }

    #[test]
    fn test_flow_dependents_populated() {
        let flow = sample_flow();
        assert_eq!(flow.get_step("a").unwrap().dependents, vec!["b", "c"]);
        assert_eq!(flow.get_step("b").unwrap().dependents, vec!["c"]);
        assert!(flow.get_step("c").unwrap().dependents.is_empty());
        assert_eq!(flow.position("c"), Some(2));
    }

    #[test]
    fn test_flow_yaml_aliases() {
        let yaml = r#"
name: demo
steps:
  - id: gate
    barrier: true
    targets: [a@x.org, b@x.org]
    status: waiting-for-inputs
"#;
        let flow: Flow = serde_yaml::from_str(yaml).unwrap();
        let gate = flow.get_step("gate").unwrap();
        assert!(gate.is_barrier);
        assert_eq!(gate.target_emails.len(), 2);
        assert_eq!(gate.status, CanonicalStatus::WaitingForInputs);
    }

    #[test]
    fn test_activity_event_parsing() {
        let line = r#"{"participant":"a@x.org","event":"step_shared","step_id":"s1","timestamp":"2025-01-01T10:00:00Z"}"#;
        let entry: ActivityLogEntry = serde_json::from_str(line).unwrap();
        assert_eq!(entry.event, ActivityEvent::StepShared);
        assert_eq!(entry.step(), Some("s1"));
        assert_eq!(entry.event.implied_status(), Some(CanonicalStatus::Shared));
    }

    #[test]
    fn test_activity_unknown_event_and_placeholder_step() {
        let line = r#"{"participant":"a@x.org","event":"mpc_ready","step":"null","timestamp":"2025-01-01T10:00:00Z"}"#;
        let entry: ActivityLogEntry = serde_json::from_str(line).unwrap();
        assert_eq!(entry.event, ActivityEvent::Unknown);
        assert_eq!(entry.step(), None);
        assert_eq!(entry.event.implied_status(), None);
    }

    #[test]
    fn test_timestamps_accept_epoch_and_rfc3339() {
        let entry: ProgressEntry = serde_json::from_str(
            r#"{"step_id":"s1","status":"completed","timestamp":1735725600}"#,
        )
        .unwrap();
        assert_eq!(
            entry.timestamp,
            Some(Utc.with_ymd_and_hms(2025, 1, 1, 10, 0, 0).unwrap())
        );

        let entry: ProgressEntry = serde_json::from_str(
            r#"{"step_id":"s1","status":"completed","timestamp":"2025-01-01T11:00:00+01:00"}"#,
        )
        .unwrap();
        assert_eq!(
            entry.timestamp,
            Some(Utc.with_ymd_and_hms(2025, 1, 1, 10, 0, 0).unwrap())
        );
    }

    #[test]
    fn test_bad_timestamps_read_as_none() {
        for line in [
            r#"{"participant":"a@x.org","event":"joined","timestamp":"yesterday"}"#,
            r#"{"participant":"a@x.org","event":"joined","timestamp":null}"#,
            r#"{"participant":"a@x.org","event":"joined","timestamp":[1]}"#,
            r#"{"participant":"a@x.org","event":"joined"}"#,
        ] {
            let entry: ActivityLogEntry = serde_json::from_str(line).unwrap();
            assert_eq!(entry.timestamp, None, "{}", line);
        }
    }

    #[test]
    fn test_email_key() {
        assert_eq!(email_key(" Alice@Lab.ORG "), "alice@lab.org");
    }
}
