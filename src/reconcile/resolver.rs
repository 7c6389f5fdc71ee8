//! Step Dependency & Completion Resolver
//!
//! Answers "is this step done, for whom, and what should I run next" from a
//! flow's step DAG plus the merged per-participant statuses. Nothing here
//! fails: missing data simply means "not done yet".
//!
//! # Barrier Rules
//!
//! A barrier is done for a participant when any of the following holds:
//!
//! 1. The participant's own status for the barrier is done
//! 2. Every dependency of the barrier is done for the participant
//! 3. A step depending on the barrier already started for the participant
//!    (see [`downstream_started`])

use std::collections::HashSet;

use serde::{Deserialize, Serialize};

use crate::flow::model::{email_key, Flow, Step};
use crate::monitoring::progress::ProgressSample;

use super::merge::MergeStore;
use super::status::CanonicalStatus;

/// Overall state of a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunOutcome {
    InProgress,
    Succeeded,
    Failed,
}

type Visiting = HashSet<(String, String)>;

/// Read-only view combining a flow with its merged statuses.
pub struct Resolver<'a> {
    flow: &'a Flow,
    store: &'a MergeStore,
    local_email: Option<&'a str>,
}

impl<'a> Resolver<'a> {
    pub fn new(flow: &'a Flow, store: &'a MergeStore, local_email: Option<&'a str>) -> Self {
        Self {
            flow,
            store,
            local_email,
        }
    }

    pub fn flow(&self) -> &'a Flow {
        self.flow
    }

    fn is_local(&self, email: &str) -> bool {
        match self.local_email {
            Some(local) => email_key(local) == email_key(email),
            None => email.trim().is_empty(),
        }
    }

    /// Identity used when a step names no participants.
    fn local_identity(&self) -> &'a str {
        self.local_email.unwrap_or("")
    }

    /// The local participant's status.
    ///
    /// An active local status (failed, running or sharing) is taken as is,
    /// so a failed step can be retried. Otherwise the step's own field and
    /// the merged record from activity or progress, whichever ranks higher.
    /// Only the step's field can report a local failure.
    pub fn local_status(&self, step: &Step) -> CanonicalStatus {
        if is_active(&step.status) {
            return step.status.clone();
        }

        let merged = self
            .local_email
            .and_then(|email| self.store.get(&step.id, email))
            .map(|record| &record.status)
            .filter(|status| **status != CanonicalStatus::Failed);

        match merged {
            Some(merged) if merged.rank() > step.status.rank() => merged.clone(),
            _ => step.status.clone(),
        }
    }

    /// Best-known status of a participant for a step.
    pub fn participant_status(&self, step: &Step, email: &str) -> Option<CanonicalStatus> {
        if self.is_local(email) {
            return Some(self.local_status(step));
        }
        self.store
            .get(&step.id, email)
            .map(|record| record.status.clone())
    }

    /// The participant's output directory, exposed only once the step is
    /// done for them.
    pub fn output_dir(&self, step: &Step, email: &str) -> Option<&'a str> {
        let record = self.store.get(&step.id, email)?;
        if record.status.satisfies_done(step.shares_output) {
            record.output_dir.as_deref()
        } else {
            None
        }
    }

    /// Whether a step is done for one participant.
    pub fn is_done(&self, step: &Step, email: &str) -> bool {
        self.done_guarded(step, email, &mut Visiting::new())
    }

    fn done_guarded(&self, step: &Step, email: &str, visiting: &mut Visiting) -> bool {
        let key = (step.id.clone(), email_key(email));
        if !visiting.insert(key.clone()) {
            return false;
        }

        let done = self.done_inner(step, email, visiting);
        visiting.remove(&key);
        done
    }

    fn done_inner(&self, step: &Step, email: &str, visiting: &mut Visiting) -> bool {
        let own = self
            .participant_status(step, email)
            .is_some_and(|status| status.satisfies_done(step.shares_output));
        if own || !step.is_barrier {
            return own;
        }

        if !step.depends_on.is_empty()
            && step.depends_on.iter().all(|dep_id| {
                let Some(dep) = self.flow.get_step(dep_id) else {
                    return true;
                };
                if dep.target_emails.is_empty() || dep.targets(email) {
                    self.done_guarded(dep, email, visiting)
                } else {
                    self.complete_guarded(dep, visiting)
                }
            })
        {
            return true;
        }

        downstream_started(self, step, email)
    }

    /// Whether a step is complete for the whole roster.
    ///
    /// Steps without targets fall back to the local participant.
    pub fn is_complete(&self, step: &Step) -> bool {
        self.complete_guarded(step, &mut Visiting::new())
    }

    fn complete_guarded(&self, step: &Step, visiting: &mut Visiting) -> bool {
        if step.target_emails.is_empty() {
            return self.done_guarded(step, self.local_identity(), visiting);
        }
        step.target_emails
            .iter()
            .all(|email| self.done_guarded(step, email, visiting))
    }

    /// The status shown for a step.
    pub fn effective_status(&self, step: &Step) -> CanonicalStatus {
        let local = self.local_status(step);
        if is_active(&local) {
            return local;
        }

        if self.is_complete(step) {
            let any_shared = step.target_emails.iter().any(|email| {
                self.participant_status(step, email) == Some(CanonicalStatus::Shared)
            }) || local == CanonicalStatus::Shared;
            return if any_shared {
                CanonicalStatus::Shared
            } else {
                CanonicalStatus::Completed
            };
        }

        local
    }

    /// True when every known dependency is complete. Unknown ids count as
    /// satisfied.
    pub fn deps_satisfied(&self, step: &Step) -> bool {
        step.depends_on.iter().all(|dep_id| {
            self.flow
                .get_step(dep_id)
                .map_or(true, |dep| self.is_complete(dep))
        })
    }

    /// Whether the local participant can act on a step right now.
    pub fn is_actionable(&self, step: &Step) -> bool {
        if !step.my_action || step.is_barrier || !self.deps_satisfied(step) {
            return false;
        }
        match self.effective_status(step) {
            CanonicalStatus::Ready | CanonicalStatus::Pending => true,
            CanonicalStatus::Completed => step.shares_output && !step.outputs_shared,
            _ => false,
        }
    }

    /// First actionable step in declaration order.
    pub fn next_action(&self) -> Option<&'a Step> {
        self.flow.steps.iter().find(|step| self.is_actionable(step))
    }

    /// Participants that still have to finish a step, in roster order.
    pub fn blockers(&self, step: &Step) -> Vec<String> {
        if step.target_emails.is_empty() {
            let local = self.local_identity();
            return if !local.is_empty() && !self.is_done(step, local) {
                vec![local.to_string()]
            } else {
                Vec::new()
            };
        }
        step.target_emails
            .iter()
            .filter(|email| !self.is_done(step, email))
            .cloned()
            .collect()
    }

    /// Blockers of the first incomplete step.
    pub fn run_blockers(&self) -> Vec<String> {
        self.flow
            .steps
            .iter()
            .find(|step| !self.is_complete(step))
            .map(|step| self.blockers(step))
            .unwrap_or_default()
    }

    /// Completed steps over total steps.
    pub fn completion(&self) -> ProgressSample {
        let completed = self
            .flow
            .steps
            .iter()
            .filter(|step| self.is_complete(step))
            .count();
        ProgressSample::new(completed as u32, self.flow.len() as u32)
    }

    /// Overall outcome of the run.
    pub fn run_outcome(&self) -> RunOutcome {
        if self.flow.is_empty() {
            return RunOutcome::InProgress;
        }
        if self
            .flow
            .steps
            .iter()
            .any(|step| self.effective_status(step) == CanonicalStatus::Failed)
        {
            return RunOutcome::Failed;
        }
        if self.flow.steps.iter().all(|step| self.is_complete(step)) {
            RunOutcome::Succeeded
        } else {
            RunOutcome::InProgress
        }
    }

    /// True when the local participant has steps and all of them are
    /// complete.
    pub fn my_steps_complete(&self) -> bool {
        let mut mine = self.flow.steps.iter().filter(|step| step.my_action).peekable();
        mine.peek().is_some() && mine.all(|step| self.is_complete(step))
    }
}

fn is_active(status: &CanonicalStatus) -> bool {
    matches!(
        status,
        CanonicalStatus::Failed | CanonicalStatus::Running | CanonicalStatus::Sharing
    )
}

/// Lag-tolerance heuristic for barriers: true when any step depending on
/// `step` already started for the participant.
///
/// Evidence that a dependent ran can arrive before evidence that the barrier
/// finished. This keeps the barrier from looking stuck in that window. It is
/// an approximation, not proof that the barrier completed.
pub fn downstream_started(resolver: &Resolver<'_>, step: &Step, email: &str) -> bool {
    step.dependents.iter().any(|dependent_id| {
        resolver
            .flow()
            .get_step(dependent_id)
            .and_then(|dependent| resolver.participant_status(dependent, email))
            .is_some_and(|status| status.is_started())
    })
}
