//! Step Timers
//!
//! Derives per-step durations from the status transitions the reconciler
//! observes, plus timestamped evidence backfilled from the activity log.
//! Once a step stops its duration is frozen: a later stale poll showing the
//! step as pending again must not wipe the time already displayed.

use std::collections::HashMap;
use std::time::Duration;

use chrono::{DateTime, Utc};
use log::debug;

use crate::reconcile::status::CanonicalStatus;

/// Start/stop evidence for one step.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct StepTimer {
    /// Earliest evidence that the step started
    pub started_at: Option<DateTime<Utc>>,
    /// When the step reached a terminal status
    pub stopped_at: Option<DateTime<Utc>>,
}

impl StepTimer {
    /// True once the timer has stopped; it never restarts afterwards.
    pub fn is_frozen(&self) -> bool {
        self.stopped_at.is_some()
    }

    /// Elapsed time, measured up to `now` while the step still runs.
    ///
    /// Returns `None` if no start evidence was ever seen.
    pub fn elapsed(&self, now: DateTime<Utc>) -> Option<Duration> {
        let start = self.started_at?;
        let end = self.stopped_at.unwrap_or(now);
        Some((end - start).to_std().unwrap_or(Duration::ZERO))
    }
}

/// Timers for every step of one session or run.
#[derive(Debug, Clone, Default)]
pub struct StepTimers {
    timers: HashMap<String, StepTimer>,
}

impl StepTimers {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feeds a status observation for a step.
    ///
    /// - `Running`/`Sharing` start the timer at `now`, or at `evidence` when
    ///   that is earlier; an existing start only ever moves earlier.
    /// - `Completed`/`Shared`/`Failed` stop the timer once. Explicit evidence
    ///   may push an existing stop later, never earlier.
    /// - `Pending`/`Ready`/`WaitingForInputs` never touch a timer.
    pub fn observe(
        &mut self,
        step_id: &str,
        status: &CanonicalStatus,
        evidence: Option<DateTime<Utc>>,
        now: DateTime<Utc>,
    ) {
        if status.is_reset_like() {
            if self.timers.get(step_id).is_some_and(StepTimer::is_frozen) {
                debug!("Ignoring {} for frozen timer '{}'", status, step_id);
            }
            return;
        }

        let at = match evidence {
            Some(ts) if ts < now => ts,
            _ => now,
        };

        if status.is_terminal() {
            let timer = self.timers.entry(step_id.to_string()).or_default();
            match timer.stopped_at {
                None => timer.stopped_at = Some(at),
                Some(stopped) if evidence.is_some() && at > stopped => {
                    timer.stopped_at = Some(at)
                }
                Some(_) => {}
            }
            return;
        }

        if status.is_started() {
            let timer = self.timers.entry(step_id.to_string()).or_default();
            if timer.is_frozen() && evidence.is_none() {
                return;
            }
            if let Some(stopped) = timer.stopped_at {
                if at > stopped {
                    return;
                }
            }
            timer.started_at = Some(match timer.started_at {
                Some(existing) => existing.min(at),
                None => at,
            });
        }
    }

    /// Returns the timer for a step.
    pub fn get(&self, step_id: &str) -> Option<&StepTimer> {
        self.timers.get(step_id)
    }

    /// Elapsed time for a step, `None` if it never started.
    pub fn elapsed(&self, step_id: &str, now: DateTime<Utc>) -> Option<Duration> {
        self.timers.get(step_id)?.elapsed(now)
    }

    /// Elapsed time for the whole run: earliest start to latest stop, or to
    /// `now` while any started step is still running.
    pub fn run_elapsed(&self, now: DateTime<Utc>) -> Option<Duration> {
        let start = self.timers.values().filter_map(|t| t.started_at).min()?;
        let still_running = self
            .timers
            .values()
            .any(|t| t.started_at.is_some() && t.stopped_at.is_none());
        let end = if still_running {
            now
        } else {
            self.timers
                .values()
                .filter_map(|t| t.stopped_at)
                .max()
                .unwrap_or(now)
        };
        Some((end - start).to_std().unwrap_or(Duration::ZERO))
    }
}
