//! Reconciliation Engine
//!
//! Owns every cache the reconciler needs, keyed by session or run id:
//! merge stores, step timers, progress trackers, byte-rate baselines, the
//! de-duplicated activity log and render fingerprints. All mutation goes
//! through `apply_*` methods; everything the presenter reads comes out of
//! `*_view` queries.
//!
//! Two kinds of state are tracked:
//!
//! - **Sessions**: multi-party flows with per-participant progress
//! - **Runs**: single-operator runs known only through their execution log
//!
//! Every time-dependent method takes `now` from the caller.

use std::collections::hash_map::DefaultHasher;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::hash::{Hash, Hasher};

use chrono::{DateTime, Utc};
use log::{debug, info};
use serde::Serialize;

use crate::config::EngineConfig;
use crate::flow::model::{
    email_key, ActivityEvent, ActivityLogEntry, Flow, ParticipantProgress, ParticipantStepRecord,
};
use crate::flow::parser::mark_local_steps;
use crate::flow::state::RunCheckpoint;
use crate::monitoring::labels::{
    blockers_label, format_elapsed, format_eta, format_latency, format_percent, format_rate,
    Freshness,
};
use crate::monitoring::progress::{
    extract_concurrency, extract_last_command, extract_progress, relevant_lines,
    select_step_log_lines, strip_escape_sequences, ProgressSample, ProgressTracker,
};
use crate::monitoring::timeline::StepTimers;
use crate::monitoring::transport::{
    PeerChannelSample, PeerRate, RateEstimator, TransportSnapshot,
};

use super::merge::MergeStore;
use super::resolver::{Resolver, RunOutcome};
use super::status::{normalize, CanonicalStatus};

/// Relevant log lines kept per run for display.
const RELEVANT_LINES_KEPT: usize = 50;

/// Log lines shown under a running or failed step.
const STEP_LOG_LINES: usize = 8;

/// Latest telemetry for one peer of one step.
#[derive(Debug, Clone)]
struct PeerTelemetry {
    peer_email: String,
    rate: PeerRate,
    avg_send_ms: Option<f64>,
    updated_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Default)]
struct StepTransport {
    channels: Vec<PeerChannelSample>,
    peers: Vec<PeerTelemetry>,
}

/// Everything cached for one multi-party session.
#[derive(Debug)]
struct SessionState {
    flow: Flow,
    local_email: Option<String>,
    store: MergeStore,
    timers: StepTimers,
    rates: RateEstimator,
    activity: Vec<ActivityLogEntry>,
    seen: HashSet<(String, ActivityEvent, String, Option<i64>)>,
    transport: BTreeMap<String, StepTransport>,
    log: String,
}

impl SessionState {
    fn new(local_email: Option<String>) -> Self {
        Self {
            flow: Flow::default(),
            local_email,
            store: MergeStore::new(),
            timers: StepTimers::new(),
            rates: RateEstimator::new(),
            activity: Vec::new(),
            seen: HashSet::new(),
            transport: BTreeMap::new(),
            log: String::new(),
        }
    }

    fn is_local(&self, email: &str) -> bool {
        self.local_email
            .as_deref()
            .is_some_and(|local| email_key(local) == email_key(email))
    }

    /// Feeds every step's effective status to its timer.
    fn refresh_timers(&mut self, now: DateTime<Utc>) {
        let SessionState {
            flow,
            local_email,
            store,
            timers,
            ..
        } = self;
        let resolver = Resolver::new(flow, store, local_email.as_deref());
        for step in &flow.steps {
            timers.observe(&step.id, &resolver.effective_status(step), None, now);
        }
    }
}

/// Everything cached for one single-operator run.
#[derive(Debug, Default)]
struct RunProgress {
    tracker: ProgressTracker,
    status: Option<CanonicalStatus>,
    concurrency: Option<u32>,
    last_command: Option<String>,
    relevant: Vec<String>,
    timer: StepTimers,
    saved: Option<RunCheckpoint>,
}

/// One participant's view of a step.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ParticipantView {
    pub email: String,
    pub status: Option<CanonicalStatus>,
    pub done: bool,
    pub output_dir: Option<String>,
}

/// A step as shown to the user.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StepView {
    pub id: String,
    pub name: String,
    pub status: CanonicalStatus,
    pub is_barrier: bool,
    pub complete: bool,
    pub actionable: bool,
    pub elapsed: Option<String>,
    pub blockers: Vec<String>,
    pub participants: Vec<ParticipantView>,
    pub log_excerpt: Option<String>,
}

/// Throughput and health of one peer.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PeerView {
    pub peer_email: String,
    pub tx_rate: f64,
    pub rx_rate: f64,
    pub tx_label: String,
    pub rx_label: String,
    pub latency: String,
    pub freshness: Freshness,
}

/// Transport state of one step.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TransportView {
    pub step_id: String,
    pub channels: Vec<String>,
    pub peers: Vec<PeerView>,
}

/// A multi-party session as shown to the user.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SessionView {
    pub session_id: String,
    pub flow_name: String,
    pub steps: Vec<StepView>,
    pub progress: ProgressSample,
    pub percent: String,
    pub elapsed: Option<String>,
    pub next_action: Option<String>,
    pub blockers: Vec<String>,
    pub blockers_label: Option<String>,
    pub outcome: RunOutcome,
    pub all_my_work_done: bool,
    pub transport: Vec<TransportView>,
}

/// A single-operator run as shown to the user.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RunView {
    pub run_id: String,
    pub status: Option<CanonicalStatus>,
    pub progress: Option<ProgressSample>,
    pub percent: String,
    pub eta: String,
    pub elapsed: Option<String>,
    pub concurrency: Option<u32>,
    pub last_command: Option<String>,
    pub relevant_lines: Vec<String>,
    pub freshness: Freshness,
}

/// Owner of all reconciliation state.
///
/// # Example
///
/// ```
/// use chrono::Utc;
/// use flowtrack::reconcile::ReconciliationEngine;
///
/// let mut engine = ReconciliationEngine::default();
/// let log = "[ab/12cd34] process > ALIGN [100%] 4 of 4\n";
/// engine.apply_run_log("run-1", log, Some("success"), Utc::now());
///
/// let view = engine.run_view("run-1", Utc::now()).unwrap();
/// assert_eq!(view.eta, "~ done");
/// ```
#[derive(Debug, Default)]
pub struct ReconciliationEngine {
    config: EngineConfig,
    sessions: HashMap<String, SessionState>,
    runs: HashMap<String, RunProgress>,
    fingerprints: HashMap<String, u64>,
}

impl ReconciliationEngine {
    pub fn new(config: EngineConfig) -> Self {
        Self {
            config,
            ..Self::default()
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    // ----- sessions -----

    /// Starts tracking a session. Reopening an existing session only
    /// updates the local identity.
    pub fn open_session(&mut self, session_id: &str, local_email: Option<&str>) {
        let local_email = local_email
            .map(str::to_string)
            .or_else(|| self.config.local_email.clone());

        match self.sessions.get_mut(session_id) {
            Some(state) => state.local_email = local_email,
            None => {
                info!("Tracking session {}", session_id);
                self.sessions
                    .insert(session_id.to_string(), SessionState::new(local_email));
            }
        }
    }

    fn session_mut(&mut self, session_id: &str) -> &mut SessionState {
        let default_email = self.config.local_email.clone();
        self.sessions
            .entry(session_id.to_string())
            .or_insert_with(|| SessionState::new(default_email))
    }

    /// True when the session is tracked.
    pub fn has_session(&self, session_id: &str) -> bool {
        self.sessions.contains_key(session_id)
    }

    /// Replaces the session's step definitions with a fresh snapshot.
    ///
    /// The snapshot's step statuses are the local participant's latest
    /// execution state and overwrite the previous ones.
    pub fn update_flow(&mut self, session_id: &str, mut flow: Flow, now: DateTime<Utc>) {
        let state = self.session_mut(session_id);

        if let Some(local) = state.local_email.as_deref() {
            mark_local_steps(&mut flow, local);
        }
        flow.refresh_dependents();

        state.flow = flow;
        state.refresh_timers(now);
    }

    /// Merges per-participant progress snapshots.
    pub fn apply_progress(
        &mut self,
        session_id: &str,
        snapshots: &[ParticipantProgress],
        now: DateTime<Utc>,
    ) {
        let state = self.session_mut(session_id);

        for snapshot in snapshots {
            for entry in &snapshot.steps {
                let mut record =
                    ParticipantStepRecord::new(&entry.step_id, &snapshot.email, entry.status.clone());
                record.output_dir = entry.output_dir.clone();
                record.reported_at = entry.timestamp;
                state.store.merge(record);
            }
        }

        state.refresh_timers(now);
    }

    /// Ingests activity-log entries, ignoring ones already seen.
    ///
    /// Step events become participant records; the local participant's
    /// events also backfill step timers with their timestamps. Returns the
    /// number of new entries.
    pub fn apply_activity(
        &mut self,
        session_id: &str,
        entries: &[ActivityLogEntry],
        now: DateTime<Utc>,
    ) -> usize {
        let state = self.session_mut(session_id);
        let mut added = 0;

        for entry in entries {
            if !state.seen.insert(entry.dedup_key()) {
                continue;
            }
            added += 1;
            state.activity.push(entry.clone());

            let (Some(step_id), Some(status)) = (entry.step(), entry.event.implied_status())
            else {
                continue;
            };

            let mut record = ParticipantStepRecord::new(step_id, &entry.participant, status.clone());
            record.reported_at = entry.timestamp;
            state.store.merge(record);

            if state.is_local(&entry.participant) {
                state.timers.observe(step_id, &status, entry.timestamp, now);
            }
        }

        if added > 0 {
            debug!("Session {}: {} new activity entries", session_id, added);
            state
                .activity
                .sort_by(|a, b| b.timestamp.cmp(&a.timestamp));
        }

        state.refresh_timers(now);
        added
    }

    /// Activity-log entries of a session, newest first.
    pub fn activity(&self, session_id: &str) -> &[ActivityLogEntry] {
        self.sessions
            .get(session_id)
            .map(|state| state.activity.as_slice())
            .unwrap_or_default()
    }

    /// Records a transport poll for a step and returns the per-peer rates.
    pub fn apply_transport(
        &mut self,
        session_id: &str,
        step_id: &str,
        snapshot: TransportSnapshot,
    ) -> HashMap<String, PeerRate> {
        let state = self.session_mut(session_id);
        let rates = state.rates.rate(step_id, &snapshot.peers);

        let peers = snapshot
            .peers
            .iter()
            .map(|sample| PeerTelemetry {
                peer_email: sample.peer_email.clone(),
                rate: rates.get(&sample.peer_email).copied().unwrap_or_default(),
                avg_send_ms: sample.avg_send_ms,
                updated_at: sample.updated_at.or(Some(sample.observed_at)),
            })
            .collect();

        state.transport.insert(
            step_id.to_string(),
            StepTransport {
                channels: snapshot.channels,
                peers,
            },
        );

        rates
    }

    /// Forgets everything about a session, frozen timers included.
    pub fn reset_session(&mut self, session_id: &str) {
        if self.sessions.remove(session_id).is_some() {
            info!("Reset session {}", session_id);
        }
        self.fingerprints.remove(&session_key(session_id));
    }

    /// True when the local participant shared the last output-sharing step,
    /// according to the activity log.
    pub fn final_share_observed(&self, session_id: &str) -> bool {
        let Some(state) = self.sessions.get(session_id) else {
            return false;
        };
        let Some(final_step) = state.flow.steps.iter().rev().find(|s| s.shares_output) else {
            return false;
        };

        state.activity.iter().any(|entry| {
            entry.event == ActivityEvent::StepShared
                && entry.step() == Some(final_step.id.as_str())
                && state.is_local(&entry.participant)
        })
    }

    /// True when every local step is complete.
    pub fn my_steps_complete(&self, session_id: &str) -> bool {
        self.sessions.get(session_id).is_some_and(|state| {
            Resolver::new(&state.flow, &state.store, state.local_email.as_deref())
                .my_steps_complete()
        })
    }

    /// Either completion signal holds.
    pub fn all_my_work_done(&self, session_id: &str) -> bool {
        self.my_steps_complete(session_id) || self.final_share_observed(session_id)
    }

    /// Effective status of one step.
    pub fn effective_status(&self, session_id: &str, step_id: &str) -> Option<CanonicalStatus> {
        let state = self.sessions.get(session_id)?;
        let step = state.flow.get_step(step_id)?;
        Some(
            Resolver::new(&state.flow, &state.store, state.local_email.as_deref())
                .effective_status(step),
        )
    }

    /// Replaces the session's log tail, the source of per-step excerpts.
    pub fn apply_session_log(&mut self, session_id: &str, log_text: &str) {
        self.session_mut(session_id).log = strip_escape_sequences(log_text);
    }

    /// Steps whose effective status is `Running` or `Sharing`, the ones
    /// worth polling transport for.
    pub fn active_steps(&self, session_id: &str) -> Vec<String> {
        let Some(state) = self.sessions.get(session_id) else {
            return Vec::new();
        };
        let resolver = Resolver::new(&state.flow, &state.store, state.local_email.as_deref());
        state
            .flow
            .steps
            .iter()
            .filter(|step| {
                matches!(
                    resolver.effective_status(step),
                    CanonicalStatus::Running | CanonicalStatus::Sharing
                )
            })
            .map(|step| step.id.clone())
            .collect()
    }

    /// Builds the presentable state of a session.
    pub fn session_view(&self, session_id: &str, now: DateTime<Utc>) -> Option<SessionView> {
        let state = self.sessions.get(session_id)?;
        let resolver = Resolver::new(&state.flow, &state.store, state.local_email.as_deref());

        let steps = state
            .flow
            .steps
            .iter()
            .map(|step| {
                let participants = step
                    .target_emails
                    .iter()
                    .map(|email| ParticipantView {
                        email: email.clone(),
                        status: resolver.participant_status(step, email),
                        done: resolver.is_done(step, email),
                        output_dir: resolver.output_dir(step, email).map(str::to_string),
                    })
                    .collect();

                let status = resolver.effective_status(step);
                let log_excerpt = if state.log.is_empty() || !shows_log(&status) {
                    None
                } else {
                    Some(select_step_log_lines(&state.log, &step.id, STEP_LOG_LINES))
                        .filter(|excerpt| !excerpt.is_empty())
                };

                StepView {
                    id: step.id.clone(),
                    name: step.name.clone(),
                    status,
                    is_barrier: step.is_barrier,
                    complete: resolver.is_complete(step),
                    actionable: resolver.is_actionable(step),
                    elapsed: state.timers.elapsed(&step.id, now).map(format_elapsed),
                    blockers: resolver.blockers(step),
                    participants,
                    log_excerpt,
                }
            })
            .collect();

        let progress = resolver.completion();
        let blockers = resolver.run_blockers();
        let stale_after = self.config.stale_after();

        let transport = state
            .transport
            .iter()
            .map(|(step_id, transport)| TransportView {
                step_id: step_id.clone(),
                channels: transport.channels.iter().map(|c| c.summary()).collect(),
                peers: transport
                    .peers
                    .iter()
                    .map(|peer| PeerView {
                        peer_email: peer.peer_email.clone(),
                        tx_rate: peer.rate.tx_rate,
                        rx_rate: peer.rate.rx_rate,
                        tx_label: format_rate(peer.rate.tx_rate),
                        rx_label: format_rate(peer.rate.rx_rate),
                        latency: format_latency(peer.avg_send_ms),
                        freshness: Freshness::from_age(peer.updated_at, now, stale_after),
                    })
                    .collect(),
            })
            .collect();

        Some(SessionView {
            session_id: session_id.to_string(),
            flow_name: state.flow.name.clone(),
            steps,
            progress,
            percent: format_percent(Some(progress)),
            elapsed: state.timers.run_elapsed(now).map(format_elapsed),
            next_action: resolver.next_action().map(|step| step.id.clone()),
            blockers_label: blockers_label(&blockers),
            blockers,
            outcome: resolver.run_outcome(),
            all_my_work_done: resolver.my_steps_complete() || self.final_share_observed(session_id),
            transport,
        })
    }

    // ----- single-operator runs -----

    /// True when the run is tracked.
    pub fn has_run(&self, run_id: &str) -> bool {
        self.runs.contains_key(run_id)
    }

    /// Feeds a run's log tail and optional status string.
    ///
    /// Returns the progress sample to display after clamping.
    pub fn apply_run_log(
        &mut self,
        run_id: &str,
        log_text: &str,
        run_status: Option<&str>,
        now: DateTime<Utc>,
    ) -> Option<ProgressSample> {
        let clean = strip_escape_sequences(log_text);
        let run = self.runs.entry(run_id.to_string()).or_default();

        let status = run_status.map(normalize);
        let terminal_success = status
            .as_ref()
            .is_some_and(|status| status.satisfies_done(false));

        let sample = run
            .tracker
            .observe(extract_progress(&clean), terminal_success, now);

        if let Some(concurrency) = extract_concurrency(&clean) {
            run.concurrency = Some(concurrency);
        }
        if let Some(command) = extract_last_command(&clean) {
            run.last_command = Some(command);
        }

        let mut lines = relevant_lines(&clean);
        if !lines.is_empty() {
            let keep_from = lines.len().saturating_sub(RELEVANT_LINES_KEPT);
            run.relevant = lines.split_off(keep_from);
        }

        let timer_status = match (&status, sample) {
            (Some(status), _) => Some(status.clone()),
            (None, Some(_)) => Some(CanonicalStatus::Running),
            (None, None) => None,
        };
        if let Some(timer_status) = timer_status {
            run.timer.observe(run_id, &timer_status, None, now);
        }
        if status.is_some() {
            run.status = status;
        }

        sample
    }

    /// Seeds a run from a persisted checkpoint, through the usual clamp.
    pub fn restore_checkpoint(
        &mut self,
        run_id: &str,
        checkpoint: &RunCheckpoint,
        now: DateTime<Utc>,
    ) {
        let run = self.runs.entry(run_id.to_string()).or_default();

        if checkpoint.has_progress() {
            run.tracker.restore(
                ProgressSample::new(checkpoint.completed, checkpoint.total),
                now,
            );
        }
        if run.concurrency.is_none() {
            run.concurrency = checkpoint.concurrency;
        }
        if run.last_command.is_none() {
            run.last_command = checkpoint.last_command.clone();
        }
        if let Some(raw) = checkpoint.status.as_deref() {
            let status = normalize(raw);
            if status.satisfies_done(false) {
                run.tracker.observe(None, true, now);
            }
            run.status.get_or_insert(status);
        }
        run.saved = Some(checkpoint.clone());

        debug!(
            "Restored run {} at {}/{}",
            run_id, checkpoint.completed, checkpoint.total
        );
    }

    /// Current checkpoint of a run, if it has any progress.
    pub fn run_checkpoint(&self, run_id: &str, now: DateTime<Utc>) -> Option<RunCheckpoint> {
        let run = self.runs.get(run_id)?;
        let sample = run.tracker.sample()?;
        Some(RunCheckpoint {
            completed: sample.completed,
            total: sample.total,
            concurrency: run.concurrency,
            last_command: run.last_command.clone(),
            last_updated: run.tracker.last_update().or(Some(now)),
            status: run.status.as_ref().map(|s| s.as_str().to_string()),
        })
    }

    /// Checkpoint to persist, or `None` when nothing changed since the last
    /// one handed out.
    pub fn take_checkpoint(&mut self, run_id: &str, now: DateTime<Utc>) -> Option<RunCheckpoint> {
        let checkpoint = self.run_checkpoint(run_id, now)?;
        let run = self.runs.get_mut(run_id)?;
        if run
            .saved
            .as_ref()
            .is_some_and(|saved| !checkpoint.differs_from(saved))
        {
            return None;
        }
        run.saved = Some(checkpoint.clone());
        Some(checkpoint)
    }

    /// Builds the presentable state of a run.
    pub fn run_view(&self, run_id: &str, now: DateTime<Utc>) -> Option<RunView> {
        let run = self.runs.get(run_id)?;
        let progress = run.tracker.sample();

        Some(RunView {
            run_id: run_id.to_string(),
            status: run.status.clone(),
            progress,
            percent: format_percent(progress),
            eta: format_eta(run.tracker.eta(), self.config.eta_cap()),
            elapsed: run.timer.elapsed(run_id, now).map(format_elapsed),
            concurrency: run.concurrency,
            last_command: run.last_command.clone(),
            relevant_lines: run.relevant.clone(),
            freshness: Freshness::from_age(
                run.tracker.last_update(),
                now,
                self.config.stale_after(),
            ),
        })
    }

    /// Forgets everything about a run.
    pub fn forget_run(&mut self, run_id: &str) {
        if self.runs.remove(run_id).is_some() {
            info!("Forgot run {}", run_id);
        }
        self.fingerprints.remove(&run_key(run_id));
    }

    // ----- render fingerprints -----

    /// Records the fingerprint of a session view and reports whether it
    /// differs from the last one recorded.
    pub fn session_view_changed(&mut self, view: &SessionView) -> bool {
        self.record_fingerprint(session_key(&view.session_id), view)
    }

    /// Records the fingerprint of a run view and reports whether it differs
    /// from the last one recorded.
    pub fn run_view_changed(&mut self, view: &RunView) -> bool {
        self.record_fingerprint(run_key(&view.run_id), view)
    }

    fn record_fingerprint<T: Serialize>(&mut self, key: String, view: &T) -> bool {
        let fingerprint = fingerprint(view);
        self.fingerprints.insert(key, fingerprint) != Some(fingerprint)
    }
}

fn shows_log(status: &CanonicalStatus) -> bool {
    matches!(
        status,
        CanonicalStatus::Running | CanonicalStatus::Sharing | CanonicalStatus::Failed
    )
}

fn session_key(session_id: &str) -> String {
    format!("session:{}", session_id)
}

fn run_key(run_id: &str) -> String {
    format!("run:{}", run_id)
}

fn fingerprint<T: Serialize>(view: &T) -> u64 {
    let encoded = serde_json::to_vec(view).unwrap_or_default();
    let mut hasher = DefaultHasher::new();
    encoded.hash(&mut hasher);
    hasher.finish()
}
