//! Cooperative Poller
//!
//! Drives the [`ReconciliationEngine`] from a [`RunHost`] on one thread.
//! Every suspension point is a host query; the engine is only touched
//! between them, so no locking is involved.
//!
//! A session or run never has two polls in flight: the second one is
//! skipped. The guard is released on every exit path, failed polls
//! included. A failed poll leaves the previously cached state untouched.

use std::cell::{Ref, RefCell, RefMut};
use std::collections::HashSet;
use std::rc::Rc;

use chrono::Utc;
use log::{debug, warn};
use tokio::sync::watch;

use crate::reconcile::engine::{ReconciliationEngine, RunView, SessionView};

use super::{HostError, RunHost};

/// Result of a single poll.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollOutcome {
    /// Fresh data was merged into the engine
    Applied,
    /// A poll for the same key was already in flight
    Skipped,
    /// The host query failed; cached state was kept
    Failed,
}

/// Marks a key as in flight until dropped.
struct InFlightGuard {
    keys: Rc<RefCell<HashSet<String>>>,
    key: String,
}

impl InFlightGuard {
    fn acquire(keys: &Rc<RefCell<HashSet<String>>>, key: String) -> Option<Self> {
        if !keys.borrow_mut().insert(key.clone()) {
            return None;
        }
        Some(Self {
            keys: Rc::clone(keys),
            key,
        })
    }
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        self.keys.borrow_mut().remove(&self.key);
    }
}

/// Polls a host and feeds the results to an engine.
///
/// # Example
///
/// ```rust,no_run
/// use flowtrack::host::{DirHost, Poller};
/// use flowtrack::reconcile::ReconciliationEngine;
///
/// #[tokio::main(flavor = "current_thread")]
/// async fn main() {
///     let poller = Poller::new(DirHost::new("runs"), ReconciliationEngine::default());
///     poller.poll_run_once("run-1").await;
///     if let Some(view) = poller.engine().run_view("run-1", chrono::Utc::now()) {
///         println!("{} ({})", view.percent, view.eta);
///     };
/// }
/// ```
pub struct Poller<H: RunHost> {
    host: H,
    engine: RefCell<ReconciliationEngine>,
    in_flight: Rc<RefCell<HashSet<String>>>,
}

impl<H: RunHost> Poller<H> {
    pub fn new(host: H, engine: ReconciliationEngine) -> Self {
        Self {
            host,
            engine: RefCell::new(engine),
            in_flight: Rc::new(RefCell::new(HashSet::new())),
        }
    }

    pub fn host(&self) -> &H {
        &self.host
    }

    /// Read access to the engine. Must not be held across an `.await`.
    pub fn engine(&self) -> Ref<'_, ReconciliationEngine> {
        self.engine.borrow()
    }

    /// Write access to the engine. Must not be held across an `.await`.
    pub fn engine_mut(&self) -> RefMut<'_, ReconciliationEngine> {
        self.engine.borrow_mut()
    }

    /// True while a poll for the session is in flight.
    pub fn session_in_flight(&self, session_id: &str) -> bool {
        self.in_flight.borrow().contains(&session_key(session_id))
    }

    /// Polls a session once: flow, progress, activity, then transport for
    /// the steps currently moving data, then the log tail. Transport and log
    /// failures are logged without failing the poll.
    pub async fn poll_session_once(&self, session_id: &str) -> PollOutcome {
        let Some(_guard) = InFlightGuard::acquire(&self.in_flight, session_key(session_id)) else {
            debug!("Session {} poll already in flight, skipping", session_id);
            return PollOutcome::Skipped;
        };

        match self.fetch_and_apply_session(session_id).await {
            Ok(()) => PollOutcome::Applied,
            Err(err) => {
                warn!("Polling session {} failed: {}", session_id, err);
                PollOutcome::Failed
            }
        }
    }

    async fn fetch_and_apply_session(&self, session_id: &str) -> Result<(), HostError> {
        let flow = self.host.fetch_flow(session_id).await?;
        let progress = self.host.fetch_progress(session_id).await?;
        let activity = self.host.fetch_activity(session_id).await?;

        let active_steps = {
            let mut engine = self.engine.borrow_mut();
            let now = Utc::now();
            engine.update_flow(session_id, flow, now);
            engine.apply_activity(session_id, &activity, now);
            engine.apply_progress(session_id, &progress, now);
            engine.active_steps(session_id)
        };

        for step_id in active_steps {
            match self.host.fetch_transport(session_id, &step_id).await {
                Ok(snapshot) => {
                    self.engine
                        .borrow_mut()
                        .apply_transport(session_id, &step_id, snapshot);
                }
                Err(err) => warn!(
                    "Transport poll for {}/{} failed: {}",
                    session_id, step_id, err
                ),
            }
        }

        let lines = self.engine.borrow().config().log_tail_lines;
        match self.host.fetch_log_tail(session_id, lines).await {
            Ok(tail) => self
                .engine
                .borrow_mut()
                .apply_session_log(session_id, &tail.text),
            Err(HostError::NotFound(_)) => debug!("Session {} has no log", session_id),
            Err(err) => warn!("Log poll for {} failed: {}", session_id, err),
        }

        Ok(())
    }

    /// Polls a run once. The first poll of a run restores its checkpoint;
    /// changed progress is checkpointed afterwards.
    pub async fn poll_run_once(&self, run_id: &str) -> PollOutcome {
        let Some(_guard) = InFlightGuard::acquire(&self.in_flight, run_key(run_id)) else {
            debug!("Run {} poll already in flight, skipping", run_id);
            return PollOutcome::Skipped;
        };

        match self.fetch_and_apply_run(run_id).await {
            Ok(()) => PollOutcome::Applied,
            Err(err) => {
                warn!("Polling run {} failed: {}", run_id, err);
                PollOutcome::Failed
            }
        }
    }

    async fn fetch_and_apply_run(&self, run_id: &str) -> Result<(), HostError> {
        let known = self.engine.borrow().has_run(run_id);
        if !known {
            match self.host.load_checkpoint(run_id).await {
                Ok(Some(checkpoint)) => {
                    self.engine
                        .borrow_mut()
                        .restore_checkpoint(run_id, &checkpoint, Utc::now());
                }
                Ok(None) => {}
                Err(err) => warn!("Ignoring unreadable checkpoint for {}: {}", run_id, err),
            }
        }

        let lines = self.engine.borrow().config().log_tail_lines;
        let tail = self.host.fetch_log_tail(run_id, lines).await?;

        let checkpoint = {
            let mut engine = self.engine.borrow_mut();
            let now = Utc::now();
            engine.apply_run_log(run_id, &tail.text, tail.status.as_deref(), now);
            engine.take_checkpoint(run_id, now)
        };

        if let Some(checkpoint) = checkpoint {
            if let Err(err) = self.host.save_checkpoint(run_id, &checkpoint).await {
                warn!("Saving checkpoint for {} failed: {}", run_id, err);
            }
        }

        Ok(())
    }

    /// Polls a session until `stop` flips to true, calling `on_view` each
    /// time the session's view changes.
    pub async fn watch_session<F>(
        &self,
        session_id: &str,
        mut stop: watch::Receiver<bool>,
        mut on_view: F,
    ) where
        F: FnMut(&SessionView),
    {
        let interval = self.engine.borrow().config().poll_interval();

        while !*stop.borrow() {
            self.poll_session_once(session_id).await;

            let view = self.engine.borrow().session_view(session_id, Utc::now());
            if let Some(view) = view {
                if self.engine.borrow_mut().session_view_changed(&view) {
                    on_view(&view);
                }
            }

            tokio::select! {
                _ = tokio::time::sleep(interval) => {}
                changed = stop.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
            }
        }
        debug!("Stopped watching session {}", session_id);
    }

    /// Polls a run until `stop` flips to true, calling `on_view` each time
    /// the run's view changes.
    pub async fn watch_run<F>(&self, run_id: &str, mut stop: watch::Receiver<bool>, mut on_view: F)
    where
        F: FnMut(&RunView),
    {
        let interval = self.engine.borrow().config().poll_interval();

        while !*stop.borrow() {
            self.poll_run_once(run_id).await;

            let view = self.engine.borrow().run_view(run_id, Utc::now());
            if let Some(view) = view {
                if self.engine.borrow_mut().run_view_changed(&view) {
                    on_view(&view);
                }
            }

            tokio::select! {
                _ = tokio::time::sleep(interval) => {}
                changed = stop.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
            }
        }
        debug!("Stopped watching run {}", run_id);
    }
}

fn session_key(session_id: &str) -> String {
    format!("session:{}", session_id)
}

fn run_key(run_id: &str) -> String {
    format!("run:{}", run_id)
}
