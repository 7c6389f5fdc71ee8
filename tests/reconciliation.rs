//! End-to-end reconciliation scenarios through the public API.

use chrono::{DateTime, Duration as ChronoDuration, TimeZone, Utc};

use flowtrack::flow::model::{
    ActivityEvent, ActivityLogEntry, ParticipantProgress, ParticipantStepRecord, ProgressEntry,
};
use flowtrack::flow::{parse_flow, Flow, Step};
use flowtrack::host::{DirHost, PollOutcome, Poller};
use flowtrack::monitoring::progress::{extract_progress, ProgressSample, ProgressTracker};
use flowtrack::monitoring::timeline::StepTimers;
use flowtrack::reconcile::{CanonicalStatus, MergeStore, ReconciliationEngine, Resolver};
use flowtrack::EngineConfig;

const A: &str = "alice@lab.org";
const B: &str = "bob@clinic.org";

fn at(secs: i64) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2025, 3, 1, 12, 0, 0).unwrap() + ChronoDuration::seconds(secs)
}

fn progress(email: &str, step: &str, status: &str) -> ParticipantProgress {
    ParticipantProgress {
        email: email.to_string(),
        steps: vec![ProgressEntry {
            step_id: step.to_string(),
            status: status.into(),
            output_dir: None,
            timestamp: None,
        }],
    }
}

#[test]
fn test_barrier_completion_is_and_over_roster() {
    let flow = Flow::from_steps(vec![Step::new("gate").with_targets(&[A, B]).barrier()]);
    let mut store = MergeStore::new();
    store.merge(ParticipantStepRecord::new("gate", A, CanonicalStatus::Completed));

    let resolver = Resolver::new(&flow, &store, Some(A));
    assert!(resolver.is_done(&flow.steps[0], A));
    assert!(!resolver.is_complete(&flow.steps[0]));

    store.merge(ParticipantStepRecord::new("gate", B, CanonicalStatus::Completed));
    let resolver = Resolver::new(&flow, &store, Some(A));
    assert!(resolver.is_complete(&flow.steps[0]));
}

#[test]
fn test_progress_clamp_sequence() {
    let mut tracker = ProgressTracker::new();
    let displayed: Vec<_> = [(2, 10), (1, 10), (3, 12), (2, 12)]
        .into_iter()
        .enumerate()
        .map(|(i, (completed, total))| {
            tracker
                .observe(Some(ProgressSample::new(completed, total)), false, at(i as i64))
                .unwrap()
        })
        .collect();

    assert_eq!(
        displayed,
        vec![
            ProgressSample::new(2, 10),
            ProgressSample::new(2, 10),
            ProgressSample::new(3, 12),
            ProgressSample::new(3, 12),
        ]
    );
}

#[test]
fn test_timer_freeze_idempotence() {
    let mut timers = StepTimers::new();
    timers.observe("s", &CanonicalStatus::Running, None, at(0));
    timers.observe("s", &CanonicalStatus::Completed, None, at(42));
    let frozen = timers.elapsed("s", at(50));

    timers.observe("s", &CanonicalStatus::Pending, None, at(60));
    timers.observe("s", &CanonicalStatus::Ready, None, at(70));

    assert_eq!(timers.elapsed("s", at(500)), frozen);
}

#[test]
fn test_extractor_prefers_explicit_count() {
    let log = "\
Submitted process > A (1)
Submitted process > A (2)
Submitted process > A (3)
Completed process > A (1)
Completed process > A (2)
process > A [ 70%] 7 of 10
";
    assert_eq!(extract_progress(log), Some(ProgressSample::new(7, 10)));
}

#[test]
fn test_single_party_success() {
    let mut engine = ReconciliationEngine::default();
    engine.apply_run_log("run-1", "process > ALIGN [100%] 4 of 4", Some("success"), at(0));

    let view = engine.run_view("run-1", at(1)).unwrap();
    assert_eq!(view.progress, Some(ProgressSample::new(4, 4)));
    assert_eq!(view.eta, "~ done");
    assert_eq!(view.percent, "100%");
}

#[test]
fn test_multi_party_lag_tolerance() {
    let flow = Flow::from_steps(vec![Step::new("compute")
        .with_targets(&[A, B])
        .sharing_output()]);

    let mut engine = ReconciliationEngine::default();
    engine.open_session("s1", Some(B));
    engine.update_flow("s1", flow, at(0));

    engine.apply_activity(
        "s1",
        &[ActivityLogEntry::new(A, Some("compute"), ActivityEvent::StepShared, at(5))],
        at(10),
    );
    engine.apply_progress("s1", &[progress(A, "compute", "pending")], at(20));

    let view = engine.session_view("s1", at(20)).unwrap();
    let alice = &view.steps[0].participants[0];
    assert_eq!(alice.email, A);
    assert_eq!(alice.status, Some(CanonicalStatus::Shared));
    assert!(alice.done);
}

#[test]
fn test_two_party_flow_end_to_end() {
    let yaml = "\
name: gwas-join
participants: [alice@lab.org, bob@clinic.org]
steps:
  - id: compute_counts
    targets: [alice@lab.org, bob@clinic.org]
    shares_output: true
  - id: wait_for_counts
    barrier: true
    depends_on: [compute_counts]
    targets: [alice@lab.org, bob@clinic.org]
  - id: aggregate
    depends_on: [wait_for_counts]
    targets: [alice@lab.org]
";
    let flow = parse_flow(yaml, None).unwrap();

    let mut engine = ReconciliationEngine::new(EngineConfig {
        local_email: Some(A.to_string()),
        ..EngineConfig::default()
    });
    engine.update_flow("s1", flow, at(0));

    let view = engine.session_view("s1", at(0)).unwrap();
    assert_eq!(view.next_action.as_deref(), Some("compute_counts"));

    engine.apply_activity(
        "s1",
        &[
            ActivityLogEntry::new(A, Some("compute_counts"), ActivityEvent::StepStarted, at(10)),
            ActivityLogEntry::new(A, Some("compute_counts"), ActivityEvent::StepShared, at(70)),
        ],
        at(80),
    );

    let view = engine.session_view("s1", at(80)).unwrap();
    assert_eq!(view.next_action, None);
    assert_eq!(view.blockers, vec![B.to_string()]);
    assert_eq!(view.blockers_label.as_deref(), Some("waiting on bob@clinic.org"));
    assert_eq!(view.steps[0].elapsed.as_deref(), Some("1m 00s"));

    engine.apply_progress("s1", &[progress(B, "compute_counts", "shared")], at(90));
    let view = engine.session_view("s1", at(90)).unwrap();
    assert_eq!(view.steps[0].status, CanonicalStatus::Shared);
    assert!(view.steps[1].complete);
    assert_eq!(view.next_action.as_deref(), Some("aggregate"));
    assert_eq!(view.percent, "67%");
}

#[tokio::test]
async fn test_directory_host_run() {
    let root = tempfile::tempdir().unwrap();
    let run_dir = root.path().join("run-7");
    std::fs::create_dir_all(&run_dir).unwrap();
    std::fs::write(
        run_dir.join("run.log"),
        "maxForks: 2\nSubmitted process > QC (1)\nSubmitted process > QC (2)\nCompleted process > QC (1)\n",
    )
    .unwrap();

    let poller = Poller::new(DirHost::new(root.path()), ReconciliationEngine::default());
    assert_eq!(poller.poll_run_once("run-7").await, PollOutcome::Applied);

    let view = poller.engine().run_view("run-7", Utc::now()).unwrap();
    assert_eq!(view.progress, Some(ProgressSample::new(1, 2)));
    assert_eq!(view.concurrency, Some(2));
    assert!(run_dir.join("checkpoint.json").exists());

    assert_eq!(poller.poll_run_once("missing").await, PollOutcome::Failed);
}
