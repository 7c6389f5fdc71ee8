//! Log Progress Extraction
//!
//! Single-operator runs have no peer reports, only an execution log tail.
//! This module recovers a `completed/total` counter from that free-form text,
//! clamps it so a truncated or rotated log never makes progress go
//! backwards, and extrapolates an ETA.
//!
//! # Extraction Priority
//!
//! 1. The last `"<n> of <m>"` line in the log (explicit progress report)
//! 2. Submission markers vs. completion/cache markers
//! 3. Nothing: no inference is possible

use std::time::Duration;

use chrono::{DateTime, Utc};
use log::debug;
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};

static ESCAPE_SEQUENCE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"\x1b\[[0-?]*[ -/]*[@-~]|\x1b\][^\x07\x1b]*(?:\x07|\x1b\\)|\x1b[@-Z\\-_]|\r")
        .expect("escape sequence pattern is valid")
});

static PROGRESS_COUNT: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"\b(\d+)\s+of\s+(\d+)\b")
        .expect("progress count pattern is valid")
});

static MAX_FORKS: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)max\s*forks\s*[:=]\s*(\d+)")
        .expect("concurrency pattern is valid")
});

/// Marks a task being handed to an executor.
const SUBMISSION_MARKERS: &[&str] = &["Submitted process"];

/// Marks a task finishing or being served from cache.
const COMPLETION_MARKERS: &[&str] = &["Completed process", "Cached process", "Task completed"];

/// Substrings of lines worth showing in the condensed execution view.
const RELEVANT_MARKERS: &[&str] = &[
    "Submitted process",
    "Cached process",
    "Completed process",
    "executor >",
    "process >",
];

/// A `completed/total` counter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProgressSample {
    pub completed: u32,
    pub total: u32,
}

impl ProgressSample {
    pub fn new(completed: u32, total: u32) -> Self {
        Self { completed, total }
    }

    /// Percentage complete, 0 when the total is unknown.
    pub fn percent(&self) -> f64 {
        if self.total == 0 {
            return 0.0;
        }
        (self.completed.min(self.total) as f64 / self.total as f64) * 100.0
    }
}

/// Removes terminal control and formatting escape sequences.
pub fn strip_escape_sequences(text: &str) -> String {
    ESCAPE_SEQUENCE.replace_all(text, "").into_owned()
}

/// Extracts a progress counter from raw log text.
///
/// # Example
///
/// ```
/// use flowtrack::monitoring::progress::{extract_progress, ProgressSample};
///
/// let log = "executor > local (3)\n[ab/12cd34] process > ALIGN [ 70%] 7 of 10\n";
/// assert_eq!(extract_progress(log), Some(ProgressSample::new(7, 10)));
/// ```
pub fn extract_progress(log_text: &str) -> Option<ProgressSample> {
    let clean = strip_escape_sequences(log_text);

    for line in clean.lines().rev() {
        if let Some(sample) = parse_count(line) {
            return Some(sample);
        }
    }

    let mut submitted: u32 = 0;
    let mut completed: u32 = 0;
    for line in clean.lines() {
        if SUBMISSION_MARKERS.iter().any(|m| line.contains(m)) {
            submitted += 1;
        }
        if COMPLETION_MARKERS.iter().any(|m| line.contains(m)) {
            completed += 1;
        }
    }

    if submitted == 0 {
        return None;
    }

    debug!(
        "Inferred progress from markers: {} submitted, {} completed",
        submitted, completed
    );
    Some(ProgressSample::new(completed.min(submitted), submitted))
}

fn parse_count(line: &str) -> Option<ProgressSample> {
    let caps = PROGRESS_COUNT.captures(line)?;
    let completed: u32 = caps.get(1)?.as_str().parse().ok()?;
    let total: u32 = caps.get(2)?.as_str().parse().ok()?;
    if total == 0 {
        return None;
    }
    Some(ProgressSample::new(completed.min(total), total))
}

/// Keeps only the lines that describe task execution.
pub fn relevant_lines(log_text: &str) -> Vec<String> {
    strip_escape_sequences(log_text)
        .lines()
        .filter(|line| {
            RELEVANT_MARKERS.iter().any(|m| line.contains(m)) || PROGRESS_COUNT.is_match(line)
        })
        .map(|line| line.trim_end().to_string())
        .collect()
}

/// Last concurrency hint (`maxForks: N`) in the log.
pub fn extract_concurrency(log_text: &str) -> Option<u32> {
    MAX_FORKS
        .captures_iter(log_text)
        .last()
        .and_then(|caps| caps.get(1))
        .and_then(|m| m.as_str().parse().ok())
}

/// Last external command line (`Command: ...` or `$ ...`) in the log.
pub fn extract_last_command(log_text: &str) -> Option<String> {
    strip_escape_sequences(log_text)
        .lines()
        .rev()
        .find_map(|line| {
            let trimmed = line.trim();
            trimmed
                .strip_prefix("Command:")
                .or_else(|| trimmed.strip_prefix("$ "))
                .map(|cmd| cmd.trim().to_string())
        })
        .filter(|cmd| !cmd.is_empty())
}

/// Picks the last `lines` lines mentioning a step out of a tail window of
/// `4 * lines`, falling back to the plain tail when none mention it.
pub fn select_step_log_lines(log_text: &str, step_id: &str, lines: usize) -> String {
    let all_lines: Vec<&str> = log_text.lines().collect();
    if all_lines.is_empty() {
        return String::new();
    }

    let window = lines.saturating_mul(4);
    let tail = &all_lines[all_lines.len().saturating_sub(window)..];

    let step_lc = step_id.to_ascii_lowercase();
    let needles = [
        format!("step {}", step_lc),
        format!("step '{}'", step_lc),
        format!("step \"{}\"", step_lc),
        format!("{}@", step_lc),
        format!("\"step\":\"{}\"", step_lc),
    ];

    let filtered: Vec<&str> = tail
        .iter()
        .filter(|line| {
            let lc = line.to_ascii_lowercase();
            needles.iter().any(|n| lc.contains(n.as_str()))
        })
        .copied()
        .collect();

    let source: &[&str] = if filtered.is_empty() { tail } else { &filtered };
    source[source.len().saturating_sub(lines)..].join("\n")
}

/// Estimated time remaining.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Eta {
    /// Fewer than one unit observed completing
    Unknown,
    /// The run finished successfully
    Done,
    /// Linear extrapolation of the remaining work
    Remaining(Duration),
}

/// Per-run progress memory with monotonic clamping and ETA tracking.
#[derive(Debug, Clone, Default)]
pub struct ProgressTracker {
    sample: Option<ProgressSample>,
    finished: bool,
    /// When tracking began and the completed count at that moment
    baseline: Option<(DateTime<Utc>, u32)>,
    /// When the current completed count was first observed
    count_since: Option<DateTime<Utc>>,
    last_update: Option<DateTime<Utc>>,
}

impl ProgressTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feeds a freshly extracted sample and returns the sample to display.
    ///
    /// A sample whose total is below the cached total is rejected. The
    /// completed count never drops. On terminal success the completed count
    /// is forced to the total.
    pub fn observe(
        &mut self,
        incoming: Option<ProgressSample>,
        terminal_success: bool,
        now: DateTime<Utc>,
    ) -> Option<ProgressSample> {
        let previous = self.sample;

        let mut next = match (previous, incoming) {
            (None, incoming) => incoming,
            (Some(cached), None) => Some(cached),
            (Some(cached), Some(new)) if new.total < cached.total => {
                debug!(
                    "Rejecting shrinking progress {}/{} (holding {}/{})",
                    new.completed, new.total, cached.completed, cached.total
                );
                Some(cached)
            }
            (Some(cached), Some(new)) => Some(ProgressSample::new(
                new.completed.max(cached.completed).min(new.total),
                new.total,
            )),
        };

        if terminal_success {
            self.finished = true;
            if let Some(sample) = next.as_mut() {
                sample.completed = sample.total;
            }
        }

        if let Some(sample) = next {
            if self.baseline.is_none() {
                self.baseline = Some((now, sample.completed));
                self.count_since = Some(now);
            } else if previous.map(|p| p.completed) != Some(sample.completed) {
                self.count_since = Some(now);
            }
            self.last_update = Some(now);
        }

        self.sample = next;
        next
    }

    /// Seeds the tracker from a persisted checkpoint, through the same clamp.
    pub fn restore(&mut self, sample: ProgressSample, now: DateTime<Utc>) {
        if sample.total == 0 {
            return;
        }
        self.observe(Some(sample), false, now);
    }

    /// The sample currently displayed.
    pub fn sample(&self) -> Option<ProgressSample> {
        self.sample
    }

    /// When the displayed sample was last refreshed.
    pub fn last_update(&self) -> Option<DateTime<Utc>> {
        self.last_update
    }

    /// Linear ETA: average time per observed unit times the units left.
    pub fn eta(&self) -> Eta {
        if self.finished {
            return Eta::Done;
        }
        let (Some(sample), Some((started, base)), Some(since)) =
            (self.sample, self.baseline, self.count_since)
        else {
            return Eta::Unknown;
        };

        let units_done = sample.completed.saturating_sub(base);
        if units_done == 0 {
            return Eta::Unknown;
        }

        let elapsed = (since - started).to_std().unwrap_or(Duration::ZERO);
        let per_unit = elapsed / units_done;
        let remaining_units = sample.total.saturating_sub(sample.completed);
        per_unit
            .checked_mul(remaining_units)
            .map_or(Eta::Unknown, Eta::Remaining)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration as ChronoDuration, TimeZone};

    fn at(secs: i64) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 3, 1, 12, 0, 0).unwrap() + ChronoDuration::seconds(secs)
    }

    #[test]
    fn test_explicit_count_wins_over_markers() {
        let log = "\
[a1/000001] Submitted process > QC (1)
[a1/000002] Submitted process > QC (2)
[a1/000003] Submitted process > QC (3)
Completed process > QC (1)
Completed process > QC (2)
[a1/000003] process > QC [ 70%] 7 of 10
";
        assert_eq!(extract_progress(log), Some(ProgressSample::new(7, 10)));
    }

    #[test]
    fn test_last_count_line_used() {
        let log = "process > A [ 20%] 1 of 5\nsomething else\nprocess > A [ 60%] 3 of 5\n";
        assert_eq!(extract_progress(log), Some(ProgressSample::new(3, 5)));
    }

    #[test]
    fn test_marker_fallback() {
        let log = "\
Submitted process > A (1)
Submitted process > A (2)
Submitted process > A (3)
Cached process > A (1)
Completed process > A (2)
";
        assert_eq!(extract_progress(log), Some(ProgressSample::new(2, 3)));
    }

    #[test]
    fn test_marker_fallback_clamps_completed() {
        let log = "Submitted process > A (1)\nCached process > B\nCompleted process > A (1)\n";
        assert_eq!(extract_progress(log), Some(ProgressSample::new(1, 1)));
    }

    #[test]
    fn test_no_markers_no_progress() {
        assert_eq!(extract_progress("N E X T F L O W\nLaunching main.nf\n"), None);
        assert_eq!(extract_progress(""), None);
    }

    #[test]
    fn test_escape_sequences_stripped() {
        let log = "\x1b[2K\x1b[1A\x1b[32mprocess > A [100%] 4 of 4 \x1b[0m\r\n";
        assert_eq!(strip_escape_sequences("\x1b[1mbold\x1b[0m"), "bold");
        assert_eq!(extract_progress(log), Some(ProgressSample::new(4, 4)));
    }

    #[test]
    fn test_relevant_lines() {
        let log = "N E X T F L O W\nexecutor >  local (2)\nplain noise\n\x1b[32mSubmitted process > A\x1b[0m\nprocess > A [ 50%] 1 of 2\n";
        let lines = relevant_lines(log);
        assert_eq!(
            lines,
            vec![
                "executor >  local (2)",
                "Submitted process > A",
                "process > A [ 50%] 1 of 2"
            ]
        );
    }

    #[test]
    fn test_concurrency_and_command() {
        let log = "Nextflow maxForks: 2\n$ nextflow run old.nf\nCommand: nextflow run main.nf -resume\nmaxForks: 4\n";
        assert_eq!(extract_concurrency(log), Some(4));
        assert_eq!(
            extract_last_command(log).as_deref(),
            Some("nextflow run main.nf -resume")
        );
        assert_eq!(extract_concurrency("nothing"), None);
        assert_eq!(extract_last_command("nothing"), None);
    }

    #[test]
    fn test_select_step_log_lines() {
        let log = "boot\nrunning step align now\nnoise\nstep 'ALIGN' done\nother\n";
        assert_eq!(
            select_step_log_lines(log, "align", 5),
            "running step align now\nstep 'ALIGN' done"
        );
        assert_eq!(select_step_log_lines(log, "absent", 2), "step 'ALIGN' done\nother");
        assert_eq!(select_step_log_lines("", "x", 3), "");
    }

    #[test]
    fn test_clamp_sequence() {
        let mut tracker = ProgressTracker::new();
        let inputs = [(2, 10), (1, 10), (3, 12), (2, 12)];
        let expected = [(2, 10), (2, 10), (3, 12), (3, 12)];

        for (i, ((c, t), (ec, et))) in inputs.iter().zip(expected.iter()).enumerate() {
            let shown = tracker.observe(Some(ProgressSample::new(*c, *t)), false, at(i as i64));
            assert_eq!(shown, Some(ProgressSample::new(*ec, *et)), "step {}", i);
        }
    }

    #[test]
    fn test_shrinking_total_rejected() {
        let mut tracker = ProgressTracker::new();
        tracker.observe(Some(ProgressSample::new(5, 20)), false, at(0));
        let shown = tracker.observe(Some(ProgressSample::new(6, 8)), false, at(1));
        assert_eq!(shown, Some(ProgressSample::new(5, 20)));
    }

    #[test]
    fn test_missing_sample_keeps_cached() {
        let mut tracker = ProgressTracker::new();
        tracker.observe(Some(ProgressSample::new(1, 3)), false, at(0));
        assert_eq!(
            tracker.observe(None, false, at(1)),
            Some(ProgressSample::new(1, 3))
        );
        assert_eq!(ProgressTracker::new().observe(None, false, at(0)), None);
    }

    #[test]
    fn test_terminal_success_forces_total() {
        let mut tracker = ProgressTracker::new();
        tracker.observe(Some(ProgressSample::new(3, 4)), false, at(0));
        let shown = tracker.observe(Some(ProgressSample::new(3, 4)), true, at(5));

        assert_eq!(shown, Some(ProgressSample::new(4, 4)));
        assert_eq!(tracker.eta(), Eta::Done);
    }

    #[test]
    fn test_eta_unknown_before_first_unit() {
        let mut tracker = ProgressTracker::new();
        tracker.observe(Some(ProgressSample::new(0, 10)), false, at(0));
        tracker.observe(Some(ProgressSample::new(0, 10)), false, at(60));
        assert_eq!(tracker.eta(), Eta::Unknown);
    }

    #[test]
    fn test_eta_linear_extrapolation() {
        let mut tracker = ProgressTracker::new();
        tracker.observe(Some(ProgressSample::new(0, 10)), false, at(0));
        tracker.observe(Some(ProgressSample::new(2, 10)), false, at(40));
        tracker.observe(Some(ProgressSample::new(2, 10)), false, at(55));

        // 40s for 2 units: 20s per unit, 8 units left
        assert_eq!(tracker.eta(), Eta::Remaining(Duration::from_secs(160)));
        assert_eq!(tracker.last_update(), Some(at(55)));
    }

    #[test]
    fn test_eta_unknown_when_estimate_overflows() {
        let mut tracker = ProgressTracker::new();
        tracker.observe(Some(ProgressSample::new(0, u32::MAX)), false, at(0));
        tracker.observe(Some(ProgressSample::new(1, u32::MAX)), false, at(10_000_000_000));
        assert_eq!(tracker.eta(), Eta::Unknown);
    }

    #[test]
    fn test_restore_uses_clamp_and_baseline() {
        let mut tracker = ProgressTracker::new();
        tracker.restore(ProgressSample::new(4, 10), at(0));
        tracker.restore(ProgressSample::new(0, 0), at(1));
        assert_eq!(tracker.sample(), Some(ProgressSample::new(4, 10)));
        assert_eq!(tracker.eta(), Eta::Unknown);

        tracker.observe(Some(ProgressSample::new(6, 10)), false, at(30));
        assert_eq!(tracker.eta(), Eta::Remaining(Duration::from_secs(60)));
    }

    #[test]
    fn test_percent() {
        assert_eq!(ProgressSample::new(1, 4).percent(), 25.0);
        assert_eq!(ProgressSample::new(0, 0).percent(), 0.0);
    }
}
