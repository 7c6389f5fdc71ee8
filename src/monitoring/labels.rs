//! Presentation Labels
//!
//! Short strings handed to whatever renders the engine's state. Nothing here
//! reads engine state directly; callers pass in the values.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;

use super::progress::{Eta, ProgressSample};

/// Shown when a value cannot be estimated.
pub const NO_VALUE: &str = "—";

/// Formats a step or run duration.
///
/// - under a minute: `45s`
/// - under an hour: `3m 05s`
/// - otherwise: `1h 02m`
pub fn format_elapsed(duration: Duration) -> String {
    let total_seconds = duration.as_secs();
    let hours = total_seconds / 3600;
    let minutes = (total_seconds % 3600) / 60;
    let seconds = total_seconds % 60;

    if hours > 0 {
        format!("{}h {:02}m", hours, minutes)
    } else if minutes > 0 {
        format!("{}m {:02}s", minutes, seconds)
    } else {
        format!("{}s", seconds)
    }
}

/// Formats an ETA, capping the display at `cap`.
pub fn format_eta(eta: Eta, cap: Duration) -> String {
    match eta {
        Eta::Unknown => NO_VALUE.to_string(),
        Eta::Done => "~ done".to_string(),
        Eta::Remaining(remaining) if remaining > cap => {
            format!("> {}h", cap.as_secs() / 3600)
        }
        Eta::Remaining(remaining) => format!("~ {} left", format_elapsed(remaining)),
    }
}

/// Formats a sample as a whole percentage, `—` when nothing is known.
pub fn format_percent(sample: Option<ProgressSample>) -> String {
    match sample {
        Some(sample) if sample.total > 0 => format!("{:.0}%", sample.percent()),
        _ => NO_VALUE.to_string(),
    }
}

/// Formats a throughput in bytes per second.
pub fn format_rate(bytes_per_sec: f64) -> String {
    const UNITS: [&str; 4] = ["B/s", "KB/s", "MB/s", "GB/s"];

    let mut value = bytes_per_sec.max(0.0);
    let mut unit = 0;
    while value >= 1024.0 && unit < UNITS.len() - 1 {
        value /= 1024.0;
        unit += 1;
    }

    if unit == 0 {
        format!("{:.0} {}", value, UNITS[unit])
    } else {
        format!("{:.1} {}", value, UNITS[unit])
    }
}

/// Formats an average send latency.
pub fn format_latency(avg_send_ms: Option<f64>) -> String {
    match avg_send_ms {
        Some(ms) if ms >= 1000.0 => format!("{:.1}s", ms / 1000.0),
        Some(ms) => format!("{:.0}ms", ms),
        None => NO_VALUE.to_string(),
    }
}

/// `waiting on a@x, b@y`, or `None` when nobody is blocking.
pub fn blockers_label(blockers: &[String]) -> Option<String> {
    if blockers.is_empty() {
        None
    } else {
        Some(format!("waiting on {}", blockers.join(", ")))
    }
}

/// How recent a peer's telemetry is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Freshness {
    Live,
    Stale,
    Unknown,
}

impl Freshness {
    /// Classifies telemetry by the age of its last update.
    pub fn from_age(
        updated_at: Option<DateTime<Utc>>,
        now: DateTime<Utc>,
        stale_after: Duration,
    ) -> Self {
        let Some(updated_at) = updated_at else {
            return Freshness::Unknown;
        };
        let age = (now - updated_at).to_std().unwrap_or(Duration::ZERO);
        if age > stale_after {
            Freshness::Stale
        } else {
            Freshness::Live
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Freshness::Live => "live",
            Freshness::Stale => "stale",
            Freshness::Unknown => "unknown",
        }
    }
}

impl std::fmt::Display for Freshness {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration as ChronoDuration, TimeZone};

    const DAY: Duration = Duration::from_secs(86_400);

    #[test]
    fn test_format_elapsed() {
        assert_eq!(format_elapsed(Duration::from_secs(0)), "0s");
        assert_eq!(format_elapsed(Duration::from_secs(45)), "45s");
        assert_eq!(format_elapsed(Duration::from_secs(185)), "3m 05s");
        assert_eq!(format_elapsed(Duration::from_secs(3720)), "1h 02m");
    }

    #[test]
    fn test_format_eta() {
        assert_eq!(format_eta(Eta::Unknown, DAY), "—");
        assert_eq!(format_eta(Eta::Done, DAY), "~ done");
        assert_eq!(
            format_eta(Eta::Remaining(Duration::from_secs(200)), DAY),
            "~ 3m 20s left"
        );
        assert_eq!(
            format_eta(Eta::Remaining(Duration::from_secs(305)), DAY),
            "~ 5m 05s left"
        );
        assert_eq!(
            format_eta(Eta::Remaining(Duration::from_secs(3720)), DAY),
            "~ 1h 02m left"
        );
        assert_eq!(
            format_eta(Eta::Remaining(Duration::from_secs(90_000)), DAY),
            "> 24h"
        );
    }

    #[test]
    fn test_format_percent() {
        assert_eq!(format_percent(None), "—");
        assert_eq!(format_percent(Some(ProgressSample::new(0, 0))), "—");
        assert_eq!(format_percent(Some(ProgressSample::new(1, 4))), "25%");
    }

    #[test]
    fn test_format_rate() {
        assert_eq!(format_rate(0.0), "0 B/s");
        assert_eq!(format_rate(-5.0), "0 B/s");
        assert_eq!(format_rate(512.0), "512 B/s");
        assert_eq!(format_rate(1536.0), "1.5 KB/s");
        assert_eq!(format_rate(3.0 * 1024.0 * 1024.0), "3.0 MB/s");
        assert_eq!(format_rate(2.0 * 1024.0 * 1024.0 * 1024.0), "2.0 GB/s");
    }

    #[test]
    fn test_format_latency() {
        assert_eq!(format_latency(None), "—");
        assert_eq!(format_latency(Some(42.4)), "42ms");
        assert_eq!(format_latency(Some(2500.0)), "2.5s");
    }

    #[test]
    fn test_blockers_label() {
        assert_eq!(blockers_label(&[]), None);
        let blockers = vec!["a@x.org".to_string(), "b@y.org".to_string()];
        assert_eq!(
            blockers_label(&blockers).as_deref(),
            Some("waiting on a@x.org, b@y.org")
        );
    }

    #[test]
    fn test_freshness() {
        let now = Utc.with_ymd_and_hms(2025, 3, 1, 12, 0, 0).unwrap();
        let stale_after = Duration::from_secs(15);

        assert_eq!(Freshness::from_age(None, now, stale_after), Freshness::Unknown);
        assert_eq!(
            Freshness::from_age(Some(now - ChronoDuration::seconds(3)), now, stale_after),
            Freshness::Live
        );
        assert_eq!(
            Freshness::from_age(Some(now - ChronoDuration::seconds(60)), now, stale_after),
            Freshness::Stale
        );
        assert_eq!(Freshness::Stale.to_string(), "stale");
    }
}
