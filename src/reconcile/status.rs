//! Status Vocabulary
//!
//! Canonicalizes the many spellings of a step status that backends and peers
//! report, and ranks the canonical values so conflicting reports can be
//! resolved without a central authority.
//!
//! # Rank Table
//!
//! | Status             | Rank |
//! |--------------------|------|
//! | `Failed`           | 100  |
//! | `Shared`           | 90   |
//! | `Completed`        | 80   |
//! | `Sharing`          | 70   |
//! | `Running`          | 60   |
//! | `Ready`            | 50   |
//! | `WaitingForInputs` | 40   |
//! | anything else      | 10   |

use std::fmt;

use serde::{Deserialize, Serialize};

/// Rank given to `Pending` and to every status the vocabulary doesn't know.
pub const UNKNOWN_RANK: i32 = 10;

/// Canonical step status.
///
/// Unknown backend spellings are kept verbatim in [`CanonicalStatus::Other`]
/// so newer backends don't break older clients.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum CanonicalStatus {
    #[default]
    Pending,
    WaitingForInputs,
    Ready,
    Running,
    Sharing,
    Completed,
    Shared,
    Failed,
    /// Unrecognized status, stored as received (trimmed)
    Other(String),
}

impl CanonicalStatus {
    /// Returns the canonical spelling of this status.
    pub fn as_str(&self) -> &str {
        match self {
            Self::Pending => "Pending",
            Self::WaitingForInputs => "WaitingForInputs",
            Self::Ready => "Ready",
            Self::Running => "Running",
            Self::Sharing => "Sharing",
            Self::Completed => "Completed",
            Self::Shared => "Shared",
            Self::Failed => "Failed",
            Self::Other(raw) => raw,
        }
    }

    /// Merge rank of this status. Higher wins.
    pub fn rank(&self) -> i32 {
        rank(self)
    }

    /// True for statuses that end a step's timer.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Shared | Self::Failed)
    }

    /// True for statuses that look like the step hasn't started yet.
    ///
    /// A stale poll commonly reports one of these for a step that already
    /// finished elsewhere.
    pub fn is_reset_like(&self) -> bool {
        matches!(self, Self::Pending | Self::Ready | Self::WaitingForInputs)
    }

    /// True once there is evidence that work on the step began.
    pub fn is_started(&self) -> bool {
        matches!(
            self,
            Self::Running | Self::Sharing | Self::Completed | Self::Shared | Self::Failed
        )
    }

    /// True when this status satisfies "done" for a step.
    ///
    /// Steps that must share their output are only done once `Shared`.
    pub fn satisfies_done(&self, shares_output: bool) -> bool {
        if shares_output {
            matches!(self, Self::Shared)
        } else {
            matches!(self, Self::Completed | Self::Shared)
        }
    }
}

impl fmt::Display for CanonicalStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl From<String> for CanonicalStatus {
    fn from(raw: String) -> Self {
        normalize(&raw)
    }
}

impl From<&str> for CanonicalStatus {
    fn from(raw: &str) -> Self {
        normalize(raw)
    }
}

impl From<CanonicalStatus> for String {
    fn from(status: CanonicalStatus) -> Self {
        status.as_str().to_string()
    }
}

/// Maps a raw status string onto the canonical vocabulary.
///
/// Matching is case-insensitive, ignores surrounding whitespace, and treats
/// `-`, `_` and camel-case word breaks alike. Never fails: unrecognized
/// input comes back as [`CanonicalStatus::Other`].
///
/// # Example
///
/// ```
/// use flowtrack::reconcile::status::{normalize, CanonicalStatus};
///
/// assert_eq!(normalize(" Done "), CanonicalStatus::Completed);
/// assert_eq!(normalize("waiting-for-inputs"), CanonicalStatus::WaitingForInputs);
/// ```
pub fn normalize(raw: &str) -> CanonicalStatus {
    let trimmed = raw.trim();
    let key: String = trimmed
        .chars()
        .filter(|c| *c != '_' && *c != '-' && !c.is_whitespace())
        .map(|c| c.to_ascii_lowercase())
        .collect();

    match key.as_str() {
        "pending" => CanonicalStatus::Pending,
        "waitingforinputs" => CanonicalStatus::WaitingForInputs,
        "ready" => CanonicalStatus::Ready,
        "running" | "inprogress" => CanonicalStatus::Running,
        "sharing" => CanonicalStatus::Sharing,
        "completed" | "complete" | "done" | "success" | "succeeded" => CanonicalStatus::Completed,
        "shared" => CanonicalStatus::Shared,
        "failed" | "error" => CanonicalStatus::Failed,
        _ => CanonicalStatus::Other(trimmed.to_string()),
    }
}

/// Returns the merge rank for a status.
pub fn rank(status: &CanonicalStatus) -> i32 {
    match status {
        CanonicalStatus::Failed => 100,
        CanonicalStatus::Shared => 90,
        CanonicalStatus::Completed => 80,
        CanonicalStatus::Sharing => 70,
        CanonicalStatus::Running => 60,
        CanonicalStatus::Ready => 50,
        CanonicalStatus::WaitingForInputs => 40,
        CanonicalStatus::Pending | CanonicalStatus::Other(_) => UNKNOWN_RANK,
    }
}
