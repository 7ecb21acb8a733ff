use serde::{Deserialize, Serialize};
use std::fmt;

/// Batch lifecycle states
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BatchStatus {
    /// Created, files may still be registered
    Pending,
    /// Upload finished, files may still be registered
    Uploaded,
    /// Per-file parsing fanned out to native workers
    Scattering,
    /// Every file reported parsed
    Scattered,
    /// Aggregation running
    Gathering,
    /// Aggregation finished
    Gathered,
    /// AI diagnosis running
    Diagnosing,
    /// Diagnosis delivered
    Completed,
    /// Pipeline failed; terminal apart from idempotent re-entry
    Failed,
}

impl BatchStatus {
    pub const ALL: [BatchStatus; 9] = [
        Self::Pending,
        Self::Uploaded,
        Self::Scattering,
        Self::Scattered,
        Self::Gathering,
        Self::Gathered,
        Self::Diagnosing,
        Self::Completed,
        Self::Failed,
    ];

    /// Targets reachable in one step from this state.
    pub fn allowed_transitions(&self) -> &'static [BatchStatus] {
        match self {
            Self::Pending => &[Self::Uploaded],
            Self::Uploaded => &[Self::Scattering],
            Self::Scattering => &[Self::Scattered, Self::Failed],
            Self::Scattered => &[Self::Gathering],
            Self::Gathering => &[Self::Gathered, Self::Failed],
            Self::Gathered => &[Self::Diagnosing],
            Self::Diagnosing => &[Self::Completed, Self::Failed],
            Self::Failed => &[Self::Failed],
            // Reopen for reprocessing. Kept in the table, no handler drives it.
            Self::Completed => &[Self::Pending],
        }
    }

    pub fn can_transition_to(&self, target: BatchStatus) -> bool {
        self.allowed_transitions().contains(&target)
    }

    /// Position along the happy path; `Failed` is off the path.
    pub fn progress_rank(&self) -> Option<u8> {
        match self {
            Self::Pending => Some(0),
            Self::Uploaded => Some(1),
            Self::Scattering => Some(2),
            Self::Scattered => Some(3),
            Self::Gathering => Some(4),
            Self::Gathered => Some(5),
            Self::Diagnosing => Some(6),
            Self::Completed => Some(7),
            Self::Failed => None,
        }
    }

    /// True when the batch is at `target` or already further along the happy path.
    pub fn has_reached(&self, target: BatchStatus) -> bool {
        match (self.progress_rank(), target.progress_rank()) {
            (Some(current), Some(wanted)) => current >= wanted,
            _ => *self == target,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }

    /// Files can only be registered before parsing starts.
    pub fn accepts_files(&self) -> bool {
        matches!(self, Self::Pending | Self::Uploaded)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Uploaded => "uploaded",
            Self::Scattering => "scattering",
            Self::Scattered => "scattered",
            Self::Gathering => "gathering",
            Self::Gathered => "gathered",
            Self::Diagnosing => "diagnosing",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }
}

impl fmt::Display for BatchStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for BatchStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .iter()
            .copied()
            .find(|status| status.as_str() == s)
            .ok_or_else(|| format!("Invalid batch status: {s}"))
    }
}

impl Default for BatchStatus {
    fn default() -> Self {
        Self::Pending
    }
}
