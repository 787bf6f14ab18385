use serde::{Deserialize, Serialize};
use std::fmt;

/// Lifecycle status of an assistant run.
///
/// The set of statuses is owned by the remote service, so unknown values are
/// preserved in `Other` and treated as still in flight.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum RunStatus {
    Queued,
    InProgress,
    RequiresAction,
    Cancelling,
    Cancelled,
    Failed,
    Completed,
    Incomplete,
    Expired,
    Other(String),
}

impl RunStatus {
    pub fn as_str(&self) -> &str {
        match self {
            Self::Queued => "queued",
            Self::InProgress => "in_progress",
            Self::RequiresAction => "requires_action",
            Self::Cancelling => "cancelling",
            Self::Cancelled => "cancelled",
            Self::Failed => "failed",
            Self::Completed => "completed",
            Self::Incomplete => "incomplete",
            Self::Expired => "expired",
            Self::Other(s) => s.as_str(),
        }
    }

    /// A terminal run never changes status again.
    ///
    /// `requires_action` counts as terminal: no tools are registered, so nothing
    /// would ever submit the outputs the run is waiting for.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::Completed
                | Self::Failed
                | Self::Cancelled
                | Self::Expired
                | Self::Incomplete
                | Self::RequiresAction
        )
    }

    pub fn is_success(&self) -> bool {
        matches!(self, Self::Completed)
    }
}

impl From<String> for RunStatus {
    fn from(value: String) -> Self {
        match value.as_str() {
            "queued" => Self::Queued,
            "in_progress" => Self::InProgress,
            "requires_action" => Self::RequiresAction,
            "cancelling" => Self::Cancelling,
            "cancelled" => Self::Cancelled,
            "failed" => Self::Failed,
            "completed" => Self::Completed,
            "incomplete" => Self::Incomplete,
            "expired" => Self::Expired,
            _ => Self::Other(value),
        }
    }
}

impl From<&str> for RunStatus {
    fn from(value: &str) -> Self {
        Self::from(value.to_string())
    }
}

impl From<RunStatus> for String {
    fn from(value: RunStatus) -> Self {
        match value {
            RunStatus::Other(s) => s,
            other => other.as_str().to_string(),
        }
    }
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Snapshot of a run as last reported by the service.
#[derive(Debug, Clone)]
pub struct Run {
    pub id: String,
    pub thread_id: String,
    pub status: RunStatus,
    pub last_error: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
}
