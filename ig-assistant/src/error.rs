use crate::types::RunStatus;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, AssistantError>;

#[derive(Debug, Error)]
pub enum AssistantError {
    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("http error: {0}")]
    Http(String),

    #[error("unexpected response format: {0}")]
    ResponseFormat(String),

    #[error("run {run_id} ended with status {status}{}", detail_suffix(.detail))]
    RunFailed {
        run_id: String,
        status: RunStatus,
        detail: Option<String>,
    },

    #[error("run {run_id} did not reach a terminal status after {attempts} polls (last status {last_status})")]
    PollTimeout {
        run_id: String,
        attempts: u32,
        last_status: RunStatus,
    },

    #[error("run {run_id} produced no assistant text")]
    NoResponse { run_id: String },
}

fn detail_suffix(detail: &Option<String>) -> String {
    detail
        .as_deref()
        .map(|d| format!(": {d}"))
        .unwrap_or_default()
}

impl From<reqwest::Error> for AssistantError {
    fn from(e: reqwest::Error) -> Self {
        Self::Http(e.to_string())
    }
}

impl From<serde_json::Error> for AssistantError {
    fn from(e: serde_json::Error) -> Self {
        Self::ResponseFormat(e.to_string())
    }
}
