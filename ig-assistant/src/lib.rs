//! Client for Assistants-style thread/run APIs.
//!
//! One call to [`AssistantClient::reply`] creates a thread, posts the user
//! text, starts a run, polls it under a [`PollPolicy`], and returns the text
//! the assistant wrote for that run.

mod client;
mod error;
mod policy;
mod types;

pub use client::{AssistantClient, DEFAULT_BASE_URL};
pub use error::{AssistantError, Result};
pub use policy::{
    DEFAULT_POLL_INTERVAL, DEFAULT_POLL_MAX_ATTEMPTS, DEFAULT_POLL_TIMEOUT, PollPolicy,
};
pub use types::{Role, Run, RunStatus};
