use crate::error::{AssistantError, Result};
use crate::types::Run;
use std::future::Future;
use std::time::{Duration, Instant};

pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(1);
pub const DEFAULT_POLL_MAX_ATTEMPTS: u32 = 120;
pub const DEFAULT_POLL_TIMEOUT: Duration = Duration::from_secs(120);

/// Bounds on how long a run is polled before giving up.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PollPolicy {
    /// Delay after the first non-terminal status fetch.
    pub interval: Duration,
    /// Multiplier applied to the delay after every sleep. `1.0` keeps it fixed.
    pub backoff_factor: f64,
    pub max_interval: Duration,
    pub max_attempts: u32,
    /// Wall-clock budget for the whole polling phase.
    pub timeout: Duration,
}

impl Default for PollPolicy {
    fn default() -> Self {
        Self::fixed(DEFAULT_POLL_INTERVAL, DEFAULT_POLL_MAX_ATTEMPTS)
    }
}

impl PollPolicy {
    pub fn fixed(interval: Duration, max_attempts: u32) -> Self {
        Self {
            interval,
            backoff_factor: 1.0,
            max_interval: interval,
            max_attempts,
            timeout: DEFAULT_POLL_TIMEOUT,
        }
    }

    pub fn with_backoff(mut self, factor: f64, max_interval: Duration) -> Self {
        self.backoff_factor = factor;
        self.max_interval = max_interval;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.interval.is_zero() {
            return Err(AssistantError::InvalidInput(
                "poll interval must be > 0".to_string(),
            ));
        }
        if self.max_attempts == 0 {
            return Err(AssistantError::InvalidInput(
                "poll max_attempts must be > 0".to_string(),
            ));
        }
        if !self.backoff_factor.is_finite() || self.backoff_factor < 1.0 {
            return Err(AssistantError::InvalidInput(format!(
                "poll backoff_factor must be a finite value >= 1.0, got {}",
                self.backoff_factor
            )));
        }
        if self.max_interval < self.interval {
            return Err(AssistantError::InvalidInput(
                "poll max_interval must be >= interval".to_string(),
            ));
        }
        Ok(())
    }

    /// Sleep to take after the `attempt`-th (1-based) non-terminal fetch.
    pub fn delay_after(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(i32::MAX as u32) as i32;
        let secs = self.interval.as_secs_f64() * self.backoff_factor.powi(exponent);
        if !secs.is_finite() || secs >= self.max_interval.as_secs_f64() {
            return self.max_interval;
        }
        Duration::from_secs_f64(secs.max(0.0))
    }
}

/// Fetch run snapshots until one reports a terminal status.
pub(crate) async fn poll_until_terminal<F, Fut>(
    policy: &PollPolicy,
    run_id: &str,
    mut fetch: F,
) -> Result<Run>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<Run>>,
{
    let started = Instant::now();
    let mut attempts: u32 = 0;

    loop {
        let run = fetch().await?;
        attempts += 1;
        if run.status.is_terminal() {
            tracing::debug!(run_id, attempts, status = %run.status, "run reached terminal status");
            return Ok(run);
        }
        let last_status = run.status;

        let delay = policy.delay_after(attempts);
        if attempts >= policy.max_attempts || started.elapsed() + delay > policy.timeout {
            tracing::warn!(
                run_id,
                attempts,
                last_status = %last_status,
                elapsed_ms = started.elapsed().as_millis() as u64,
                "run polling budget exhausted"
            );
            return Err(AssistantError::PollTimeout {
                run_id: run_id.to_string(),
                attempts,
                last_status,
            });
        }

        tracing::trace!(run_id, attempts, status = %last_status, ?delay, "run still in flight");
        tokio::time::sleep(delay).await;
    }
}
