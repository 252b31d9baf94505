// Retry and polling policies for provider calls.
// One-shot calls retry transient failures; waits poll against a caller deadline.

use std::future::Future;
use std::time::Duration;

use tokio::time::{sleep, Instant};
use tokio_retry::strategy::{jitter, ExponentialBackoff};
use tokio_retry::RetryIf;
use tracing::{debug, warn};

use crate::errors::ProviderError;

#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Total calls, the first one included
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub jitter: bool,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(30),
            jitter: true,
        }
    }
}

impl RetryPolicy {
    /// A single call with no retries; used by tests that assert on the first failure.
    pub fn none() -> Self {
        Self {
            max_attempts: 1,
            ..Self::default()
        }
    }

    /// Delays between attempts: base, 2*base, 4*base ... capped at max_delay.
    /// One fewer than `max_attempts`.
    pub fn delays(&self) -> Vec<Duration> {
        let half_base = (self.base_delay.as_millis() as u64 / 2).max(1);
        ExponentialBackoff::from_millis(2)
            .factor(half_base)
            .max_delay(self.max_delay)
            .take(self.max_attempts.saturating_sub(1) as usize)
            .map(|d| if self.jitter { jitter(d) } else { d })
            .collect()
    }

    /// Run a provider call, retrying only errors the provider marks transient.
    pub async fn call<T, F, Fut>(&self, operation: &str, mut action: F) -> Result<T, ProviderError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, ProviderError>>,
    {
        let operation_id = uuid::Uuid::new_v4();
        debug!(
            operation = operation,
            operation_id = %operation_id,
            max_attempts = self.max_attempts,
            "Starting provider call"
        );

        RetryIf::spawn(
            self.delays(),
            || action(),
            |error: &ProviderError| {
                if error.is_transient() {
                    warn!(operation = operation, operation_id = %operation_id, error = %error, "Transient provider error, retrying");
                    true
                } else {
                    false
                }
            },
        )
        .await
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct PollPolicy {
    pub initial_interval: Duration,
    pub max_interval: Duration,
    pub multiplier: f64,
}

impl Default for PollPolicy {
    fn default() -> Self {
        Self {
            initial_interval: Duration::from_secs(2),
            max_interval: Duration::from_secs(30),
            multiplier: 1.5,
        }
    }
}

impl PollPolicy {
    pub fn next_interval(&self, current: Duration) -> Duration {
        Duration::try_from_secs_f64(current.as_secs_f64() * self.multiplier.max(1.0))
            .map_or(self.max_interval, |scaled| scaled.min(self.max_interval))
    }
}

/// Result of a deadline-bounded wait.
#[derive(Debug, Clone, PartialEq)]
pub enum WaitOutcome<T> {
    Reached(T),
    /// Deadline passed; carries the last successful observation, if any.
    Expired { last: Option<T>, attempts: u32 },
}

/// Probe until `done` accepts an observation or `timeout` elapses.
///
/// The probe always starts at least once and never outlives the deadline: a
/// probe still pending when it passes counts as expiry. Transient probe errors
/// are logged and polling continues; any other error aborts the wait.
pub async fn wait_until<T, F, Fut, D>(
    policy: &PollPolicy,
    timeout: Duration,
    mut probe: F,
    done: D,
) -> Result<WaitOutcome<T>, ProviderError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, ProviderError>>,
    D: Fn(&T) -> bool,
{
    let deadline = Instant::now() + timeout;
    let mut interval = policy.initial_interval;
    let mut attempts = 0u32;
    let mut last = None;

    loop {
        attempts = attempts.saturating_add(1);
        let remaining = deadline.saturating_duration_since(Instant::now());
        let Ok(probed) = tokio::time::timeout(remaining, probe()).await else {
            warn!(attempt = attempts, "Probe still pending at the deadline");
            return Ok(WaitOutcome::Expired { last, attempts });
        };
        match probed {
            Ok(observation) => {
                if done(&observation) {
                    return Ok(WaitOutcome::Reached(observation));
                }
                last = Some(observation);
            }
            Err(error) if error.is_transient() => {
                warn!(attempt = attempts, error = %error, "Transient error while polling");
            }
            Err(error) => return Err(error),
        }

        let now = Instant::now();
        if now >= deadline {
            return Ok(WaitOutcome::Expired { last, attempts });
        }
        let pause = interval.min(deadline - now);
        debug!(attempt = attempts, pause_ms = pause.as_millis() as u64, "Polling again");
        sleep(pause).await;
        interval = policy.next_interval(interval);
    }
}
