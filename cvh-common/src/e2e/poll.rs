//! Bounded retry-with-interval for eventually-consistent checks.
//!
//! The cluster is expected to reach a target state eventually, but the exact
//! time is unknown. [`Poller::poll`] keeps calling a read-only check until it
//! succeeds or the timeout budget is spent, then reports the last observed
//! discrepancy.

use std::fmt;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use super::cancel::CancelToken;

/// Interval and total budget for one verification point.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PollSpec {
    pub interval: Duration,
    pub timeout: Duration,
}

impl PollSpec {
    pub fn new(interval: Duration, timeout: Duration) -> Self {
        Self { interval, timeout }
    }
}

impl Default for PollSpec {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(1),
            timeout: Duration::from_secs(60),
        }
    }
}

/// A successful poll.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Converged<T> {
    pub value: T,
    pub attempts: u32,
    pub elapsed: Duration,
}

/// The check never succeeded within its budget.
#[derive(Debug)]
pub struct PollTimeout<E> {
    pub description: String,
    pub timeout: Duration,
    pub elapsed: Duration,
    pub attempts: u32,
    /// Error returned by the final attempt.
    pub last_error: E,
}

impl<E: fmt::Display> fmt::Display for PollTimeout<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} did not converge within {:?} ({} attempts over {:?}); last error: {}",
            self.description, self.timeout, self.attempts, self.elapsed, self.last_error
        )
    }
}

impl<E: fmt::Debug + fmt::Display> std::error::Error for PollTimeout<E> {}

#[derive(Debug)]
pub enum PollError<E> {
    Timeout(PollTimeout<E>),
    Cancelled { description: String, attempts: u32 },
}

impl<E: fmt::Display> fmt::Display for PollError<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Timeout(timeout) => timeout.fmt(f),
            Self::Cancelled {
                description,
                attempts,
            } => write!(f, "{description} cancelled after {attempts} attempts"),
        }
    }
}

impl<E: fmt::Debug + fmt::Display> std::error::Error for PollError<E> {}

/// Runs checks under a [`PollSpec`], honouring a [`CancelToken`].
#[derive(Debug, Clone, Default)]
pub struct Poller {
    spec: PollSpec,
    cancel: CancelToken,
}

impl Poller {
    pub fn new(spec: PollSpec) -> Self {
        Self {
            spec,
            cancel: CancelToken::new(),
        }
    }

    pub fn with_cancel(mut self, cancel: CancelToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn spec(&self) -> PollSpec {
        self.spec
    }

    /// Call `check` until it returns `Ok`, sleeping `interval` between
    /// failures. Once the elapsed time reaches `timeout` the most recent error
    /// is returned inside [`PollTimeout`]. The final sleep is clipped so the
    /// last attempt lands at the deadline.
    pub fn poll<T, E, F>(&self, description: &str, mut check: F) -> Result<Converged<T>, PollError<E>>
    where
        F: FnMut() -> Result<T, E>,
        E: fmt::Display,
    {
        let start = Instant::now();
        let mut attempts = 0u32;
        debug!(
            check = description,
            interval_ms = self.spec.interval.as_millis() as u64,
            timeout_ms = self.spec.timeout.as_millis() as u64,
            "polling"
        );

        loop {
            if self.cancel.is_cancelled() {
                return Err(PollError::Cancelled {
                    description: description.to_string(),
                    attempts,
                });
            }

            attempts += 1;
            let error = match check() {
                Ok(value) => {
                    let elapsed = start.elapsed();
                    info!(
                        check = description,
                        attempts,
                        elapsed_ms = elapsed.as_millis() as u64,
                        "check converged"
                    );
                    return Ok(Converged {
                        value,
                        attempts,
                        elapsed,
                    });
                }
                Err(error) => error,
            };

            let elapsed = start.elapsed();
            if elapsed >= self.spec.timeout {
                warn!(
                    check = description,
                    attempts,
                    elapsed_ms = elapsed.as_millis() as u64,
                    last_error = %error,
                    "check timed out"
                );
                return Err(PollError::Timeout(PollTimeout {
                    description: description.to_string(),
                    timeout: self.spec.timeout,
                    elapsed,
                    attempts,
                    last_error: error,
                }));
            }

            debug!(check = description, attempt = attempts, error = %error, "not yet converged");
            let pause = self.spec.interval.min(self.spec.timeout - elapsed);
            if self.cancel.sleep(pause) {
                return Err(PollError::Cancelled {
                    description: description.to_string(),
                    attempts,
                });
            }
        }
    }
}

/// Free-function form: `poll(check, interval, timeout)`.
pub fn poll<T, E, F>(check: F, interval: Duration, timeout: Duration) -> Result<T, PollError<E>>
where
    F: FnMut() -> Result<T, E>,
    E: fmt::Display,
{
    Poller::new(PollSpec::new(interval, timeout))
        .poll("check", check)
        .map(|converged| converged.value)
}
