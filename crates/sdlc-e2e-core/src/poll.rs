//! Deadline-bounded polling.
//!
//! [`poll_until`] is the only suspension primitive used by the verifier.
//! Readiness probes, post-create verification, build waits and downstream
//! propagation checks all go through it, so every wait has the same
//! semantics: errors count as "not yet", every attempt is cut off at the
//! deadline, and expiry is reported with the elapsed time.

use std::fmt::Display;
use std::future::Future;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tracing::debug;

/// Interval and deadline of one polling loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PollPolicy {
    /// Pause between two checks.
    #[serde(with = "duration_secs")]
    pub interval: Duration,

    /// Total time budget, measured from the first check.
    #[serde(with = "duration_secs")]
    pub deadline: Duration,
}

impl PollPolicy {
    pub const fn new(interval: Duration, deadline: Duration) -> Self {
        Self { interval, deadline }
    }

    /// Convenience constructor taking whole seconds.
    pub const fn from_secs(interval_secs: u64, deadline_secs: u64) -> Self {
        Self::new(
            Duration::from_secs(interval_secs),
            Duration::from_secs(deadline_secs),
        )
    }
}

/// A polling loop ran out of time.
#[derive(Debug, Clone)]
pub struct PollTimeout {
    pub label: String,
    pub elapsed: Duration,
    pub attempts: u32,
    /// Text of the last swallowed error, if the last attempt failed.
    pub last_error: Option<String>,
}

/// Run `check` every `policy.interval` until it yields a value or the
/// deadline elapses.
///
/// `check` returns `Ok(Some(v))` when done, `Ok(None)` when not yet, and
/// `Err(_)` for transient failures; errors are logged and treated as
/// "not yet". Each attempt is bounded by the remaining budget.
pub async fn poll_until<T, E, F, Fut>(
    label: &str,
    policy: &PollPolicy,
    mut check: F,
) -> Result<T, PollTimeout>
where
    E: Display,
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<Option<T>, E>>,
{
    let start = Instant::now();
    let deadline = start + policy.deadline;
    let mut attempts = 0u32;
    let mut last_error = None;

    loop {
        let now = Instant::now();
        if now >= deadline {
            break;
        }

        attempts += 1;
        match tokio::time::timeout(deadline - now, check()).await {
            Ok(Ok(Some(value))) => {
                debug!(label = %label, attempts, "poll satisfied");
                return Ok(value);
            }
            Ok(Ok(None)) => {
                last_error = None;
            }
            Ok(Err(e)) => {
                debug!(label = %label, attempts, error = %e, "poll attempt failed");
                last_error = Some(e.to_string());
            }
            // Attempt cut off by the deadline.
            Err(_) => break,
        }

        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            break;
        }
        tokio::time::sleep(policy.interval.min(remaining)).await;
    }

    Err(PollTimeout {
        label: label.to_string(),
        elapsed: start.elapsed(),
        attempts,
        last_error,
    })
}

/// Serialize durations as whole seconds in reports and config dumps.
pub(crate) mod duration_secs {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_secs())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_secs(u64::deserialize(d)?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[tokio::test(start_paused = true)]
    async fn test_poll_returns_first_satisfied_value() {
        let calls = AtomicU32::new(0);
        let calls = &calls;
        let policy = PollPolicy::from_secs(1, 30);

        let value = poll_until("counter", &policy, move || async move {
            let n = calls.fetch_add(1, Ordering::SeqCst) + 1;
            Ok::<_, String>((n == 3).then_some(n))
        })
        .await
        .expect("poll should succeed");

        assert_eq!(value, 3);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_poll_swallows_errors_until_success() {
        let calls = AtomicU32::new(0);
        let calls = &calls;
        let policy = PollPolicy::from_secs(2, 60);

        let value = poll_until("flaky", &policy, move || async move {
            let n = calls.fetch_add(1, Ordering::SeqCst);
            if n < 2 {
                Err("connection refused".to_string())
            } else {
                Ok(Some("up"))
            }
        })
        .await
        .expect("errors are transient");

        assert_eq!(value, "up");
    }

    #[tokio::test(start_paused = true)]
    async fn test_poll_times_out_at_deadline() {
        let policy = PollPolicy::from_secs(2, 10);
        let start = Instant::now();

        let timeout = poll_until("never", &policy, || async {
            Err::<Option<()>, _>("refused")
        })
        .await
        .expect_err("never ready");

        assert!(start.elapsed() <= Duration::from_secs(10));
        assert!(timeout.elapsed <= Duration::from_secs(10));
        assert!(timeout.attempts >= 5);
        assert_eq!(timeout.last_error.as_deref(), Some("refused"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_poll_cuts_off_hung_attempt() {
        let policy = PollPolicy::from_secs(1, 5);
        let start = Instant::now();

        let timeout = poll_until("hung", &policy, || async {
            tokio::time::sleep(Duration::from_secs(3600)).await;
            Ok::<Option<()>, String>(Some(()))
        })
        .await
        .expect_err("attempt never completes in time");

        assert_eq!(timeout.attempts, 1);
        assert!(start.elapsed() <= Duration::from_secs(5));
    }
}
