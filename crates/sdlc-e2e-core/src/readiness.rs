//! Readiness probing.

use std::time::Duration;

use async_trait::async_trait;
use tracing::info;

use crate::error::{E2eError, Result};
use crate::poll::{poll_until, PollPolicy};
use crate::services::Service;

/// Raw answer of a status request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusResponse {
    pub status: u16,
    pub body: String,
}

/// A service that can answer a lightweight status request.
#[async_trait]
pub trait StatusProbe: Service {
    /// Issue one status request against the endpoint's readiness path.
    async fn fetch_status(&self) -> Result<StatusResponse>;
}

/// Poll `probe` until its readiness rule accepts a response.
///
/// Transport errors (connection refused while the service boots) count as
/// "not ready yet". Returns the time spent waiting.
pub async fn wait_until_ready<P>(probe: &P, policy: &PollPolicy) -> Result<Duration>
where
    P: StatusProbe + ?Sized,
{
    let endpoint = probe.endpoint();
    let rule = &endpoint.readiness.rule;
    let started = tokio::time::Instant::now();

    let outcome = poll_until(&format!("{} readiness", endpoint.name), policy, move || async move {
        let response = probe.fetch_status().await?;
        Ok::<_, E2eError>(rule.is_ready(response.status, &response.body).then_some(()))
    })
    .await;

    match outcome {
        Ok(()) => {
            let waited = started.elapsed();
            info!(
                service = %endpoint.name,
                waited_ms = waited.as_millis() as u64,
                "service ready"
            );
            Ok(waited)
        }
        Err(timeout) => Err(E2eError::ReadinessTimeout {
            service: endpoint.name.clone(),
            url: endpoint
                .readiness_url()
                .map(|u| u.to_string())
                .unwrap_or_else(|_| endpoint.base_url.to_string()),
            elapsed: timeout.elapsed,
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fakes::FakeLab;

    #[tokio::test(start_paused = true)]
    async fn test_ready_after_startup_errors() {
        let lab = FakeLab::new();
        lab.quality_boots_after(3);
        let quality = lab.quality();

        let waited = wait_until_ready(&quality, &PollPolicy::from_secs(2, 180))
            .await
            .expect("becomes ready");

        assert!(waited >= Duration::from_secs(6));
        assert_eq!(lab.counters().quality_status_calls, 4);
    }

    #[tokio::test(start_paused = true)]
    async fn test_never_ready_times_out_within_deadline() {
        let lab = FakeLab::new();
        lab.quality_boots_after(u32::MAX);
        let quality = lab.quality();
        let start = tokio::time::Instant::now();

        let err = wait_until_ready(&quality, &PollPolicy::from_secs(2, 20))
            .await
            .expect_err("never ready");

        assert!(start.elapsed() <= Duration::from_secs(20));
        match err {
            E2eError::ReadinessTimeout { service, url, elapsed } => {
                assert_eq!(service, "sonarqube");
                assert!(url.ends_with("/api/system/status"));
                assert!(elapsed <= Duration::from_secs(20));
            }
            other => panic!("unexpected error: {other}"),
        }
    }
}
