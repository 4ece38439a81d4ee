//! CI job triggering and build convergence.

use std::fmt;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::error::{E2eError, Result};
use crate::poll::{poll_until, PollPolicy};
use crate::services::Service;

/// A job to trigger.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobRef {
    pub name: String,
    /// Parameterised jobs are triggered with their default parameters.
    pub parameterized: bool,
}

impl JobRef {
    pub fn plain(name: &str) -> Self {
        Self {
            name: name.to_string(),
            parameterized: false,
        }
    }

    pub fn parameterized(name: &str) -> Self {
        Self {
            name: name.to_string(),
            parameterized: true,
        }
    }
}

/// Observed state of a build.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BuildStatus {
    Pending,
    Running,
    Success,
    Failure,
    Unknown,
}

impl BuildStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, BuildStatus::Success | BuildStatus::Failure)
    }
}

impl fmt::Display for BuildStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            BuildStatus::Pending => "pending",
            BuildStatus::Running => "running",
            BuildStatus::Success => "success",
            BuildStatus::Failure => "failure",
            BuildStatus::Unknown => "unknown",
        };
        f.write_str(s)
    }
}

/// Latest build as reported by the CI server.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BuildSnapshot {
    pub number: u64,
    pub status: BuildStatus,
}

/// A build started by this run. The CI server owns its state; the run only
/// observes it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BuildRun {
    pub job: String,
    pub number: u64,
    pub triggered_at: DateTime<Utc>,
    pub status: BuildStatus,
}

/// Opaque token for an intermediate confirmation step.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Confirmation {
    pub description: String,
}

/// Answer of the CI server to a trigger.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TriggerOutcome {
    Queued,
    /// Nothing starts until the confirmation is acknowledged.
    ConfirmationRequired(Confirmation),
}

/// Build control surface of a CI server.
#[async_trait]
pub trait BuildControl: Service {
    async fn job_exists(&self, job: &str) -> Result<bool>;

    /// Latest build of `job`, if it ever ran.
    async fn latest_build(&self, job: &str) -> Result<Option<BuildSnapshot>>;

    async fn trigger(&self, job: &JobRef) -> Result<TriggerOutcome>;

    /// Acknowledge a confirmation step returned by [`BuildControl::trigger`].
    async fn acknowledge(&self, job: &JobRef, confirmation: &Confirmation) -> Result<TriggerOutcome>;
}

/// Trigger `job` and wait for the build it started to succeed.
///
/// Builds that existed before the trigger are ignored, so a run left over
/// from an earlier invocation is never mistaken for this one.
pub async fn trigger_and_await_success<C>(ci: &C, job: &JobRef, policy: &PollPolicy) -> Result<BuildRun>
where
    C: BuildControl + ?Sized,
{
    let baseline = ci.latest_build(&job.name).await?.map(|b| b.number).unwrap_or(0);
    let triggered_at = Utc::now();

    match ci.trigger(job).await? {
        TriggerOutcome::Queued => {}
        TriggerOutcome::ConfirmationRequired(confirmation) => {
            info!(job = %job.name, step = %confirmation.description, "acknowledging build confirmation");
            if let TriggerOutcome::ConfirmationRequired(_) = ci.acknowledge(job, &confirmation).await? {
                return Err(E2eError::ConfirmationNotAccepted {
                    job: job.name.clone(),
                });
            }
        }
    }
    info!(job = %job.name, baseline, "build triggered");

    let last_status = std::sync::Mutex::new(BuildStatus::Pending);
    let last_status_ref = &last_status;
    let name = job.name.as_str();

    let outcome = poll_until(&format!("build of {name}"), policy, move || async move {
        let Some(snapshot) = ci.latest_build(name).await? else {
            return Ok::<_, E2eError>(None);
        };
        if snapshot.number <= baseline {
            return Ok(None);
        }
        if let Ok(mut last) = last_status_ref.lock() {
            *last = snapshot.status;
        }
        Ok(snapshot.status.is_terminal().then_some(snapshot))
    })
    .await;

    let last_status = last_status.lock().map(|s| *s).unwrap_or(BuildStatus::Unknown);
    match outcome {
        Ok(BuildSnapshot {
            number,
            status: BuildStatus::Success,
        }) => {
            info!(job = %job.name, number, "build succeeded");
            Ok(BuildRun {
                job: job.name.clone(),
                number,
                triggered_at,
                status: BuildStatus::Success,
            })
        }
        Ok(BuildSnapshot { number, .. }) => {
            warn!(job = %job.name, number, "build failed");
            Err(E2eError::BuildFailed {
                job: job.name.clone(),
                number,
            })
        }
        Err(timeout) => Err(E2eError::BuildTimeout {
            job: job.name.clone(),
            elapsed: timeout.elapsed,
            last_status,
        }),
    }
}

/// Wait until `job` exists, e.g. after a seed job generated it.
pub async fn wait_for_job<C>(ci: &C, job: &str, policy: &PollPolicy) -> Result<()>
where
    C: BuildControl + ?Sized,
{
    poll_until(&format!("appearance of {job}"), policy, move || async move {
        Ok::<_, E2eError>(ci.job_exists(job).await?.then_some(()))
    })
    .await
    .map_err(|timeout| E2eError::JobAppearanceTimeout {
        job: job.to_string(),
        elapsed: timeout.elapsed,
    })?;
    info!(job = %job, "job available");
    Ok(())
}
