//! The fixed end-to-end step sequence.
//!
//! [`Orchestrator::run`] walks the quality service, source control, CI
//! server, artifact store and web server in a fixed order. Each step is
//! timed, logged inside its own span and recorded in the [`RunReport`]. The
//! first failing step stops the run; nothing is retried at this level.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Serialize, Serializer};
use sha2::{Digest, Sha256};
use tokio::time::Instant;
use tracing::Instrument;
use uuid::Uuid;

use crate::config::{RunConfig, Timings};
use crate::credentials::{Credential, CredentialNegotiator, Validity};
use crate::ensure::{ensure, EnsureOutcome, ResourceDescriptor, ResourceHandle};
use crate::error::{E2eError, Result};
use crate::obs::{self, StepSpan};
use crate::pipeline::{trigger_and_await_success, wait_for_job, JobRef};
use crate::poll::{duration_secs, poll_until, PollPolicy};
use crate::propagation::{verify_downstream_propagation, AccessPath, ContentExpectation, ConvergenceCheck};
use crate::readiness::{wait_until_ready, StatusProbe};
use crate::services::{
    CiServer, ContentServer, ContentService, GiteaClient, IssueState, JenkinsClient, QualityService,
    SonarQubeClient, SourceControl,
};

/// Names of the settings that supply override secrets, for error hints.
const SONAR_OVERRIDE_SETTING: &str = "SONAR_NEW_PASS";
const GITEA_OVERRIDE_SETTING: &str = "GITEA_ADMIN_PASS";
const JENKINS_OVERRIDE_SETTING: &str = "JENKINS_ADMIN_PASS";

/// Step names in execution order.
pub const STEPS: [&str; 19] = [
    "quality.readiness",
    "quality.credentials",
    "quality.project",
    "scm.readiness",
    "scm.installation",
    "scm.credentials",
    "scm.repository",
    "scm.issue",
    "scm.file.index",
    "scm.file.pipeline",
    "ci.readiness",
    "ci.credentials",
    "ci.seed_job",
    "ci.seed_build",
    "ci.generated_job",
    "ci.pipeline_build",
    "artifact.propagation",
    "web.propagation",
    "scm.close_issue",
];

/// The five services a run talks to.
#[derive(Clone)]
pub struct Services {
    pub quality: Arc<dyn QualityService>,
    pub scm: Arc<dyn SourceControl>,
    pub ci: Arc<dyn CiServer>,
    pub artifact_store: Arc<dyn ContentService>,
    pub web_server: Arc<dyn ContentService>,
}

impl Services {
    /// HTTP adapters for the endpoints in `config`.
    pub fn connect(config: &RunConfig) -> Result<Self> {
        let timeout = config.timings.request_timeout;
        Ok(Self {
            quality: Arc::new(SonarQubeClient::new(config.quality.endpoint.clone(), timeout)?),
            scm: Arc::new(GiteaClient::new(config.scm.endpoint.clone(), timeout)?),
            ci: Arc::new(JenkinsClient::new(config.ci.endpoint.clone(), timeout)?),
            artifact_store: Arc::new(ContentServer::new(config.artifact_store.clone(), timeout)?),
            web_server: Arc::new(ContentServer::new(config.web_server.clone(), timeout)?),
        })
    }
}

/// How a step ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    /// Done; no resource involved.
    Completed,
    /// A missing resource was created and verified.
    Created,
    /// The resource already existed and was left alone.
    Skipped,
    Failed,
}

#[derive(Debug, Clone, Serialize)]
pub struct StepRecord {
    pub name: String,
    pub status: StepStatus,
    pub elapsed_ms: u64,
    pub detail: String,
}

/// The first failure of a run.
#[derive(Debug, thiserror::Error, Serialize)]
#[error("step '{step}' failed after {}s: {source}", .elapsed.as_secs())]
pub struct RunFailure {
    pub step: String,
    #[serde(with = "duration_secs")]
    pub elapsed: Duration,
    #[serde(serialize_with = "display")]
    pub source: E2eError,
}

fn display<S: Serializer>(error: &E2eError, s: S) -> std::result::Result<S::Ok, S::Error> {
    s.collect_str(error)
}

/// Everything a run observed.
#[derive(Debug, Serialize)]
pub struct RunReport {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub steps: Vec<StepRecord>,
    /// Hex SHA-256 of the verified artifact body.
    pub artifact_sha256: Option<String>,
    pub failure: Option<RunFailure>,
}

impl RunReport {
    fn new(run_id: Uuid) -> Self {
        Self {
            run_id,
            started_at: Utc::now(),
            finished_at: None,
            steps: Vec::new(),
            artifact_sha256: None,
            failure: None,
        }
    }

    pub fn succeeded(&self) -> bool {
        self.failure.is_none() && self.steps.len() == STEPS.len()
    }

    pub fn step(&self, name: &str) -> Option<&StepRecord> {
        self.steps.iter().find(|s| s.name == name)
    }

    /// Steps that created something.
    pub fn created(&self) -> impl Iterator<Item = &StepRecord> {
        self.steps.iter().filter(|s| s.status == StepStatus::Created)
    }
}

/// Readiness of one service, as reported by [`Orchestrator::probe`].
#[derive(Debug, Clone, Serialize)]
pub struct ProbeResult {
    pub service: String,
    pub ready: bool,
    pub elapsed_ms: u64,
    pub error: Option<String>,
}

/// What a step produced, plus how to record it.
struct Done<T> {
    value: T,
    status: StepStatus,
    detail: String,
}

impl<T> Done<T> {
    fn completed(value: T, detail: impl Into<String>) -> Self {
        Self {
            value,
            status: StepStatus::Completed,
            detail: detail.into(),
        }
    }
}

impl Done<ResourceHandle> {
    fn ensured(outcome: EnsureOutcome) -> Self {
        let (status, verb) = if outcome.created() {
            (StepStatus::Created, "created")
        } else {
            (StepStatus::Skipped, "already exists")
        };
        let handle = outcome.handle().clone();
        Self {
            detail: format!("{handle} {verb}"),
            value: handle,
            status,
        }
    }
}

/// Run bookkeeping shared by the step helper and the timeout path.
struct Progress {
    report: RunReport,
    current: Option<(&'static str, Instant)>,
}

pub struct Orchestrator<'a> {
    config: &'a RunConfig,
    services: Services,
    run_id: Uuid,
}

impl<'a> Orchestrator<'a> {
    pub fn new(config: &'a RunConfig, services: Services) -> Self {
        Self {
            config,
            services,
            run_id: Uuid::new_v4(),
        }
    }

    pub fn run_id(&self) -> Uuid {
        self.run_id
    }

    /// Run every step in order, bounded by the configured run timeout.
    pub async fn run(&self) -> RunReport {
        let run_id = self.run_id.to_string();
        obs::emit_run_started(&run_id, STEPS.len());
        let started = Instant::now();
        let mut progress = Progress {
            report: RunReport::new(self.run_id),
            current: None,
        };

        let limit = self.config.run_timeout;
        let outcome = tokio::time::timeout(limit, self.run_steps(&mut progress)).await;
        let failure = match outcome {
            Ok(Ok(())) => None,
            Ok(Err(failure)) => Some(failure),
            Err(_) => {
                let (step, step_started) = progress.current.unwrap_or(("run", started));
                let elapsed = step_started.elapsed();
                obs::emit_step_failed(step, elapsed, &format!("run timeout of {}s exceeded", limit.as_secs()));
                progress.report.steps.push(StepRecord {
                    name: step.to_string(),
                    status: StepStatus::Failed,
                    elapsed_ms: elapsed.as_millis() as u64,
                    detail: "interrupted by run timeout".to_string(),
                });
                Some(RunFailure {
                    step: step.to_string(),
                    elapsed,
                    source: E2eError::RunTimeout { limit },
                })
            }
        };

        let mut report = progress.report;
        report.failure = failure;
        report.finished_at = Some(Utc::now());
        obs::emit_run_finished(&run_id, started.elapsed().as_millis() as u64, report.succeeded());
        report
    }

    /// Check readiness of every service without changing anything.
    pub async fn probe(&self) -> Vec<ProbeResult> {
        let policy = &self.config.timings.readiness;
        vec![
            probe_one(&*self.services.quality, policy).await,
            probe_one(&*self.services.scm, policy).await,
            probe_one(&*self.services.ci, policy).await,
            probe_one(&*self.services.artifact_store, policy).await,
            probe_one(&*self.services.web_server, policy).await,
        ]
    }

    async fn step<T, Fut>(&self, progress: &mut Progress, name: &'static str, action: Fut) -> std::result::Result<T, RunFailure>
    where
        Fut: Future<Output = Result<Done<T>>>,
    {
        let span = StepSpan::new(&self.run_id.to_string(), name);
        let started = Instant::now();
        progress.current = Some((name, started));
        span.span().in_scope(|| obs::emit_step_started(name));

        let outcome = action.instrument(span.span().clone()).await;
        let elapsed = started.elapsed();
        progress.current = None;

        let _entered = span.span().enter();
        match outcome {
            Ok(done) => {
                obs::emit_step_finished(name, elapsed, &done.detail);
                progress.report.steps.push(StepRecord {
                    name: name.to_string(),
                    status: done.status,
                    elapsed_ms: elapsed.as_millis() as u64,
                    detail: done.detail,
                });
                Ok(done.value)
            }
            Err(source) => {
                obs::emit_step_failed(name, elapsed, &source);
                progress.report.steps.push(StepRecord {
                    name: name.to_string(),
                    status: StepStatus::Failed,
                    elapsed_ms: elapsed.as_millis() as u64,
                    detail: source.to_string(),
                });
                Err(RunFailure {
                    step: name.to_string(),
                    elapsed,
                    source,
                })
            }
        }
    }

    async fn run_steps(&self, progress: &mut Progress) -> std::result::Result<(), RunFailure> {
        let config = self.config;
        let timings = &config.timings;
        let quality = &*self.services.quality;
        let scm = &*self.services.scm;
        let ci = &*self.services.ci;

        // Code quality.
        self.step(progress, "quality.readiness", readiness(quality, timings)).await?;
        self.step(progress, "quality.credentials", async {
            let negotiator = CredentialNegotiator::new(SONAR_OVERRIDE_SETTING);
            let resolved = negotiator
                .resolve_working_credential(quality, config.quality.candidates())
                .await?;
            let effective = negotiator
                .handle_forced_rotation(quality, &resolved, config.quality.new_secret.as_ref())
                .await?;
            Ok::<_, E2eError>(Done::completed((), describe_credential(&effective)))
        })
        .await?;
        self.step(progress, "quality.project", async {
            let project = ResourceDescriptor::Project {
                key: config.quality.project_key.clone(),
                name: config.quality.project_name.clone(),
                main_branch: config.quality.main_branch.clone(),
            };
            Ok::<_, E2eError>(Done::ensured(ensure(quality, &project, timings).await?))
        })
        .await?;

        // Source control.
        let owner = config.scm.admin_user.clone();
        let repository = config.scm.repository.clone();
        self.step(progress, "scm.readiness", readiness(scm, timings)).await?;
        self.step(progress, "scm.installation", async {
            let installation = ResourceDescriptor::Installation {
                site_title: config.scm.site_title.clone(),
                admin: config.scm.admin_credential(),
                admin_email: config.scm.admin_email.clone(),
            };
            Ok::<_, E2eError>(Done::ensured(ensure(scm, &installation, timings).await?))
        })
        .await?;
        self.step(progress, "scm.credentials", async {
            let negotiator = CredentialNegotiator::new(GITEA_OVERRIDE_SETTING);
            let resolved = negotiator
                .resolve_working_credential(scm, vec![config.scm.admin_credential()])
                .await?;
            Ok::<_, E2eError>(Done::completed((), describe_credential(&resolved)))
        })
        .await?;
        self.step(progress, "scm.repository", async {
            let repo = ResourceDescriptor::Repository {
                owner: owner.clone(),
                name: repository.clone(),
                default_branch: config.scm.default_branch.clone(),
            };
            Ok::<_, E2eError>(Done::ensured(ensure(scm, &repo, timings).await?))
        })
        .await?;
        let issue = self
            .step(progress, "scm.issue", async {
                let issue = ResourceDescriptor::Issue {
                    owner: owner.clone(),
                    repo: repository.clone(),
                    title: config.scm.issue_title.clone(),
                };
                Ok::<_, E2eError>(Done::ensured(ensure(scm, &issue, timings).await?))
            })
            .await?;
        for (name, file) in [
            ("scm.file.index", &config.index_file),
            ("scm.file.pipeline", &config.pipeline_file),
        ] {
            self.step(progress, name, async {
                let descriptor = ResourceDescriptor::File {
                    owner: owner.clone(),
                    repo: repository.clone(),
                    path: file.path.clone(),
                    content: file.content.clone(),
                    message: format!("add {}", file.path),
                };
                Ok::<_, E2eError>(Done::ensured(ensure(scm, &descriptor, timings).await?))
            })
            .await?;
        }

        // CI.
        self.step(progress, "ci.readiness", readiness(ci, timings)).await?;
        self.step(progress, "ci.credentials", async {
            let negotiator = CredentialNegotiator::new(JENKINS_OVERRIDE_SETTING);
            let resolved = negotiator
                .resolve_working_credential(ci, vec![config.ci.admin_credential()])
                .await?;
            Ok::<_, E2eError>(Done::completed((), describe_credential(&resolved)))
        })
        .await?;
        self.step(progress, "ci.seed_job", async {
            let job = ResourceDescriptor::Job {
                name: config.ci.seed_job.clone(),
                definition: config.ci.seed_job_definition.clone(),
            };
            Ok::<_, E2eError>(Done::ensured(ensure(ci, &job, timings).await?))
        })
        .await?;
        self.step(progress, "ci.seed_build", async {
            let run = trigger_and_await_success(ci, &JobRef::parameterized(&config.ci.seed_job), &timings.build).await?;
            Ok::<_, E2eError>(Done::completed((), format!("build #{} {}", run.number, run.status)))
        })
        .await?;
        self.step(progress, "ci.generated_job", async {
            wait_for_job(ci, &config.ci.pipeline_job, &timings.job_appearance).await?;
            Ok::<_, E2eError>(Done::completed((), format!("job {} available", config.ci.pipeline_job)))
        })
        .await?;
        self.step(progress, "ci.pipeline_build", async {
            let run = trigger_and_await_success(ci, &JobRef::plain(&config.ci.pipeline_job), &timings.build).await?;
            Ok::<_, E2eError>(Done::completed((), format!("build #{} {}", run.number, run.status)))
        })
        .await?;

        // Downstream propagation.
        let digest = self
            .step(progress, "artifact.propagation", async {
                let check = ConvergenceCheck {
                    target: config.artifact_url()?,
                    access: AccessPath::Raw,
                    expected: ContentExpectation::contains(&config.expected_text),
                };
                let content =
                    verify_downstream_propagation(&*self.services.artifact_store, &check, &timings.propagation).await?;
                let digest = hex::encode(Sha256::digest(content.body.as_bytes()));
                Ok::<_, E2eError>(Done::completed(digest.clone(), format!("sha256 {digest}")))
            })
            .await?;
        progress.report.artifact_sha256 = Some(digest);
        self.step(progress, "web.propagation", async {
            let check = ConvergenceCheck {
                target: config.web_server.base_url.clone(),
                access: AccessPath::Browser,
                expected: ContentExpectation::heading(1, &config.expected_text),
            };
            verify_downstream_propagation(&*self.services.web_server, &check, &timings.propagation).await?;
            Ok::<_, E2eError>(Done::completed((), format!("h1 is '{}'", config.expected_text)))
        })
        .await?;

        // Close-out.
        self.step(progress, "scm.close_issue", close_issue(scm, &issue, config)).await?;
        Ok(())
    }
}

async fn probe_one<P: StatusProbe + ?Sized>(service: &P, policy: &PollPolicy) -> ProbeResult {
    let started = Instant::now();
    let outcome = wait_until_ready(service, policy).await;
    ProbeResult {
        service: service.name().to_string(),
        ready: outcome.is_ok(),
        elapsed_ms: started.elapsed().as_millis() as u64,
        error: outcome.err().map(|e| e.to_string()),
    }
}

async fn readiness<P: StatusProbe + ?Sized>(probe: &P, timings: &Timings) -> Result<Done<()>> {
    let waited = wait_until_ready(probe, &timings.readiness).await?;
    Ok(Done::completed((), format!("ready after {}ms", waited.as_millis())))
}

/// Close the tracking issue and wait until it reads back as closed.
async fn close_issue<S: SourceControl + ?Sized>(scm: &S, issue: &ResourceHandle, config: &RunConfig) -> Result<Done<()>> {
    let already_closed = scm.issue_state(issue).await? == IssueState::Closed;
    if !already_closed {
        scm.close_issue(issue).await?;
    }
    poll_until(&format!("closing {issue}"), &config.timings.verification, move || async move {
        Ok::<_, E2eError>((scm.issue_state(issue).await? == IssueState::Closed).then_some(()))
    })
    .await
    .map_err(|timeout| E2eError::IssueNotClosed {
        issue: issue.id.clone(),
        elapsed: timeout.elapsed,
    })?;
    let detail = if already_closed { "already closed" } else { "closed" };
    Ok(Done {
        value: (),
        status: if already_closed { StepStatus::Skipped } else { StepStatus::Completed },
        detail: format!("{issue} {detail}"),
    })
}

fn describe_credential(credential: &Credential) -> String {
    let how = match credential.validity {
        Validity::Rotated => "rotated",
        _ if credential.is_known_default() => "default",
        _ => "override",
    };
    format!("signed in as {} ({how})", credential.principal)
}
