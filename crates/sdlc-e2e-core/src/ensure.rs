//! Idempotent resource ensuring.
//!
//! Every resource the run depends on is described by a [`ResourceDescriptor`]
//! and goes through the same [`ensure`] routine:
//! - look it up immediately before acting
//! - present: return [`EnsureOutcome::AlreadyExists`] without touching it
//! - absent: create it, then poll the lookup until it is observed
//!
//! A creation request that appears to succeed but never produces the
//! resource is a [`E2eError::ResourceCreationVerificationFailed`], not a
//! silent pass.

use std::fmt;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::config::Timings;
use crate::credentials::Credential;
use crate::error::{E2eError, Result};
use crate::poll::{poll_until, PollPolicy};
use crate::services::Service;

/// Kinds of resources the run provisions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResourceKind {
    Installation,
    Project,
    Repository,
    Issue,
    File,
    Job,
}

impl ResourceKind {
    pub fn name(&self) -> &'static str {
        match self {
            ResourceKind::Installation => "installation",
            ResourceKind::Project => "project",
            ResourceKind::Repository => "repository",
            ResourceKind::Issue => "issue",
            ResourceKind::File => "file",
            ResourceKind::Job => "job",
        }
    }
}

impl fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// A resource to ensure, tagged by kind.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResourceDescriptor {
    /// First-run setup of a service, including its admin account.
    Installation {
        site_title: String,
        admin: Credential,
        admin_email: String,
    },
    /// A code-quality analysis project.
    Project {
        key: String,
        name: String,
        main_branch: String,
    },
    Repository {
        owner: String,
        name: String,
        default_branch: String,
    },
    /// A tracking issue, matched by exact title.
    Issue {
        owner: String,
        repo: String,
        title: String,
    },
    /// A file in a repository, matched by exact path.
    File {
        owner: String,
        repo: String,
        path: String,
        content: String,
        message: String,
    },
    /// A CI job. Without a definition the job can only be observed.
    Job {
        name: String,
        definition: Option<String>,
    },
}

impl ResourceDescriptor {
    pub fn kind(&self) -> ResourceKind {
        match self {
            ResourceDescriptor::Installation { .. } => ResourceKind::Installation,
            ResourceDescriptor::Project { .. } => ResourceKind::Project,
            ResourceDescriptor::Repository { .. } => ResourceKind::Repository,
            ResourceDescriptor::Issue { .. } => ResourceKind::Issue,
            ResourceDescriptor::File { .. } => ResourceKind::File,
            ResourceDescriptor::Job { .. } => ResourceKind::Job,
        }
    }

    /// Identifying key, used in logs and errors.
    pub fn key(&self) -> String {
        match self {
            ResourceDescriptor::Installation { site_title, .. } => site_title.clone(),
            ResourceDescriptor::Project { key, .. } => key.clone(),
            ResourceDescriptor::Repository { owner, name, .. } => format!("{owner}/{name}"),
            ResourceDescriptor::Issue { title, .. } => title.clone(),
            ResourceDescriptor::File { path, .. } => path.clone(),
            ResourceDescriptor::Job { name, .. } => name.clone(),
        }
    }
}

/// Confirmed identity of an existing resource.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceHandle {
    pub kind: ResourceKind,
    /// Service-side identifier: issue number, repository full name, file
    /// path, project key, job name.
    pub id: String,
}

impl ResourceHandle {
    pub fn new(kind: ResourceKind, id: impl Into<String>) -> Self {
        Self {
            kind,
            id: id.into(),
        }
    }
}

impl fmt::Display for ResourceHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.kind, self.id)
    }
}

/// Result of a lookup.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Presence {
    Absent,
    Present(ResourceHandle),
}

/// What [`ensure`] did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EnsureOutcome {
    Created(ResourceHandle),
    AlreadyExists(ResourceHandle),
}

impl EnsureOutcome {
    pub fn handle(&self) -> &ResourceHandle {
        match self {
            EnsureOutcome::Created(h) | EnsureOutcome::AlreadyExists(h) => h,
        }
    }

    pub fn created(&self) -> bool {
        matches!(self, EnsureOutcome::Created(_))
    }
}

/// A service that owns some resource kinds.
#[async_trait]
pub trait ResourceProvider: Service {
    /// Look the resource up by its exact key.
    async fn lookup(&self, resource: &ResourceDescriptor) -> Result<Presence>;

    /// Submit the creation. Success here is not proof of existence.
    async fn create(&self, resource: &ResourceDescriptor) -> Result<()>;
}

/// Make sure `resource` exists, creating it only when it is absent.
pub async fn ensure<P>(
    provider: &P,
    resource: &ResourceDescriptor,
    timings: &Timings,
) -> Result<EnsureOutcome>
where
    P: ResourceProvider + ?Sized,
{
    let kind = resource.kind();
    let key = resource.key();

    if let Presence::Present(handle) = provider.lookup(resource).await? {
        info!(service = %provider.name(), %kind, key = %key, "already exists, skipping");
        return Ok(EnsureOutcome::AlreadyExists(handle));
    }

    info!(service = %provider.name(), %kind, key = %key, "creating");
    provider.create(resource).await?;

    if !timings.settle.is_zero() {
        tokio::time::sleep(timings.settle).await;
    }

    let key_str = key.as_str();
    let verified = poll_until(
        &format!("{kind} '{key}' verification"),
        verification_policy(timings, kind),
        move || async move {
            match provider.lookup(resource).await? {
                Presence::Present(handle) => Ok::<_, E2eError>(Some(handle)),
                Presence::Absent => {
                    debug!(%kind, key = %key_str, "not visible yet");
                    Ok(None)
                }
            }
        },
    )
    .await;

    match verified {
        Ok(handle) => {
            info!(service = %provider.name(), %kind, key = %key, handle = %handle, "created and verified");
            Ok(EnsureOutcome::Created(handle))
        }
        Err(timeout) => Err(E2eError::ResourceCreationVerificationFailed {
            kind,
            key: key.clone(),
            elapsed: timeout.elapsed + timings.settle,
        }),
    }
}

/// Fail with [`E2eError::UnsupportedResource`] for kinds a provider does not own.
pub fn unsupported<T>(service: &str, resource: &ResourceDescriptor) -> Result<T> {
    Err(E2eError::UnsupportedResource {
        service: service.to_string(),
        kind: resource.kind(),
    })
}

/// Post-create polling for `kind`. An installation gets the longer window.
fn verification_policy(timings: &Timings, kind: ResourceKind) -> &PollPolicy {
    match kind {
        ResourceKind::Installation => &timings.installation,
        _ => &timings.verification,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;
    use std::time::Duration;

    use tokio::time::Instant;

    use crate::config::{scm_readiness, ServiceEndpoint};
    use crate::credentials::Secret;
    use crate::fakes::FakeLab;

    fn timings() -> Timings {
        Timings::default()
    }

    fn issue(title: &str) -> ResourceDescriptor {
        ResourceDescriptor::Issue {
            owner: "admin".to_string(),
            repo: "hello-world".to_string(),
            title: title.to_string(),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_present_resource_is_left_alone() {
        let lab = FakeLab::new();
        lab.seed_repository("admin", "hello-world");
        lab.seed_issue("admin", "hello-world", "deploy it");
        let scm = lab.scm();

        let outcome = ensure(&scm, &issue("deploy it"), &timings()).await.unwrap();

        assert!(!outcome.created());
        assert_eq!(lab.counters().scm_creations, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_absent_resource_is_created_and_verified() {
        let lab = FakeLab::new();
        lab.seed_repository("admin", "hello-world");
        let scm = lab.scm();

        let outcome = ensure(&scm, &issue("deploy it"), &timings()).await.unwrap();

        assert!(outcome.created());
        assert_eq!(outcome.handle().kind, ResourceKind::Issue);
        assert_eq!(lab.counters().scm_creations, 1);
        assert!(lab.issue_state("admin", "hello-world", "deploy it").is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn test_second_ensure_is_a_no_op() {
        let lab = FakeLab::new();
        lab.seed_repository("admin", "hello-world");
        let scm = lab.scm();

        let first = ensure(&scm, &issue("deploy it"), &timings()).await.unwrap();
        let second = ensure(&scm, &issue("deploy it"), &timings()).await.unwrap();

        assert!(first.created());
        assert_eq!(second, EnsureOutcome::AlreadyExists(first.handle().clone()));
        assert_eq!(lab.counters().scm_creations, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_substring_title_is_not_a_match() {
        let lab = FakeLab::new();
        lab.seed_repository("admin", "hello-world");
        lab.seed_issue("admin", "hello-world", "deploy it to nginx (old)");
        let scm = lab.scm();

        let outcome = ensure(&scm, &issue("deploy it to nginx"), &timings())
            .await
            .unwrap();

        assert!(outcome.created());
    }

    #[tokio::test(start_paused = true)]
    async fn test_silent_creation_failure_is_surfaced() {
        let lab = FakeLab::new();
        lab.seed_repository("admin", "hello-world");
        lab.drop_scm_creations(true);
        let scm = lab.scm();
        let start = tokio::time::Instant::now();

        let err = ensure(&scm, &issue("deploy it"), &timings())
            .await
            .unwrap_err();

        assert!(matches!(
            err,
            E2eError::ResourceCreationVerificationFailed {
                kind: ResourceKind::Issue,
                ..
            }
        ));
        let window = timings().settle + timings().verification.deadline;
        assert!(start.elapsed() <= window);
    }

    /// A service whose resources only show up once a restart has finished.
    struct Restarting {
        endpoint: ServiceEndpoint,
        restart: Duration,
        submitted: Mutex<Option<Instant>>,
    }

    impl Restarting {
        fn new(restart: Duration) -> Self {
            Self {
                endpoint: ServiceEndpoint::parse("gitea", "http://localhost:3000", scm_readiness())
                    .unwrap(),
                restart,
                submitted: Mutex::new(None),
            }
        }
    }

    impl Service for Restarting {
        fn endpoint(&self) -> &ServiceEndpoint {
            &self.endpoint
        }
    }

    #[async_trait]
    impl ResourceProvider for Restarting {
        async fn lookup(&self, resource: &ResourceDescriptor) -> Result<Presence> {
            let submitted = *self.submitted.lock().unwrap();
            Ok(match submitted {
                Some(at) if at.elapsed() >= self.restart => {
                    Presence::Present(ResourceHandle::new(resource.kind(), resource.key()))
                }
                _ => Presence::Absent,
            })
        }

        async fn create(&self, _resource: &ResourceDescriptor) -> Result<()> {
            *self.submitted.lock().unwrap() = Some(Instant::now());
            Ok(())
        }
    }

    fn installation() -> ResourceDescriptor {
        ResourceDescriptor::Installation {
            site_title: "hello-world".to_string(),
            admin: Credential::operator_override("admin", Secret::new("Adm1n-pass")),
            admin_email: "admin@example.com".to_string(),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_installation_outlasting_plain_verification_is_verified() {
        let scm = Restarting::new(Duration::from_secs(45));
        let start = Instant::now();

        let outcome = ensure(&scm, &installation(), &timings()).await.unwrap();

        assert!(outcome.created());
        assert!(start.elapsed() > timings().verification.deadline);
        assert!(start.elapsed() <= timings().settle + timings().installation.deadline);
    }

    #[tokio::test(start_paused = true)]
    async fn test_slow_issue_still_uses_plain_verification() {
        let scm = Restarting::new(Duration::from_secs(45));

        let err = ensure(&scm, &issue("deploy it"), &timings())
            .await
            .unwrap_err();

        assert!(matches!(
            err,
            E2eError::ResourceCreationVerificationFailed {
                kind: ResourceKind::Issue,
                ..
            }
        ));
    }

    #[test]
    fn test_descriptor_keys() {
        let repo = ResourceDescriptor::Repository {
            owner: "admin".to_string(),
            name: "hello-world".to_string(),
            default_branch: "main".to_string(),
        };
        assert_eq!(repo.kind(), ResourceKind::Repository);
        assert_eq!(repo.key(), "admin/hello-world");

        let job = ResourceDescriptor::Job {
            name: "seed-job".to_string(),
            definition: None,
        };
        assert_eq!(job.kind().to_string(), "job");
    }
}
