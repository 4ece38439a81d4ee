//! In-memory lab of fake services (testing only)
//!
//! [`FakeLab`] holds the shared state of all five services and hands out
//! handles implementing the same traits as the HTTP adapters. Knobs on the
//! lab script behaviour (slow boot, forced rotation, slow builds, lagging
//! web sync) and [`LabCounters`] records every side effect.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use url::Url;

use crate::config::{RunConfig, ServiceEndpoint};
use crate::credentials::{AuthAttempt, AuthProbe, AuthProbeOutcome, AuthStrategy, Credential, PasswordRotation, Secret};
use crate::ensure::{unsupported, Presence, ResourceDescriptor, ResourceHandle, ResourceKind, ResourceProvider};
use crate::error::{E2eError, Result};
use crate::orchestrator::Services;
use crate::pipeline::{BuildControl, BuildSnapshot, BuildStatus, Confirmation, JobRef, TriggerOutcome};
use crate::propagation::{AccessPath, ContentFetcher, FetchedContent};
use crate::readiness::{StatusProbe, StatusResponse};
use crate::services::{IssueState, IssueTracker, Service};

/// Page the web server shows before the first sync.
pub const NGINX_WELCOME: &str = "<html><body><h1>Welcome to nginx!</h1></body></html>";

/// Side-effect counters.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LabCounters {
    pub quality_status_calls: u32,
    pub quality_auth_probes: u32,
    pub quality_rotation_checks: u32,
    pub quality_password_change_attempts: u32,
    pub quality_password_changes: u32,
    pub quality_creations: u32,
    /// Every call made to the source-control service.
    pub scm_calls: u32,
    pub scm_creations: u32,
    pub scm_issue_closes: u32,
    pub ci_triggers: u32,
    pub ci_acknowledgements: u32,
    pub ci_creations: u32,
    pub content_fetches: u32,
}

#[derive(Debug, Clone)]
struct FakeIssue {
    owner: String,
    repo: String,
    number: u64,
    title: String,
    state: IssueState,
}

#[derive(Debug, Clone)]
struct FakeBuild {
    number: u64,
    status: BuildStatus,
    polls_left: u32,
}

#[derive(Debug, Clone)]
struct ServedContent {
    body: String,
    /// Fetches answered with `fallback` before `body` becomes visible.
    hidden_fetches: u32,
    fallback: Option<String>,
    fetches: u32,
}

/// A pipeline job that uploads a repository file to the artifact store.
#[derive(Debug, Clone)]
struct PublishRule {
    job: String,
    source: (String, String, String),
    artifact_url: String,
    web_url: String,
    web_sync_fetches: u32,
}

#[derive(Debug)]
struct LabState {
    counters: LabCounters,

    quality_boot_calls: u32,
    quality_unreachable: bool,
    quality_password: String,
    quality_rotation_required: bool,
    quality_keep_demanding_rotation: bool,
    quality_refuse_session_cookie: bool,
    projects: BTreeSet<String>,

    scm_admin: Option<(String, String)>,
    repositories: BTreeSet<(String, String)>,
    issues: Vec<FakeIssue>,
    files: BTreeMap<(String, String, String), String>,
    drop_scm_creations: bool,

    ci_admin: (String, String),
    jobs: BTreeMap<String, Vec<FakeBuild>>,
    build_duration_polls: u32,
    build_outcome: BuildStatus,
    require_confirmation: bool,
    ignore_acknowledgements: bool,
    generates: BTreeMap<String, String>,
    publish: Option<PublishRule>,

    content: BTreeMap<String, ServedContent>,
}

impl LabState {
    fn new(config: &RunConfig) -> Self {
        Self {
            counters: LabCounters::default(),
            quality_boot_calls: 0,
            quality_unreachable: false,
            quality_password: config.quality.default_secret.expose().to_string(),
            quality_rotation_required: false,
            quality_keep_demanding_rotation: false,
            quality_refuse_session_cookie: false,
            projects: BTreeSet::new(),
            scm_admin: None,
            repositories: BTreeSet::new(),
            issues: Vec::new(),
            files: BTreeMap::new(),
            drop_scm_creations: false,
            ci_admin: (
                config.ci.admin_user.clone(),
                config.ci.admin_secret.expose().to_string(),
            ),
            jobs: BTreeMap::new(),
            build_duration_polls: 1,
            build_outcome: BuildStatus::Success,
            require_confirmation: false,
            ignore_acknowledgements: false,
            generates: BTreeMap::new(),
            publish: None,
            content: BTreeMap::new(),
        }
    }

    fn serve(&mut self, url: &str, body: &str, hidden_fetches: u32) {
        let fallback = self.content.get(url).map(|served| served.body.clone());
        self.content.insert(
            url.to_string(),
            ServedContent {
                body: body.to_string(),
                hidden_fetches,
                fallback,
                fetches: 0,
            },
        );
    }

    fn queue_build(&mut self, job: &str) {
        let polls = self.build_duration_polls;
        if let Some(builds) = self.jobs.get_mut(job) {
            let number = builds.last().map(|b| b.number).unwrap_or(0) + 1;
            builds.push(FakeBuild {
                number,
                status: BuildStatus::Running,
                polls_left: polls,
            });
        }
    }

    /// Effects of a finished build; may turn a success into a failure when
    /// the pipeline has nothing to publish.
    fn finish_build(&mut self, job: &str, status: BuildStatus) -> BuildStatus {
        if status != BuildStatus::Success {
            return status;
        }
        if let Some(generated) = self.generates.get(job).cloned() {
            self.jobs.entry(generated).or_default();
        }
        let Some(rule) = self.publish.clone().filter(|rule| rule.job == job) else {
            return status;
        };
        let Some(body) = self.files.get(&rule.source).cloned() else {
            return BuildStatus::Failure;
        };
        self.serve(&rule.artifact_url, &body, 0);
        self.serve(&rule.web_url, &body, rule.web_sync_fetches);
        status
    }
}

/// Endpoints handed to the fake services.
#[derive(Debug, Clone)]
struct LabEndpoints {
    quality: ServiceEndpoint,
    scm: ServiceEndpoint,
    ci: ServiceEndpoint,
    artifact_store: ServiceEndpoint,
    web_server: ServiceEndpoint,
}

/// Shared state of the fake services.
#[derive(Debug, Clone)]
pub struct FakeLab {
    state: Arc<Mutex<LabState>>,
    endpoints: LabEndpoints,
}

impl Default for FakeLab {
    fn default() -> Self {
        Self::new()
    }
}

impl FakeLab {
    /// Bare lab on the default endpoints: nothing provisioned, no jobs.
    pub fn new() -> Self {
        Self::for_config(&RunConfig::with_defaults().unwrap())
    }

    /// Bare lab matching `config`'s endpoints and factory credentials.
    pub fn for_config(config: &RunConfig) -> Self {
        Self {
            state: Arc::new(Mutex::new(LabState::new(config))),
            endpoints: LabEndpoints {
                quality: config.quality.endpoint.clone(),
                scm: config.scm.endpoint.clone(),
                ci: config.ci.endpoint.clone(),
                artifact_store: config.artifact_store.clone(),
                web_server: config.web_server.clone(),
            },
        }
    }

    /// A freshly started deployment: the CI server ships the seed job, the
    /// seed job generates the pipeline job, the pipeline publishes the index
    /// file to the artifact store and the web server syncs it two fetches
    /// later.
    pub fn deployment(config: &RunConfig) -> Self {
        let lab = Self::for_config(config);
        lab.seed_job(&config.ci.seed_job);
        lab.seed_generates(&config.ci.seed_job, &config.ci.pipeline_job);
        {
            let mut state = lab.state();
            state.publish = Some(PublishRule {
                job: config.ci.pipeline_job.clone(),
                source: (
                    config.scm.admin_user.clone(),
                    config.scm.repository.clone(),
                    config.index_file.path.clone(),
                ),
                artifact_url: config.artifact_url().unwrap().to_string(),
                web_url: config.web_server.base_url.to_string(),
                web_sync_fetches: 2,
            });
            let web_url = config.web_server.base_url.to_string();
            state.serve(&web_url, NGINX_WELCOME, 0);
        }
        lab
    }

    fn state(&self) -> MutexGuard<'_, LabState> {
        self.state.lock().unwrap()
    }

    pub fn counters(&self) -> LabCounters {
        self.state().counters.clone()
    }

    pub fn quality(&self) -> FakeQuality {
        FakeQuality {
            endpoint: self.endpoints.quality.clone(),
            state: self.state.clone(),
        }
    }

    pub fn scm(&self) -> FakeScm {
        FakeScm {
            endpoint: self.endpoints.scm.clone(),
            state: self.state.clone(),
        }
    }

    pub fn ci(&self) -> FakeCi {
        FakeCi {
            endpoint: self.endpoints.ci.clone(),
            state: self.state.clone(),
        }
    }

    pub fn artifact_store(&self) -> FakeContentServer {
        FakeContentServer {
            endpoint: self.endpoints.artifact_store.clone(),
            state: self.state.clone(),
        }
    }

    pub fn web_server(&self) -> FakeContentServer {
        FakeContentServer {
            endpoint: self.endpoints.web_server.clone(),
            state: self.state.clone(),
        }
    }

    /// Handles for every service, ready for an orchestrator.
    pub fn services(&self) -> Services {
        Services {
            quality: Arc::new(self.quality()),
            scm: Arc::new(self.scm()),
            ci: Arc::new(self.ci()),
            artifact_store: Arc::new(self.artifact_store()),
            web_server: Arc::new(self.web_server()),
        }
    }

    // -- code quality -------------------------------------------------------

    /// The status endpoint answers "not ready" for the first `calls` calls.
    pub fn quality_boots_after(&self, calls: u32) {
        self.state().quality_boot_calls = calls;
    }

    pub fn set_quality_password(&self, password: &str) {
        self.state().quality_password = password.to_string();
    }

    pub fn set_quality_unreachable(&self, unreachable: bool) {
        self.state().quality_unreachable = unreachable;
    }

    pub fn require_quality_rotation(&self, required: bool) {
        self.state().quality_rotation_required = required;
    }

    /// Keep reporting a pending rotation after the password was changed.
    pub fn keep_demanding_rotation(&self, keep: bool) {
        self.state().quality_keep_demanding_rotation = keep;
    }

    pub fn refuse_session_cookie_for_password_change(&self, refuse: bool) {
        self.state().quality_refuse_session_cookie = refuse;
    }

    pub fn quality_password(&self) -> String {
        self.state().quality_password.clone()
    }

    pub fn has_project(&self, key: &str) -> bool {
        self.state().projects.contains(key)
    }

    // -- source control -----------------------------------------------------

    /// Mark the service as installed with `admin` as its administrator.
    pub fn seed_installation(&self, admin: &str, password: &str) {
        self.state().scm_admin = Some((admin.to_string(), password.to_string()));
    }

    pub fn seed_repository(&self, owner: &str, name: &str) {
        self.state()
            .repositories
            .insert((owner.to_string(), name.to_string()));
    }

    pub fn seed_issue(&self, owner: &str, repo: &str, title: &str) {
        let mut state = self.state();
        let number = state.issues.len() as u64 + 1;
        state.issues.push(FakeIssue {
            owner: owner.to_string(),
            repo: repo.to_string(),
            number,
            title: title.to_string(),
            state: IssueState::Open,
        });
    }

    pub fn seed_file(&self, owner: &str, repo: &str, path: &str, content: &str) {
        self.state().files.insert(
            (owner.to_string(), repo.to_string(), path.to_string()),
            content.to_string(),
        );
    }

    /// Accept creation requests without creating anything.
    pub fn drop_scm_creations(&self, drop: bool) {
        self.state().drop_scm_creations = drop;
    }

    pub fn is_installed(&self) -> bool {
        self.state().scm_admin.is_some()
    }

    pub fn issue_state(&self, owner: &str, repo: &str, title: &str) -> Option<IssueState> {
        self.state()
            .issues
            .iter()
            .find(|i| i.owner == owner && i.repo == repo && i.title == title)
            .map(|i| i.state)
    }

    pub fn issue_count(&self) -> usize {
        self.state().issues.len()
    }

    pub fn file(&self, owner: &str, repo: &str, path: &str) -> Option<String> {
        self.state()
            .files
            .get(&(owner.to_string(), repo.to_string(), path.to_string()))
            .cloned()
    }

    // -- CI -----------------------------------------------------------------

    pub fn seed_job(&self, name: &str) {
        self.state().jobs.entry(name.to_string()).or_default();
    }

    pub fn seed_finished_build(&self, job: &str, number: u64, status: BuildStatus) {
        self.state()
            .jobs
            .entry(job.to_string())
            .or_default()
            .push(FakeBuild {
                number,
                status,
                polls_left: 0,
            });
    }

    /// A successful build of `seed` creates job `generated`.
    pub fn seed_generates(&self, seed: &str, generated: &str) {
        self.state()
            .generates
            .insert(seed.to_string(), generated.to_string());
    }

    /// Number of `latest_build` polls a triggered build stays running.
    pub fn set_build_duration_polls(&self, polls: u32) {
        self.state().build_duration_polls = polls;
    }

    pub fn set_build_outcome(&self, status: BuildStatus) {
        self.state().build_outcome = status;
    }

    pub fn require_build_confirmation(&self, required: bool) {
        self.state().require_confirmation = required;
    }

    /// Keep asking for confirmation after it was acknowledged.
    pub fn ignore_acknowledgements(&self, ignore: bool) {
        self.state().ignore_acknowledgements = ignore;
    }

    pub fn job_exists(&self, name: &str) -> bool {
        self.state().jobs.contains_key(name)
    }

    pub fn build_count(&self, job: &str) -> usize {
        self.state().jobs.get(job).map(Vec::len).unwrap_or(0)
    }

    // -- content ------------------------------------------------------------

    /// Serve `body` at `url` after `hidden_fetches` fetches that see the
    /// previous content (or a 404).
    pub fn serve_after(&self, url: &str, body: &str, hidden_fetches: u32) {
        self.state().serve(url, body, hidden_fetches);
    }
}

fn not_found(service: &str, what: &str) -> E2eError {
    E2eError::UnexpectedResponse {
        service: service.to_string(),
        status: 404,
        body: format!("{what} not found"),
    }
}

// ---------------------------------------------------------------------------
// FakeQuality
// ---------------------------------------------------------------------------

/// Code-quality service handle.
#[derive(Debug, Clone)]
pub struct FakeQuality {
    endpoint: ServiceEndpoint,
    state: Arc<Mutex<LabState>>,
}

impl Service for FakeQuality {
    fn endpoint(&self) -> &ServiceEndpoint {
        &self.endpoint
    }
}

#[async_trait]
impl StatusProbe for FakeQuality {
    async fn fetch_status(&self) -> Result<StatusResponse> {
        let mut state = self.state.lock().unwrap();
        state.counters.quality_status_calls += 1;
        let calls = state.counters.quality_status_calls;
        if state.quality_unreachable || (calls == 1 && state.quality_boot_calls > 0) {
            return Err(E2eError::UnexpectedResponse {
                service: self.name().to_string(),
                status: 502,
                body: "connection refused".to_string(),
            });
        }
        let status = if calls <= state.quality_boot_calls {
            "STARTING"
        } else {
            "UP"
        };
        Ok(StatusResponse {
            status: 200,
            body: format!(r#"{{"id":"fake","version":"10.4","status":"{status}"}}"#),
        })
    }
}

#[async_trait]
impl AuthProbe for FakeQuality {
    async fn probe(&self, credential: &Credential) -> AuthProbeOutcome {
        let mut state = self.state.lock().unwrap();
        state.counters.quality_auth_probes += 1;
        if state.quality_unreachable {
            return AuthProbeOutcome::Unreachable("connection refused".to_string());
        }
        if credential.secret.expose() == state.quality_password {
            AuthProbeOutcome::Accepted
        } else {
            AuthProbeOutcome::Rejected
        }
    }

    async fn adopt(&self, credential: &Credential) -> Result<()> {
        let state = self.state.lock().unwrap();
        if credential.secret.expose() != state.quality_password {
            return Err(E2eError::UnexpectedResponse {
                service: self.name().to_string(),
                status: 401,
                body: "authentication failed".to_string(),
            });
        }
        Ok(())
    }
}

#[async_trait]
impl PasswordRotation for FakeQuality {
    async fn rotation_required(&self, _current: &Credential) -> Result<bool> {
        let mut state = self.state.lock().unwrap();
        state.counters.quality_rotation_checks += 1;
        Ok(state.quality_rotation_required)
    }

    async fn change_password(
        &self,
        strategy: AuthStrategy,
        current: &Credential,
        new_secret: &Secret,
    ) -> Result<AuthAttempt> {
        let mut state = self.state.lock().unwrap();
        state.counters.quality_password_change_attempts += 1;
        if strategy == AuthStrategy::SessionCookie && state.quality_refuse_session_cookie {
            return Ok(AuthAttempt::Unauthorized);
        }
        if current.secret.expose() != state.quality_password {
            return Ok(AuthAttempt::Rejected {
                status: 400,
                body: "old password is incorrect".to_string(),
            });
        }
        if new_secret.expose() == current.secret.expose() {
            return Ok(AuthAttempt::Rejected {
                status: 400,
                body: "new password must be different".to_string(),
            });
        }
        state.quality_password = new_secret.expose().to_string();
        state.quality_rotation_required = state.quality_keep_demanding_rotation;
        state.counters.quality_password_changes += 1;
        Ok(AuthAttempt::Accepted)
    }
}

#[async_trait]
impl ResourceProvider for FakeQuality {
    async fn lookup(&self, resource: &ResourceDescriptor) -> Result<Presence> {
        let ResourceDescriptor::Project { key, .. } = resource else {
            return unsupported(self.name(), resource);
        };
        let state = self.state.lock().unwrap();
        Ok(if state.projects.contains(key) {
            Presence::Present(ResourceHandle::new(ResourceKind::Project, key.as_str()))
        } else {
            Presence::Absent
        })
    }

    async fn create(&self, resource: &ResourceDescriptor) -> Result<()> {
        let ResourceDescriptor::Project { key, .. } = resource else {
            return unsupported(self.name(), resource);
        };
        let mut state = self.state.lock().unwrap();
        state.counters.quality_creations += 1;
        state.projects.insert(key.clone());
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// FakeScm
// ---------------------------------------------------------------------------

/// Source-control service handle.
#[derive(Debug, Clone)]
pub struct FakeScm {
    endpoint: ServiceEndpoint,
    state: Arc<Mutex<LabState>>,
}

impl FakeScm {
    fn lock(&self) -> MutexGuard<'_, LabState> {
        let mut state = self.state.lock().unwrap();
        state.counters.scm_calls += 1;
        state
    }

    fn issue_index(state: &LabState, handle: &ResourceHandle) -> Option<usize> {
        let (repo, number) = handle.id.rsplit_once('#')?;
        let (owner, repo) = repo.split_once('/')?;
        let number: u64 = number.parse().ok()?;
        state
            .issues
            .iter()
            .position(|i| i.owner == owner && i.repo == repo && i.number == number)
    }
}

impl Service for FakeScm {
    fn endpoint(&self) -> &ServiceEndpoint {
        &self.endpoint
    }
}

#[async_trait]
impl StatusProbe for FakeScm {
    async fn fetch_status(&self) -> Result<StatusResponse> {
        let state = self.lock();
        Ok(if state.scm_admin.is_some() {
            StatusResponse {
                status: 200,
                body: "<title>hello-world</title>".to_string(),
            }
        } else {
            StatusResponse {
                status: 200,
                body: r#"<form action="/install" method="post"></form>"#.to_string(),
            }
        })
    }
}

#[async_trait]
impl AuthProbe for FakeScm {
    async fn probe(&self, credential: &Credential) -> AuthProbeOutcome {
        let state = self.lock();
        match &state.scm_admin {
            Some((user, pass)) if *user == credential.principal && pass == credential.secret.expose() => {
                AuthProbeOutcome::Accepted
            }
            _ => AuthProbeOutcome::Rejected,
        }
    }

    async fn adopt(&self, _credential: &Credential) -> Result<()> {
        drop(self.lock());
        Ok(())
    }
}

#[async_trait]
impl ResourceProvider for FakeScm {
    async fn lookup(&self, resource: &ResourceDescriptor) -> Result<Presence> {
        let state = self.lock();
        let handle = match resource {
            ResourceDescriptor::Installation { .. } => state
                .scm_admin
                .as_ref()
                .map(|_| ResourceHandle::new(ResourceKind::Installation, self.endpoint.base_url.as_str())),
            ResourceDescriptor::Repository { owner, name, .. } => state
                .repositories
                .contains(&(owner.clone(), name.clone()))
                .then(|| ResourceHandle::new(ResourceKind::Repository, format!("{owner}/{name}"))),
            ResourceDescriptor::Issue { owner, repo, title } => state
                .issues
                .iter()
                .find(|i| i.owner == *owner && i.repo == *repo && i.title == *title)
                .map(|i| ResourceHandle::new(ResourceKind::Issue, format!("{owner}/{repo}#{}", i.number))),
            ResourceDescriptor::File {
                owner, repo, path, ..
            } => state
                .files
                .contains_key(&(owner.clone(), repo.clone(), path.clone()))
                .then(|| ResourceHandle::new(ResourceKind::File, path.as_str())),
            ResourceDescriptor::Project { .. } | ResourceDescriptor::Job { .. } => {
                return unsupported(self.name(), resource)
            }
        };
        Ok(handle.map(Presence::Present).unwrap_or(Presence::Absent))
    }

    async fn create(&self, resource: &ResourceDescriptor) -> Result<()> {
        let mut state = self.lock();
        if matches!(
            resource,
            ResourceDescriptor::Project { .. } | ResourceDescriptor::Job { .. }
        ) {
            return unsupported(self.name(), resource);
        }
        state.counters.scm_creations += 1;
        if state.drop_scm_creations {
            return Ok(());
        }
        match resource {
            ResourceDescriptor::Installation { admin, .. } => {
                state.scm_admin = Some((admin.principal.clone(), admin.secret.expose().to_string()));
            }
            ResourceDescriptor::Repository { owner, name, .. } => {
                state.repositories.insert((owner.clone(), name.clone()));
            }
            ResourceDescriptor::Issue { owner, repo, title } => {
                if !state.repositories.contains(&(owner.clone(), repo.clone())) {
                    return Err(not_found(self.name(), "repository"));
                }
                let number = state.issues.len() as u64 + 1;
                state.issues.push(FakeIssue {
                    owner: owner.clone(),
                    repo: repo.clone(),
                    number,
                    title: title.clone(),
                    state: IssueState::Open,
                });
            }
            ResourceDescriptor::File {
                owner,
                repo,
                path,
                content,
                ..
            } => {
                if !state.repositories.contains(&(owner.clone(), repo.clone())) {
                    return Err(not_found(self.name(), "repository"));
                }
                state
                    .files
                    .insert((owner.clone(), repo.clone(), path.clone()), content.clone());
            }
            ResourceDescriptor::Project { .. } | ResourceDescriptor::Job { .. } => {}
        }
        Ok(())
    }
}

#[async_trait]
impl IssueTracker for FakeScm {
    async fn close_issue(&self, issue: &ResourceHandle) -> Result<()> {
        let mut state = self.lock();
        let index = Self::issue_index(&state, issue).ok_or_else(|| not_found(self.name(), "issue"))?;
        state.issues[index].state = IssueState::Closed;
        state.counters.scm_issue_closes += 1;
        Ok(())
    }

    async fn issue_state(&self, issue: &ResourceHandle) -> Result<IssueState> {
        let state = self.lock();
        let index = Self::issue_index(&state, issue).ok_or_else(|| not_found(self.name(), "issue"))?;
        Ok(state.issues[index].state)
    }
}

// ---------------------------------------------------------------------------
// FakeCi
// ---------------------------------------------------------------------------

/// CI server handle.
#[derive(Debug, Clone)]
pub struct FakeCi {
    endpoint: ServiceEndpoint,
    state: Arc<Mutex<LabState>>,
}

impl Service for FakeCi {
    fn endpoint(&self) -> &ServiceEndpoint {
        &self.endpoint
    }
}

#[async_trait]
impl StatusProbe for FakeCi {
    async fn fetch_status(&self) -> Result<StatusResponse> {
        Ok(StatusResponse {
            status: 200,
            body: "<form name=\"login\"></form>".to_string(),
        })
    }
}

#[async_trait]
impl AuthProbe for FakeCi {
    async fn probe(&self, credential: &Credential) -> AuthProbeOutcome {
        let state = self.state.lock().unwrap();
        let (user, pass) = &state.ci_admin;
        if *user == credential.principal && pass == credential.secret.expose() {
            AuthProbeOutcome::Accepted
        } else {
            AuthProbeOutcome::Rejected
        }
    }

    async fn adopt(&self, _credential: &Credential) -> Result<()> {
        Ok(())
    }
}

#[async_trait]
impl ResourceProvider for FakeCi {
    async fn lookup(&self, resource: &ResourceDescriptor) -> Result<Presence> {
        let ResourceDescriptor::Job { name, .. } = resource else {
            return unsupported(self.name(), resource);
        };
        let state = self.state.lock().unwrap();
        Ok(if state.jobs.contains_key(name) {
            Presence::Present(ResourceHandle::new(ResourceKind::Job, name.as_str()))
        } else {
            Presence::Absent
        })
    }

    async fn create(&self, resource: &ResourceDescriptor) -> Result<()> {
        let ResourceDescriptor::Job { name, definition } = resource else {
            return unsupported(self.name(), resource);
        };
        if definition.is_none() {
            return Err(E2eError::ResourceCreationFailed {
                kind: ResourceKind::Job,
                key: name.clone(),
                reason: "no job definition configured".to_string(),
            });
        }
        let mut state = self.state.lock().unwrap();
        state.counters.ci_creations += 1;
        state.jobs.entry(name.clone()).or_default();
        Ok(())
    }
}

#[async_trait]
impl BuildControl for FakeCi {
    async fn job_exists(&self, job: &str) -> Result<bool> {
        Ok(self.state.lock().unwrap().jobs.contains_key(job))
    }

    async fn latest_build(&self, job: &str) -> Result<Option<BuildSnapshot>> {
        let mut state = self.state.lock().unwrap();
        let outcome = state.build_outcome;
        let Some(build) = state.jobs.get_mut(job).and_then(|builds| builds.last_mut()) else {
            return Ok(None);
        };
        if build.status != BuildStatus::Running {
            return Ok(Some(BuildSnapshot {
                number: build.number,
                status: build.status,
            }));
        }
        build.polls_left = build.polls_left.saturating_sub(1);
        if build.polls_left > 0 {
            return Ok(Some(BuildSnapshot {
                number: build.number,
                status: BuildStatus::Running,
            }));
        }

        let number = build.number;
        let status = state.finish_build(job, outcome);
        if let Some(build) = state.jobs.get_mut(job).and_then(|builds| builds.last_mut()) {
            build.status = status;
        }
        Ok(Some(BuildSnapshot { number, status }))
    }

    async fn trigger(&self, job: &JobRef) -> Result<TriggerOutcome> {
        let mut state = self.state.lock().unwrap();
        if !state.jobs.contains_key(&job.name) {
            return Err(not_found(self.name(), "job"));
        }
        state.counters.ci_triggers += 1;
        if state.require_confirmation {
            return Ok(TriggerOutcome::ConfirmationRequired(Confirmation {
                description: "proceed".to_string(),
            }));
        }
        state.queue_build(&job.name);
        Ok(TriggerOutcome::Queued)
    }

    async fn acknowledge(&self, job: &JobRef, confirmation: &Confirmation) -> Result<TriggerOutcome> {
        let mut state = self.state.lock().unwrap();
        state.counters.ci_acknowledgements += 1;
        if state.ignore_acknowledgements {
            return Ok(TriggerOutcome::ConfirmationRequired(confirmation.clone()));
        }
        state.queue_build(&job.name);
        Ok(TriggerOutcome::Queued)
    }
}

// ---------------------------------------------------------------------------
// FakeContentServer
// ---------------------------------------------------------------------------

/// Artifact store or web server handle. Both read the lab's content table,
/// keyed by absolute URL.
#[derive(Debug, Clone)]
pub struct FakeContentServer {
    endpoint: ServiceEndpoint,
    state: Arc<Mutex<LabState>>,
}

impl Service for FakeContentServer {
    fn endpoint(&self) -> &ServiceEndpoint {
        &self.endpoint
    }
}

#[async_trait]
impl StatusProbe for FakeContentServer {
    async fn fetch_status(&self) -> Result<StatusResponse> {
        Ok(StatusResponse {
            status: 200,
            body: String::new(),
        })
    }
}

#[async_trait]
impl ContentFetcher for FakeContentServer {
    async fn fetch(&self, target: &Url, _access: AccessPath) -> Result<FetchedContent> {
        let mut state = self.state.lock().unwrap();
        state.counters.content_fetches += 1;
        let Some(served) = state.content.get_mut(target.as_str()) else {
            return Ok(FetchedContent {
                status: 404,
                body: "Not Found".to_string(),
            });
        };
        served.fetches += 1;
        if served.fetches > served.hidden_fetches {
            return Ok(FetchedContent {
                status: 200,
                body: served.body.clone(),
            });
        }
        Ok(match &served.fallback {
            Some(previous) => FetchedContent {
                status: 200,
                body: previous.clone(),
            },
            None => FetchedContent {
                status: 404,
                body: "Not Found".to_string(),
            },
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_publish_requires_index_file() {
        let config = RunConfig::with_defaults().unwrap();
        let lab = FakeLab::deployment(&config);
        lab.seed_job(&config.ci.pipeline_job);
        let ci = lab.ci();

        ci.trigger(&JobRef::plain(&config.ci.pipeline_job)).await.unwrap();
        let build = ci.latest_build(&config.ci.pipeline_job).await.unwrap().unwrap();

        assert_eq!(build.status, BuildStatus::Failure);
    }

    #[tokio::test]
    async fn test_web_server_lags_behind_artifact_store() {
        let config = RunConfig::with_defaults().unwrap();
        let lab = FakeLab::deployment(&config);
        lab.seed_job(&config.ci.pipeline_job);
        lab.seed_file("admin", "hello-world", "index.html", "<h1>hello world</h1>");
        let ci = lab.ci();
        ci.trigger(&JobRef::plain(&config.ci.pipeline_job)).await.unwrap();
        ci.latest_build(&config.ci.pipeline_job).await.unwrap();

        let artifact = lab
            .artifact_store()
            .fetch(&config.artifact_url().unwrap(), AccessPath::Raw)
            .await
            .unwrap();
        assert_eq!(artifact.body, "<h1>hello world</h1>");

        let web = lab.web_server();
        let first = web
            .fetch(&config.web_server.base_url, AccessPath::Browser)
            .await
            .unwrap();
        assert_eq!(first.body, NGINX_WELCOME);
        web.fetch(&config.web_server.base_url, AccessPath::Browser)
            .await
            .unwrap();
        let third = web
            .fetch(&config.web_server.base_url, AccessPath::Browser)
            .await
            .unwrap();
        assert_eq!(third.body, "<h1>hello world</h1>");
    }

    #[tokio::test]
    async fn test_close_issue_is_idempotent() {
        let lab = FakeLab::new();
        lab.seed_repository("admin", "hello-world");
        lab.seed_issue("admin", "hello-world", "deploy it");
        let scm = lab.scm();
        let handle = ResourceHandle::new(ResourceKind::Issue, "admin/hello-world#1");

        scm.close_issue(&handle).await.unwrap();
        scm.close_issue(&handle).await.unwrap();

        assert_eq!(scm.issue_state(&handle).await.unwrap(), IssueState::Closed);
    }
}
