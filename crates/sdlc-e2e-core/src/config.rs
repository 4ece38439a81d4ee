//! Run configuration.
//!
//! A [`RunConfig`] is assembled once at startup (the CLI builds it from flags
//! and environment variables) and handed to every component by reference.
//! Nothing below this module reads the process environment.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use url::Url;

use crate::credentials::{Credential, Secret};
use crate::error::{E2eError, Result};
use crate::poll::{duration_secs, PollPolicy};

/// Baked-in defaults; each one can be overridden by the caller.
pub mod defaults {
    pub const GITEA_URL: &str = "http://localhost:3000";
    pub const JENKINS_URL: &str = "http://localhost:8080";
    pub const NEXUS_URL: &str = "http://localhost:8081";
    pub const NGINX_URL: &str = "http://localhost:8088";
    pub const SONAR_URL: &str = "http://localhost:9000";

    pub const GITEA_ADMIN_USER: &str = "admin";
    pub const GITEA_ADMIN_PASS: &str = "admin123!";
    pub const GITEA_ADMIN_EMAIL: &str = "admin@example.com";
    pub const GITEA_SITE_TITLE: &str = "hello-world";
    pub const GITEA_REPO: &str = "hello-world";
    pub const DEFAULT_BRANCH: &str = "main";
    pub const ISSUE_TITLE: &str = "create hello-world app and deploy it to nginx";

    pub const SONAR_ADMIN_USER: &str = "admin";
    pub const SONAR_ADMIN_PASS: &str = "admin";
    pub const SONAR_PROJECT_KEY: &str = "hello-world";
    pub const SONAR_PROJECT_NAME: &str = "hello-world";

    pub const JENKINS_ADMIN_USER: &str = "admin";
    pub const JENKINS_ADMIN_PASS: &str = "admin";
    pub const SEED_JOB: &str = "seed-job";
    pub const PIPELINE_JOB: &str = "hello-world";

    pub const NEXUS_ARTIFACT_PATH: &str = "repository/web/hello-world/index.html";
    pub const EXPECTED_TEXT: &str = "hello world";

    pub const INDEX_FILE: &str = "index.html";
    pub const INDEX_HTML: &str = "<html><body><h1>hello world</h1></body></html>";
    pub const PIPELINE_FILE: &str = "Jenkinsfile";
    pub const JENKINSFILE: &str = "pipeline { agent any; stages { stage('Publish to Nexus') { steps { sh 'PASS=$(cat /nexus-data/admin.password) && curl -fsS -u admin:$PASS --upload-file index.html http://nexus:8081/repository/web/hello-world/index.html' } } } }";

    pub const RUN_TIMEOUT_SECS: u64 = 600;
}

/// How readiness is judged from a status response.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "rule", rename_all = "snake_case")]
pub enum ReadyRule {
    /// Any HTTP response means the service is accepting requests.
    AnyResponse,
    /// A 2xx response.
    SuccessStatus,
    /// A 2xx JSON body whose `field` is one of `accepted`.
    JsonFieldIn {
        field: String,
        accepted: Vec<String>,
    },
}

impl ReadyRule {
    /// Evaluate the rule against a status response.
    pub fn is_ready(&self, status: u16, body: &str) -> bool {
        match self {
            ReadyRule::AnyResponse => true,
            ReadyRule::SuccessStatus => (200..300).contains(&status),
            ReadyRule::JsonFieldIn { field, accepted } => {
                if !(200..300).contains(&status) {
                    return false;
                }
                serde_json::from_str::<serde_json::Value>(body)
                    .ok()
                    .and_then(|v| v.get(field).and_then(|f| f.as_str()).map(str::to_owned))
                    .map(|value| accepted.iter().any(|a| *a == value))
                    .unwrap_or(false)
            }
        }
    }
}

/// Where and how to check that a service is up.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReadinessCheck {
    pub path: String,
    pub rule: ReadyRule,
}

impl ReadinessCheck {
    pub fn new(path: &str, rule: ReadyRule) -> Self {
        Self {
            path: path.to_string(),
            rule,
        }
    }
}

/// A named external service.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceEndpoint {
    pub name: String,
    pub base_url: Url,
    pub readiness: ReadinessCheck,
}

impl ServiceEndpoint {
    /// Parse `base_url` and build an endpoint.
    pub fn parse(name: &str, base_url: &str, readiness: ReadinessCheck) -> Result<Self> {
        let mut base_url = Url::parse(base_url)
            .map_err(|e| E2eError::Config(format!("invalid {name} URL '{base_url}': {e}")))?;
        // Url::join treats a base without a trailing slash as a file.
        if !base_url.path().ends_with('/') {
            let path = format!("{}/", base_url.path());
            base_url.set_path(&path);
        }
        Ok(Self {
            name: name.to_string(),
            base_url,
            readiness,
        })
    }

    /// Resolve a path relative to the service root.
    pub fn url(&self, path: &str) -> Result<Url> {
        self.base_url
            .join(path.trim_start_matches('/'))
            .map_err(|e| E2eError::Config(format!("invalid {} path '{path}': {e}", self.name)))
    }

    /// URL of the readiness check.
    pub fn readiness_url(&self) -> Result<Url> {
        self.url(&self.readiness.path)
    }
}

/// Poll policies for every wait in the run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Timings {
    pub readiness: PollPolicy,
    pub verification: PollPolicy,
    /// Verification of a first-run installation, which restarts the service.
    pub installation: PollPolicy,
    pub build: PollPolicy,
    pub job_appearance: PollPolicy,
    pub propagation: PollPolicy,

    /// Pause after a state-changing action before the first verification lookup.
    #[serde(with = "duration_secs")]
    pub settle: Duration,

    /// Upper bound for any single HTTP request.
    #[serde(with = "duration_secs")]
    pub request_timeout: Duration,
}

impl Default for Timings {
    fn default() -> Self {
        Self {
            readiness: PollPolicy::from_secs(2, 180),
            verification: PollPolicy::from_secs(1, 30),
            installation: PollPolicy::from_secs(2, 120),
            build: PollPolicy::from_secs(5, 180),
            job_appearance: PollPolicy::from_secs(5, 120),
            propagation: PollPolicy::from_secs(5, 120),
            settle: Duration::from_secs(1),
            request_timeout: Duration::from_secs(30),
        }
    }
}

/// Code-quality service settings.
#[derive(Debug, Clone, Serialize)]
pub struct QualitySettings {
    pub endpoint: ServiceEndpoint,
    pub admin_user: String,
    /// The product's factory password.
    pub default_secret: Secret,
    /// Operator-supplied password, used when the default was rotated away
    /// or must be rotated.
    pub new_secret: Option<Secret>,
    pub project_key: String,
    pub project_name: String,
    pub main_branch: String,
}

impl QualitySettings {
    /// Candidates in priority order: known default, then override.
    pub fn candidates(&self) -> Vec<Credential> {
        let mut candidates = vec![Credential::known_default(
            &self.admin_user,
            self.default_secret.clone(),
        )];
        if let Some(secret) = &self.new_secret {
            candidates.push(Credential::operator_override(&self.admin_user, secret.clone()));
        }
        candidates
    }
}

/// Source-control service settings.
#[derive(Debug, Clone, Serialize)]
pub struct ScmSettings {
    pub endpoint: ServiceEndpoint,
    pub admin_user: String,
    pub admin_secret: Secret,
    pub admin_email: String,
    pub site_title: String,
    pub repository: String,
    pub default_branch: String,
    pub issue_title: String,
}

impl ScmSettings {
    pub fn admin_credential(&self) -> Credential {
        Credential::operator_override(&self.admin_user, self.admin_secret.clone())
    }
}

/// CI server settings.
#[derive(Debug, Clone, Serialize)]
pub struct CiSettings {
    pub endpoint: ServiceEndpoint,
    pub admin_user: String,
    pub admin_secret: Secret,
    pub seed_job: String,
    /// Job definition used to create the seed job when it is missing.
    pub seed_job_definition: Option<String>,
    pub pipeline_job: String,
}

impl CiSettings {
    pub fn admin_credential(&self) -> Credential {
        Credential::operator_override(&self.admin_user, self.admin_secret.clone())
    }
}

/// A file the run keeps in the repository.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrackedFile {
    pub path: String,
    pub content: String,
}

/// Everything one run needs.
#[derive(Debug, Clone, Serialize)]
pub struct RunConfig {
    pub quality: QualitySettings,
    pub scm: ScmSettings,
    pub ci: CiSettings,
    pub artifact_store: ServiceEndpoint,
    pub artifact_path: String,
    pub web_server: ServiceEndpoint,
    pub index_file: TrackedFile,
    pub pipeline_file: TrackedFile,
    pub expected_text: String,
    pub timings: Timings,
    #[serde(with = "duration_secs")]
    pub run_timeout: Duration,
}

/// Readiness check for the code-quality service.
pub fn quality_readiness() -> ReadinessCheck {
    ReadinessCheck::new(
        "api/system/status",
        ReadyRule::JsonFieldIn {
            field: "status".to_string(),
            accepted: vec!["UP".to_string(), "STARTED".to_string()],
        },
    )
}

/// Readiness check for the source-control service. The install page is
/// served with a success status too.
pub fn scm_readiness() -> ReadinessCheck {
    ReadinessCheck::new("", ReadyRule::SuccessStatus)
}

/// Readiness check for the CI server. The login page answers 503 while
/// the server is still starting.
pub fn ci_readiness() -> ReadinessCheck {
    ReadinessCheck::new("login", ReadyRule::SuccessStatus)
}

/// Readiness check for plain content servers.
pub fn content_readiness() -> ReadinessCheck {
    ReadinessCheck::new("", ReadyRule::AnyResponse)
}

impl RunConfig {
    /// Configuration with every default applied.
    pub fn with_defaults() -> Result<Self> {
        use defaults::*;

        Ok(Self {
            quality: QualitySettings {
                endpoint: ServiceEndpoint::parse("sonarqube", SONAR_URL, quality_readiness())?,
                admin_user: SONAR_ADMIN_USER.to_string(),
                default_secret: Secret::new(SONAR_ADMIN_PASS),
                new_secret: None,
                project_key: SONAR_PROJECT_KEY.to_string(),
                project_name: SONAR_PROJECT_NAME.to_string(),
                main_branch: DEFAULT_BRANCH.to_string(),
            },
            scm: ScmSettings {
                endpoint: ServiceEndpoint::parse("gitea", GITEA_URL, scm_readiness())?,
                admin_user: GITEA_ADMIN_USER.to_string(),
                admin_secret: Secret::new(GITEA_ADMIN_PASS),
                admin_email: GITEA_ADMIN_EMAIL.to_string(),
                site_title: GITEA_SITE_TITLE.to_string(),
                repository: GITEA_REPO.to_string(),
                default_branch: DEFAULT_BRANCH.to_string(),
                issue_title: ISSUE_TITLE.to_string(),
            },
            ci: CiSettings {
                endpoint: ServiceEndpoint::parse("jenkins", JENKINS_URL, ci_readiness())?,
                admin_user: JENKINS_ADMIN_USER.to_string(),
                admin_secret: Secret::new(JENKINS_ADMIN_PASS),
                seed_job: SEED_JOB.to_string(),
                seed_job_definition: None,
                pipeline_job: PIPELINE_JOB.to_string(),
            },
            artifact_store: ServiceEndpoint::parse("nexus", NEXUS_URL, content_readiness())?,
            artifact_path: NEXUS_ARTIFACT_PATH.to_string(),
            web_server: ServiceEndpoint::parse("nginx", NGINX_URL, content_readiness())?,
            index_file: TrackedFile {
                path: INDEX_FILE.to_string(),
                content: INDEX_HTML.to_string(),
            },
            pipeline_file: TrackedFile {
                path: PIPELINE_FILE.to_string(),
                content: JENKINSFILE.to_string(),
            },
            expected_text: EXPECTED_TEXT.to_string(),
            timings: Timings::default(),
            run_timeout: Duration::from_secs(RUN_TIMEOUT_SECS),
        })
    }

    /// Reject configurations that cannot produce a meaningful run.
    pub fn validate(&self) -> Result<()> {
        let required = [
            ("sonar project key", &self.quality.project_key),
            ("repository name", &self.scm.repository),
            ("issue title", &self.scm.issue_title),
            ("seed job", &self.ci.seed_job),
            ("pipeline job", &self.ci.pipeline_job),
            ("expected text", &self.expected_text),
            ("artifact path", &self.artifact_path),
        ];
        for (what, value) in required {
            if value.trim().is_empty() {
                return Err(E2eError::Config(format!("{what} must not be empty")));
            }
        }
        if self.ci.seed_job == self.ci.pipeline_job {
            return Err(E2eError::Config(
                "seed job and pipeline job must differ".to_string(),
            ));
        }
        if self.index_file.path == self.pipeline_file.path {
            return Err(E2eError::Config(
                "index file and pipeline file must differ".to_string(),
            ));
        }
        Ok(())
    }

    /// URL of the published artifact in the artifact store.
    pub fn artifact_url(&self) -> Result<Url> {
        self.artifact_store.url(&self.artifact_path)
    }
}
