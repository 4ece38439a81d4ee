//! SonarQube adapter.

use std::time::Duration;

use async_trait::async_trait;
use regex::Regex;
use reqwest::{Client, StatusCode};
use serde::Deserialize;
use tracing::debug;

use super::http::{self, CredentialSlot};
use super::Service;
use crate::config::ServiceEndpoint;
use crate::credentials::{AuthAttempt, AuthProbe, AuthProbeOutcome, AuthStrategy, Credential, PasswordRotation, Secret};
use crate::ensure::{unsupported, Presence, ResourceDescriptor, ResourceHandle, ResourceKind, ResourceProvider};
use crate::error::{E2eError, Result};
use crate::readiness::{StatusProbe, StatusResponse};

/// Path the web app redirects to while a password change is pending.
const RESET_PASSWORD_PATH: &str = "/account/reset_password";
const ROTATION_PROMPT: &str = r"(?i)update your password|enter a new password";

pub struct SonarQubeClient {
    endpoint: ServiceEndpoint,
    http: Client,
    credential: CredentialSlot,
}

impl SonarQubeClient {
    pub fn new(endpoint: ServiceEndpoint, request_timeout: Duration) -> Result<Self> {
        Ok(Self {
            endpoint,
            http: http::build_client(request_timeout)?,
            credential: CredentialSlot::default(),
        })
    }
}

impl Service for SonarQubeClient {
    fn endpoint(&self) -> &ServiceEndpoint {
        &self.endpoint
    }
}

#[async_trait]
impl StatusProbe for SonarQubeClient {
    async fn fetch_status(&self) -> Result<StatusResponse> {
        let response = self.http.get(self.endpoint.readiness_url()?).send().await?;
        let fetched = http::read(response).await?;
        Ok(StatusResponse {
            status: fetched.status.as_u16(),
            body: fetched.body,
        })
    }
}

#[derive(Debug, Deserialize)]
struct Validation {
    valid: bool,
}

#[async_trait]
impl AuthProbe for SonarQubeClient {
    async fn probe(&self, credential: &Credential) -> AuthProbeOutcome {
        let url = match self.endpoint.url("api/authentication/validate") {
            Ok(url) => url,
            Err(e) => return AuthProbeOutcome::Unreachable(e.to_string()),
        };
        let request = http::with_basic_auth(self.http.get(url), credential);
        let fetched = match request.send().await {
            Ok(response) => match http::read(response).await {
                Ok(fetched) => fetched,
                Err(e) => return AuthProbeOutcome::Unreachable(e.to_string()),
            },
            Err(e) => return AuthProbeOutcome::Unreachable(e.to_string()),
        };
        if !fetched.is_success() {
            return http::auth_outcome(fetched.status);
        }
        match fetched.json::<Validation>() {
            Ok(Validation { valid: true }) => AuthProbeOutcome::Accepted,
            Ok(Validation { valid: false }) => AuthProbeOutcome::Rejected,
            Err(e) => AuthProbeOutcome::Unreachable(e.to_string()),
        }
    }

    async fn adopt(&self, credential: &Credential) -> Result<()> {
        // Establishes the session cookie used by cookie-authenticated calls.
        let response = self
            .http
            .post(self.endpoint.url("api/authentication/login")?)
            .form(&[
                ("login", credential.principal.as_str()),
                ("password", credential.secret.expose()),
            ])
            .send()
            .await?;
        http::read(response).await?.require_success(self.name())?;
        self.credential.set(credential);
        Ok(())
    }
}

/// Whether a page load of the account area shows a forced password change.
pub fn shows_rotation_prompt(final_url: &str, body: &str) -> bool {
    if final_url.contains(RESET_PASSWORD_PATH) {
        return true;
    }
    Regex::new(ROTATION_PROMPT)
        .map(|prompt| prompt.is_match(body))
        .unwrap_or(false)
}

#[async_trait]
impl PasswordRotation for SonarQubeClient {
    async fn rotation_required(&self, _current: &Credential) -> Result<bool> {
        let response = self.http.get(self.endpoint.url("account")?).send().await?;
        let fetched = http::read(response).await?;
        let required = shows_rotation_prompt(&fetched.url, &fetched.body);
        debug!(url = %fetched.url, required, "checked for forced password change");
        Ok(required)
    }

    async fn change_password(
        &self,
        strategy: AuthStrategy,
        current: &Credential,
        new_secret: &Secret,
    ) -> Result<AuthAttempt> {
        let request = self
            .http
            .post(self.endpoint.url("api/users/change_password")?)
            .form(&[
                ("login", current.principal.as_str()),
                ("previousPassword", current.secret.expose()),
                ("password", new_secret.expose()),
            ]);
        let request = match strategy {
            AuthStrategy::SessionCookie => request,
            AuthStrategy::BasicAuth => http::with_basic_auth(request, current),
        };
        let fetched = http::read(request.send().await?).await?;
        Ok(match fetched.status {
            s if s.is_success() => AuthAttempt::Accepted,
            StatusCode::UNAUTHORIZED => AuthAttempt::Unauthorized,
            s => AuthAttempt::Rejected {
                status: s.as_u16(),
                body: http::excerpt(&fetched.body),
            },
        })
    }
}

#[derive(Debug, Deserialize)]
struct ProjectSearch {
    #[serde(default)]
    components: Vec<ProjectComponent>,
}

#[derive(Debug, Deserialize)]
struct ProjectComponent {
    key: String,
}

/// Find `key` among search results. The search matches by prefix, so the
/// key has to be compared exactly.
pub fn find_project(body: &str, key: &str) -> Result<Presence> {
    let search: ProjectSearch = serde_json::from_str(body)?;
    Ok(search
        .components
        .into_iter()
        .find(|component| component.key == key)
        .map(|component| Presence::Present(ResourceHandle::new(ResourceKind::Project, component.key)))
        .unwrap_or(Presence::Absent))
}

#[async_trait]
impl ResourceProvider for SonarQubeClient {
    async fn lookup(&self, resource: &ResourceDescriptor) -> Result<Presence> {
        let ResourceDescriptor::Project { key, .. } = resource else {
            return unsupported(self.name(), resource);
        };
        let mut url = self.endpoint.url("api/projects/search")?;
        url.query_pairs_mut().append_pair("projects", key);
        let fetched = http::read(self.credential.apply(self.http.get(url)).send().await?)
            .await?
            .require_success(self.name())?;
        find_project(&fetched.body, key)
    }

    async fn create(&self, resource: &ResourceDescriptor) -> Result<()> {
        let ResourceDescriptor::Project {
            key,
            name,
            main_branch,
        } = resource
        else {
            return unsupported(self.name(), resource);
        };
        let request = self
            .http
            .post(self.endpoint.url("api/projects/create")?)
            .form(&[
                ("project", key.as_str()),
                ("name", name.as_str()),
                ("mainBranch", main_branch.as_str()),
            ]);
        let fetched = http::read(self.credential.apply(request).send().await?).await?;
        if !fetched.is_success() {
            return Err(E2eError::ResourceCreationFailed {
                kind: ResourceKind::Project,
                key: key.clone(),
                reason: format!("{} {}", fetched.status, http::excerpt(&fetched.body)),
            });
        }
        Ok(())
    }
}
