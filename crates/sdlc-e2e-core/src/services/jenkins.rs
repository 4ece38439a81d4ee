//! Jenkins adapter.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, RequestBuilder, StatusCode};
use serde::Deserialize;
use tracing::debug;

use super::http::{self, CredentialSlot};
use super::Service;
use crate::config::ServiceEndpoint;
use crate::credentials::{AuthProbe, AuthProbeOutcome, Credential};
use crate::ensure::{unsupported, Presence, ResourceDescriptor, ResourceHandle, ResourceKind, ResourceProvider};
use crate::error::{E2eError, Result};
use crate::pipeline::{BuildControl, BuildSnapshot, BuildStatus, Confirmation, JobRef, TriggerOutcome};
use crate::readiness::{StatusProbe, StatusResponse};

const CRUMB_CONFIRMATION: &str = "request crumb";

pub struct JenkinsClient {
    endpoint: ServiceEndpoint,
    http: Client,
    credential: CredentialSlot,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Crumb {
    crumb: String,
    crumb_request_field: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct JobInfo {
    last_build: Option<LastBuild>,
}

#[derive(Debug, Deserialize)]
struct LastBuild {
    number: u64,
    #[serde(default)]
    building: bool,
    result: Option<String>,
}

/// Map Jenkins' `building`/`result` pair to a status.
fn build_status(building: bool, result: Option<&str>) -> BuildStatus {
    match (building, result) {
        (true, _) => BuildStatus::Running,
        (false, Some("SUCCESS")) => BuildStatus::Success,
        (false, Some("FAILURE" | "UNSTABLE" | "ABORTED" | "NOT_BUILT")) => BuildStatus::Failure,
        (false, None) => BuildStatus::Pending,
        (false, Some(_)) => BuildStatus::Unknown,
    }
}

impl JenkinsClient {
    pub fn new(endpoint: ServiceEndpoint, request_timeout: Duration) -> Result<Self> {
        Ok(Self {
            endpoint,
            http: http::build_client(request_timeout)?,
            credential: CredentialSlot::default(),
        })
    }

    fn job_path(job: &str, rest: &str) -> String {
        format!("job/{job}/{rest}")
    }

    async fn crumb(&self) -> Result<Crumb> {
        let request = self
            .credential
            .apply(self.http.get(self.endpoint.url("crumbIssuer/api/json")?));
        http::read(request.send().await?)
            .await?
            .require_success(self.name())?
            .json()
    }

    fn trigger_request(&self, job: &JobRef) -> Result<RequestBuilder> {
        let mut url = if job.parameterized {
            self.endpoint.url(&Self::job_path(&job.name, "buildWithParameters"))?
        } else {
            self.endpoint.url(&Self::job_path(&job.name, "build"))?
        };
        url.query_pairs_mut().append_pair("delay", "0sec");
        Ok(self.credential.apply(self.http.post(url)))
    }

    async fn send_trigger(&self, request: RequestBuilder, job: &JobRef) -> Result<TriggerOutcome> {
        let fetched = http::read(request.send().await?).await?;
        match fetched.status {
            s if s.is_success() || s.is_redirection() => Ok(TriggerOutcome::Queued),
            StatusCode::FORBIDDEN => {
                debug!(job = %job.name, "trigger refused without crumb");
                Ok(TriggerOutcome::ConfirmationRequired(Confirmation {
                    description: CRUMB_CONFIRMATION.to_string(),
                }))
            }
            _ => Err(fetched.unexpected(self.name())),
        }
    }
}

impl Service for JenkinsClient {
    fn endpoint(&self) -> &ServiceEndpoint {
        &self.endpoint
    }
}

#[async_trait]
impl StatusProbe for JenkinsClient {
    async fn fetch_status(&self) -> Result<StatusResponse> {
        let response = self.http.get(self.endpoint.readiness_url()?).send().await?;
        let fetched = http::read(response).await?;
        Ok(StatusResponse {
            status: fetched.status.as_u16(),
            body: fetched.body,
        })
    }
}

#[async_trait]
impl AuthProbe for JenkinsClient {
    async fn probe(&self, credential: &Credential) -> AuthProbeOutcome {
        let url = match self.endpoint.url("me/api/json") {
            Ok(url) => url,
            Err(e) => return AuthProbeOutcome::Unreachable(e.to_string()),
        };
        match http::with_basic_auth(self.http.get(url), credential).send().await {
            Ok(response) => http::auth_outcome(response.status()),
            Err(e) => AuthProbeOutcome::Unreachable(e.to_string()),
        }
    }

    async fn adopt(&self, credential: &Credential) -> Result<()> {
        self.credential.set(credential);
        Ok(())
    }
}

#[async_trait]
impl ResourceProvider for JenkinsClient {
    async fn lookup(&self, resource: &ResourceDescriptor) -> Result<Presence> {
        let ResourceDescriptor::Job { name, .. } = resource else {
            return unsupported(self.name(), resource);
        };
        Ok(if self.job_exists(name).await? {
            Presence::Present(ResourceHandle::new(ResourceKind::Job, name.as_str()))
        } else {
            Presence::Absent
        })
    }

    async fn create(&self, resource: &ResourceDescriptor) -> Result<()> {
        let ResourceDescriptor::Job { name, definition } = resource else {
            return unsupported(self.name(), resource);
        };
        let Some(definition) = definition else {
            return Err(E2eError::ResourceCreationFailed {
                kind: ResourceKind::Job,
                key: name.clone(),
                reason: "no job definition configured; the job must be provisioned with the server".to_string(),
            });
        };

        let crumb = self.crumb().await?;
        let mut url = self.endpoint.url("createItem")?;
        url.query_pairs_mut().append_pair("name", name);
        let request = self
            .credential
            .apply(self.http.post(url))
            .header(crumb.crumb_request_field.as_str(), crumb.crumb.as_str())
            .header(reqwest::header::CONTENT_TYPE, "application/xml")
            .body(definition.clone());
        let fetched = http::read(request.send().await?).await?;
        if !fetched.is_success() {
            return Err(E2eError::ResourceCreationFailed {
                kind: ResourceKind::Job,
                key: name.clone(),
                reason: format!("{} {}", fetched.status, http::excerpt(&fetched.body)),
            });
        }
        Ok(())
    }
}

#[async_trait]
impl BuildControl for JenkinsClient {
    async fn job_exists(&self, job: &str) -> Result<bool> {
        let request = self
            .credential
            .apply(self.http.get(self.endpoint.url(&Self::job_path(job, "api/json"))?));
        let fetched = http::read(request.send().await?).await?;
        match fetched.status {
            s if s.is_success() => Ok(true),
            StatusCode::NOT_FOUND => Ok(false),
            _ => Err(fetched.unexpected(self.name())),
        }
    }

    async fn latest_build(&self, job: &str) -> Result<Option<BuildSnapshot>> {
        let mut url = self.endpoint.url(&Self::job_path(job, "api/json"))?;
        url.query_pairs_mut()
            .append_pair("tree", "lastBuild[number,building,result]");
        let fetched = http::read(self.credential.apply(self.http.get(url)).send().await?).await?;
        if fetched.status == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        let info: JobInfo = fetched.require_success(self.name())?.json()?;
        Ok(info.last_build.map(|build| BuildSnapshot {
            number: build.number,
            status: build_status(build.building, build.result.as_deref()),
        }))
    }

    async fn trigger(&self, job: &JobRef) -> Result<TriggerOutcome> {
        let request = self.trigger_request(job)?;
        self.send_trigger(request, job).await
    }

    async fn acknowledge(&self, job: &JobRef, confirmation: &Confirmation) -> Result<TriggerOutcome> {
        debug!(job = %job.name, step = %confirmation.description, "fetching crumb");
        let crumb = self.crumb().await?;
        let request = self
            .trigger_request(job)?
            .header(crumb.crumb_request_field.as_str(), crumb.crumb.as_str());
        self.send_trigger(request, job).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_build_status_mapping() {
        assert_eq!(build_status(true, None), BuildStatus::Running);
        assert_eq!(build_status(true, Some("SUCCESS")), BuildStatus::Running);
        assert_eq!(build_status(false, Some("SUCCESS")), BuildStatus::Success);
        assert_eq!(build_status(false, Some("UNSTABLE")), BuildStatus::Failure);
        assert_eq!(build_status(false, None), BuildStatus::Pending);
        assert_eq!(build_status(false, Some("SOMETHING")), BuildStatus::Unknown);
    }

    #[test]
    fn test_job_info_parses_missing_last_build() {
        let info: JobInfo =
            serde_json::from_str(r#"{"_class":"hudson.model.FreeStyleProject","lastBuild":null}"#).unwrap();
        assert!(info.last_build.is_none());

        let info: JobInfo = serde_json::from_str(
            r#"{"lastBuild":{"number":12,"building":false,"result":"SUCCESS"}}"#,
        )
        .unwrap();
        let last = info.last_build.unwrap();
        assert_eq!(last.number, 12);
        assert_eq!(build_status(last.building, last.result.as_deref()), BuildStatus::Success);
    }

    #[test]
    fn test_crumb_parses() {
        let crumb: Crumb = serde_json::from_str(
            r#"{"_class":"hudson.security.csrf.DefaultCrumbIssuer","crumb":"abc","crumbRequestField":"Jenkins-Crumb"}"#,
        )
        .unwrap();
        assert_eq!(crumb.crumb_request_field, "Jenkins-Crumb");
        assert_eq!(crumb.crumb, "abc");
    }
}
