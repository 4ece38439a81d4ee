//! Gitea adapter: first-run installation, repositories, issues and files.

use std::time::Duration;

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use regex::Regex;
use reqwest::{Client, StatusCode};
use serde::Deserialize;
use serde_json::json;
use tracing::debug;

use super::http::{self, CredentialSlot, Fetched};
use super::{IssueState, IssueTracker, Service};
use crate::config::ServiceEndpoint;
use crate::credentials::{AuthProbe, AuthProbeOutcome, Credential};
use crate::ensure::{unsupported, Presence, ResourceDescriptor, ResourceHandle, ResourceKind, ResourceProvider};
use crate::error::{E2eError, Result};
use crate::readiness::{StatusProbe, StatusResponse};

const ISSUE_PAGE_SIZE: usize = 50;

pub struct GiteaClient {
    endpoint: ServiceEndpoint,
    http: Client,
    credential: CredentialSlot,
}

impl GiteaClient {
    pub fn new(endpoint: ServiceEndpoint, request_timeout: Duration) -> Result<Self> {
        Ok(Self {
            endpoint,
            http: http::build_client(request_timeout)?,
            credential: CredentialSlot::default(),
        })
    }

    async fn get(&self, path: &str) -> Result<Fetched> {
        let request = self.credential.apply(self.http.get(self.endpoint.url(path)?));
        http::read(request.send().await?).await
    }

    async fn post_json(&self, path: &str, body: serde_json::Value) -> Result<Fetched> {
        let request = self
            .credential
            .apply(self.http.post(self.endpoint.url(path)?))
            .json(&body);
        http::read(request.send().await?).await
    }

    /// GET `path`, mapping 404 to `None`.
    async fn get_optional(&self, path: &str) -> Result<Option<Fetched>> {
        let fetched = self.get(path).await?;
        if fetched.status == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        fetched.require_success(self.name()).map(Some)
    }

    async fn find_issue(&self, owner: &str, repo: &str, title: &str) -> Result<Option<IssueSummary>> {
        for page in 1.. {
            let mut url = self.endpoint.url(&format!("api/v1/repos/{owner}/{repo}/issues"))?;
            url.query_pairs_mut()
                .append_pair("state", "all")
                .append_pair("type", "issues")
                .append_pair("q", title)
                .append_pair("limit", &ISSUE_PAGE_SIZE.to_string())
                .append_pair("page", &page.to_string());
            let request = self.credential.apply(self.http.get(url));
            let issues: Vec<IssueSummary> = http::read(request.send().await?)
                .await?
                .require_success(self.name())?
                .json()?;
            // The server may cap `limit` below the requested size, so only an
            // empty page ends the listing.
            if issues.is_empty() {
                break;
            }
            if let Some(issue) = issues.into_iter().find(|issue| issue.title == title) {
                return Ok(Some(issue));
            }
        }
        Ok(None)
    }

    fn creation_failed(resource: &ResourceDescriptor, fetched: &Fetched) -> E2eError {
        E2eError::ResourceCreationFailed {
            kind: resource.kind(),
            key: resource.key(),
            reason: format!("{} {}", fetched.status, http::excerpt(&fetched.body)),
        }
    }
}

impl Service for GiteaClient {
    fn endpoint(&self) -> &ServiceEndpoint {
        &self.endpoint
    }
}

#[async_trait]
impl StatusProbe for GiteaClient {
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
impl AuthProbe for GiteaClient {
    async fn probe(&self, credential: &Credential) -> AuthProbeOutcome {
        let url = match self.endpoint.url("api/v1/user") {
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

/// Whether a page is the first-run installation form.
pub fn is_install_page(final_url: &str, body: &str) -> bool {
    final_url.contains("/install")
        || body.contains(r#"action="/install""#)
        || body.to_ascii_lowercase().contains("initial configuration")
}

/// Collect the submitted values of an HTML form: every named input with its
/// pre-filled value, unchecked checkboxes excluded.
pub fn form_defaults(html: &str) -> Vec<(String, String)> {
    let (Ok(input), Ok(name), Ok(value)) = (
        Regex::new(r"(?is)<input\b[^>]*>"),
        Regex::new(r#"(?i)\bname\s*=\s*"([^"]*)""#),
        Regex::new(r#"(?i)\bvalue\s*=\s*"([^"]*)""#),
    ) else {
        return Vec::new();
    };

    input
        .find_iter(html)
        .filter_map(|tag| {
            let tag = tag.as_str();
            let lower = tag.to_ascii_lowercase();
            if lower.contains(r#"type="checkbox""#) && !lower.contains("checked") {
                return None;
            }
            let field = name.captures(tag)?.get(1)?.as_str().to_string();
            let value = value
                .captures(tag)
                .and_then(|c| c.get(1))
                .map(|v| unescape(v.as_str()))
                .unwrap_or_default();
            Some((field, value))
        })
        .collect()
}

fn unescape(value: &str) -> String {
    value
        .replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&quot;", "\"")
        .replace("&#39;", "'")
        .replace("&amp;", "&")
}

/// Replace or append a form field.
fn set_field(form: &mut Vec<(String, String)>, field: &str, value: &str) {
    match form.iter_mut().find(|(name, _)| name == field) {
        Some(entry) => entry.1 = value.to_string(),
        None => form.push((field.to_string(), value.to_string())),
    }
}

#[derive(Debug, Deserialize)]
struct IssueSummary {
    number: u64,
    title: String,
    state: String,
}

#[derive(Debug, Deserialize)]
struct RepositorySummary {
    full_name: String,
}

/// Issue handles carry the repository so close-out needs nothing else.
fn issue_handle(owner: &str, repo: &str, number: u64) -> ResourceHandle {
    ResourceHandle::new(ResourceKind::Issue, format!("{owner}/{repo}#{number}"))
}

fn issue_path(handle: &ResourceHandle) -> Result<String> {
    let (repo, number) = handle
        .id
        .rsplit_once('#')
        .filter(|(repo, _)| repo.contains('/'))
        .ok_or_else(|| E2eError::Config(format!("malformed issue handle '{}'", handle.id)))?;
    Ok(format!("api/v1/repos/{repo}/issues/{number}"))
}

fn parse_state(state: &str) -> IssueState {
    if state.eq_ignore_ascii_case("closed") {
        IssueState::Closed
    } else {
        IssueState::Open
    }
}

#[async_trait]
impl ResourceProvider for GiteaClient {
    async fn lookup(&self, resource: &ResourceDescriptor) -> Result<Presence> {
        match resource {
            ResourceDescriptor::Installation { .. } => {
                let response = self.http.get(self.endpoint.url("")?).send().await?;
                let fetched = http::read(response).await?;
                if is_install_page(&fetched.url, &fetched.body) {
                    return Ok(Presence::Absent);
                }
                Ok(Presence::Present(ResourceHandle::new(
                    ResourceKind::Installation,
                    self.endpoint.base_url.as_str(),
                )))
            }
            ResourceDescriptor::Repository { owner, name, .. } => {
                let Some(fetched) = self.get_optional(&format!("api/v1/repos/{owner}/{name}")).await? else {
                    return Ok(Presence::Absent);
                };
                let repo: RepositorySummary = fetched.json()?;
                Ok(Presence::Present(ResourceHandle::new(ResourceKind::Repository, repo.full_name)))
            }
            ResourceDescriptor::Issue { owner, repo, title } => Ok(self
                .find_issue(owner, repo, title)
                .await?
                .map(|issue| Presence::Present(issue_handle(owner, repo, issue.number)))
                .unwrap_or(Presence::Absent)),
            ResourceDescriptor::File { owner, repo, path, .. } => {
                let found = self
                    .get_optional(&format!("api/v1/repos/{owner}/{repo}/contents/{path}"))
                    .await?;
                Ok(match found {
                    Some(_) => Presence::Present(ResourceHandle::new(ResourceKind::File, path.as_str())),
                    None => Presence::Absent,
                })
            }
            ResourceDescriptor::Project { .. } | ResourceDescriptor::Job { .. } => {
                unsupported(self.name(), resource)
            }
        }
    }

    async fn create(&self, resource: &ResourceDescriptor) -> Result<()> {
        let fetched = match resource {
            ResourceDescriptor::Installation {
                site_title,
                admin,
                admin_email,
            } => {
                let page = http::read(self.http.get(self.endpoint.url("")?).send().await?).await?;
                let mut form = form_defaults(&page.body);
                debug!(fields = form.len(), "installation form defaults collected");
                set_field(&mut form, "app_name", site_title);
                set_field(&mut form, "admin_name", &admin.principal);
                set_field(&mut form, "admin_passwd", admin.secret.expose());
                set_field(&mut form, "admin_confirm_passwd", admin.secret.expose());
                set_field(&mut form, "admin_email", admin_email);
                let response = self
                    .http
                    .post(self.endpoint.url("install")?)
                    .form(&form)
                    .send()
                    .await?;
                http::read(response).await?
            }
            ResourceDescriptor::Repository {
                owner,
                name,
                default_branch,
            } => {
                let body = json!({
                    "name": name,
                    "default_branch": default_branch,
                    "auto_init": true,
                    "private": false,
                });
                let adopted = self.credential.get().map(|c| c.principal);
                let path = if adopted.as_deref() == Some(owner.as_str()) {
                    "api/v1/user/repos".to_string()
                } else {
                    format!("api/v1/admin/users/{owner}/repos")
                };
                self.post_json(&path, body).await?
            }
            ResourceDescriptor::Issue { owner, repo, title } => {
                self.post_json(
                    &format!("api/v1/repos/{owner}/{repo}/issues"),
                    json!({ "title": title }),
                )
                .await?
            }
            ResourceDescriptor::File {
                owner,
                repo,
                path,
                content,
                message,
            } => {
                self.post_json(
                    &format!("api/v1/repos/{owner}/{repo}/contents/{path}"),
                    json!({
                        "content": BASE64.encode(content.as_bytes()),
                        "message": message,
                    }),
                )
                .await?
            }
            ResourceDescriptor::Project { .. } | ResourceDescriptor::Job { .. } => {
                return unsupported(self.name(), resource);
            }
        };
        if fetched.is_success() || fetched.status.is_redirection() {
            Ok(())
        } else {
            Err(Self::creation_failed(resource, &fetched))
        }
    }
}

#[async_trait]
impl IssueTracker for GiteaClient {
    async fn close_issue(&self, issue: &ResourceHandle) -> Result<()> {
        let request = self
            .credential
            .apply(self.http.patch(self.endpoint.url(&issue_path(issue)?)?))
            .json(&json!({ "state": "closed" }));
        http::read(request.send().await?)
            .await?
            .require_success(self.name())?;
        Ok(())
    }

    async fn issue_state(&self, issue: &ResourceHandle) -> Result<IssueState> {
        let summary: IssueSummary = self
            .get(&issue_path(issue)?)
            .await?
            .require_success(self.name())?
            .json()?;
        Ok(parse_state(&summary.state))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const INSTALL_FORM: &str = r#"
        <form class="ui form" action="/install" method="post">
          <input type="hidden" name="db_type" value="sqlite3">
          <input id="db_path" name="db_path" value="/data/gitea/gitea.db">
          <input id="app_name" name="app_name" value="Gitea: Git with a cup of tea" required>
          <input id="app_url" name="app_url" value="http://localhost:3000/">
          <input name="offline_mode" type="checkbox">
          <input name="enable_federated_avatar" type="checkbox" checked>
          <input id="admin_name" name="admin_name" value="">
          <button class="ui primary button">Install Gitea</button>
        </form>"#;

    #[test]
    fn test_install_page_detection() {
        assert!(is_install_page("http://localhost:3000/", INSTALL_FORM));
        assert!(is_install_page("http://localhost:3000/install", ""));
        assert!(!is_install_page(
            "http://localhost:3000/",
            "<title>hello-world</title><a href=\"/user/login\">Sign In</a>"
        ));
    }

    #[test]
    fn test_form_defaults_keep_prefilled_values() {
        let form = form_defaults(INSTALL_FORM);
        assert!(form.contains(&("db_type".to_string(), "sqlite3".to_string())));
        assert!(form.contains(&("app_url".to_string(), "http://localhost:3000/".to_string())));
        assert!(form.iter().any(|(name, _)| name == "enable_federated_avatar"));
        assert!(!form.iter().any(|(name, _)| name == "offline_mode"));
    }

    #[test]
    fn test_set_field_overrides() {
        let mut form = form_defaults(INSTALL_FORM);
        set_field(&mut form, "app_name", "hello-world");
        set_field(&mut form, "admin_email", "admin@example.com");
        assert!(form.contains(&("app_name".to_string(), "hello-world".to_string())));
        assert_eq!(form.iter().filter(|(name, _)| name == "app_name").count(), 1);
        assert!(form.contains(&("admin_email".to_string(), "admin@example.com".to_string())));
    }

    #[test]
    fn test_issue_handle_path() {
        let handle = issue_handle("admin", "hello-world", 3);
        assert_eq!(handle.id, "admin/hello-world#3");
        assert_eq!(issue_path(&handle).unwrap(), "api/v1/repos/admin/hello-world/issues/3");
        assert!(issue_path(&ResourceHandle::new(ResourceKind::Issue, "3")).is_err());
    }

    #[test]
    fn test_parse_state() {
        assert_eq!(parse_state("closed"), IssueState::Closed);
        assert_eq!(parse_state("open"), IssueState::Open);
    }

    #[test]
    fn test_unescape_entities() {
        assert_eq!(unescape("a &amp; b &quot;c&quot;"), "a & b \"c\"");
    }
}
