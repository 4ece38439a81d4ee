//! Shared HTTP plumbing for the service adapters.

use std::sync::RwLock;
use std::time::Duration;

use reqwest::{Client, RequestBuilder, Response, StatusCode};

use crate::credentials::{AuthProbeOutcome, Credential};
use crate::error::{E2eError, Result};

const USER_AGENT: &str = concat!("sdlc-e2e/", env!("CARGO_PKG_VERSION"));

/// Longest response body kept in error messages.
const BODY_EXCERPT: usize = 512;

/// Build a client with a cookie store, so session cookies set at sign-in are
/// replayed on later calls.
pub fn build_client(request_timeout: Duration) -> Result<Client> {
    Ok(Client::builder()
        .user_agent(USER_AGENT)
        .cookie_store(true)
        .timeout(request_timeout)
        .build()?)
}

/// Attach basic auth for `credential`.
pub fn with_basic_auth(request: RequestBuilder, credential: &Credential) -> RequestBuilder {
    request.basic_auth(&credential.principal, Some(credential.secret.expose()))
}

/// Judge a credential from the status of an authenticated request. Only an
/// explicit refusal rejects it; server errors and throttling leave it unjudged.
pub fn auth_outcome(status: StatusCode) -> AuthProbeOutcome {
    match status {
        s if s.is_success() => AuthProbeOutcome::Accepted,
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => AuthProbeOutcome::Rejected,
        s => AuthProbeOutcome::Unreachable(format!("authentication check answered {s}")),
    }
}

/// The credential adopted at sign-in, shared by every later call.
#[derive(Debug, Default)]
pub struct CredentialSlot(RwLock<Option<Credential>>);

impl CredentialSlot {
    pub fn set(&self, credential: &Credential) {
        if let Ok(mut slot) = self.0.write() {
            *slot = Some(credential.clone());
        }
    }

    pub fn get(&self) -> Option<Credential> {
        self.0.read().ok().and_then(|slot| slot.clone())
    }

    /// Attach basic auth when a credential was adopted. Without one the
    /// request relies on the session cookie, if any.
    pub fn apply(&self, request: RequestBuilder) -> RequestBuilder {
        match self.get() {
            Some(credential) => with_basic_auth(request, &credential),
            None => request,
        }
    }
}

/// Read status, final URL and body of a response.
pub async fn read(response: Response) -> Result<Fetched> {
    let status = response.status();
    let url = response.url().to_string();
    let body = response.text().await?;
    Ok(Fetched { status, url, body })
}

/// A fully read response.
#[derive(Debug, Clone)]
pub struct Fetched {
    pub status: StatusCode,
    /// URL after redirects.
    pub url: String,
    pub body: String,
}

impl Fetched {
    pub fn is_success(&self) -> bool {
        self.status.is_success()
    }

    /// Turn a non-success response into [`E2eError::UnexpectedResponse`].
    pub fn require_success(self, service: &str) -> Result<Self> {
        if self.is_success() {
            Ok(self)
        } else {
            Err(self.unexpected(service))
        }
    }

    pub fn unexpected(&self, service: &str) -> E2eError {
        E2eError::UnexpectedResponse {
            service: service.to_string(),
            status: self.status.as_u16(),
            body: excerpt(&self.body),
        }
    }

    pub fn json<T: serde::de::DeserializeOwned>(&self) -> Result<T> {
        Ok(serde_json::from_str(&self.body)?)
    }
}

/// First [`BODY_EXCERPT`] bytes of `body`, cut on a char boundary.
pub fn excerpt(body: &str) -> String {
    if body.len() <= BODY_EXCERPT {
        return body.trim().to_string();
    }
    let mut end = BODY_EXCERPT;
    while !body.is_char_boundary(end) {
        end -= 1;
    }
    format!("{}...", body[..end].trim())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_excerpt_truncates_on_char_boundary() {
        let body = "é".repeat(400);
        let cut = excerpt(&body);
        assert!(cut.ends_with("..."));
        assert!(cut.len() <= BODY_EXCERPT + 3);
    }

    #[test]
    fn test_short_body_kept() {
        assert_eq!(excerpt("  not found \n"), "not found");
    }

    #[test]
    fn test_credential_slot_roundtrip() {
        use crate::credentials::Secret;

        let slot = CredentialSlot::default();
        assert!(slot.get().is_none());
        slot.set(&Credential::operator_override("admin", Secret::new("pw")));
        assert_eq!(slot.get().map(|c| c.principal), Some("admin".to_string()));
    }

    #[test]
    fn test_auth_outcome_only_rejects_refusals() {
        assert_eq!(auth_outcome(StatusCode::OK), AuthProbeOutcome::Accepted);
        assert_eq!(auth_outcome(StatusCode::UNAUTHORIZED), AuthProbeOutcome::Rejected);
        assert_eq!(auth_outcome(StatusCode::FORBIDDEN), AuthProbeOutcome::Rejected);
        for status in [
            StatusCode::SERVICE_UNAVAILABLE,
            StatusCode::BAD_GATEWAY,
            StatusCode::TOO_MANY_REQUESTS,
        ] {
            assert!(matches!(auth_outcome(status), AuthProbeOutcome::Unreachable(_)));
        }
    }

    #[test]
    fn test_client_builds() {
        assert!(build_client(Duration::from_secs(5)).is_ok());
    }
}
