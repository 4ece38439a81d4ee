//! Error taxonomy for the end-to-end run.
//!
//! Every variant is fatal to the run. Components retry only inside their own
//! polling contract; once an error escapes a component the orchestrator stops.

use std::time::Duration;

use crate::ensure::ResourceKind;
use crate::pipeline::BuildStatus;

/// Errors produced by the verifier's components and service adapters.
#[derive(Debug, thiserror::Error)]
pub enum E2eError {
    #[error("{service} not ready at {url} after {}s", .elapsed.as_secs())]
    ReadinessTimeout {
        service: String,
        url: String,
        elapsed: Duration,
    },

    #[error("no candidate credential authenticates against {service} (tried {tried}){}", hint_suffix(.hint))]
    AuthExhausted {
        service: String,
        tried: usize,
        hint: Option<String>,
    },

    #[error("{service} unreachable while probing credentials: {reason}")]
    AuthProbeUnreachable { service: String, reason: String },

    #[error("{service} requires a password update, but no new secret is configured (set {variable})")]
    PasswordRotationRequiredButNoTargetProvided { service: String, variable: String },

    #[error("{service} rejected the password change: {status} {body}")]
    RotationRejected {
        service: String,
        status: u16,
        body: String,
    },

    #[error("failed to create {kind} '{key}': {reason}")]
    ResourceCreationFailed {
        kind: ResourceKind,
        key: String,
        reason: String,
    },

    #[error("{kind} '{key}' still absent {}s after creation was submitted", .elapsed.as_secs())]
    ResourceCreationVerificationFailed {
        kind: ResourceKind,
        key: String,
        elapsed: Duration,
    },

    #[error("{service} does not manage {kind} resources")]
    UnsupportedResource { service: String, kind: ResourceKind },

    #[error("build #{number} of job '{job}' finished unsuccessfully")]
    BuildFailed { job: String, number: u64 },

    #[error("job '{job}' produced no successful build within {}s (last status: {last_status})", .elapsed.as_secs())]
    BuildTimeout {
        job: String,
        elapsed: Duration,
        last_status: BuildStatus,
    },

    #[error("job '{job}' still asks for confirmation after it was acknowledged")]
    ConfirmationNotAccepted { job: String },

    #[error("job '{job}' did not appear within {}s", .elapsed.as_secs())]
    JobAppearanceTimeout { job: String, elapsed: Duration },

    #[error("{target} did not converge within {}s (last observation: {last_observation})", .elapsed.as_secs())]
    DownstreamPropagationTimeout {
        target: String,
        elapsed: Duration,
        last_observation: String,
    },

    #[error("issue {issue} not observed closed within {}s", .elapsed.as_secs())]
    IssueNotClosed { issue: String, elapsed: Duration },

    #[error("unexpected response from {service}: {status} {body}")]
    UnexpectedResponse {
        service: String,
        status: u16,
        body: String,
    },

    #[error("run exceeded its overall timeout of {}s", .limit.as_secs())]
    RunTimeout { limit: Duration },

    #[error("configuration error: {0}")]
    Config(String),

    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("serialization error: {0}")]
    Json(#[from] serde_json::Error),
}

fn hint_suffix(hint: &Option<String>) -> String {
    hint.as_ref().map(|h| format!("; {h}")).unwrap_or_default()
}

/// Result type for verifier operations.
pub type Result<T> = std::result::Result<T, E2eError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_readiness_timeout_display() {
        let err = E2eError::ReadinessTimeout {
            service: "sonarqube".to_string(),
            url: "http://localhost:9000/api/system/status".to_string(),
            elapsed: Duration::from_secs(180),
        };
        let msg = err.to_string();
        assert!(msg.contains("sonarqube"));
        assert!(msg.contains("180s"));
    }

    #[test]
    fn test_auth_exhausted_hint() {
        let err = E2eError::AuthExhausted {
            service: "sonarqube".to_string(),
            tried: 1,
            hint: Some("set SONAR_NEW_PASS".to_string()),
        };
        assert!(err.to_string().ends_with("; set SONAR_NEW_PASS"));

        let err = E2eError::AuthExhausted {
            service: "gitea".to_string(),
            tried: 2,
            hint: None,
        };
        assert!(err.to_string().ends_with("(tried 2)"));
    }

    #[test]
    fn test_verification_failure_is_distinct_from_creation_failure() {
        let failed = E2eError::ResourceCreationFailed {
            kind: ResourceKind::Issue,
            key: "deploy".to_string(),
            reason: "500".to_string(),
        };
        let unverified = E2eError::ResourceCreationVerificationFailed {
            kind: ResourceKind::Issue,
            key: "deploy".to_string(),
            elapsed: Duration::from_secs(30),
        };
        assert!(failed.to_string().starts_with("failed to create issue"));
        assert!(unverified.to_string().contains("still absent 30s"));
    }
}
