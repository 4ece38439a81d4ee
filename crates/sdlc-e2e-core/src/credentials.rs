//! Credential negotiation and one-shot forced password rotation.
//!
//! Candidates are probed through a non-UI authentication check in a fixed
//! priority order (known default first, then the operator override). A
//! server-imposed password change is carried out at most once per run and
//! only while the effective credential is still the known default.

use std::fmt;

use async_trait::async_trait;
use serde::{Deserialize, Serialize, Serializer};
use tokio::sync::Mutex;
use tracing::{info, warn};

use crate::error::{E2eError, Result};
use crate::services::Service;

/// A secret that never shows up in logs, debug output or reports.
#[derive(Clone, PartialEq, Eq)]
pub struct Secret(String);

impl Secret {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    /// The raw value, for building requests only.
    pub fn expose(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for Secret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Secret(***)")
    }
}

impl Serialize for Secret {
    fn serialize<S: Serializer>(&self, s: S) -> std::result::Result<S::Ok, S::Error> {
        s.serialize_str("***")
    }
}

/// Where a credential came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CredentialOrigin {
    /// The product's factory default.
    KnownDefault,
    /// Supplied by the operator, or produced by a rotation.
    Override,
}

/// What the run currently knows about a credential.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Validity {
    Unknown,
    Valid,
    Invalid,
    /// Produced by this run's forced rotation.
    Rotated,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Credential {
    pub principal: String,
    pub secret: Secret,
    pub origin: CredentialOrigin,
    pub validity: Validity,
}

impl Credential {
    pub fn known_default(principal: &str, secret: Secret) -> Self {
        Self {
            principal: principal.to_string(),
            secret,
            origin: CredentialOrigin::KnownDefault,
            validity: Validity::Unknown,
        }
    }

    pub fn operator_override(principal: &str, secret: Secret) -> Self {
        Self {
            principal: principal.to_string(),
            secret,
            origin: CredentialOrigin::Override,
            validity: Validity::Unknown,
        }
    }

    pub fn is_known_default(&self) -> bool {
        self.origin == CredentialOrigin::KnownDefault
    }

    fn with_validity(mut self, validity: Validity) -> Self {
        self.validity = validity;
        self
    }
}

/// Result of a non-UI authentication probe.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuthProbeOutcome {
    Accepted,
    Rejected,
    /// The service could not be reached; the credential was not judged.
    Unreachable(String),
}

/// A service that can check a credential without side effects.
#[async_trait]
pub trait AuthProbe: Service {
    async fn probe(&self, credential: &Credential) -> AuthProbeOutcome;

    /// Use `credential` for every later call (the "sign-in" intent).
    async fn adopt(&self, credential: &Credential) -> Result<()>;
}

/// How a state-changing call authenticates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuthStrategy {
    /// Reuse the session cookie established at sign-in.
    SessionCookie,
    /// Send an explicit basic-auth header.
    BasicAuth,
}

/// Answer to one authenticated attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuthAttempt {
    Accepted,
    /// This authentication scheme was refused; another one may work.
    Unauthorized,
    /// The request itself was refused.
    Rejected { status: u16, body: String },
}

/// A service that may force a password change before further use.
#[async_trait]
pub trait PasswordRotation: Service {
    /// Whether the service currently demands a new password for `current`.
    async fn rotation_required(&self, current: &Credential) -> Result<bool>;

    async fn change_password(
        &self,
        strategy: AuthStrategy,
        current: &Credential,
        new_secret: &Secret,
    ) -> Result<AuthAttempt>;
}

/// Outcome of running an ordered list of authentication strategies.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChainOutcome {
    Accepted(AuthStrategy),
    Rejected {
        strategy: AuthStrategy,
        status: u16,
        body: String,
    },
    /// Every strategy answered `Unauthorized`.
    Exhausted,
}

/// Try `strategies` in order until one is accepted or one is rejected
/// outright. `Unauthorized` moves on to the next strategy.
pub async fn first_accepted<F, Fut>(strategies: &[AuthStrategy], mut attempt: F) -> Result<ChainOutcome>
where
    F: FnMut(AuthStrategy) -> Fut,
    Fut: std::future::Future<Output = Result<AuthAttempt>>,
{
    for &strategy in strategies {
        match attempt(strategy).await? {
            AuthAttempt::Accepted => return Ok(ChainOutcome::Accepted(strategy)),
            AuthAttempt::Unauthorized => {
                warn!(?strategy, "authentication scheme refused, trying next");
            }
            AuthAttempt::Rejected { status, body } => {
                return Ok(ChainOutcome::Rejected {
                    strategy,
                    status,
                    body,
                })
            }
        }
    }
    Ok(ChainOutcome::Exhausted)
}

/// Resolves working credentials and guards the one allowed rotation.
pub struct CredentialNegotiator {
    /// Name of the setting that supplies the override secret, for messages.
    override_setting: String,
    strategies: Vec<AuthStrategy>,
    rotated: Mutex<Option<Credential>>,
}

impl CredentialNegotiator {
    pub fn new(override_setting: &str) -> Self {
        Self {
            override_setting: override_setting.to_string(),
            strategies: vec![AuthStrategy::SessionCookie, AuthStrategy::BasicAuth],
            rotated: Mutex::new(None),
        }
    }

    /// Return the first candidate the service accepts.
    ///
    /// A rejected candidate falls through to the next one. An unreachable
    /// service fails immediately: a candidate is never skipped because of a
    /// network error.
    pub async fn resolve_working_credential<S>(
        &self,
        service: &S,
        candidates: Vec<Credential>,
    ) -> Result<Credential>
    where
        S: AuthProbe + ?Sized,
    {
        let tried = candidates.len();
        let only_default = candidates.iter().all(Credential::is_known_default);

        for candidate in candidates {
            match service.probe(&candidate).await {
                AuthProbeOutcome::Accepted => {
                    let credential = candidate.with_validity(Validity::Valid);
                    service.adopt(&credential).await?;
                    info!(
                        service = %service.name(),
                        principal = %credential.principal,
                        origin = ?credential.origin,
                        "credential accepted"
                    );
                    return Ok(credential);
                }
                AuthProbeOutcome::Rejected => {
                    info!(
                        service = %service.name(),
                        principal = %candidate.principal,
                        origin = ?candidate.origin,
                        "credential rejected"
                    );
                }
                AuthProbeOutcome::Unreachable(reason) => {
                    return Err(E2eError::AuthProbeUnreachable {
                        service: service.name().to_string(),
                        reason,
                    });
                }
            }
        }

        let hint = only_default.then(|| {
            format!(
                "the default password was refused and {} is not set",
                self.override_setting
            )
        });
        Err(E2eError::AuthExhausted {
            service: service.name().to_string(),
            tried,
            hint,
        })
    }

    /// Carry out a server-imposed password change, at most once per run.
    ///
    /// Returns the credential to use from now on: the rotated one after a
    /// change, `current` when no change is needed or allowed.
    pub async fn handle_forced_rotation<S>(
        &self,
        service: &S,
        current: &Credential,
        new_secret: Option<&Secret>,
    ) -> Result<Credential>
    where
        S: PasswordRotation + AuthProbe + ?Sized,
    {
        let mut rotated = self.rotated.lock().await;
        if let Some(credential) = rotated.as_ref() {
            return Ok(credential.clone());
        }
        if !current.is_known_default() || current.validity == Validity::Rotated {
            return Ok(current.clone());
        }
        if !service.rotation_required(current).await? {
            return Ok(current.clone());
        }

        let new_secret =
            new_secret.ok_or_else(|| E2eError::PasswordRotationRequiredButNoTargetProvided {
                service: service.name().to_string(),
                variable: self.override_setting.clone(),
            })?;

        info!(service = %service.name(), principal = %current.principal, "rotating default password");
        let outcome = first_accepted(&self.strategies, |strategy| {
            service.change_password(strategy, current, new_secret)
        })
        .await?;

        match outcome {
            ChainOutcome::Accepted(strategy) => {
                let credential = Credential {
                    principal: current.principal.clone(),
                    secret: new_secret.clone(),
                    origin: CredentialOrigin::Override,
                    validity: Validity::Rotated,
                };
                service.adopt(&credential).await?;
                info!(service = %service.name(), ?strategy, "password rotated");
                *rotated = Some(credential.clone());
                Ok(credential)
            }
            ChainOutcome::Rejected { status, body, .. } => Err(E2eError::RotationRejected {
                service: service.name().to_string(),
                status,
                body,
            }),
            ChainOutcome::Exhausted => Err(E2eError::RotationRejected {
                service: service.name().to_string(),
                status: 401,
                body: "every authentication scheme was refused".to_string(),
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fakes::FakeLab;

    fn default_admin() -> Credential {
        Credential::known_default("admin", Secret::new("admin"))
    }

    #[test]
    fn test_secret_is_redacted() {
        let credential = default_admin();
        assert!(format!("{credential:?}").contains("Secret(***)"));
        assert_eq!(format!("{:?}", credential.secret), "Secret(***)");
        assert_eq!(
            serde_json::to_string(&credential.secret).unwrap(),
            "\"***\""
        );
    }

    #[tokio::test]
    async fn test_default_accepted_first() {
        let lab = FakeLab::new();
        let quality = lab.quality();
        let negotiator = CredentialNegotiator::new("SONAR_NEW_PASS");

        let resolved = negotiator
            .resolve_working_credential(
                &quality,
                vec![
                    default_admin(),
                    Credential::operator_override("admin", Secret::new("new-pass")),
                ],
            )
            .await
            .unwrap();

        assert!(resolved.is_known_default());
        assert_eq!(resolved.validity, Validity::Valid);
        assert_eq!(lab.counters().quality_auth_probes, 1);
    }

    #[tokio::test]
    async fn test_falls_through_to_override_when_default_rejected() {
        let lab = FakeLab::new();
        lab.set_quality_password("new-pass");
        let quality = lab.quality();
        let negotiator = CredentialNegotiator::new("SONAR_NEW_PASS");

        let resolved = negotiator
            .resolve_working_credential(
                &quality,
                vec![
                    default_admin(),
                    Credential::operator_override("admin", Secret::new("new-pass")),
                ],
            )
            .await
            .unwrap();

        assert_eq!(resolved.secret.expose(), "new-pass");
        assert_eq!(resolved.origin, CredentialOrigin::Override);
    }

    #[tokio::test]
    async fn test_exhausted_names_missing_override() {
        let lab = FakeLab::new();
        lab.set_quality_password("someone-else-changed-it");
        let quality = lab.quality();
        let negotiator = CredentialNegotiator::new("SONAR_NEW_PASS");

        let err = negotiator
            .resolve_working_credential(&quality, vec![default_admin()])
            .await
            .unwrap_err();

        assert!(matches!(err, E2eError::AuthExhausted { tried: 1, .. }));
        assert!(err.to_string().contains("SONAR_NEW_PASS"));
    }

    #[tokio::test]
    async fn test_unreachable_fails_without_trying_next_candidate() {
        let lab = FakeLab::new();
        lab.set_quality_unreachable(true);
        let quality = lab.quality();
        let negotiator = CredentialNegotiator::new("SONAR_NEW_PASS");

        let err = negotiator
            .resolve_working_credential(
                &quality,
                vec![
                    default_admin(),
                    Credential::operator_override("admin", Secret::new("new-pass")),
                ],
            )
            .await
            .unwrap_err();

        assert!(matches!(err, E2eError::AuthProbeUnreachable { .. }));
        assert_eq!(lab.counters().quality_auth_probes, 1);
    }

    #[tokio::test]
    async fn test_rotation_happens_at_most_once() {
        let lab = FakeLab::new();
        lab.require_quality_rotation(true);
        // Keep demanding a rotation even after the change.
        lab.keep_demanding_rotation(true);
        let quality = lab.quality();
        let negotiator = CredentialNegotiator::new("SONAR_NEW_PASS");
        let current = default_admin().with_validity(Validity::Valid);
        let new_secret = Secret::new("rotated!");

        let first = negotiator
            .handle_forced_rotation(&quality, &current, Some(&new_secret))
            .await
            .unwrap();
        let second = negotiator
            .handle_forced_rotation(&quality, &current, Some(&new_secret))
            .await
            .unwrap();

        assert_eq!(first.validity, Validity::Rotated);
        assert_eq!(first, second);
        assert_eq!(lab.counters().quality_password_changes, 1);
    }

    #[tokio::test]
    async fn test_rotation_skipped_for_non_default_credential() {
        let lab = FakeLab::new();
        lab.require_quality_rotation(true);
        let quality = lab.quality();
        let negotiator = CredentialNegotiator::new("SONAR_NEW_PASS");
        let current = Credential::operator_override("admin", Secret::new("already-changed"));

        let effective = negotiator
            .handle_forced_rotation(&quality, &current, Some(&Secret::new("another")))
            .await
            .unwrap();

        assert_eq!(effective, current);
        assert_eq!(lab.counters().quality_password_changes, 0);
        assert_eq!(lab.counters().quality_rotation_checks, 0);
    }

    #[tokio::test]
    async fn test_rotation_required_without_target_fails_fast() {
        let lab = FakeLab::new();
        lab.require_quality_rotation(true);
        let quality = lab.quality();
        let negotiator = CredentialNegotiator::new("SONAR_NEW_PASS");

        let err = negotiator
            .handle_forced_rotation(&quality, &default_admin(), None)
            .await
            .unwrap_err();

        assert!(matches!(
            err,
            E2eError::PasswordRotationRequiredButNoTargetProvided { .. }
        ));
        assert_eq!(lab.counters().quality_password_changes, 0);
    }

    #[tokio::test]
    async fn test_rotation_falls_back_to_basic_auth() {
        let lab = FakeLab::new();
        lab.require_quality_rotation(true);
        lab.refuse_session_cookie_for_password_change(true);
        let quality = lab.quality();
        let negotiator = CredentialNegotiator::new("SONAR_NEW_PASS");

        let rotated = negotiator
            .handle_forced_rotation(&quality, &default_admin(), Some(&Secret::new("rotated!")))
            .await
            .unwrap();

        assert_eq!(rotated.secret.expose(), "rotated!");
        assert_eq!(lab.counters().quality_password_change_attempts, 2);
        assert_eq!(lab.counters().quality_password_changes, 1);
    }

    #[tokio::test]
    async fn test_first_accepted_stops_on_rejection() {
        let outcome = first_accepted(
            &[AuthStrategy::SessionCookie, AuthStrategy::BasicAuth],
            |strategy| async move {
                Ok(match strategy {
                    AuthStrategy::SessionCookie => AuthAttempt::Rejected {
                        status: 400,
                        body: "password too short".to_string(),
                    },
                    AuthStrategy::BasicAuth => AuthAttempt::Accepted,
                })
            },
        )
        .await
        .unwrap();

        assert_eq!(
            outcome,
            ChainOutcome::Rejected {
                strategy: AuthStrategy::SessionCookie,
                status: 400,
                body: "password too short".to_string(),
            }
        );
    }
}
