//! Service seams and the shipped HTTP adapters.
//!
//! Each external product sits behind a composite trait built from the
//! component traits (`StatusProbe`, `AuthProbe`, `ResourceProvider`, ...).
//! The orchestrator only sees these traits; `fakes` and the HTTP clients
//! below both implement them.

pub mod content;
pub mod gitea;
pub mod http;
pub mod jenkins;
pub mod sonar;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::config::ServiceEndpoint;
use crate::credentials::{AuthProbe, PasswordRotation};
use crate::ensure::{ResourceHandle, ResourceProvider};
use crate::error::Result;
use crate::pipeline::BuildControl;
use crate::propagation::ContentFetcher;
use crate::readiness::StatusProbe;

pub use content::ContentServer;
pub use gitea::GiteaClient;
pub use jenkins::JenkinsClient;
pub use sonar::SonarQubeClient;

/// An external service with a configured endpoint.
pub trait Service: Send + Sync {
    fn endpoint(&self) -> &ServiceEndpoint;

    fn name(&self) -> &str {
        &self.endpoint().name
    }
}

/// State of a tracked issue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IssueState {
    Open,
    Closed,
}

/// Issue state transitions beyond creation.
#[async_trait]
pub trait IssueTracker: Service {
    /// Close the issue. Closing a closed issue is a no-op.
    async fn close_issue(&self, issue: &ResourceHandle) -> Result<()>;

    async fn issue_state(&self, issue: &ResourceHandle) -> Result<IssueState>;
}

/// Code-quality analysis service.
pub trait QualityService: StatusProbe + AuthProbe + PasswordRotation + ResourceProvider {}

impl<T> QualityService for T where T: StatusProbe + AuthProbe + PasswordRotation + ResourceProvider {}

/// Source control and issue tracker.
pub trait SourceControl: StatusProbe + AuthProbe + ResourceProvider + IssueTracker {}

impl<T> SourceControl for T where T: StatusProbe + AuthProbe + ResourceProvider + IssueTracker {}

/// CI server.
pub trait CiServer: StatusProbe + AuthProbe + ResourceProvider + BuildControl {}

impl<T> CiServer for T where T: StatusProbe + AuthProbe + ResourceProvider + BuildControl {}

/// Plain content server (artifact store, web server).
pub trait ContentService: StatusProbe + ContentFetcher {}

impl<T> ContentService for T where T: StatusProbe + ContentFetcher {}
