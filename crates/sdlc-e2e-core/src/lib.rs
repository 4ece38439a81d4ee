//! SDLC end-to-end verifier.
//!
//! Drives one scripted workflow across a code-quality service, source
//! control, a CI server, an artifact store and a web server, and verifies
//! that a change propagates all the way to the served page.

pub mod config;
pub mod credentials;
pub mod ensure;
pub mod error;
pub mod fakes;
pub mod obs;
pub mod orchestrator;
pub mod pipeline;
pub mod poll;
pub mod propagation;
pub mod readiness;
pub mod services;
pub mod telemetry;

pub use config::{RunConfig, ServiceEndpoint, Timings};
pub use credentials::{Credential, CredentialNegotiator, Secret};
pub use ensure::{ensure, EnsureOutcome, ResourceDescriptor, ResourceHandle, ResourceKind};
pub use error::{E2eError, Result};
pub use orchestrator::{Orchestrator, ProbeResult, RunFailure, RunReport, Services, StepRecord, StepStatus, STEPS};
pub use pipeline::{trigger_and_await_success, wait_for_job, BuildRun, BuildStatus, JobRef};
pub use poll::{poll_until, PollPolicy, PollTimeout};
pub use propagation::{verify_downstream_propagation, AccessPath, ContentExpectation, ConvergenceCheck};
pub use readiness::wait_until_ready;
