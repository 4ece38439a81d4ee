//! End-to-end runs of the orchestrator against the in-memory lab.

use std::time::Duration;

use sdlc_e2e_core::fakes::FakeLab;
use sdlc_e2e_core::services::IssueState;
use sdlc_e2e_core::{E2eError, Orchestrator, RunConfig, Secret, StepStatus, STEPS};

fn config() -> RunConfig {
    RunConfig::with_defaults().expect("defaults parse")
}

/// Test: a fresh deployment is provisioned and the change reaches the web server
#[tokio::test(start_paused = true)]
async fn test_fresh_deployment_converges() {
    let config = config();
    let lab = FakeLab::deployment(&config);

    let report = Orchestrator::new(&config, lab.services()).run().await;

    assert!(report.succeeded(), "run failed: {:?}", report.failure);
    assert_eq!(report.steps.len(), STEPS.len());
    let names: Vec<&str> = report.steps.iter().map(|s| s.name.as_str()).collect();
    assert_eq!(names, STEPS.to_vec());

    assert!(lab.is_installed());
    assert!(lab.has_project("hello-world"));
    assert_eq!(
        lab.issue_state("admin", "hello-world", &config.scm.issue_title),
        Some(IssueState::Closed)
    );
    assert_eq!(
        lab.file("admin", "hello-world", "index.html").as_deref(),
        Some(config.index_file.content.as_str())
    );

    let digest = report.artifact_sha256.as_deref().expect("artifact digest");
    assert_eq!(digest.len(), 64);
    assert_eq!(
        report.step("scm.repository").map(|s| s.status),
        Some(StepStatus::Created)
    );
    assert_eq!(
        report.step("scm.close_issue").map(|s| s.status),
        Some(StepStatus::Completed)
    );
}

/// Test: a second run over the same lab creates nothing
#[tokio::test(start_paused = true)]
async fn test_rerun_is_idempotent() {
    let config = config();
    let lab = FakeLab::deployment(&config);

    let first = Orchestrator::new(&config, lab.services()).run().await;
    assert!(first.succeeded(), "first run failed: {:?}", first.failure);
    let after_first = lab.counters();

    let second = Orchestrator::new(&config, lab.services()).run().await;
    assert!(second.succeeded(), "second run failed: {:?}", second.failure);
    let after_second = lab.counters();

    assert_eq!(second.created().count(), 0);
    assert_eq!(after_second.quality_creations, after_first.quality_creations);
    assert_eq!(after_second.scm_creations, after_first.scm_creations);
    assert_eq!(after_second.ci_creations, after_first.ci_creations);
    assert_eq!(after_second.scm_issue_closes, after_first.scm_issue_closes);
    assert_eq!(lab.issue_count(), 1);
    assert_eq!(
        second.step("scm.close_issue").map(|s| s.status),
        Some(StepStatus::Skipped)
    );
    assert_eq!(first.artifact_sha256, second.artifact_sha256);
}

/// Test: a forced rotation without a new secret stops the run before source control
#[tokio::test(start_paused = true)]
async fn test_forced_rotation_without_new_secret_fails_fast() {
    let config = config();
    let lab = FakeLab::deployment(&config);
    lab.require_quality_rotation(true);

    let report = Orchestrator::new(&config, lab.services()).run().await;

    let failure = report.failure.as_ref().expect("run should fail");
    assert_eq!(failure.step, "quality.credentials");
    match &failure.source {
        E2eError::PasswordRotationRequiredButNoTargetProvided { variable, .. } => {
            assert_eq!(variable, "SONAR_NEW_PASS");
        }
        other => panic!("unexpected error: {other}"),
    }
    assert_eq!(lab.counters().scm_calls, 0);
    assert_eq!(lab.counters().quality_password_changes, 0);
    assert_eq!(
        report.steps.last().map(|s| s.status),
        Some(StepStatus::Failed)
    );
}

/// Test: a forced rotation with a new secret rotates once and continues
#[tokio::test(start_paused = true)]
async fn test_forced_rotation_with_new_secret() {
    let mut config = config();
    config.quality.new_secret = Some(Secret::new("N3w-Passw0rd!"));
    let lab = FakeLab::deployment(&config);
    lab.require_quality_rotation(true);

    let report = Orchestrator::new(&config, lab.services()).run().await;

    assert!(report.succeeded(), "run failed: {:?}", report.failure);
    assert_eq!(lab.quality_password(), "N3w-Passw0rd!");
    assert_eq!(lab.counters().quality_password_changes, 1);
    let detail = &report.step("quality.credentials").expect("step").detail;
    assert!(detail.contains("rotated"), "detail was {detail}");

    // The next run authenticates with the override and does not rotate again.
    let rerun = Orchestrator::new(&config, lab.services()).run().await;
    assert!(rerun.succeeded(), "rerun failed: {:?}", rerun.failure);
    assert_eq!(lab.counters().quality_password_changes, 1);
}

/// Test: a build that never finishes is cut off by the run timeout
#[tokio::test(start_paused = true)]
async fn test_run_timeout_interrupts_current_step() {
    let mut config = config();
    config.run_timeout = Duration::from_secs(90);
    let lab = FakeLab::deployment(&config);
    lab.set_build_duration_polls(u32::MAX);

    let report = Orchestrator::new(&config, lab.services()).run().await;

    let failure = report.failure.as_ref().expect("run should time out");
    assert_eq!(failure.step, "ci.seed_build");
    assert!(matches!(failure.source, E2eError::RunTimeout { .. }));
    assert_eq!(
        report.step("ci.seed_build").map(|s| s.status),
        Some(StepStatus::Failed)
    );
    assert!(report.finished_at.is_some());
}

/// Test: a failing pipeline build names the step and stops before propagation
#[tokio::test(start_paused = true)]
async fn test_failed_build_stops_run() {
    let config = config();
    let lab = FakeLab::deployment(&config);
    lab.set_build_outcome(sdlc_e2e_core::BuildStatus::Failure);

    let report = Orchestrator::new(&config, lab.services()).run().await;

    let failure = report.failure.as_ref().expect("run should fail");
    assert_eq!(failure.step, "ci.seed_build");
    assert!(matches!(failure.source, E2eError::BuildFailed { .. }));
    assert!(report.step("artifact.propagation").is_none());
    assert_eq!(lab.counters().content_fetches, 0);
}

/// Test: probe reports every service without touching state
#[tokio::test(start_paused = true)]
async fn test_probe_reports_all_services() {
    let config = config();
    let lab = FakeLab::deployment(&config);
    lab.quality_boots_after(3);

    let results = Orchestrator::new(&config, lab.services()).probe().await;

    assert_eq!(results.len(), 5);
    assert!(results.iter().all(|r| r.ready), "{results:?}");
    assert_eq!(results[0].service, "sonarqube");
    assert_eq!(lab.counters().scm_creations, 0);
    assert!(!lab.is_installed());
}

/// Test: the report serializes with the failure rendered as text
#[tokio::test(start_paused = true)]
async fn test_report_serializes() {
    let config = config();
    let lab = FakeLab::deployment(&config);
    lab.require_quality_rotation(true);

    let report = Orchestrator::new(&config, lab.services()).run().await;
    let json = serde_json::to_value(&report).unwrap();

    assert_eq!(json["failure"]["step"], "quality.credentials");
    assert!(json["failure"]["source"]
        .as_str()
        .unwrap()
        .contains("SONAR_NEW_PASS"));
    assert_eq!(json["steps"][0]["status"], "completed");
}
