//! SDLC end-to-end verifier CLI
//!
//! The `sdlc-e2e` command drives one verification run across the quality
//! service, source control, CI server, artifact store and web server.
//!
//! ## Commands
//!
//! - `run`: provision what is missing, build, and verify propagation
//! - `probe`: readiness check of every service, nothing is changed
//! - `config`: print the resolved configuration with secrets redacted

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::{Args, Parser, Subcommand};
use tracing::{info, Level};

use sdlc_e2e_core::config::defaults;
use sdlc_e2e_core::config::{
    ci_readiness, content_readiness, quality_readiness, scm_readiness, TrackedFile,
};
use sdlc_e2e_core::telemetry::init_tracing;
use sdlc_e2e_core::{
    Orchestrator, ProbeResult, RunConfig, RunReport, Secret, ServiceEndpoint, Services,
    StepStatus,
};

#[derive(Parser)]
#[command(name = "sdlc-e2e")]
#[command(author = "Stevedores Org")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "End-to-end verifier for a self-hosted SDLC pipeline", long_about = None)]
struct Cli {
    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Emit JSON-formatted log lines and reports
    #[arg(long, global = true)]
    json: bool,

    #[command(flatten)]
    settings: Settings,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the full verification
    Run,

    /// Check that every service answers, without changing anything
    Probe,

    /// Print the resolved configuration
    Config,
}

/// Every run setting, overridable by flag or environment variable.
#[derive(Args, Debug, Clone)]
struct Settings {
    #[arg(long, env = "GITEA_URL", default_value = defaults::GITEA_URL, global = true)]
    gitea_url: String,

    #[arg(long, env = "JENKINS_URL", default_value = defaults::JENKINS_URL, global = true)]
    jenkins_url: String,

    #[arg(long, env = "NEXUS_URL", default_value = defaults::NEXUS_URL, global = true)]
    nexus_url: String,

    #[arg(long, env = "NGINX_URL", default_value = defaults::NGINX_URL, global = true)]
    nginx_url: String,

    #[arg(long, env = "SONAR_URL", default_value = defaults::SONAR_URL, global = true)]
    sonar_url: String,

    #[arg(long, env = "GITEA_ADMIN_USER", default_value = defaults::GITEA_ADMIN_USER, global = true)]
    gitea_admin_user: String,

    #[arg(long, env = "GITEA_ADMIN_PASS", default_value = defaults::GITEA_ADMIN_PASS, hide_env_values = true, hide_default_value = true, global = true)]
    gitea_admin_pass: String,

    #[arg(long, env = "GITEA_ADMIN_EMAIL", default_value = defaults::GITEA_ADMIN_EMAIL, global = true)]
    gitea_admin_email: String,

    #[arg(long, env = "GITEA_REPO", default_value = defaults::GITEA_REPO, global = true)]
    gitea_repo: String,

    #[arg(long, env = "ISSUE_TITLE", default_value = defaults::ISSUE_TITLE, global = true)]
    issue_title: String,

    #[arg(long, env = "SONAR_ADMIN_USER", default_value = defaults::SONAR_ADMIN_USER, global = true)]
    sonar_admin_user: String,

    #[arg(long, env = "SONAR_ADMIN_PASS", default_value = defaults::SONAR_ADMIN_PASS, hide_env_values = true, hide_default_value = true, global = true)]
    sonar_admin_pass: String,

    /// Password to rotate to, or to sign in with once rotated
    #[arg(long, env = "SONAR_NEW_PASS", hide_env_values = true, global = true)]
    sonar_new_pass: Option<String>,

    #[arg(long, env = "SONAR_PROJECT_KEY", default_value = defaults::SONAR_PROJECT_KEY, global = true)]
    sonar_project_key: String,

    #[arg(long, env = "SONAR_PROJECT_NAME", default_value = defaults::SONAR_PROJECT_NAME, global = true)]
    sonar_project_name: String,

    #[arg(long, env = "JENKINS_ADMIN_USER", default_value = defaults::JENKINS_ADMIN_USER, global = true)]
    jenkins_admin_user: String,

    #[arg(long, env = "JENKINS_ADMIN_PASS", default_value = defaults::JENKINS_ADMIN_PASS, hide_env_values = true, hide_default_value = true, global = true)]
    jenkins_admin_pass: String,

    #[arg(long, env = "SEED_JOB", default_value = defaults::SEED_JOB, global = true)]
    seed_job: String,

    #[arg(long, env = "PIPELINE_JOB", default_value = defaults::PIPELINE_JOB, global = true)]
    pipeline_job: String,

    #[arg(long, env = "NEXUS_ARTIFACT_PATH", default_value = defaults::NEXUS_ARTIFACT_PATH, global = true)]
    nexus_artifact_path: String,

    #[arg(long, env = "EXPECTED_TEXT", default_value = defaults::EXPECTED_TEXT, global = true)]
    expected_text: String,

    #[arg(long, env = "RUN_TIMEOUT_SECS", default_value_t = defaults::RUN_TIMEOUT_SECS, global = true)]
    run_timeout_secs: u64,

    /// Jenkinsfile to commit instead of the built-in one
    #[arg(long, global = true)]
    jenkinsfile: Option<PathBuf>,

    /// index.html to commit instead of the built-in one
    #[arg(long, global = true)]
    index_html: Option<PathBuf>,

    /// Job definition used to create the seed job when it is missing
    #[arg(long, env = "SEED_JOB_DEFINITION", global = true)]
    seed_job_definition: Option<PathBuf>,
}

fn read_file(path: &Path) -> Result<String> {
    std::fs::read_to_string(path).with_context(|| format!("Failed to read {}", path.display()))
}

impl Settings {
    /// Overlay the settings onto the built-in defaults.
    fn into_config(self) -> Result<RunConfig> {
        let mut config = RunConfig::with_defaults()?;

        config.quality.endpoint = ServiceEndpoint::parse("sonarqube", &self.sonar_url, quality_readiness())?;
        config.quality.admin_user = self.sonar_admin_user;
        config.quality.default_secret = Secret::new(self.sonar_admin_pass);
        config.quality.new_secret = self
            .sonar_new_pass
            .filter(|pass| !pass.is_empty())
            .map(Secret::new);
        config.quality.project_key = self.sonar_project_key;
        config.quality.project_name = self.sonar_project_name;

        config.scm.endpoint = ServiceEndpoint::parse("gitea", &self.gitea_url, scm_readiness())?;
        config.scm.admin_user = self.gitea_admin_user;
        config.scm.admin_secret = Secret::new(self.gitea_admin_pass);
        config.scm.admin_email = self.gitea_admin_email;
        config.scm.repository = self.gitea_repo;
        config.scm.issue_title = self.issue_title;

        config.ci.endpoint = ServiceEndpoint::parse("jenkins", &self.jenkins_url, ci_readiness())?;
        config.ci.admin_user = self.jenkins_admin_user;
        config.ci.admin_secret = Secret::new(self.jenkins_admin_pass);
        config.ci.seed_job = self.seed_job;
        config.ci.pipeline_job = self.pipeline_job;
        if let Some(path) = &self.seed_job_definition {
            config.ci.seed_job_definition = Some(read_file(path)?);
        }

        config.artifact_store = ServiceEndpoint::parse("nexus", &self.nexus_url, content_readiness())?;
        config.artifact_path = self.nexus_artifact_path;
        config.web_server = ServiceEndpoint::parse("nginx", &self.nginx_url, content_readiness())?;

        if let Some(path) = &self.index_html {
            config.index_file = TrackedFile {
                path: defaults::INDEX_FILE.to_string(),
                content: read_file(path)?,
            };
        }
        if let Some(path) = &self.jenkinsfile {
            config.pipeline_file = TrackedFile {
                path: defaults::PIPELINE_FILE.to_string(),
                content: read_file(path)?,
            };
        }
        config.expected_text = self.expected_text;
        config.run_timeout = Duration::from_secs(self.run_timeout_secs);

        config.validate()?;
        Ok(config)
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let level = if cli.verbose {
        Level::DEBUG
    } else {
        Level::INFO
    };
    init_tracing(cli.json, level);

    let config = cli
        .settings
        .into_config()
        .context("Invalid configuration")?;

    match cli.command {
        Commands::Run => cmd_run(&config, cli.json).await,
        Commands::Probe => cmd_probe(&config, cli.json).await,
        Commands::Config => cmd_config(&config),
    }
}

async fn cmd_run(config: &RunConfig, json: bool) -> Result<()> {
    let services = Services::connect(config).context("Failed to build service clients")?;
    let orchestrator = Orchestrator::new(config, services);
    info!(run_id = %orchestrator.run_id(), "starting verification run");

    let report = orchestrator.run().await;
    if json {
        println!("{}", report_json(&report)?);
    } else {
        print!("{}", render_report(&report));
    }

    if let Some(failure) = &report.failure {
        bail!(
            "step '{}' failed after {}s: {}",
            failure.step,
            failure.elapsed.as_secs(),
            failure.source
        );
    }
    Ok(())
}

/// The report as printed by `run --json`: one pretty-printed JSON document.
fn report_json(report: &RunReport) -> Result<String> {
    serde_json::to_string_pretty(report).context("Failed to serialize run report")
}

async fn cmd_probe(config: &RunConfig, json: bool) -> Result<()> {
    let services = Services::connect(config).context("Failed to build service clients")?;
    let results = Orchestrator::new(config, services).probe().await;

    if json {
        println!("{}", serde_json::to_string_pretty(&results)?);
    } else {
        print!("{}", render_probe(&results));
    }

    let down: Vec<&str> = results
        .iter()
        .filter(|r| !r.ready)
        .map(|r| r.service.as_str())
        .collect();
    if !down.is_empty() {
        bail!("not ready: {}", down.join(", "));
    }
    Ok(())
}

fn cmd_config(config: &RunConfig) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(config)?);
    Ok(())
}

fn status_label(status: StepStatus) -> &'static str {
    match status {
        StepStatus::Completed => "ok",
        StepStatus::Created => "created",
        StepStatus::Skipped => "exists",
        StepStatus::Failed => "FAILED",
    }
}

fn render_report(report: &RunReport) -> String {
    let mut out = format!("Run {}\n", report.run_id);
    for step in &report.steps {
        out.push_str(&format!(
            "  {:<8} {:<22} {:>7}ms  {}\n",
            status_label(step.status),
            step.name,
            step.elapsed_ms,
            step.detail
        ));
    }
    if let Some(digest) = &report.artifact_sha256 {
        out.push_str(&format!("Artifact sha256: {digest}\n"));
    }
    match &report.failure {
        Some(failure) => out.push_str(&format!("FAILED at {}\n", failure.step)),
        None => out.push_str("PASSED\n"),
    }
    out
}

fn render_probe(results: &[ProbeResult]) -> String {
    let mut out = String::new();
    for result in results {
        let state = if result.ready { "ready" } else { "DOWN" };
        out.push_str(&format!(
            "  {:<10} {:<6} {:>7}ms",
            result.service, state, result.elapsed_ms
        ));
        if let Some(error) = &result.error {
            out.push_str(&format!("  {error}"));
        }
        out.push('\n');
    }
    out
}
