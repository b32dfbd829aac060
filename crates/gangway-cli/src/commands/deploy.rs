use std::fmt::Write as _;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::{Context, bail};
use tracing::info;

use gangway_backend::HttpBackend;
use gangway_core::{Backend, GangwayConfig, Prober};
use gangway_probe::HttpProber;
use gangway_rollout::{
    Orchestrator, Outcome, RollbackStatus, RunOutcome, RunStatus, StageConfig, StageReport,
};

use crate::OutputFormat;

pub struct DeployArgs {
    pub version: String,
    pub config: PathBuf,
    pub backend: Option<String>,
    pub timeout: Option<String>,
    pub check_interval: Option<String>,
    pub smoke_token: Option<String>,
    pub output: OutputFormat,
}

pub async fn deploy(args: DeployArgs) -> anyhow::Result<ExitCode> {
    let mut config = GangwayConfig::from_file(&args.config)
        .with_context(|| format!("loading {}", args.config.display()))?;

    // Command-line overrides go through the same validation as the file.
    if let Some(endpoint) = args.backend {
        config.backend.endpoint = Some(endpoint);
    }
    if let Some(timeout) = args.timeout {
        config.timing.timeout = timeout;
    }
    if let Some(interval) = args.check_interval {
        config.timing.check_interval = interval;
    }
    config.validate().context("invalid settings")?;

    let stage_config = StageConfig {
        timeout: config.timing.timeout()?,
        check_interval: config.timing.check_interval()?,
    };
    let Some(endpoint) = config.backend.endpoint.as_deref() else {
        bail!("no scheduler endpoint: set [backend].endpoint or pass --backend");
    };
    let backend = HttpBackend::new(endpoint, config.backend.request_timeout()?)?;

    let mut prober = HttpProber::default();
    if let Some(token) = args.smoke_token.filter(|t| !t.is_empty()) {
        prober = prober.with_smoke_token(token);
    }

    let services = config.service_units(&args.version)?;
    let scheduled_tasks = config.scheduled_task_units(&args.version)?;
    info!(
        version = %args.version,
        services = services.len(),
        scheduled_tasks = scheduled_tasks.len(),
        backend = %endpoint,
        "deploying"
    );

    let orchestrator = Orchestrator::new(
        stage_config,
        Arc::new(backend) as Arc<dyn Backend>,
        Arc::new(prober) as Arc<dyn Prober>,
    );
    let outcome = orchestrator.run_deployment(services, scheduled_tasks).await;

    match args.output {
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&outcome)?),
        OutputFormat::Text => print!("{}", render_summary(&args.version, &outcome)),
    }

    Ok(ExitCode::from(exit_code(&outcome)))
}

/// Process exit status for a finished run.
pub fn exit_code(outcome: &RunOutcome) -> u8 {
    match outcome.status {
        RunStatus::Succeeded => 0,
        RunStatus::Degraded => 3,
        RunStatus::RollbackFailed => 4,
        RunStatus::Failed | RunStatus::RolledBack if outcome.timed_out() => 2,
        RunStatus::Failed | RunStatus::RolledBack => 1,
    }
}

pub fn render_summary(version: &str, outcome: &RunOutcome) -> String {
    let mut out = String::new();
    let _ = writeln!(out, "deploy {version}: {}", outcome.status.as_str());

    render_report(&mut out, "", &outcome.deploy);
    for report in [&outcome.verify_deployed, &outcome.verify_drained].into_iter().flatten() {
        render_report(&mut out, "", report);
    }

    if let Some(rollback) = &outcome.rollback {
        let _ = writeln!(
            out,
            "rollback after {} ({}): {}",
            rollback.trigger,
            rollback.units.join(", "),
            match rollback.status {
                RollbackStatus::Confirmed => "confirmed",
                RollbackStatus::Draining => "previous version live, still draining",
                RollbackStatus::Unconfirmed => "previous version not observed",
                RollbackStatus::Failed => "revert failed",
            }
        );
        render_report(&mut out, "  ", &rollback.revert);
        for report in [&rollback.verify_deployed, &rollback.verify_drained].into_iter().flatten() {
            render_report(&mut out, "  ", report);
        }
    }

    if outcome.status == RunStatus::RollbackFailed {
        out.push_str("rollback could not be confirmed; manual intervention required\n");
    }
    out
}

fn render_report(out: &mut String, indent: &str, report: &StageReport) {
    let _ = writeln!(out, "{indent}{}:", report.stage);
    let width = report.results.iter().map(|r| r.unit.len()).max().unwrap_or(0);
    for result in &report.results {
        let status = match &result.outcome {
            Outcome::Succeeded => "ok".to_string(),
            Outcome::NoCheckConfigured => "skipped (no check endpoint)".to_string(),
            Outcome::Failed(error) => format!("FAILED: {error}"),
        };
        let _ = writeln!(out, "{indent}  {:<width$}  {status}", result.unit);
    }
}
