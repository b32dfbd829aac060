//! gangway: deploy a version everywhere, prove it is live, roll back if not.
//!
//! # Usage
//!
//! ```text
//! gangway deploy --version 4f2a9c81e0d3 --config gangway.toml
//! gangway check --url http://api.internal/revision --version 4f2a9c81e0d3
//! gangway validate --config gangway.toml
//! ```

use std::path::PathBuf;
use std::process::ExitCode;

use clap::{Parser, Subcommand, ValueEnum};
use tracing_subscriber::EnvFilter;

mod commands;

#[derive(Parser)]
#[command(
    name = "gangway",
    about = "Gangway: staged deploys with verification and automatic rollback",
    version,
    propagate_version = true
)]
struct Cli {
    /// Log line format (logs go to stderr).
    #[arg(long, global = true, value_enum, default_value_t = LogFormat::Text)]
    log_format: LogFormat,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Deploy a version to every configured unit.
    ///
    /// Exits 0 on success, 1 on a failed run that was rolled back (or
    /// needed no rollback), 2 when that failure came from a stage
    /// deadline, 3 when the new version is live but old revisions did not
    /// drain, and 4 when the rollback itself could not be confirmed.
    Deploy {
        /// Version to deploy (typically a git SHA).
        #[arg(long)]
        version: String,

        /// Path to the config file.
        #[arg(short, long, default_value = "gangway.toml")]
        config: PathBuf,

        /// Scheduler control plane URL; overrides [backend].endpoint.
        #[arg(long)]
        backend: Option<String>,

        /// Deadline for each polling stage (e.g. "5m"); overrides [timing].
        #[arg(long)]
        timeout: Option<String>,

        /// Pause between checks (e.g. "15s"); overrides [timing].
        #[arg(long)]
        check_interval: Option<String>,

        /// Bearer token sent with smoke test requests.
        #[arg(long, env = "GANGWAY_SMOKE_TOKEN", hide_env_values = true)]
        smoke_token: Option<String>,

        /// Summary format.
        #[arg(short, long, value_enum, default_value_t = OutputFormat::Text)]
        output: OutputFormat,
    },
    /// Probe one endpoint once and compare it against a version.
    Check {
        /// Endpoint serving the deployed version.
        #[arg(long)]
        url: String,

        /// Expected version.
        #[arg(long)]
        version: String,

        /// Smoke test endpoint to hit after a match.
        #[arg(long)]
        smoke_url: Option<String>,

        /// Bearer token sent with the smoke test request.
        #[arg(long, env = "GANGWAY_SMOKE_TOKEN", hide_env_values = true)]
        smoke_token: Option<String>,
    },
    /// Load and validate a config file, then list its units.
    Validate {
        #[arg(short, long, default_value = "gangway.toml")]
        config: PathBuf,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum LogFormat {
    Text,
    Json,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub(crate) enum OutputFormat {
    Text,
    Json,
}

#[tokio::main]
async fn main() -> anyhow::Result<ExitCode> {
    let cli = Cli::parse();
    init_tracing(cli.log_format);

    match cli.command {
        Command::Deploy {
            version,
            config,
            backend,
            timeout,
            check_interval,
            smoke_token,
            output,
        } => {
            commands::deploy::deploy(commands::deploy::DeployArgs {
                version,
                config,
                backend,
                timeout,
                check_interval,
                smoke_token,
                output,
            })
            .await
        }
        Command::Check {
            url,
            version,
            smoke_url,
            smoke_token,
        } => commands::check::check(&url, &version, smoke_url.as_deref(), smoke_token).await,
        Command::Validate { config } => commands::validate::validate(&config),
    }
}

fn init_tracing(format: LogFormat) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,gangway=debug"));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);
    match format {
        LogFormat::Text => builder.init(),
        LogFormat::Json => builder.json().init(),
    }
}
