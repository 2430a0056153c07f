//! Headless launcher for the tracking rig.
//!
//! Run one trial with the synthetic camera:
//! ```bash
//! rig run --name trial_01 --duration 60
//! ```
//!
//! Replay a raw recording instead of the camera:
//! ```bash
//! rig run --name replay --duration 30 --video trials/trial_01_raw.frames
//! ```
//!
//! Show the effective configuration:
//! ```bash
//! rig config
//! ```

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use closed_loop_rig::config::{RigConfig, SourceKind};
use closed_loop_rig::messages::{Command, TrialParameters, UnitName};
use closed_loop_rig::orchestrator::Rig;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Slack on top of the trial duration before the launcher gives up waiting.
const FINISH_SLACK: Duration = Duration::from_secs(30);

#[derive(Parser)]
#[command(name = "rig")]
#[command(about = "Closed-loop behavioral tracking rig", long_about = None)]
struct Cli {
    /// Configuration file; defaults to `config/rig.toml`, then the user config dir
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Log level for the rig's own targets
    #[arg(long, global = true)]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a single trial and exit once every unit has saved
    Run {
        /// Trial name, used as the prefix of every output file
        #[arg(long)]
        name: String,

        /// Trial duration in seconds
        #[arg(long, default_value_t = 60.0)]
        duration: f64,

        /// Directory for trial outputs
        #[arg(long)]
        output_dir: Option<PathBuf>,

        /// Raw recording to replay instead of the camera
        #[arg(long)]
        video: Option<PathBuf>,
    },

    /// Print the effective configuration as TOML
    Config,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let mut config = load_config(cli.config.as_deref())?;
    if let Some(level) = cli.log_level {
        config.application.log_level = level;
    }

    match cli.command {
        Commands::Config => {
            let text = toml::to_string_pretty(&config).context("Failed to serialize configuration")?;
            println!("{text}");
            Ok(())
        }
        Commands::Run {
            name,
            duration,
            output_dir,
            video,
        } => {
            closed_loop_rig::logging::init(&config.application.log_level)?;
            if let Some(dir) = output_dir {
                config.application.output_dir = dir;
            }
            if let Some(path) = video {
                config.camera.source = SourceKind::File;
                config.camera.video_path = Some(path);
            }
            run_trial(config, TrialParameters::new(name, duration)).await
        }
    }
}

fn load_config(explicit: Option<&Path>) -> Result<RigConfig> {
    let path = match explicit {
        Some(path) => path.to_path_buf(),
        None => {
            let local = PathBuf::from("config/rig.toml");
            let user = dirs::config_dir().map(|dir| dir.join("closed_loop_rig").join("rig.toml"));
            match user {
                Some(user) if !local.exists() && user.exists() => user,
                _ => local,
            }
        }
    };
    RigConfig::load_from(&path).with_context(|| format!("Failed to load {}", path.display()))
}

async fn run_trial(config: RigConfig, params: TrialParameters) -> Result<()> {
    std::fs::create_dir_all(&config.application.output_dir).with_context(|| {
        format!("Cannot create {}", config.application.output_dir.display())
    })?;
    let start_timeout = config.barrier.ack_timeout.unwrap_or(FINISH_SLACK) + FINISH_SLACK;
    let finish_timeout = params.duration() + FINISH_SLACK;

    let mut rig = Rig::build(config)?.spawn();
    tracing::info!(name = %params.name, duration = params.duration_seconds, "Requesting trial start");
    rig.send(Command::Start(params))?;

    let outcome = match rig
        .wait_for(start_timeout, |c| matches!(c, Command::Started | Command::Error { .. }))
        .await
    {
        Some(Command::Started) => {
            tracing::info!("Trial running");
            wait_until_finished(&mut rig, finish_timeout).await
        }
        Some(Command::Error { reason, .. }) => Err(anyhow::anyhow!("Trial did not start: {reason}")),
        _ => Err(anyhow::anyhow!("Trial did not start within {start_timeout:?}")),
    };

    rig.shutdown().await?;
    outcome
}

async fn wait_until_finished(rig: &mut closed_loop_rig::orchestrator::RunningRig, timeout: Duration) -> Result<()> {
    let deadline = tokio::time::Instant::now() + timeout;
    let mut interrupted = false;
    loop {
        let left = deadline.saturating_duration_since(tokio::time::Instant::now());
        if left.is_zero() {
            anyhow::bail!("Trial did not finish within {timeout:?}");
        }
        tokio::select! {
            notification = rig.next_notification(left) => match notification {
                Some(Command::Saving) => tracing::info!("Saving trial outputs"),
                Some(Command::Finished) => {
                    tracing::info!("Trial finished");
                    return Ok(());
                }
                Some(Command::Error { destination: UnitName::Gui, reason }) => {
                    tracing::error!(%reason, "Rig reported an error");
                }
                Some(other) => tracing::debug!(kind = other.kind(), "Notification"),
                None => {}
            },
            signal = tokio::signal::ctrl_c(), if !interrupted => {
                signal.context("Failed to listen for Ctrl-C")?;
                tracing::warn!("Interrupted, stopping trial");
                interrupted = true;
                rig.send(Command::Stop)?;
            }
        }
    }
}
