mod config;

use clap::{Parser, Subcommand};
use config::{CommonConfig, Config, LoggingConfig, MetricsConfig};
use ingest::types::FileStatus;
use ingest::{Services, SetupError, actions};
use std::path::PathBuf;
use std::process::ExitCode;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

/// Pulls ATS collar fixes and forwards them as observations.
#[derive(Parser)]
#[command(name = "collarsync", version, about)]
struct Cli {
    #[arg(long, default_value = "collarsync.yaml")]
    config_file: PathBuf,

    #[command(subcommand)]
    command: CliCommand,
}

#[derive(Subcommand)]
enum CliCommand {
    /// Run the admin API and the pull and process schedules.
    Serve,
    /// Pull both payloads of an integration once.
    Pull {
        #[arg(long)]
        integration: String,
    },
    /// Drain the pending files of an integration once.
    Process {
        #[arg(long)]
        integration: String,
    },
    FileStatus {
        name: String,
    },
    SetFileStatus {
        name: String,
        /// pending, in_progress or processed
        status: FileStatus,
    },
    Reprocess {
        #[arg(long)]
        integration: String,
        name: String,
    },
}

#[derive(thiserror::Error, Debug)]
enum CliError {
    #[error(transparent)]
    Setup(#[from] SetupError),
    #[error(transparent)]
    Ingest(#[from] ingest::errors::IngestError),
    #[error("could not create statsd recorder: {0}")]
    Statsd(#[from] metrics_exporter_statsd::StatsdError),
    #[error("a metrics recorder is already installed")]
    RecorderAlreadySet,
    #[error("could not serialize result: {0}")]
    Output(#[from] serde_json::Error),
    #[error("could not start runtime: {0}")]
    Runtime(#[from] std::io::Error),
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    let config = match Config::from_file(&cli.config_file) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("{e}");
            return ExitCode::FAILURE;
        }
    };

    let _sentry = init_logging(config.common.logging.as_ref());

    match run(cli.command, config) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!(error = %e, "collarsync failed");
            ExitCode::FAILURE
        }
    }
}

fn run(command: CliCommand, config: Config) -> Result<(), CliError> {
    init_metrics(&config.common)?;

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?;

    runtime.block_on(async move {
        let services = match command {
            CliCommand::Serve => {
                tracing::info!("Starting collarsync");
                return Ok(ingest::run(config.ingest).await?);
            }
            _ => Services::from_config(config.ingest)?,
        };

        let output = match command {
            CliCommand::Serve => return Ok(()),
            CliCommand::Pull { integration } => {
                let files = services.pull(&integration).await?;
                serde_json::json!({
                    "data_points_file": files.data_points.to_string(),
                    "transmissions_file": files.transmissions.to_string(),
                })
            }
            CliCommand::Process { integration } => {
                let observations = services.process(&integration).await?;
                serde_json::json!({ "observations_processed": observations })
            }
            CliCommand::FileStatus { name } => serde_json::to_value(
                actions::get_file_status(services.processor(), &name).await?,
            )?,
            CliCommand::SetFileStatus { name, status } => serde_json::to_value(
                actions::set_file_status(services.processor(), &name, status).await?,
            )?,
            CliCommand::Reprocess { integration, name } => {
                serde_json::to_value(services.reprocess(&integration, &name).await?)?
            }
        };
        println!("{output}");
        Ok::<(), CliError>(())
    })
}

/// Installs the fmt subscriber, plus the Sentry layer when a DSN is configured.
fn init_logging(logging: Option<&LoggingConfig>) -> Option<sentry::ClientInitGuard> {
    let level = logging
        .and_then(|l| l.level.as_deref())
        .unwrap_or("info");
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    let guard = logging.and_then(|l| l.sentry_dsn.as_deref()).map(|dsn| {
        sentry::init((
            dsn,
            sentry::ClientOptions {
                release: sentry::release_name!(),
                ..Default::default()
            },
        ))
    });
    let sentry_layer = guard
        .as_ref()
        .map(|_| sentry::integrations::tracing::layer());

    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer().with_target(true))
        .with(sentry_layer)
        .with(env_filter)
        .init();

    guard
}

fn init_metrics(common: &CommonConfig) -> Result<(), CliError> {
    let Some(MetricsConfig {
        statsd_host,
        statsd_port,
        prefix,
    }) = &common.metrics
    else {
        return Ok(());
    };

    let recorder = metrics_exporter_statsd::StatsdBuilder::from(statsd_host.as_str(), *statsd_port)
        .build(Some(prefix.as_str()))?;
    metrics::set_global_recorder(recorder).map_err(|_| CliError::RecorderAlreadySet)?;
    shared::metrics_defs::describe_all(ingest::metrics_defs::ALL_METRICS);
    tracing::info!(host = %statsd_host, port = statsd_port, "Sending metrics to statsd");

    Ok(())
}
