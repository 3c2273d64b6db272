mod cloud_logging;
mod config;

use clap::{Args, Parser, Subcommand};
use config::{Config, LoggingConfig, MetricsConfig};
use metrics_exporter_statsd::StatsdBuilder;
use shared::metrics_defs::MetricDef;
use std::path::PathBuf;
use std::process::ExitCode;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::prelude::*;

#[derive(Parser)]
#[command(version, about = "Proxies BigQuery remote function calls to a vault API")]
struct Cli {
    #[command(subcommand)]
    command: CliCommand,
}

#[derive(Subcommand)]
enum CliCommand {
    /// Serve the detokenize remote function
    Detokenize(ServiceArgs),
}

#[derive(Args)]
struct ServiceArgs {
    /// Path to the YAML config file
    #[arg(long, default_value = "config.yaml")]
    config: PathBuf,
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    match cli.command {
        CliCommand::Detokenize(args) => {
            let config = match Config::from_file(&args.config) {
                Ok(config) => config,
                Err(e) => {
                    eprintln!("server cannot start: {e}");
                    return ExitCode::FAILURE;
                }
            };

            let _sentry = init_sentry(&config.common.logging);
            let gcp_project_id = config.detokenize.gcp_project_id.as_deref();
            init_tracing(
                &config.common.logging,
                gcp_project_id.is_some_and(|p| !p.is_empty()),
            );
            if let Some(metrics) = &config.common.metrics {
                init_statsd(metrics);
            }

            let runtime = match tokio::runtime::Runtime::new() {
                Ok(runtime) => runtime,
                Err(e) => {
                    tracing::error!(error = %e, "Failed to start tokio runtime");
                    return ExitCode::FAILURE;
                }
            };
            if let Err(e) = runtime.block_on(detokenize::run(config.detokenize)) {
                tracing::error!(error = %e, "server cannot start");
                return ExitCode::FAILURE;
            }
        }
    }

    ExitCode::SUCCESS
}

fn init_sentry(logging: &LoggingConfig) -> Option<sentry::ClientInitGuard> {
    let dsn = logging.sentry_dsn.as_deref()?;
    Some(sentry::init((
        dsn,
        sentry::ClientOptions {
            release: sentry::release_name!(),
            ..Default::default()
        },
    )))
}

/// Logs go to stdout as Cloud Logging JSON entries when running in a GCP
/// project, and as plain text otherwise.
fn init_tracing(logging: &LoggingConfig, json_logs: bool) {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&logging.level))
        .unwrap_or_else(|_| EnvFilter::new("warn"));
    let sentry_layer = logging
        .sentry_dsn
        .is_some()
        .then(sentry::integrations::tracing::layer);

    let (text_layer, json_layer) = if json_logs {
        (None, Some(cloud_logging::layer(std::io::stdout)))
    } else {
        (Some(tracing_subscriber::fmt::layer()), None)
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(text_layer)
        .with(json_layer)
        .with(sentry_layer)
        .init();
}

fn init_statsd(config: &MetricsConfig) {
    let recorder = match StatsdBuilder::from(config.statsd_host.as_str(), config.statsd_port)
        .build(Some(config.prefix.as_str()))
    {
        Ok(recorder) => recorder,
        Err(e) => {
            tracing::error!(error = %e, "Failed to build statsd recorder, metrics disabled");
            return;
        }
    };
    if metrics::set_global_recorder(recorder).is_err() {
        tracing::error!("Metrics recorder already installed");
        return;
    }

    let all_metrics: Vec<&MetricDef> = batchflow::metrics_defs::ALL_METRICS
        .iter()
        .chain(detokenize::metrics_defs::ALL_METRICS)
        .collect();
    for def in all_metrics {
        def.describe();
        tracing::debug!(
            name = def.name,
            metric_type = def.metric_type.as_str(),
            "Registered metric"
        );
    }
}
