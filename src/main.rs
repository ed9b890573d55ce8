use std::{path::PathBuf, process::ExitCode};

use ::tracing::{error, info, info_span, warn};
use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use data_model::version_number;
use service::Service;

mod config;
mod plugins;
mod service;
mod tracing;
use tracing::setup_tracing;

#[derive(Parser)]
#[command(version, about, long_about = None)]
struct Cli {
    #[arg(short, long, value_name = "config file", help = "Path to config file")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Compare every plugin's schema version with this build.
    Validate {
        /// Apply pending migrations of outdated plugins.
        #[arg(long)]
        auto_upgrade: bool,
    },
    /// Apply pending migrations.
    Upgrade {
        /// Only upgrade this plugin.
        #[arg(long)]
        plugin: Option<String>,
        /// Stop at this version instead of the latest one.
        #[arg(long, requires = "plugin")]
        to_version: Option<u32>,
    },
    /// Revert migrations of a plugin down to a version.
    Downgrade {
        #[arg(long)]
        plugin: String,
        #[arg(long)]
        to_version: u32,
    },
    /// Print the schema state of every plugin.
    Status,
    /// Create the secondary indexes plugins expect.
    SyncIndexes {
        /// Report what would be created without creating it.
        #[arg(long)]
        read_only: bool,
    },
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    let cli = Cli::parse();
    let config = config::ServerConfig::load(cli.config.as_deref())?;
    setup_tracing(&config);

    let instance_id = config.instance_id();
    metrics::init_provider(
        config.telemetry.enable_metrics,
        config.telemetry.endpoint.as_ref(),
        config.telemetry.metrics_interval,
        &instance_id,
        env!("CARGO_PKG_VERSION"),
    )
    .context("initializing metrics")?;

    let root_span = info_span!(
        "schema-server",
        env = %config.env,
        "schema-instance" = %instance_id
    );
    let _guard = root_span.enter();

    let service = Service::new(config)?;
    let cancel = service.cancellation_token();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("interrupted, cancelling");
            cancel.cancel();
        }
    });

    let result = run(&service, cli.command).await;
    if let Err(err) = &result {
        error!("{err:#}");
    }
    result
}

async fn run(service: &Service, command: Command) -> Result<ExitCode> {
    match command {
        Command::Validate { auto_upgrade } => {
            if service.validate(auto_upgrade).await? {
                Ok(ExitCode::SUCCESS)
            } else {
                error!("schema validation failed, run `upgrade` or pass --auto-upgrade");
                Ok(ExitCode::FAILURE)
            }
        }
        Command::Upgrade { plugin, to_version } => {
            let versions = service.upgrade(plugin.as_deref(), to_version).await?;
            for (plugin, version) in versions {
                info!(plugin = %plugin, version = version_number(version), "upgraded");
            }
            Ok(ExitCode::SUCCESS)
        }
        Command::Downgrade { plugin, to_version } => {
            let version = service.downgrade(&plugin, to_version).await?;
            info!(plugin = %plugin, version = version_number(version), "downgraded");
            Ok(ExitCode::SUCCESS)
        }
        Command::Status => {
            for result in service.status().await? {
                println!("{result}");
            }
            Ok(ExitCode::SUCCESS)
        }
        Command::SyncIndexes { read_only } => {
            let reports = service.sync_indexes(read_only).await?;
            for (collection, report) in reports {
                for index in &report.created {
                    println!("{collection}: created {index}");
                }
                for index in &report.skipped {
                    println!("{collection}: would create {index}");
                }
                for index in &report.advisory_removals {
                    println!("{collection}: not declared {index}");
                }
            }
            Ok(ExitCode::SUCCESS)
        }
    }
}

#[cfg(test)]
mod tests {
    use clap::CommandFactory;

    use super::*;

    #[test]
    fn test_cli_definition() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_to_version_requires_plugin() {
        assert!(Cli::try_parse_from(["schema-server", "upgrade", "--to-version", "3"]).is_err());
        let cli = Cli::try_parse_from([
            "schema-server",
            "-c",
            "sample_config.yaml",
            "upgrade",
            "--plugin",
            "build",
            "--to-version",
            "3",
        ])
        .unwrap();
        assert!(matches!(
            cli.command,
            Command::Upgrade { plugin: Some(ref p), to_version: Some(3) } if p == "build"
        ));
    }
}
