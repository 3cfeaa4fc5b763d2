use std::process::ExitCode;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use erpsync_sync::{
    build_scheduler, engine_from_config, EntityRegistry, SyncConfig, SyncEngine, MAX_LOOKBACK_HOURS,
};
use serde::Serialize;
use tracing::info;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

mod args;

use args::SyncRequest;

#[derive(Debug, Parser)]
#[command(name = "erpsync")]
#[command(about = "Sync ERP datasets into the Postgres warehouse")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Sync one entity: [PERIOD | START_DATE | PERIOD START_DATE | START END [START_DATE]]
    Sync {
        entity: String,
        args: Vec<String>,
        /// Ignore the entity's default filters and fetch everything
        #[arg(long)]
        all: bool,
    },
    /// Apply upstream deletes
    Deletes {
        /// Unix seconds to look back to instead of the configured window
        #[arg(long, conflicts_with = "lookback_hours")]
        since: Option<i64>,
        /// Override the configured lookback window
        #[arg(long, value_parser = clap::value_parser!(i64).range(0..=MAX_LOOKBACK_HOURS))]
        lookback_hours: Option<i64>,
    },
    /// List configured entities
    Entities,
    /// Run scheduled jobs until interrupted
    Schedule,
    /// Serve the HTTP trigger endpoints
    Serve {
        #[arg(long)]
        port: Option<u16>,
    },
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_writer(std::io::stderr))
        .init();
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn exit_code(success: bool) -> ExitCode {
    if success {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    }
}

async fn engine(config: &SyncConfig) -> Result<Arc<SyncEngine>> {
    Ok(Arc::new(engine_from_config(config).await?))
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    init_tracing();
    let cli = Cli::parse();
    let config = SyncConfig::from_env();

    match cli.command {
        Commands::Sync {
            entity,
            args: positional,
            all,
        } => {
            let request = args::interpret(&positional, all)?;
            let engine = engine(&config).await?;
            match request {
                SyncRequest::Single(filters) => {
                    let result = engine.run_sync(&entity, filters).await;
                    print_json(&result)?;
                    Ok(exit_code(result.success))
                }
                SyncRequest::Range {
                    start,
                    end,
                    start_date,
                } => {
                    let summary = engine.run_range(&entity, start, end, start_date).await?;
                    print_json(&summary)?;
                    Ok(exit_code(summary.success))
                }
            }
        }
        Commands::Deletes {
            since,
            lookback_hours,
        } => {
            let engine = engine(&config).await?;
            let result = match (since, lookback_hours) {
                (Some(epoch), _) => engine.run_delete_sync_since(epoch).await,
                (None, Some(hours)) => engine.run_delete_sync_within(hours).await,
                (None, None) => engine.run_delete_sync().await,
            };
            print_json(&result)?;
            Ok(exit_code(result.success))
        }
        Commands::Entities => {
            let registry = EntityRegistry::load(&config.entities_file)?;
            print_json(&registry.summaries())?;
            Ok(ExitCode::SUCCESS)
        }
        Commands::Schedule => {
            let engine = engine(&config).await?;
            let mut sched = build_scheduler(engine).await?;
            sched.start().await.context("starting scheduler")?;
            info!("scheduler running; press ctrl-c to stop");
            tokio::signal::ctrl_c()
                .await
                .context("waiting for shutdown signal")?;
            sched.shutdown().await.context("stopping scheduler")?;
            Ok(ExitCode::SUCCESS)
        }
        Commands::Serve { port } => {
            let engine = engine(&config).await?;
            let mut sched = if config.scheduler_enabled {
                let sched = build_scheduler(engine.clone()).await?;
                sched.start().await.context("starting scheduler")?;
                Some(sched)
            } else {
                None
            };
            let served = erpsync_web::serve(engine, port.unwrap_or(config.web_port)).await;
            if let Some(sched) = sched.as_mut() {
                sched.shutdown().await.context("stopping scheduler")?;
            }
            served?;
            Ok(ExitCode::SUCCESS)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lookback_flag_is_range_checked() {
        let cli = Cli::try_parse_from(["erpsync", "deletes", "--lookback-hours", "12"]).unwrap();
        assert!(matches!(
            cli.command,
            Commands::Deletes {
                lookback_hours: Some(12),
                since: None
            }
        ));

        for hours in ["9000000000000000", "-1"] {
            assert!(
                Cli::try_parse_from(["erpsync", "deletes", "--lookback-hours", hours]).is_err(),
                "{hours} was accepted"
            );
        }
    }

    #[test]
    fn since_and_lookback_are_exclusive() {
        assert!(Cli::try_parse_from([
            "erpsync",
            "deletes",
            "--since",
            "1700000000",
            "--lookback-hours",
            "2"
        ])
        .is_err());
    }
}
