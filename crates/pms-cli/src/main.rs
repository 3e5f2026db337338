use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::Utc;
use clap::{Parser, Subcommand};
use pms_storage::{DestinationStore, MemoryStore};
use pms_sync::{maybe_build_scheduler, resolve_window, InvocationResponse, Settings, SyncPipeline};
use tracing::info;
use tracing_subscriber::EnvFilter;

const DEFAULT_LOG_FILTER: &str = "pms=info";

#[derive(Debug, Parser)]
#[command(name = "pms-cli")]
#[command(about = "Personal metrics sync command-line interface")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Fetch one integration and reconcile it into its table.
    Sync {
        integration: String,
        /// Day to sync (YYYY-MM-DD); defaults to today.
        #[arg(long)]
        date: Option<String>,
        /// Exclusive end of a multi-day window.
        #[arg(long)]
        end_date: Option<String>,
        /// Write into an in-memory table instead of the workspace.
        #[arg(long)]
        dry_run: bool,
    },
    /// Serve HTTP sync triggers.
    Serve,
    /// Run configured cron schedules until interrupted.
    Schedule,
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt().with_env_filter(log_filter()).init();

    let cli = Cli::parse();
    match cli.command {
        Commands::Sync {
            integration,
            date,
            end_date,
            dry_run,
        } => {
            let window = resolve_window(date.as_deref(), end_date.as_deref(), Utc::now().date_naive())?;
            let pipeline = build_pipeline(dry_run)?;
            let response = InvocationResponse::from_result(pipeline.run_integration(&integration, window).await);
            println!("{}", serde_json::to_string_pretty(&response)?);
            if response.summary.as_ref().map_or(true, |s| !s.is_success()) {
                std::process::exit(1);
            }
        }
        Commands::Serve => pms_web::serve_from_env().await?,
        Commands::Schedule => {
            let pipeline = Arc::new(build_pipeline(false)?);
            let Some(mut sched) = maybe_build_scheduler(pipeline).await? else {
                anyhow::bail!("no integration declares a schedule");
            };
            sched.start().await.context("starting scheduler")?;
            info!("scheduler running; press ctrl-c to stop");
            tokio::signal::ctrl_c().await.context("waiting for ctrl-c")?;
            sched.shutdown().await.context("stopping scheduler")?;
        }
    }

    Ok(())
}

/// `RUST_LOG` when set, otherwise info for the pms crates.
fn log_filter() -> EnvFilter {
    log_filter_from(std::env::var(EnvFilter::DEFAULT_ENV).ok().as_deref())
}

fn log_filter_from(rust_log: Option<&str>) -> EnvFilter {
    rust_log
        .filter(|directives| !directives.trim().is_empty())
        .and_then(|directives| EnvFilter::try_new(directives).ok())
        .unwrap_or_else(|| EnvFilter::new(DEFAULT_LOG_FILTER))
}

fn build_pipeline(dry_run: bool) -> Result<SyncPipeline> {
    let settings = Settings::from_env()?;
    let store: Arc<dyn DestinationStore> = if dry_run {
        info!("dry run: writes go to an in-memory table");
        Arc::new(MemoryStore::new())
    } else {
        Arc::new(settings.notion_store()?)
    };
    Ok(SyncPipeline::from_settings(&settings, store)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tracing_subscriber::filter::LevelFilter;

    #[test]
    fn rust_log_overrides_the_default_filter() {
        assert_eq!(log_filter_from(Some("pms=trace")).max_level_hint(), Some(LevelFilter::TRACE));
        assert_eq!(log_filter_from(None).max_level_hint(), Some(LevelFilter::INFO));
        assert_eq!(log_filter_from(Some("  ")).max_level_hint(), Some(LevelFilter::INFO));
    }

    #[test]
    fn sync_flags_parse() {
        let cli = Cli::try_parse_from([
            "pms-cli", "sync", "whoop-workout", "--date", "2024-03-09", "--end-date", "2024-03-11", "--dry-run",
        ])
        .unwrap();
        match cli.command {
            Commands::Sync {
                integration,
                date,
                end_date,
                dry_run,
            } => {
                assert_eq!(integration, "whoop-workout");
                assert_eq!(date.as_deref(), Some("2024-03-09"));
                assert_eq!(end_date.as_deref(), Some("2024-03-11"));
                assert!(dry_run);
            }
            other => panic!("unexpected command {other:?}"),
        }
    }
}
