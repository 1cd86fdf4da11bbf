use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing::info;
use tracing_subscriber::EnvFilter;
use vacsync_core::AppConfig;
use vacsync_source::FixtureSourceClient;
use vacsync_storage::{ListingStore, PgListingStore, PoolSettings};
use vacsync_sync::{PassTrigger, SyncPipeline, SyncScheduler};
use vacsync_web::AppState;

#[derive(Debug, Parser)]
#[command(name = "vacsync")]
#[command(about = "Vacancy Sync: periodic vacancy ingest service")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Migrate, start the scheduler and serve the HTTP API (default).
    Serve,
    /// Run a single sync pass and print its summary.
    Sync {
        /// Read the batch from a local JSON file instead of the upstream URL.
        #[arg(long)]
        fixture: Option<PathBuf>,
    },
    /// Apply database migrations and exit.
    Migrate,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = AppConfig::from_env().context("loading configuration")?;
    init_tracing(&config)?;

    match cli.command.unwrap_or(Commands::Serve) {
        Commands::Serve => serve(config).await,
        Commands::Sync { fixture } => sync_once(config, fixture).await,
        Commands::Migrate => {
            let store = connect_store(&config).await?;
            store.close().await;
            Ok(())
        }
    }
}

fn init_tracing(config: &AppConfig) -> Result<()> {
    let mut filter = EnvFilter::try_new(&config.log_level)
        .with_context(|| format!("invalid LOG_LEVEL {:?}", config.log_level))?;
    if config.debug {
        filter = filter.add_directive("sqlx::query=debug".parse()?);
    }
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();
    Ok(())
}

/// Connects the pool and brings the schema up to date.
async fn connect_store(config: &AppConfig) -> Result<PgListingStore> {
    let store = PgListingStore::connect(&config.database_url, PoolSettings::default())
        .await
        .context("connecting to DATABASE_URL")?;
    store.migrate().await.context("running migrations")?;
    Ok(store)
}

async fn serve(config: AppConfig) -> Result<()> {
    let store: Arc<dyn ListingStore> = Arc::new(connect_store(&config).await?);
    let pipeline = SyncPipeline::from_config(&config, Arc::clone(&store))?;
    let scheduler = Arc::new(SyncScheduler::from_config(pipeline, &config));
    scheduler.start().await.context("starting sync scheduler")?;

    let state = AppState::new(store, Arc::clone(&scheduler));
    let served = vacsync_web::serve(state, &config, vacsync_web::shutdown_signal()).await;

    scheduler.stop().await;
    info!("vacsync stopped");
    served
}

async fn sync_once(config: AppConfig, fixture: Option<PathBuf>) -> Result<()> {
    let store: Arc<dyn ListingStore> = Arc::new(connect_store(&config).await?);
    let pipeline = match fixture {
        Some(path) => SyncPipeline::new(Arc::new(FixtureSourceClient::new(path)), Arc::clone(&store)),
        None => SyncPipeline::from_config(&config, Arc::clone(&store))?,
    };

    let result = pipeline.run_once(PassTrigger::OnDemand).await;
    store.close().await;
    let summary = result?;

    println!(
        "sync complete: run_id={} fetched={} created={} updated={} unchanged={}",
        summary.run_id, summary.fetched, summary.created, summary.updated, summary.unchanged
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn cli_definition_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn sync_accepts_a_fixture_path() {
        let cli = Cli::try_parse_from(["vacsync", "sync", "--fixture", "fixtures/vacancies/sample.json"])
            .unwrap();
        match cli.command {
            Some(Commands::Sync { fixture }) => {
                assert_eq!(fixture, Some(PathBuf::from("fixtures/vacancies/sample.json")))
            }
            other => panic!("unexpected command {other:?}"),
        }
    }

    #[test]
    fn no_subcommand_means_serve() {
        let cli = Cli::try_parse_from(["vacsync"]).unwrap();
        assert!(cli.command.is_none());
    }
}
