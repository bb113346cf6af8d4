use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use clap::{Args, Parser, Subcommand};
use sqlact_core::config::settings_schema_json;
use sqlact_core::{
    load_settings, ActivityJob, ActivityScheduler, ActivitySettings, Bucket, SettingsHandle,
    SystemClock, TimeSource,
};
use sqlact_store::SqliteStatsStore;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

#[derive(Parser)]
#[command(name = "sqlact-svc", version, about = "Statistics activity materialization")]
struct Cli {
    #[command(flatten)]
    common: CommonArgs,
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Args, Clone)]
struct CommonArgs {
    /// Settings file (TOML); falls back to SQLACT_CONFIG, then defaults
    #[arg(long, global = true)]
    config: Option<PathBuf>,
    /// Directory holding stats.sqlite; falls back to SQLACT_DATA_DIR, then ./state
    #[arg(long, global = true)]
    data_dir: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the scheduler until interrupted (default)
    Run,
    /// Materialize one bucket and exit
    Once {
        /// Any timestamp inside the bucket (RFC 3339); defaults to now
        #[arg(long)]
        at: Option<DateTime<Utc>>,
    },
    /// Print the settings JSON schema
    Schema,
    /// Print both activity tables as JSON
    Dump,
    /// Clear raw statistics and activity for every bucket
    Reset,
}

#[tokio::main]
async fn main() -> Result<()> {
    sqlact_otel::init();
    let cli = Cli::parse();
    match cli.command.unwrap_or(Commands::Run) {
        Commands::Schema => {
            println!("{}", serde_json::to_string_pretty(&settings_schema_json())?);
            Ok(())
        }
        Commands::Dump => {
            let store = open_store(&cli.common)?;
            println!("{}", store.dump_activity()?);
            Ok(())
        }
        Commands::Reset => {
            let store = open_store(&cli.common)?;
            store.reset_stats_async().await
        }
        Commands::Once { at } => run_once(&cli.common, at).await,
        Commands::Run => run_scheduler(&cli.common).await,
    }
}

fn resolve_settings(common: &CommonArgs) -> Result<ActivitySettings> {
    let path = common
        .config
        .clone()
        .or_else(|| std::env::var_os("SQLACT_CONFIG").map(PathBuf::from));
    let settings = match path {
        Some(path) => load_settings(&path)
            .with_context(|| format!("loading settings from {}", path.display()))?,
        None => {
            let mut settings = ActivitySettings::default();
            settings.apply_env_overrides();
            settings
        }
    };
    if let Err(err) = settings.validate() {
        warn!(target: "sqlact::config", error = %err, "settings failed validation");
    }
    Ok(settings)
}

fn open_store(common: &CommonArgs) -> Result<SqliteStatsStore> {
    let dir = common
        .data_dir
        .clone()
        .or_else(|| std::env::var_os("SQLACT_DATA_DIR").map(PathBuf::from))
        .unwrap_or_else(|| PathBuf::from("state"));
    let store = SqliteStatsStore::open(&dir)
        .with_context(|| format!("opening store in {}", dir.display()))?;
    info!(target: "sqlact::store", path = %store.db_path().display(), "using statistics store");
    Ok(store)
}

fn build_job(common: &CommonArgs) -> Result<(Arc<ActivityJob>, ActivitySettings)> {
    let settings = resolve_settings(common)?;
    let store = Arc::new(open_store(common)?);
    let job = ActivityJob::new(
        store.clone(),
        store,
        Arc::new(SettingsHandle::new(settings.clone())),
        Arc::new(SystemClock),
    )
    .with_query_timeout(settings.query_timeout());
    Ok((Arc::new(job), settings))
}

async fn run_once(common: &CommonArgs, at: Option<DateTime<Utc>>) -> Result<()> {
    let (job, settings) = build_job(common)?;
    let bucket = at
        .map(Bucket::containing)
        .unwrap_or_else(|| SystemClock.current_bucket());
    let report = job
        .transfer_top_stats(
            bucket,
            settings.top_limit,
            settings.row_caps(),
            CancellationToken::new(),
        )
        .await?;
    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(())
}

async fn run_scheduler(common: &CommonArgs) -> Result<()> {
    let (job, settings) = build_job(common)?;
    let cancel = CancellationToken::new();
    let handle = ActivityScheduler::new(job, settings.run_interval()).spawn(cancel.clone());
    info!(
        target: "sqlact::scheduler",
        interval_secs = settings.run_interval_secs,
        top_limit = settings.top_limit,
        "activity scheduler started"
    );
    shutdown_signal().await;
    cancel.cancel();
    handle.await.context("scheduler task panicked")?;
    info!(target: "sqlact::scheduler", "activity scheduler stopped");
    Ok(())
}

async fn shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};

        match signal(SignalKind::terminate()) {
            Ok(mut term) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => {},
                    _ = term.recv() => {},
                }
            }
            Err(err) => {
                warn!(%err, "failed to install SIGTERM handler");
                let _ = tokio::signal::ctrl_c().await;
            }
        }
    }

    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }

    info!("shutdown signal received");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cli_defaults_to_run() {
        let cli = Cli::try_parse_from(["sqlact-svc"]).unwrap();
        assert!(cli.command.is_none());
        let cli = Cli::try_parse_from([
            "sqlact-svc",
            "once",
            "--at",
            "2024-06-01T10:05:00Z",
            "--data-dir",
            "/tmp/x",
        ])
        .unwrap();
        assert!(matches!(cli.command, Some(Commands::Once { at: Some(_) })));
        assert_eq!(cli.common.data_dir, Some(PathBuf::from("/tmp/x")));
    }
}
