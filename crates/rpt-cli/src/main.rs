use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use clap::{Parser, Subcommand};
use rpt_adapters::{FixtureSheetSource, SheetSource};
use rpt_storage::{JobStore, PgJobStore};
use rpt_sync::{
    disposition_report, maybe_build_scheduler, probe_sources, run_pending_jobs, SheetRegistry,
    SyncConfig, SyncPipeline,
};
use sqlx::{Connection, PgConnection, PgPool};
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "rpt-cli")]
#[command(about = "Ring production tracker command-line interface")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Run one reconciliation-and-load pass
    Sync {
        /// Use the memory-bounded streaming path
        #[arg(long)]
        streaming: bool,
    },
    /// Drain pending background sync jobs
    Jobs {
        /// Keep draining, with the cron scheduler enqueuing runs
        #[arg(long)]
        watch: bool,
    },
    /// Print disposition tallies over stored units
    Report,
    /// Check that each configured worksheet opens
    Probe,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let config = SyncConfig::from_env();
    let registry = SheetRegistry::load(&config.registry_path)?;
    let source: Arc<dyn SheetSource> = Arc::new(FixtureSheetSource::new(config.sheets_dir.clone()));

    match cli.command.unwrap_or(Commands::Sync { streaming: false }) {
        Commands::Sync { streaming } => {
            let mut conn = PgConnection::connect(&config.database_url).await?;
            let pipeline = SyncPipeline::new(config, registry, source);
            let summary = if streaming {
                pipeline.run_streaming(&mut conn).await?
            } else {
                pipeline.run_bulk(&mut conn).await?
            };
            println!(
                "sync {}: run_id={} production={} merged={} duplicates_removed={} updated={} inserted={}",
                summary.status,
                summary.run_id,
                summary.production_rows,
                summary.merged_records,
                summary.duplicates_removed,
                summary.updated,
                summary.inserted
            );
        }
        Commands::Jobs { watch } => {
            let pool = PgPool::connect(&config.database_url).await?;
            let mut conn = PgConnection::connect(&config.database_url).await?;
            let jobs = PgJobStore::new(pool);
            let pipeline = SyncPipeline::new(config, registry, source);

            if watch {
                let store: Arc<dyn JobStore> = Arc::new(jobs.clone());
                if let Some(sched) = maybe_build_scheduler(pipeline.config(), store).await? {
                    sched.start().await?;
                }
                loop {
                    let processed = run_pending_jobs(&pipeline, &jobs, &mut conn).await?;
                    if processed > 0 {
                        println!("processed {processed} job(s)");
                    }
                    tokio::time::sleep(Duration::from_secs(30)).await;
                }
            } else {
                let processed = run_pending_jobs(&pipeline, &jobs, &mut conn).await?;
                println!("processed {processed} job(s)");
            }
        }
        Commands::Report => {
            let mut conn = PgConnection::connect(&config.database_url).await?;
            let units = rpt_storage::fetch_all_units(&mut conn).await?;
            let report = disposition_report(&units);
            println!(
                "units: received={} accepted={} rejected={} pending={}",
                report.totals.received,
                report.totals.accepted,
                report.totals.rejected,
                report.totals.pending
            );
            for (vendor, tally) in &report.vendors {
                println!(
                    "  {vendor}: received={} accepted={} rejected={} pending={}",
                    tally.received, tally.accepted, tally.rejected, tally.pending
                );
            }
            for (reason, count) in &report.vqc_rejection_reasons {
                println!("  vqc rejection: {reason} ({count})");
            }
            for (reason, count) in &report.ft_rejection_reasons {
                println!("  ft rejection: {reason} ({count})");
            }
        }
        Commands::Probe => {
            let outcome = probe_sources(source.as_ref(), &registry).await;
            for line in &outcome.lines {
                println!("{line}");
            }
            if !outcome.ok {
                anyhow::bail!("one or more sources are unreachable");
            }
        }
    }

    Ok(())
}
