use std::sync::Arc;

use anyhow::Result;
use clap::Parser;
use codi_core::{RunContext, RunMode};
use codi_ingest::{DatasetRegistry, IngestConfig, IngestJob};
use codi_storage::ObjectStore;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "codi-cli")]
#[command(about = "City open-data ingest runner")]
struct Cli {
    /// Unique run identifier; generated when omitted.
    #[arg(long)]
    run_id: Option<String>,

    /// auto, bootstrap or incremental.
    #[arg(long, default_value = "auto")]
    mode: RunModeArg,

    /// Comma-separated dataset keys to ingest.
    #[arg(long, default_value = "contractors", value_delimiter = ',')]
    datasets: Vec<String>,

    /// Identifier of the preceding run, for audit linkage.
    #[arg(long)]
    prev_run_id: Option<String>,
}

#[derive(Debug, Clone, Copy)]
struct RunModeArg(RunMode);

impl std::str::FromStr for RunModeArg {
    type Err = codi_core::ParseRunModeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        s.parse().map(RunModeArg)
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let cli = Cli::parse();
    let run_id = cli.run_id.unwrap_or_else(RunContext::generated_run_id);
    let ctx = RunContext::new(run_id, cli.mode.0, cli.datasets)
        .with_prev_run_id(cli.prev_run_id);

    let config = IngestConfig::from_env();
    let store = ObjectStore::new(config.data_root.clone());
    let source = Arc::new(config.soda_client()?);

    let job = IngestJob::new(ctx, DatasetRegistry::builtin(), store, source, config);
    let summary = job.run().await;

    for outcome in &summary.outcomes {
        if let Some(error) = &outcome.error {
            let stage = outcome
                .failed_stage
                .map(|s| s.to_string())
                .unwrap_or_else(|| "validation".to_string());
            eprintln!("  {}: failed at {stage}: {error}", outcome.dataset);
        } else {
            println!(
                "  {}: ok mode={} fetched={} merged={}",
                outcome.dataset,
                outcome.mode.as_deref().unwrap_or("-"),
                outcome.fetched_rows,
                outcome.merged_rows
            );
        }
    }
    println!(
        "ingest complete: run_id={} succeeded={} failed={}",
        summary.run_id,
        summary.succeeded().count(),
        summary.failed().count()
    );

    if summary.failed().count() > 0 {
        std::process::exit(1);
    }
    Ok(())
}
