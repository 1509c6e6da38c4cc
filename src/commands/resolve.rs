use anyhow::{Context, Result};
use clap::Args;
use std::path::PathBuf;
use std::time::Duration;
use tracing::{info, warn};

use crate::commands::CommandReport;
use crate::error::SyncError;
use crate::remote::dataverse::DataverseClient;
use crate::sync::config::load_config;
use crate::sync::deadline::Deadline;
use crate::sync::map_store::{BatchLock, MapStore, lock_path};
use crate::sync::reconcile::{Reconciler, RunOptions};
use crate::sync::schema::Schema;
use crate::sync::source::read_rows;

#[derive(Debug, Args)]
pub struct ResolveArgs {
    /// Tab-delimited input, one record per row
    #[arg(long)]
    pub input: PathBuf,

    /// Output table; rows already in it are not searched again
    #[arg(long)]
    pub out: PathBuf,
}

#[derive(Debug, Default)]
struct Counters {
    total: u64,
    cached: u64,
    resolved: u64,
    unmatched: u64,
    error: u64,
}

pub fn run(args: &ResolveArgs) -> Result<CommandReport> {
    let config = load_config()?;
    let mut report = CommandReport::new("resolve");
    let _lock = BatchLock::acquire(&lock_path(&args.out))?;

    let rows = read_rows(&args.input)?;
    let local_column = config.identity.local_id_column.as_str();
    let mut out = MapStore::load(&args.out, local_column, &config.identity.external_id_column)?;
    report.detail(format!("prior_entries={}", out.len()));

    let schema = Schema::dataverse(&config.server.distributor);
    let client = DataverseClient::new(&config.server, schema.clone())?;
    // Search only: never create, push or publish.
    let options = RunOptions::default();
    let reconciler =
        Reconciler::new(&client, &schema, &config.reconcile, &config.identity, &options);
    let record_timeout = Duration::from_secs(config.reconcile.record_timeout_secs);

    let mut counters = Counters::default();
    for row in &rows {
        counters.total += 1;
        let local_id = row.get(local_column).map(|v| v.trim()).unwrap_or_default();
        if local_id.is_empty() {
            counters.error += 1;
            warn!("row without `{local_column}`");
            continue;
        }
        if out.lookup(local_id).is_some() {
            counters.cached += 1;
            continue;
        }
        let fields = match config.layout.build(row) {
            Ok(mut builder) => builder.output().clone(),
            Err(err) => {
                counters.error += 1;
                warn!(local_id, "{err}");
                continue;
            }
        };

        let deadline = Deadline::new(record_timeout);
        match reconciler.identify(local_id, &fields, &out, &deadline) {
            Ok(Some(identity)) => {
                out.merge(vec![(local_id.to_string(), identity.external_id.clone())])
                    .with_context(|| {
                        format!(
                            "{local_id} resolved to an id already in {}",
                            args.out.display()
                        )
                    })?;
                out.save(&args.out)?;
                counters.resolved += 1;
                info!(local_id, external_id = %identity.external_id, "resolved");
            }
            Ok(None) | Err(SyncError::InsufficientIdentitySignal { .. }) => {
                counters.unmatched += 1;
                info!(local_id, "no match");
            }
            Err(err) => {
                counters.error += 1;
                warn!(local_id, "{err}");
            }
        }
    }

    report.detail(format!(
        "total={} cached={} resolved={} unmatched={} error={}",
        counters.total, counters.cached, counters.resolved, counters.unmatched, counters.error
    ));
    report.detail(format!("out={}", args.out.display()));
    if counters.error > 0 {
        report.issue(format!("{} row(s) failed to resolve", counters.error));
    }
    Ok(report)
}
