use anyhow::{Context, Result};
use clap::Args;
use std::path::PathBuf;

use crate::commands::CommandReport;
use crate::remote::dataverse::DataverseClient;
use crate::sync::config::load_config;
use crate::sync::driver::Driver;
use crate::sync::map_store::{BatchLock, MapStore};
use crate::sync::paths::resolve_paths;
use crate::sync::reconcile::{Reconciler, RunOptions};
use crate::sync::schema::Schema;
use crate::sync::source::{read_id_list, read_rows};
use crate::sync::util::file_sha256;

#[derive(Debug, Args)]
pub struct SyncArgs {
    /// Tab-delimited input, one record per row
    #[arg(long)]
    pub input: PathBuf,

    /// Data file attached to every updated entity
    #[arg(long)]
    pub attachment: Option<PathBuf>,

    /// Create, push and publish; without it the run is a preview
    #[arg(long, default_value_t = false)]
    pub commit: bool,

    /// Update even when nothing differs, and diff volatile fields too
    #[arg(long, default_value_t = false)]
    pub force_update: bool,

    /// Only decide equal or not, do not report each difference
    #[arg(long, default_value_t = false)]
    pub quiet_diff: bool,

    /// File with one local id per line; other rows are left alone
    #[arg(long)]
    pub only: Option<PathBuf>,

    /// Mapping table (defaults to $DVSYNC_HOME/map.tsv)
    #[arg(long)]
    pub map: Option<PathBuf>,

    /// Batch updates log (defaults to $DVSYNC_HOME/updates.tsv)
    #[arg(long)]
    pub updates: Option<PathBuf>,
}

pub fn run(args: &SyncArgs) -> Result<CommandReport> {
    let config = load_config()?;
    let paths = resolve_paths()?.with_overrides(args.map.clone(), args.updates.clone());
    let mut report = CommandReport::new("sync");

    report.detail(format!("mode={}", if args.commit { "commit" } else { "preview" }));
    report.detail(format!("input={}", args.input.display()));
    report.detail(format!("home={}", paths.home.display()));
    report.detail(format!("logs_dir={}", paths.logs_dir.display()));
    report.detail(format!("map_file={}", paths.map_file.display()));
    report.detail(format!("updates_file={}", paths.updates_file.display()));

    if args.commit {
        if config.server.api_key.is_empty() {
            report.issue("commit requires an api key (server.api_key or DVSYNC_API_KEY)");
        }
        if config.server.collection.is_empty() {
            report.issue("commit requires a collection (server.collection or DVSYNC_COLLECTION)");
        }
    }
    if let Some(attachment) = &args.attachment {
        if attachment.is_file() {
            report.detail(format!(
                "attachment={} sha256={}",
                attachment.display(),
                file_sha256(attachment)?
            ));
        } else {
            report.issue(format!("attachment not found: {}", attachment.display()));
        }
    }
    if !report.ok {
        return Ok(report);
    }

    let lock = BatchLock::acquire(&paths.lock_file())?;
    report.detail(format!("lock={}", lock.path().display()));

    let rows = read_rows(&args.input)?;
    let only = args.only.as_deref().map(read_id_list).transpose()?;
    let columns = (
        config.identity.local_id_column.as_str(),
        config.identity.external_id_column.as_str(),
    );
    let mut map = MapStore::load(&paths.map_file, columns.0, columns.1)?;
    if map.is_empty() {
        report.detail("mapping table is empty; every row goes through search");
    }
    let updates = MapStore::load(&paths.updates_file, columns.0, columns.1)?;
    let resumed = map
        .merge(updates.pairs().map(|(l, e)| (l.to_string(), e.to_string())))
        .context("updates log conflicts with the mapping table; run merge-maps first")?;
    report.detail(format!(
        "mappings={} resumed_from_updates={}",
        map.len(),
        resumed.added
    ));

    let schema = Schema::dataverse(&config.server.distributor);
    let client = DataverseClient::new(&config.server, schema.clone())?;
    let options = RunOptions {
        commit: args.commit,
        force_update: args.force_update,
        quiet_diff: args.quiet_diff,
        attachment: args.attachment.clone(),
    };
    let reconciler =
        Reconciler::new(&client, &schema, &config.reconcile, &config.identity, &options);
    let mut driver = Driver::new(reconciler, &config, &paths, map, updates);
    let summary = driver.run(&rows, only.as_ref())?;

    report.detail(format!("rows={}", rows.len()));
    report.detail(summary.tally.to_string());
    report.detail(format!("mappings_added={}", summary.mappings_added));
    report.detail(format!("audit_log={}", paths.audit_log.display()));
    if summary.failed.is_empty() {
        report.detail("failed=0");
    } else {
        report.issue(format!(
            "{} record(s) failed; retry with --only {}",
            summary.failed.len(),
            paths.failed_list.display()
        ));
    }
    Ok(report)
}
