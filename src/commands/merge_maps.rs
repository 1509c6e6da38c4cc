use anyhow::Result;
use clap::Args;
use std::path::PathBuf;

use crate::commands::CommandReport;
use crate::error::MapConflict;
use crate::sync::config::load_config;
use crate::sync::map_store::{BatchLock, MapStore, lock_path};
use crate::sync::source::read_pairs;

#[derive(Debug, Args)]
pub struct MergeMapsArgs {
    /// Base mapping table, rewritten in place
    pub base: PathBuf,

    /// Update logs to fold into the base table
    #[arg(required = true)]
    pub incoming: Vec<PathBuf>,
}

pub fn run(args: &MergeMapsArgs) -> Result<CommandReport> {
    let config = load_config()?;
    let mut report = CommandReport::new("merge-maps");
    let local = config.identity.local_id_column.as_str();
    let external = config.identity.external_id_column.as_str();

    let _lock = BatchLock::acquire(&lock_path(&args.base))?;
    let mut base = MapStore::load(&args.base, local, external)?;
    report.detail(format!("base={} entries={}", args.base.display(), base.len()));

    for path in &args.incoming {
        let pairs = read_pairs(path, local, external)?;
        match base.merge(pairs) {
            Ok(merged) => report.detail(format!(
                "{}: added={} preexisting={}",
                path.display(),
                merged.added,
                merged.preexisting
            )),
            Err(conflict) => {
                report.issue(format!("{}: {conflict}", path.display()));
                if let MapConflict::LocalBound { existing, .. } = &conflict
                    && let Some(owner) = base.owner_of(existing)
                {
                    report.detail(format!("base maps `{existing}` to `{owner}`"));
                }
                report.detail("base left unchanged");
                return Ok(report);
            }
        }
    }

    base.save(&args.base)?;
    report.detail(format!("entries_after={}", base.len()));
    Ok(report)
}
