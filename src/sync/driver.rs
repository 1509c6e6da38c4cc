//! Batch loop: one reconciliation per input row, strictly in order.
//!
//! Per-record failures are classified and counted; only persistence failures
//! and mapping conflicts stop the batch.

use crate::error::SyncError;
use crate::sync::audit::{AuditEvent, append_event};
use crate::sync::config::SyncConfig;
use crate::sync::deadline::Deadline;
use crate::sync::map_store::MapStore;
use crate::sync::paths::SyncPaths;
use crate::sync::reconcile::{Decision, IdentityOrigin, Reconciler};
use crate::sync::record::SourceRow;
use crate::sync::util::write_atomic;
use anyhow::{Context, Result};
use serde::Serialize;
use std::collections::BTreeSet;
use std::fmt;
use std::thread;
use std::time::Duration;
use tracing::{error, info, warn};

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct Tally {
    pub total: u64,
    pub created: u64,
    pub updated: u64,
    pub skipped: u64,
    pub unresolved: u64,
    pub error: u64,
    pub timeout: u64,
}

impl fmt::Display for Tally {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "total={} created={} updated={} skipped={} unresolved={} error={} timeout={}",
            self.total,
            self.created,
            self.updated,
            self.skipped,
            self.unresolved,
            self.error,
            self.timeout
        )
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct BatchSummary {
    pub tally: Tally,
    pub failed: Vec<String>,
    pub cooldowns: u64,
    pub mappings_added: usize,
}

pub struct Driver<'a> {
    reconciler: Reconciler<'a>,
    config: &'a SyncConfig,
    files: &'a SyncPaths,
    map: MapStore,
    updates: MapStore,
}

impl<'a> Driver<'a> {
    pub fn new(
        reconciler: Reconciler<'a>,
        config: &'a SyncConfig,
        files: &'a SyncPaths,
        map: MapStore,
        updates: MapStore,
    ) -> Self {
        Self {
            reconciler,
            config,
            files,
            map,
            updates,
        }
    }

    /// Persist a newly learned pair in the table and in this batch's updates
    /// log before the record goes any further.
    fn remember(&mut self, local_id: &str, external_id: &str) -> Result<usize> {
        let pair = || vec![(local_id.to_string(), external_id.to_string())];
        let report = self
            .map
            .merge(pair())
            .with_context(|| format!("cannot record {local_id} -> {external_id}"))?;
        self.map.save(&self.files.map_file)?;
        self.updates
            .merge(pair())
            .with_context(|| format!("updates log disagrees on {local_id}"))?;
        self.updates.save(&self.files.updates_file)?;
        info!(local_id, external_id, "mapping persisted");
        Ok(report.added)
    }

    fn audit(&self, local_id: &str, external_id: Option<&str>, outcome: &str, message: &str) {
        let written = AuditEvent::new(local_id, external_id, outcome, message)
            .and_then(|event| append_event(&self.files.audit_log, &event));
        if let Err(err) = written {
            warn!(local_id, "audit write failed: {err:#}");
        }
    }

    fn fail(
        &self,
        summary: &mut BatchSummary,
        local_id: &str,
        external_id: Option<&str>,
        err: &SyncError,
    ) -> bool {
        let outcome = match err {
            SyncError::InsufficientIdentitySignal { .. } => {
                summary.tally.unresolved += 1;
                warn!(local_id, "{err}");
                "unresolved"
            }
            SyncError::TimeoutExceeded { .. } => {
                summary.tally.timeout += 1;
                warn!(local_id, "{err}");
                "timeout"
            }
            SyncError::Validation { .. } => {
                summary.tally.error += 1;
                error!(local_id, external_id, "{err}");
                "error"
            }
            _ => {
                summary.tally.error += 1;
                warn!(local_id, external_id, "{err}");
                "error"
            }
        };
        if outcome != "unresolved" {
            summary.failed.push(local_id.to_string());
        }
        self.audit(local_id, external_id, outcome, &err.to_string());
        outcome == "timeout"
    }

    fn dump_candidate(&self, candidate: &serde_json::Value) {
        let written = serde_json::to_vec_pretty(candidate)
            .map_err(anyhow::Error::from)
            .and_then(|bytes| write_atomic(&self.files.candidate_dump, &bytes));
        if let Err(err) = written {
            warn!("candidate dump failed: {err:#}");
        }
    }

    pub fn run(
        &mut self,
        rows: &[SourceRow],
        only: Option<&BTreeSet<String>>,
    ) -> Result<BatchSummary> {
        let record_timeout = Duration::from_secs(self.config.reconcile.record_timeout_secs);
        let cooldown = Duration::from_secs(self.config.reconcile.cooldown_secs);
        let id_column = self.config.identity.local_id_column.clone();
        let mut summary = BatchSummary::default();
        let mut last_timed_out = false;
        let selected = rows.len();

        for (index, row) in rows.iter().enumerate() {
            let local_id = row
                .get(&id_column)
                .map(|v| v.trim().to_string())
                .unwrap_or_default();
            if let Some(only) = only
                && !only.contains(&local_id)
            {
                continue;
            }
            if last_timed_out {
                info!(secs = cooldown.as_secs(), "previous record timed out; cooling down");
                thread::sleep(cooldown);
                summary.cooldowns += 1;
            }
            summary.tally.total += 1;
            info!(row = index + 1, of = selected, local_id = %local_id, "processing");

            last_timed_out = self.run_one(&mut summary, row, &local_id, record_timeout)?;
            info!(tally = %summary.tally, "progress");
        }

        let failed = summary.failed.join("\n");
        write_atomic(&self.files.failed_list, failed.as_bytes())?;
        Ok(summary)
    }

    /// Returns whether the record timed out.
    fn run_one(
        &mut self,
        summary: &mut BatchSummary,
        row: &SourceRow,
        local_id: &str,
        record_timeout: Duration,
    ) -> Result<bool> {
        if local_id.is_empty() {
            let err = SyncError::MalformedInput(format!(
                "row has no `{}`",
                self.config.identity.local_id_column
            ));
            summary.tally.error += 1;
            warn!("{err}");
            self.audit("", None, "error", &err.to_string());
            return Ok(false);
        }

        let fields = match self.config.layout.build(row) {
            Ok(mut builder) => builder.output().clone(),
            Err(err) => {
                let err = SyncError::MalformedInput(err.to_string());
                return Ok(self.fail(summary, local_id, None, &err));
            }
        };

        let deadline = Deadline::new(record_timeout);
        let identity = match self.reconciler.identify(local_id, &fields, &self.map, &deadline) {
            Ok(Some(identity)) => identity,
            Ok(None) => {
                summary.tally.created += 1;
                self.audit(local_id, None, "preview_create", "would create a new entity");
                return Ok(false);
            }
            Err(err) => return Ok(self.fail(summary, local_id, None, &err)),
        };
        let external_id = identity.external_id.clone();

        if identity.origin != IdentityOrigin::Mapped {
            summary.mappings_added += self.remember(local_id, &external_id)?;
        }
        if identity.origin == IdentityOrigin::Created {
            summary.tally.created += 1;
        }

        match self.reconciler.reconcile(&identity, &fields, &deadline) {
            Ok(outcome) => {
                self.dump_candidate(&outcome.candidate);
                let label = match (outcome.decision, outcome.applied) {
                    (Decision::Skip, _) => {
                        summary.tally.skipped += 1;
                        "skipped"
                    }
                    (Decision::Update, true) => {
                        summary.tally.updated += 1;
                        "updated"
                    }
                    (Decision::Update, false) => {
                        summary.tally.updated += 1;
                        "preview_update"
                    }
                };
                let message = format!("{} difference(s)", outcome.differences.len());
                self.audit(local_id, Some(&external_id), label, &message);
                Ok(false)
            }
            Err(err) => Ok(self.fail(summary, local_id, Some(&external_id), &err)),
        }
    }
}
