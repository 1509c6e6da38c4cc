//! Per-record reconciliation against the repository.
//!
//! A record moves through identification, snapshot build, volatile-field
//! suppression, comparison and (in commit mode) apply. Identification and the
//! rest are separate calls so the driver can persist a new mapping before the
//! record continues.

use crate::error::SyncError;
use crate::remote::{ExternalId, RemoteError, Repository, VersionSelector};
use crate::sync::config::{IdentityConfig, ReconcileConfig};
use crate::sync::deadline::Deadline;
use crate::sync::diff::{self, Difference};
use crate::sync::map_store::MapStore;
use crate::sync::record::{CanonicalFields, DESCRIPTION_FIELD};
use crate::sync::schema::Schema;
use crate::sync::tree;
use serde::Serialize;
use serde_json::Value;
use std::path::PathBuf;
use std::time::Duration;
use tracing::{info, warn};

#[derive(Debug, Clone, Default)]
pub struct RunOptions {
    pub commit: bool,
    pub force_update: bool,
    pub quiet_diff: bool,
    pub attachment: Option<PathBuf>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum IdentityOrigin {
    Mapped,
    Searched,
    Created,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Identity {
    pub external_id: ExternalId,
    pub origin: IdentityOrigin,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Decision {
    Skip,
    Update,
}

#[derive(Debug, Clone)]
pub struct Outcome {
    pub decision: Decision,
    /// True when the update was pushed and published.
    pub applied: bool,
    pub differences: Vec<Difference>,
    pub candidate: Value,
}

fn strip_tags(html: &str) -> String {
    let mut out = String::with_capacity(html.len());
    let mut in_tag = false;
    for c in html.chars() {
        match c {
            '<' => {
                in_tag = true;
                out.push(' ');
            }
            '>' if in_tag => in_tag = false,
            _ if !in_tag => out.push(c),
            _ => {}
        }
    }
    out
}

fn collapse_spaces(text: &str) -> String {
    text.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Build the full-text query that identifies a record by its labelled
/// description parts.
pub fn identity_query(
    description: &str,
    labels: &[String],
    needed: usize,
) -> Result<String, SyncError> {
    let parts: Vec<String> = description
        .split("</p>")
        .map(|part| collapse_spaces(&strip_tags(part)))
        .filter(|part| !part.is_empty())
        .filter(|part| labels.iter().any(|label| part.starts_with(label.as_str())))
        .collect();
    if parts.len() < needed {
        return Err(SyncError::InsufficientIdentitySignal {
            found: parts.len(),
            needed,
        });
    }
    let quoted: Vec<String> = parts
        .iter()
        .map(|part| format!("\"{}\"", part.replace('"', "\\\"")))
        .collect();
    Ok(quoted.join(" AND "))
}

fn entry_name<'a>(entry: &'a Value, key: &str) -> Option<&'a str> {
    entry.get(key).and_then(Value::as_str)
}

pub struct Reconciler<'a> {
    repo: &'a dyn Repository,
    schema: &'a Schema,
    config: &'a ReconcileConfig,
    identity: &'a IdentityConfig,
    options: &'a RunOptions,
}

impl<'a> Reconciler<'a> {
    pub fn new(
        repo: &'a dyn Repository,
        schema: &'a Schema,
        config: &'a ReconcileConfig,
        identity: &'a IdentityConfig,
        options: &'a RunOptions,
    ) -> Self {
        Self {
            repo,
            schema,
            config,
            identity,
            options,
        }
    }

    /// Resolve the repository id for a record. `None` means the record is new
    /// and the run is a preview, so nothing was created.
    pub fn identify(
        &self,
        local_id: &str,
        fields: &CanonicalFields,
        map: &MapStore,
        deadline: &Deadline,
    ) -> Result<Option<Identity>, SyncError> {
        if let Some(id) = map.lookup(local_id) {
            return Ok(Some(Identity {
                external_id: id.to_string(),
                origin: IdentityOrigin::Mapped,
            }));
        }

        let description = fields
            .get(DESCRIPTION_FIELD)
            .map(String::as_str)
            .unwrap_or_default();
        let query = identity_query(description, &self.identity.labels, self.identity.threshold())?;
        if let Some(id) = self.repo.search(&query, deadline)? {
            info!(local_id, external_id = %id, "identified by search");
            return Ok(Some(Identity {
                external_id: id,
                origin: IdentityOrigin::Searched,
            }));
        }

        if !self.options.commit {
            info!(local_id, "no match; preview run, not creating");
            return Ok(None);
        }

        let title = fields
            .get("Title")
            .filter(|t| !t.trim().is_empty())
            .ok_or_else(|| {
                SyncError::MalformedInput(format!("{local_id}: no Title to create with"))
            })?;
        let id = self.repo.create_entity(title, description, deadline)?;
        info!(local_id, external_id = %id, "created placeholder entity");
        self.await_queryable(&id, deadline)?;
        Ok(Some(Identity {
            external_id: id,
            origin: IdentityOrigin::Created,
        }))
    }

    fn await_queryable(&self, id: &str, deadline: &Deadline) -> Result<(), SyncError> {
        let attempts = self.config.create_retries.max(1);
        let backoff = Duration::from_secs(self.config.create_backoff_secs);
        for attempt in 1..=attempts {
            match self.repo.probe(id, deadline) {
                Ok(()) => return Ok(()),
                Err(SyncError::Remote(RemoteError::NotYetQueryable(_))) => {
                    warn!(external_id = id, attempt, attempts, "created entity not queryable yet");
                    if attempt < attempts {
                        deadline.sleep(backoff, "create-backoff")?;
                    }
                }
                Err(other) => return Err(other),
            }
        }
        Err(SyncError::CreateNotQueryable { attempts })
    }

    /// Fetch, build, compare and (in commit mode) apply.
    pub fn reconcile(
        &self,
        identity: &Identity,
        fields: &CanonicalFields,
        deadline: &Deadline,
    ) -> Result<Outcome, SyncError> {
        let id = identity.external_id.as_str();
        let published = self
            .repo
            .fetch_snapshot(id, VersionSelector::Published, deadline)?;
        let mut candidate = self.build_candidate(&published, fields)?;
        if !self.options.force_update {
            self.suppress_volatile(&published, &mut candidate)?;
        }

        let root = self.config.compare_root.as_str();
        let before = tree::get(&published, root)?.cloned().unwrap_or(Value::Null);
        let after = tree::get(&candidate, root)?.cloned().unwrap_or(Value::Null);
        let (unchanged, differences) = if self.options.quiet_diff {
            (diff::equal(&before, &after), Vec::new())
        } else {
            let found = diff::report(&before, &after);
            for difference in &found {
                info!(external_id = id, "{difference}");
            }
            (found.is_empty(), found)
        };

        let has_file = published
            .get("files")
            .and_then(Value::as_array)
            .is_some_and(|files| !files.is_empty());
        if unchanged && has_file && !self.options.force_update {
            info!(external_id = id, "no update required");
            return Ok(Outcome {
                decision: Decision::Skip,
                applied: false,
                differences,
                candidate,
            });
        }

        if !self.options.commit {
            info!(external_id = id, "update needed; preview only");
            return Ok(Outcome {
                decision: Decision::Update,
                applied: false,
                differences,
                candidate,
            });
        }

        self.apply(id, &candidate, deadline)?;
        Ok(Outcome {
            decision: Decision::Update,
            applied: true,
            differences,
            candidate,
        })
    }

    pub fn build_candidate(
        &self,
        published: &Value,
        fields: &CanonicalFields,
    ) -> Result<Value, SyncError> {
        if !published.is_object() {
            return Err(SyncError::MalformedInput(
                "published snapshot is not a mapping".to_string(),
            ));
        }
        let mut candidate = published.clone();
        for path in &self.config.server_state_paths {
            tree::delete(&mut candidate, path);
        }
        self.schema.apply(fields, &mut candidate)?;
        Ok(candidate)
    }

    /// Mirror server-maintained values from `published` so they never show up
    /// as differences. Values absent from `published` are never invented.
    pub fn suppress_volatile(
        &self,
        published: &Value,
        candidate: &mut Value,
    ) -> Result<(), SyncError> {
        let key = self.config.identity_key.as_str();
        let fields_path = self.config.fields_path.as_str();
        if let Some(published_fields) = tree::get(published, fields_path)?.and_then(Value::as_array)
            && let Some(candidate_fields) =
                tree::get_mut(candidate, fields_path)?.and_then(Value::as_array_mut)
        {
            for name in &self.config.volatile_fields {
                let Some(pos) = published_fields
                    .iter()
                    .position(|f| entry_name(f, key) == Some(name.as_str()))
                else {
                    continue;
                };
                let published_entry = &published_fields[pos];
                let existing = candidate_fields
                    .iter()
                    .position(|f| entry_name(f, key) == Some(name.as_str()));
                match existing {
                    Some(index) => {
                        if let (Some(entry), Some(value)) = (
                            candidate_fields[index].as_object_mut(),
                            published_entry.get("value"),
                        ) {
                            entry.insert("value".to_string(), value.clone());
                        }
                    }
                    None => {
                        let anchor = published_fields[..pos]
                            .iter()
                            .rev()
                            .filter_map(|f| entry_name(f, key))
                            .find_map(|prior| {
                                candidate_fields
                                    .iter()
                                    .position(|c| entry_name(c, key) == Some(prior))
                            });
                        let at = anchor.map(|i| i + 1).unwrap_or(0);
                        candidate_fields.insert(at, published_entry.clone());
                    }
                }
            }
        }

        for path in &self.config.volatile_paths {
            let Some(value) = tree::get(published, path)?.cloned() else {
                continue;
            };
            if let Some((parent, _)) = path.trim_matches('/').rsplit_once('/') {
                tree::ensure_path(candidate, parent)?;
            }
            tree::set(candidate, path, value)?;
        }
        Ok(())
    }

    fn apply(&self, id: &str, candidate: &Value, deadline: &Deadline) -> Result<(), SyncError> {
        self.repo.push_snapshot(id, candidate, deadline)?;
        let draft = self.repo.fetch_snapshot(id, VersionSelector::Draft, deadline)?;
        let root = self.config.compare_root.as_str();
        let pushed = tree::get(candidate, root)?.cloned().unwrap_or(Value::Null);
        let stored = tree::get(&draft, root)?.cloned().unwrap_or(Value::Null);
        if let Some(first) = diff::report(&pushed, &stored).into_iter().next() {
            return Err(SyncError::Validation {
                path: first.path.clone(),
                detail: first.to_string(),
            });
        }
        info!(external_id = id, "draft verified");

        if let Some(path) = &self.options.attachment {
            self.repo.replace_attached_file(id, path, deadline)?;
            deadline.sleep(
                Duration::from_secs(self.config.ingest_settle_secs),
                "ingest-settle",
            )?;
            info!(external_id = id, file = %path.display(), "attachment replaced");
        }
        self.repo.publish(id, deadline)?;
        info!(external_id = id, "published");
        Ok(())
    }
}
