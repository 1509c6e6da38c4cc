//! One-to-one table between local record ids and repository ids.

use crate::error::MapConflict;
use crate::sync::source::{encode_pairs, read_pairs};
use crate::sync::util::write_atomic;
use anyhow::{Context, Result, anyhow};
use fs2::FileExt;
use serde::Serialize;
use std::collections::BTreeMap;
use std::fs::{self, File, OpenOptions};
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct MergeReport {
    pub added: usize,
    pub preexisting: usize,
}

#[derive(Debug, Clone)]
pub struct MapStore {
    local_column: String,
    external_column: String,
    forward: BTreeMap<String, String>,
    reverse: BTreeMap<String, String>,
    // Insertion order, so a rewrite keeps existing rows where they were.
    order: Vec<String>,
}

impl MapStore {
    pub fn new(local_column: &str, external_column: &str) -> Self {
        Self {
            local_column: local_column.to_string(),
            external_column: external_column.to_string(),
            forward: BTreeMap::new(),
            reverse: BTreeMap::new(),
            order: Vec::new(),
        }
    }

    /// Load a table from disk. A missing file is an empty table; a file that
    /// breaks the one-to-one rule is an error.
    pub fn load(path: &Path, local_column: &str, external_column: &str) -> Result<Self> {
        let mut store = Self::new(local_column, external_column);
        let pairs = read_pairs(path, local_column, external_column)?;
        store
            .merge(pairs)
            .with_context(|| format!("mapping table {} is inconsistent", path.display()))?;
        Ok(store)
    }

    pub fn len(&self) -> usize {
        self.forward.len()
    }

    pub fn is_empty(&self) -> bool {
        self.forward.is_empty()
    }

    pub fn lookup(&self, local: &str) -> Option<&str> {
        self.forward.get(local).map(String::as_str)
    }

    pub fn owner_of(&self, external: &str) -> Option<&str> {
        self.reverse.get(external).map(String::as_str)
    }

    pub fn pairs(&self) -> impl Iterator<Item = (&str, &str)> {
        self.order
            .iter()
            .filter_map(|l| self.forward.get(l).map(|e| (l.as_str(), e.as_str())))
    }

    /// Add `incoming` pairs. Every pair is checked against the table and
    /// against the other incoming pairs first; on any conflict nothing is
    /// written.
    pub fn merge<I>(&mut self, incoming: I) -> Result<MergeReport, MapConflict>
    where
        I: IntoIterator<Item = (String, String)>,
    {
        let mut staged_forward: BTreeMap<String, String> = BTreeMap::new();
        let mut staged_reverse: BTreeMap<String, String> = BTreeMap::new();
        let mut staged_order = Vec::new();
        let mut report = MergeReport::default();

        for (local, external) in incoming {
            let local = local.trim().to_string();
            let external = external.trim().to_string();
            if local.is_empty() || external.is_empty() {
                return Err(MapConflict::EmptyId { local, external });
            }

            let bound_external = self
                .forward
                .get(&local)
                .or_else(|| staged_forward.get(&local));
            if let Some(existing) = bound_external {
                if *existing != external {
                    return Err(MapConflict::LocalBound {
                        local,
                        existing: existing.clone(),
                        incoming: external,
                    });
                }
                report.preexisting += 1;
                continue;
            }

            let bound_local = self
                .reverse
                .get(&external)
                .or_else(|| staged_reverse.get(&external));
            if let Some(existing) = bound_local {
                return Err(MapConflict::ExternalBound {
                    external,
                    existing: existing.clone(),
                    incoming: local,
                });
            }

            staged_forward.insert(local.clone(), external.clone());
            staged_reverse.insert(external, local.clone());
            staged_order.push(local);
            report.added += 1;
        }

        self.forward.append(&mut staged_forward);
        self.reverse.append(&mut staged_reverse);
        self.order.append(&mut staged_order);
        Ok(report)
    }

    pub fn encode(&self) -> Result<Vec<u8>> {
        encode_pairs(&self.local_column, &self.external_column, self.pairs())
    }

    /// Rewrite the whole table atomically.
    pub fn save(&self, path: &Path) -> Result<()> {
        write_atomic(path, &self.encode()?)
    }
}

/// Lock file guarding `table`: the same name with a `.lock` suffix.
pub fn lock_path(table: &Path) -> PathBuf {
    let mut name = table
        .file_name()
        .map(|n| n.to_os_string())
        .unwrap_or_else(|| "map.tsv".into());
    name.push(".lock");
    table.with_file_name(name)
}

/// Exclusive advisory lock held for the duration of a batch.
#[derive(Debug)]
pub struct BatchLock {
    file: File,
    path: PathBuf,
}

impl BatchLock {
    pub fn acquire(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            fs::create_dir_all(parent)
                .with_context(|| format!("failed to create {}", parent.display()))?;
        }
        let file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(path)
            .with_context(|| format!("failed to open lock {}", path.display()))?;
        file.try_lock_exclusive().map_err(|_| {
            anyhow!(
                "another run holds {}; wait for it to finish",
                path.display()
            )
        })?;
        Ok(Self {
            file,
            path: path.to_path_buf(),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for BatchLock {
    fn drop(&mut self) {
        let _ = FileExt::unlock(&self.file);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn pair(l: &str, r: &str) -> (String, String) {
        (l.to_string(), r.to_string())
    }

    fn store() -> MapStore {
        let mut s = MapStore::new("Local ID", "DOI");
        s.merge(vec![pair("P1", "doi:1"), pair("P2", "doi:2")])
            .expect("seed");
        s
    }

    #[test]
    fn merging_the_same_set_twice_is_a_no_op() {
        let incoming = vec![pair("A", "doi:1"), pair("B", "doi:2")];
        let mut s = MapStore::new("Local ID", "DOI");
        let first = s.merge(incoming.clone()).expect("first merge");
        assert_eq!(
            first,
            MergeReport {
                added: 2,
                preexisting: 0
            }
        );
        let before = s.encode().expect("encode");

        let second = s.merge(incoming).expect("second merge");
        assert_eq!(
            second,
            MergeReport {
                added: 0,
                preexisting: 2
            }
        );
        assert_eq!(s.encode().expect("encode"), before);
        assert_eq!(s.len(), 2);
    }

    #[test]
    fn merge_counts_added_and_preexisting() {
        let mut s = store();
        let report = s
            .merge(vec![pair("P1", "doi:1"), pair("P3", "doi:3")])
            .expect("merge");
        assert_eq!(
            report,
            MergeReport {
                added: 1,
                preexisting: 1
            }
        );
        assert_eq!(s.lookup("P3"), Some("doi:3"));
        assert_eq!(s.owner_of("doi:3"), Some("P3"));
    }

    #[test]
    fn conflicting_local_leaves_table_unchanged() {
        let mut s = store();
        let before = s.encode().expect("encode");
        let err = s
            .merge(vec![pair("P3", "doi:3"), pair("P1", "doi:9")])
            .expect_err("conflict");
        assert!(matches!(err, MapConflict::LocalBound { .. }));
        assert_eq!(s.encode().expect("encode"), before);
        assert_eq!(s.lookup("P3"), None);
    }

    #[test]
    fn conflicting_external_is_rejected() {
        let mut s = store();
        let err = s.merge(vec![pair("P9", "doi:2")]).expect_err("conflict");
        assert!(matches!(err, MapConflict::ExternalBound { .. }));
    }

    #[test]
    fn conflicts_inside_one_batch_are_rejected() {
        let mut s = store();
        let err = s
            .merge(vec![pair("P5", "doi:5"), pair("P6", "doi:5")])
            .expect_err("in-batch conflict");
        assert!(matches!(err, MapConflict::ExternalBound { .. }));
        assert_eq!(s.len(), 2);

        let report = s
            .merge(vec![pair("P5", "doi:5"), pair("P5", "doi:5")])
            .expect("consistent duplicate");
        assert_eq!(report.added, 1);
        assert_eq!(report.preexisting, 1);
    }

    #[test]
    fn save_then_load_preserves_pairs() {
        let tmp = tempdir().expect("tempdir");
        let path = tmp.path().join("map.tsv");
        let s = store();
        s.save(&path).expect("save");
        let loaded = MapStore::load(&path, "Local ID", "DOI").expect("load");
        assert_eq!(
            loaded.pairs().collect::<Vec<_>>(),
            vec![("P1", "doi:1"), ("P2", "doi:2")]
        );
    }

    #[test]
    fn load_rejects_non_bijective_file() {
        let tmp = tempdir().expect("tempdir");
        let path = tmp.path().join("map.tsv");
        fs::write(&path, "Local ID\tDOI\nP1\tdoi:1\nP2\tdoi:1\n").expect("write");
        assert!(MapStore::load(&path, "Local ID", "DOI").is_err());
    }

    #[test]
    fn batch_lock_is_exclusive() {
        let tmp = tempdir().expect("tempdir");
        let path = tmp.path().join("map.tsv.lock");
        let held = BatchLock::acquire(&path).expect("first lock");
        assert!(BatchLock::acquire(&path).is_err());
        drop(held);
        BatchLock::acquire(&path).expect("lock after release");
    }
}
