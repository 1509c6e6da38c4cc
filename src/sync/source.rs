//! Tab-delimited input rows and two-column mapping tables.

use crate::sync::record::SourceRow;
use anyhow::{Context, Result, anyhow};
use std::collections::BTreeSet;
use std::fs::{self, File};
use std::path::Path;

/// Read every row of a tab-delimited file with a header line. Cells are
/// trimmed; quotes are literal text.
pub fn read_rows(path: &Path) -> Result<Vec<SourceRow>> {
    let file =
        File::open(path).with_context(|| format!("open input failed: {}", path.display()))?;
    let mut rdr = csv::ReaderBuilder::new()
        .delimiter(b'\t')
        .quoting(false)
        .flexible(true)
        .trim(csv::Trim::All)
        .from_reader(file);

    let headers = rdr
        .headers()
        .with_context(|| format!("read header failed: {}", path.display()))?
        .clone();
    let mut rows = Vec::new();
    for (line, rec) in rdr.records().enumerate() {
        let rec = rec.with_context(|| format!("read row {} failed: {}", line + 2, path.display()))?;
        let row: SourceRow = headers
            .iter()
            .zip(rec.iter())
            .map(|(h, v)| (h.to_string(), v.to_string()))
            .collect();
        rows.push(row);
    }
    Ok(rows)
}

/// Read a two-column table. A missing file is an empty table.
pub fn read_pairs(path: &Path, left: &str, right: &str) -> Result<Vec<(String, String)>> {
    if !path.exists() {
        return Ok(Vec::new());
    }
    let file = File::open(path).with_context(|| format!("open table failed: {}", path.display()))?;
    let mut rdr = csv::ReaderBuilder::new()
        .delimiter(b'\t')
        .trim(csv::Trim::All)
        .from_reader(file);

    let headers = rdr
        .headers()
        .with_context(|| format!("read header failed: {}", path.display()))?
        .clone();
    let position = |name: &str| {
        headers
            .iter()
            .position(|h| h == name)
            .ok_or_else(|| anyhow!("{} has no `{name}` column", path.display()))
    };
    let (li, ri) = (position(left)?, position(right)?);

    let mut pairs = Vec::new();
    for rec in rdr.records() {
        let rec = rec.with_context(|| format!("read table row failed: {}", path.display()))?;
        let l = rec.get(li).unwrap_or_default();
        let r = rec.get(ri).unwrap_or_default();
        if l.is_empty() && r.is_empty() {
            continue;
        }
        pairs.push((l.to_string(), r.to_string()));
    }
    Ok(pairs)
}

/// One id per line; blank lines are ignored.
pub fn read_id_list(path: &Path) -> Result<BTreeSet<String>> {
    let raw = fs::read_to_string(path)
        .with_context(|| format!("read id list failed: {}", path.display()))?;
    Ok(raw
        .lines()
        .map(str::trim)
        .filter(|l| !l.is_empty())
        .map(ToOwned::to_owned)
        .collect())
}

/// Serialize a two-column table with its header line.
pub fn encode_pairs<'a>(
    left: &str,
    right: &str,
    pairs: impl IntoIterator<Item = (&'a str, &'a str)>,
) -> Result<Vec<u8>> {
    let mut wtr = csv::WriterBuilder::new()
        .delimiter(b'\t')
        .from_writer(Vec::new());
    wtr.write_record([left, right])?;
    for (l, r) in pairs {
        wtr.write_record([l, r])?;
    }
    wtr.into_inner()
        .map_err(|err| anyhow!("flush table failed: {}", err.error()))
}
