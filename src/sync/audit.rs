use crate::sync::util::now_epoch_secs;
use anyhow::{Context, Result};
use serde::Serialize;
use std::fs;
use std::io::Write;
use std::path::Path;

#[derive(Debug, Clone, Serialize)]
pub struct AuditEvent {
    pub at_epoch_secs: u64,
    pub local_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub external_id: Option<String>,
    pub outcome: String,
    pub message: String,
}

impl AuditEvent {
    pub fn new(
        local_id: &str,
        external_id: Option<&str>,
        outcome: &str,
        message: &str,
    ) -> Result<Self> {
        Ok(Self {
            at_epoch_secs: now_epoch_secs()?,
            local_id: local_id.to_string(),
            external_id: external_id.map(ToOwned::to_owned),
            outcome: outcome.to_string(),
            message: message.to_string(),
        })
    }
}

/// Append one JSON line to the audit log.
pub fn append_event(path: &Path, event: &AuditEvent) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("failed to create {}", parent.display()))?;
    }
    let line = format!("{}\n", serde_json::to_string(event)?);
    let mut file = fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .with_context(|| format!("failed to open {}", path.display()))?;
    file.write_all(line.as_bytes())?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn events_append_as_json_lines() {
        let tmp = tempdir().expect("tempdir");
        let path = tmp.path().join("logs/audit.log");
        let first =
            AuditEvent::new("P1", Some("doi:1"), "skipped", "no update required").expect("event");
        let second = AuditEvent::new("P2", None, "unresolved", "weak signal").expect("event");
        append_event(&path, &first).expect("append");
        append_event(&path, &second).expect("append");

        let raw = fs::read_to_string(&path).expect("read");
        let lines: Vec<serde_json::Value> = raw
            .lines()
            .map(|l| serde_json::from_str(l).expect("json line"))
            .collect();
        assert_eq!(lines.len(), 2);
        assert_eq!(lines[0]["external_id"], "doi:1");
        assert!(lines[1].get("external_id").is_none());
    }
}
