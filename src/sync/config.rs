use crate::sync::record::RecordLayout;
use anyhow::{Result, anyhow};
use serde::{Deserialize, Serialize};
use std::env;
use std::fs;
use std::path::PathBuf;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub base_url: String,
    pub collection: String,
    pub api_key: String,
    pub request_timeout_secs: u64,
    pub contact_email: String,
    pub placeholder_author: String,
    pub distributor: String,
    pub publish_type: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            base_url: "https://dataverse.harvard.edu".to_string(),
            collection: String::new(),
            api_key: String::new(),
            request_timeout_secs: 45,
            contact_email: String::new(),
            placeholder_author: "Placeholder".to_string(),
            distributor: "Harvard Dataverse Network".to_string(),
            publish_type: "minor".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ReconcileConfig {
    pub record_timeout_secs: u64,
    pub cooldown_secs: u64,
    pub create_retries: u32,
    pub create_backoff_secs: u64,
    pub ingest_settle_secs: u64,
    pub compare_root: String,
    pub fields_path: String,
    pub identity_key: String,
    pub volatile_fields: Vec<String>,
    pub volatile_paths: Vec<String>,
    pub server_state_paths: Vec<String>,
}

impl Default for ReconcileConfig {
    fn default() -> Self {
        Self {
            record_timeout_secs: 180,
            cooldown_secs: 30,
            create_retries: 3,
            create_backoff_secs: 30,
            ingest_settle_secs: 5,
            compare_root: "metadataBlocks".to_string(),
            fields_path: "metadataBlocks/citation/fields".to_string(),
            identity_key: "typeName".to_string(),
            volatile_fields: vec!["dateOfDeposit".to_string(), "distributionDate".to_string()],
            volatile_paths: Vec::new(),
            server_state_paths: vec![
                "lastUpdateTime".to_string(),
                "createTime".to_string(),
                "distributionDate".to_string(),
                "files".to_string(),
            ],
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct IdentityConfig {
    pub local_id_column: String,
    pub external_id_column: String,
    pub labels: Vec<String>,
    pub slack: usize,
}

impl Default for IdentityConfig {
    fn default() -> Self {
        Self {
            local_id_column: "Local ID".to_string(),
            external_id_column: "DOI".to_string(),
            labels: [
                "Date of creation",
                "Petition subject",
                "Original",
                "Petition location",
                "Legislator, committee, or address that the petition was sent to",
                "Selected signatures",
                "Total signatures",
            ]
            .into_iter()
            .map(ToOwned::to_owned)
            .collect(),
            slack: 2,
        }
    }
}

impl IdentityConfig {
    /// Minimum number of labelled description parts needed for a search.
    pub fn threshold(&self) -> usize {
        self.labels.len().saturating_sub(self.slack).max(1)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct SyncConfig {
    pub server: ServerConfig,
    pub reconcile: ReconcileConfig,
    pub identity: IdentityConfig,
    pub layout: RecordLayout,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
struct PartialSyncConfig {
    server: Option<ServerConfig>,
    reconcile: Option<ReconcileConfig>,
    identity: Option<IdentityConfig>,
    layout: Option<RecordLayout>,
}

fn env_or_u64(var: &str, fallback: u64) -> u64 {
    match env::var(var) {
        Ok(v) => v.trim().parse::<u64>().ok().unwrap_or(fallback),
        Err(_) => fallback,
    }
}

fn env_or_u32(var: &str, fallback: u32) -> u32 {
    match env::var(var) {
        Ok(v) => v.trim().parse::<u32>().ok().unwrap_or(fallback),
        Err(_) => fallback,
    }
}

fn env_or_usize(var: &str, fallback: usize) -> usize {
    match env::var(var) {
        Ok(v) => v.trim().parse::<usize>().ok().unwrap_or(fallback),
        Err(_) => fallback,
    }
}

fn env_or_string(var: &str, fallback: &str) -> String {
    match env::var(var) {
        Ok(v) if !v.trim().is_empty() => v.trim().to_string(),
        _ => fallback.to_string(),
    }
}

fn env_or_csv(var: &str, fallback: &[String]) -> Vec<String> {
    match env::var(var) {
        Ok(v) => {
            let out = v
                .split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(ToOwned::to_owned)
                .collect::<Vec<_>>();
            if out.is_empty() {
                fallback.to_vec()
            } else {
                out
            }
        }
        Err(_) => fallback.to_vec(),
    }
}

fn validate(cfg: &SyncConfig) -> Result<()> {
    if cfg.server.request_timeout_secs == 0 {
        return Err(anyhow!("invalid request timeout: must be >= 1 second"));
    }
    if cfg.server.publish_type != "minor" && cfg.server.publish_type != "major" {
        return Err(anyhow!("invalid publish type: use `minor` or `major`"));
    }
    if cfg.reconcile.record_timeout_secs == 0 {
        return Err(anyhow!("invalid record timeout: must be >= 1 second"));
    }
    if cfg.reconcile.compare_root.trim().is_empty() {
        return Err(anyhow!("invalid compare root: cannot be empty"));
    }
    if cfg.reconcile.identity_key.trim().is_empty() {
        return Err(anyhow!("invalid identity key: cannot be empty"));
    }
    if cfg.identity.local_id_column.trim().is_empty()
        || cfg.identity.external_id_column.trim().is_empty()
    {
        return Err(anyhow!("invalid identity columns: names cannot be empty"));
    }
    if cfg.identity.local_id_column == cfg.identity.external_id_column {
        return Err(anyhow!("invalid identity columns: local and external must differ"));
    }
    if cfg.identity.labels.is_empty() {
        return Err(anyhow!("invalid identity labels: at least one label is required"));
    }
    Ok(())
}

fn resolve_config_path() -> Option<PathBuf> {
    if let Ok(custom) = env::var("DVSYNC_CONFIG_PATH") {
        let trimmed = custom.trim();
        if !trimmed.is_empty() {
            return Some(PathBuf::from(trimmed));
        }
    }

    let home = dirs::home_dir()?;
    Some(home.join(".dvsync").join("dvsync.toml"))
}

fn merge_file_config(base: &mut SyncConfig) -> Result<()> {
    let Some(path) = resolve_config_path() else {
        return Ok(());
    };
    if !path.exists() {
        return Ok(());
    }

    let raw = fs::read_to_string(&path)?;
    let parsed: PartialSyncConfig = toml::from_str(&raw)
        .map_err(|err| anyhow!("failed to parse dvsync config {}: {err}", path.display()))?;
    if let Some(server) = parsed.server {
        base.server = server;
    }
    if let Some(reconcile) = parsed.reconcile {
        base.reconcile = reconcile;
    }
    if let Some(identity) = parsed.identity {
        base.identity = identity;
    }
    if let Some(layout) = parsed.layout {
        base.layout = layout;
    }
    Ok(())
}

pub fn load_config() -> Result<SyncConfig> {
    let mut cfg = SyncConfig::default();
    merge_file_config(&mut cfg)?;

    cfg.server.base_url = env_or_string("DVSYNC_BASE_URL", &cfg.server.base_url);
    cfg.server.collection = env_or_string("DVSYNC_COLLECTION", &cfg.server.collection);
    cfg.server.api_key = env_or_string("DVSYNC_API_KEY", &cfg.server.api_key);
    cfg.server.request_timeout_secs =
        env_or_u64("DVSYNC_REQUEST_TIMEOUT_SECS", cfg.server.request_timeout_secs);
    cfg.server.contact_email = env_or_string("DVSYNC_CONTACT_EMAIL", &cfg.server.contact_email);
    cfg.server.publish_type = env_or_string("DVSYNC_PUBLISH_TYPE", &cfg.server.publish_type);
    cfg.reconcile.record_timeout_secs =
        env_or_u64("DVSYNC_RECORD_TIMEOUT_SECS", cfg.reconcile.record_timeout_secs);
    cfg.reconcile.cooldown_secs = env_or_u64("DVSYNC_COOLDOWN_SECS", cfg.reconcile.cooldown_secs);
    cfg.reconcile.create_retries =
        env_or_u32("DVSYNC_CREATE_RETRIES", cfg.reconcile.create_retries);
    cfg.reconcile.create_backoff_secs =
        env_or_u64("DVSYNC_CREATE_BACKOFF_SECS", cfg.reconcile.create_backoff_secs);
    cfg.reconcile.ingest_settle_secs =
        env_or_u64("DVSYNC_INGEST_SETTLE_SECS", cfg.reconcile.ingest_settle_secs);
    cfg.reconcile.volatile_fields =
        env_or_csv("DVSYNC_VOLATILE_FIELDS", &cfg.reconcile.volatile_fields);
    cfg.identity.slack = env_or_usize("DVSYNC_IDENTITY_SLACK", cfg.identity.slack);

    validate(&cfg)?;
    Ok(cfg)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_validate() {
        let cfg = SyncConfig::default();
        validate(&cfg).expect("defaults are valid");
        assert_eq!(cfg.identity.threshold(), 5);
        assert_eq!(cfg.reconcile.compare_root, "metadataBlocks");
    }

    #[test]
    fn partial_file_replaces_only_named_sections() {
        let raw = r#"
[identity]
local_id_column = "Local ID"
external_id_column = "DOI"
labels = ["Petition subject"]
slack = 0
"#;
        let parsed: PartialSyncConfig = toml::from_str(raw).expect("parse");
        assert!(parsed.server.is_none());
        let identity = parsed.identity.expect("identity");
        assert_eq!(identity.threshold(), 1);

        let server: PartialSyncConfig =
            toml::from_str("[server]\ncollection = \"petitions\"\n").expect("parse server");
        let server = server.server.expect("server");
        assert_eq!(server.collection, "petitions");
        assert_eq!(server.request_timeout_secs, 45);
    }

    #[test]
    fn rejects_matching_identity_columns() {
        let mut cfg = SyncConfig::default();
        cfg.identity.external_id_column = cfg.identity.local_id_column.clone();
        assert!(validate(&cfg).is_err());
    }

    #[test]
    fn rejects_unknown_publish_type() {
        let mut cfg = SyncConfig::default();
        cfg.server.publish_type = "patch".to_string();
        assert!(validate(&cfg).is_err());
    }
}
