use anyhow::Result;
use std::env;
use std::path::PathBuf;

#[derive(Debug, Clone)]
pub struct SyncPaths {
    pub home: PathBuf,
    pub map_file: PathBuf,
    pub updates_file: PathBuf,
    pub logs_dir: PathBuf,
    pub candidate_dump: PathBuf,
    pub audit_log: PathBuf,
    pub failed_list: PathBuf,
}

fn required_home_dir() -> Result<PathBuf> {
    if let Some(home) = dirs::home_dir() {
        return Ok(home);
    }
    Err(anyhow::anyhow!("HOME directory could not be resolved"))
}

fn env_or_default_path(var: &str, fallback: PathBuf) -> PathBuf {
    match env::var(var) {
        Ok(v) if !v.trim().is_empty() => PathBuf::from(v.trim()),
        _ => fallback,
    }
}

pub fn resolve_paths() -> Result<SyncPaths> {
    let home = match env::var("DVSYNC_HOME") {
        Ok(v) if !v.trim().is_empty() => PathBuf::from(v.trim()),
        _ => required_home_dir()?.join("dvsync"),
    };

    let map_file = env_or_default_path("DVSYNC_MAP_FILE", home.join("map.tsv"));
    let updates_file = env_or_default_path("DVSYNC_UPDATES_FILE", home.join("updates.tsv"));
    let logs_dir = env_or_default_path("DVSYNC_LOGS_DIR", home.join("logs"));
    let candidate_dump = logs_dir.join("candidate.json");
    let audit_log = logs_dir.join("audit.log");
    let failed_list = logs_dir.join("failed.txt");

    Ok(SyncPaths {
        home,
        map_file,
        updates_file,
        logs_dir,
        candidate_dump,
        audit_log,
        failed_list,
    })
}

impl SyncPaths {
    pub fn with_overrides(mut self, map: Option<PathBuf>, updates: Option<PathBuf>) -> Self {
        if let Some(map) = map {
            self.map_file = map;
        }
        if let Some(updates) = updates {
            self.updates_file = updates;
        }
        self
    }

    /// Advisory lock file guarding the mapping table.
    pub fn lock_file(&self) -> PathBuf {
        crate::sync::map_store::lock_path(&self.map_file)
    }
}
