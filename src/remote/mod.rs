pub mod dataverse;

use crate::error::SyncError;
use crate::sync::deadline::Deadline;
use serde_json::Value;
use std::path::Path;
use thiserror::Error;

pub type ExternalId = String;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VersionSelector {
    Published,
    Draft,
}

impl VersionSelector {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Published => ":latest-published",
            Self::Draft => ":draft",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RemoteError {
    #[error("transport failure: {0}")]
    Transport(String),
    #[error("server answered {code}: {body}")]
    Status { code: u16, body: String },
    #[error("`{0}` not found")]
    NotFound(String),
    #[error("`{0}` is not queryable yet")]
    NotYetQueryable(ExternalId),
    #[error("query matched {count} entities, expected at most one")]
    AmbiguousMatch { count: usize },
    #[error("unexpected response shape: {0}")]
    Decode(String),
}

/// Everything the reconciler needs from the repository service. Every call
/// receives the record deadline so it can stop at once when the budget is
/// spent.
pub trait Repository {
    fn search(&self, query: &str, deadline: &Deadline) -> Result<Option<ExternalId>, SyncError>;

    fn create_entity(
        &self,
        title: &str,
        description: &str,
        deadline: &Deadline,
    ) -> Result<ExternalId, SyncError>;

    /// `Ok(())` once the entity answers queries, `NotYetQueryable` before.
    fn probe(&self, id: &str, deadline: &Deadline) -> Result<(), SyncError>;

    fn fetch_snapshot(
        &self,
        id: &str,
        version: VersionSelector,
        deadline: &Deadline,
    ) -> Result<Value, SyncError>;

    fn push_snapshot(&self, id: &str, snapshot: &Value, deadline: &Deadline)
    -> Result<Value, SyncError>;

    fn publish(&self, id: &str, deadline: &Deadline) -> Result<(), SyncError>;

    fn replace_attached_file(
        &self,
        id: &str,
        path: &Path,
        deadline: &Deadline,
    ) -> Result<(), SyncError>;
}
