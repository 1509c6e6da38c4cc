use crate::remote::RemoteError;
use crate::sync::schema::SchemaError;
use crate::sync::tree::PathError;
use thiserror::Error;

/// Per-record failure. The driver classifies these into outcome counters and
/// keeps going.
#[derive(Debug, Error)]
pub enum SyncError {
    #[error("identity signal too weak: {found} labelled parts, need {needed}")]
    InsufficientIdentitySignal { found: usize, needed: usize },
    #[error("remote call failed: {0}")]
    Remote(#[from] RemoteError),
    #[error("record timed out during {stage} after {limit_secs}s")]
    TimeoutExceeded { stage: String, limit_secs: u64 },
    #[error("created entity never became queryable after {attempts} probes")]
    CreateNotQueryable { attempts: u32 },
    #[error("pushed draft diverges at `{path}`: {detail}")]
    Validation { path: String, detail: String },
    #[error("malformed input: {0}")]
    MalformedInput(String),
    #[error(transparent)]
    Tree(#[from] PathError),
}

impl From<SchemaError> for SyncError {
    fn from(err: SchemaError) -> Self {
        match err {
            SchemaError::Tree(path) => SyncError::Tree(path),
            other => SyncError::MalformedInput(other.to_string()),
        }
    }
}

/// A mapping that would break the one-to-one table.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum MapConflict {
    #[error("local id `{local}` already maps to `{existing}`, refusing `{incoming}`")]
    LocalBound {
        local: String,
        existing: String,
        incoming: String,
    },
    #[error("external id `{external}` already belongs to `{existing}`, refusing `{incoming}`")]
    ExternalBound {
        external: String,
        existing: String,
        incoming: String,
    },
    #[error("empty identifier in pair (`{local}`, `{external}`)")]
    EmptyId { local: String, external: String },
}
