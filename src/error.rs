use thiserror::Error;

/// The closed set of error kinds a ChronDB core operation can raise.
/// Each variant carries the structured context its callers need; external
/// adapters re-format these (JSON for HTTP, a short line for RESP, a SQL
/// error string for the PG wire) — formatting lives outside this crate.
#[derive(Error, Debug)]
pub enum ChronError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),

    #[error("storage unavailable: handle is closed")]
    StorageUnavailable,

    #[error("stale branch '{branch}': ref moved concurrently")]
    StaleBranch { branch: String },

    #[error("version conflict on '{id}'@{branch}: expected {expected}, found {actual}")]
    VersionConflict {
        expected: u64,
        actual: u64,
        id: String,
        branch: String,
    },

    #[error(
        "validation failed for '{id}' in namespace '{namespace}' (mode={mode}): {violations:?}"
    )]
    ValidationError {
        namespace: String,
        id: String,
        mode: String,
        violations: Vec<String>,
    },

    #[error("invalid timestamp: {input}")]
    InvalidTimestamp { input: String },

    #[error("not found: {id}")]
    NotFound { id: String },

    #[error("corruption detected in object {object}")]
    Corruption { object: String },

    #[error("bundle invalid at '{path}': {reason}")]
    BundleInvalid { path: String, reason: String },

    #[error("I/O failure during {op}: {cause}")]
    IoFailure { op: String, cause: String },

    #[error("branch not found: {0}")]
    BranchNotFound(String),

    #[error("branch already exists: {0}")]
    BranchExists(String),

    #[error("commit not found: {0}")]
    CommitNotFound(String),

    #[error("empty repository — no commits yet")]
    EmptyRepository,
}

pub type Result<T> = std::result::Result<T, ChronError>;
