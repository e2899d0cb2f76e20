//! Error taxonomy for the pipeline engine.
//!
//! Severity is decided by the caller, not the type: decode failures found
//! during a catalog scan are recovered locally (the file is recorded as
//! unrecognized), configuration errors abort before any execution, and
//! execution errors fail only the affected tuple.

/// Errors produced while decoding a path back into an artifact identifier.
#[derive(Debug, thiserror::Error)]
pub enum DecodeError {
    #[error("path escapes the root (absolute or contains `..`): {path}")]
    Traversal { path: String },

    #[error("path component is not valid UTF-8")]
    InvalidComponent,

    #[error("path does not match the {kind} template: {path}")]
    UnknownTemplate { kind: &'static str, path: String },

    #[error("expected {expected} `_`-separated fields, found {found}: {token}")]
    FieldCount {
        expected: usize,
        found: usize,
        token: String,
    },

    #[error("malformed batch token: {token}")]
    BadBatch { token: String },

    #[error("malformed year: {token}")]
    BadYear { token: String },

    #[error("malformed date: {token}")]
    BadDate { token: String },

    #[error("invalid field value: {0}")]
    InvalidField(String),
}

/// Pipeline engine errors.
#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    /// Bad templates, bad field values, dependency cycles, invalid manifest.
    /// Fatal: aborts before any execution.
    #[error("configuration error: {0}")]
    Configuration(String),

    /// A path did not parse under the expected template.
    #[error("decode error: {0}")]
    Decode(#[from] DecodeError),

    /// Re-planning disagrees with batches already laid out on disk or
    /// recorded in the manifest.
    #[error("plan conflict for {tuple}: {detail}")]
    PlanConflict { tuple: String, detail: String },

    /// Two identifiers render to one path, or a concurrent writer was
    /// detected. Fatal for the affected tuple only.
    #[error("conflict: {0}")]
    Conflict(String),

    /// An external stage process failed or produced incomplete outputs.
    #[error("execution failed for {tuple}: {reason}")]
    Execution { tuple: String, reason: String },

    /// Aggregation or finalization is missing required inputs.
    #[error("incomplete inputs for {scenario}/{measure}: missing {missing:?}")]
    IncompleteInput {
        scenario: String,
        measure: String,
        missing: Vec<String>,
    },

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Result type for pipeline engine operations.
pub type Result<T> = std::result::Result<T, PipelineError>;
