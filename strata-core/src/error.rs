//! Error types for strata.
//!
//! All errors use `thiserror` for ergonomic error handling and proper error
//! chains. Best-effort cleanup failures (view teardown, lease deletion) are
//! logged where they happen and never surface through these types.

use std::path::PathBuf;
use std::sync::Arc;
use thiserror::Error;

/// Result type alias for strata operations.
pub type Result<T> = std::result::Result<T, StrataError>;

/// Main error type for strata.
#[derive(Error, Debug)]
pub enum StrataError {
    // Definition loading errors
    #[error("failed to parse op")]
    MalformedOp(#[from] prost::DecodeError),

    #[error("failed to find input {digest}")]
    MissingInput { digest: String },

    #[error("invalid op: {reason}")]
    InvalidOp { reason: String },

    #[error("invalid digest: {digest}")]
    InvalidDigest { digest: String },

    // Source errors
    #[error("invalid source identifier: {identifier}")]
    InvalidIdentifier { identifier: String },

    #[error("no source registered for scheme {scheme}")]
    UnknownScheme { scheme: String },

    #[error("source {identifier} failed")]
    Source {
        identifier: String,
        #[source]
        source: anyhow::Error,
    },

    // Worker errors
    #[error("worker failed running {args}")]
    Worker {
        args: String,
        #[source]
        source: anyhow::Error,
    },

    // Job registry errors
    #[error("job {id} already exists")]
    DuplicateJob { id: String },

    #[error("no such job {id}")]
    NoSuchJob { id: String },

    // Ref store errors
    #[error("not found: {id}")]
    NotFound { id: String },

    #[error("invalid ref: {reason}")]
    InvalidRef { reason: String },

    #[error("failed to set blob for reference with non-addressable parent: {id}")]
    NonAddressableParent { id: String },

    #[error("error committing {id}")]
    Commit {
        id: String,
        #[source]
        source: Box<StrataError>,
    },

    #[error("snapshotter failed on {key}: {reason}")]
    Snapshotter { key: String, reason: String },

    // Ambient errors
    #[error("I/O error at {path:?}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("metadata error: {0}")]
    Metadata(#[from] serde_json::Error),

    #[error("invalid configuration: {reason}")]
    InvalidConfig { reason: String },

    #[error("operation canceled")]
    Canceled,

    // A previously recorded failure, re-surfaced to a later caller.
    #[error(transparent)]
    Shared(#[from] Arc<StrataError>),

    #[error("internal error: {0}")]
    Internal(String),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl StrataError {
    /// Create an Internal error from any error type.
    pub fn internal(err: impl std::error::Error + Send + Sync + 'static) -> Self {
        Self::Internal(err.to_string())
    }
}
