//! Pipeline error types.

use std::io;
use thiserror::Error;

use crate::nut::NutType;

/// Result alias used across the crate.
pub type Result<T> = std::result::Result<T, Error>;

// ============================================================================
// Error
// ============================================================================

/// Errors raised while resolving, transforming or configuring nuts.
#[derive(Debug, Error)]
pub enum Error {
    /// A store could not resolve a path.
    #[error("no nut found for `{path}` in store `{store}`")]
    NotFound { store: String, path: String },

    /// A stage received a nut type it does not declare.
    #[error("stage `{stage}` does not support nut type {nut_type} (nut `{name}`)")]
    UnsupportedType {
        stage: String,
        nut_type: NutType,
        name: String,
    },

    /// `transform` was called twice on the same convertible nut.
    #[error("nut `{0}` has already been transformed")]
    AlreadyTransformed(String),

    /// A relative reference walks above the store root.
    #[error("path `{path}` referenced from `{referencer}` goes above the root")]
    UnreachablePath { referencer: String, path: String },

    /// Stream or store access failure.
    #[error("IO error on `{0}`")]
    Io(String, #[source] io::Error),

    /// Duplicate id across tags or contradictory store options.
    #[error("configuration conflict: {0}")]
    ConfigurationConflict(String),

    /// Composition or dependency cycle.
    #[error("cycle detected: {0}")]
    CycleDetected(String),

    /// A registration references an id nobody registered.
    #[error("unknown {kind} `{id}`")]
    UnknownId { kind: &'static str, id: String },

    /// Invalid wildcard or regex pattern.
    #[error("invalid pattern `{pattern}`")]
    InvalidPattern {
        pattern: String,
        #[source]
        source: regex::Error,
    },

    /// Version resolution failed (memoized failure).
    #[error("version of `{name}` unavailable: {reason}")]
    Version { name: String, reason: String },

    /// Custom stage failure.
    #[error("stage `{stage}` failed: {message}")]
    Stage { stage: String, message: String },
}

impl Error {
    /// Wrap an IO error with the path it relates to.
    pub fn io(path: impl Into<String>, err: io::Error) -> Self {
        Self::Io(path.into(), err)
    }

    /// Whether this error is a resolution miss.
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }
}
