//! Error handling

use std::path::PathBuf;

pub type EngineResult<T> = Result<T, EngineError>;

/// Engine error taxonomy.
///
/// Per-request failures (timeouts, resets) are never errors here: they are
/// recorded as observations. Per-target health failures are carried in the
/// target's `HealthState`, not as errors.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    /// Malformed or missing target configuration. Fatal before any dispatch.
    #[error("invalid configuration: {0}")]
    Config(String),

    /// A dataset file could not be parsed. Fatal for the whole corpus so a
    /// partially loaded corpus never biases the metrics.
    #[error("failed to load corpus file {path}: {reason}")]
    CorpusLoad { path: PathBuf, reason: String },

    /// Persistence failure. Fatal for the affected target's dispatch.
    #[error("results store error: {0}")]
    Store(#[from] sqlx::Error),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}
