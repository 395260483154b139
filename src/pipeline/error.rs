//! Error taxonomy for the scoring pipeline
//!
//! Every task body returns `Result<(), PipelineError>`. The scheduler's failure
//! boundary records all of them and keeps ticking, except `FatalIo`: once the
//! log file itself can no longer be rotated the process shuts down.

use std::path::PathBuf;
use thiserror::Error;

/// Store gateway failures (connection, query, commit)
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("Invalid row data: {0}")]
    InvalidRow(String),

    /// Some rows of a score batch failed; the transaction was still committed
    #[error("Partial score write: {failed} of {total} rows failed (first: {first_error})")]
    PartialWrite {
        failed: usize,
        total: usize,
        first_error: String,
    },

    #[error("Schema error: {0}")]
    Schema(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Inference engine failures (shape, numeric, load)
#[derive(Error, Debug)]
pub enum InferenceError {
    #[error("Shape mismatch: expected {expected} scores, got {actual}")]
    ShapeMismatch { expected: usize, actual: usize },

    #[error("Non-finite score at index {index}")]
    NonFinite { index: usize },

    #[error("Failed to load model from {path}: {reason}")]
    Load { path: PathBuf, reason: String },

    #[error("Inference worker failed: {0}")]
    Worker(String),
}

/// Configuration failures (environment, reload drop directory)
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Missing environment variable: {0}")]
    MissingVariable(String),

    #[error("Invalid configuration value: {0}")]
    InvalidValue(String),

    #[error("Found {count} reload candidates in {dir} (expected at most one)")]
    MultipleReloadCandidates { count: usize, dir: PathBuf },

    #[error("Failed to swap model artifact {path}: {source}")]
    ArtifactSwap {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Task-level error, classified by how the pipeline reacts to it
#[derive(Error, Debug)]
pub enum PipelineError {
    /// Logged, cycle aborted, retried next tick
    #[error("Transient store error: {0}")]
    TransientStore(#[from] StoreError),

    /// Logged, batch dropped, no retry
    #[error("Inference error: {0}")]
    Inference(#[from] InferenceError),

    /// Logged, reload refused, pipeline stays active
    #[error("Configuration error: {0}")]
    Configuration(#[from] ConfigError),

    /// Failure recorder compromised: terminates the process
    #[error("Fatal IO error on {path}: {source}")]
    FatalIo {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// Export file could not be written (history dump); retried next tick
    #[error("Export error: {0}")]
    Export(#[from] std::io::Error),
}

impl PipelineError {
    pub fn is_fatal(&self) -> bool {
        matches!(self, PipelineError::FatalIo { .. })
    }

    /// Short label used in log lines
    pub fn kind(&self) -> &'static str {
        match self {
            PipelineError::TransientStore(_) => "TransientStoreError",
            PipelineError::Inference(_) => "InferenceError",
            PipelineError::Configuration(_) => "ConfigurationError",
            PipelineError::FatalIo { .. } => "FatalIOError",
            PipelineError::Export(_) => "ExportError",
        }
    }
}
