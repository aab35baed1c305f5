use std::path::PathBuf;
use thiserror::Error;

/// Failures that abort a pipeline run. Nothing is retried or rendered partially.
#[derive(Error, Debug)]
pub enum PipelineError {
    #[error("Failed to load {}: {reason}", .path.display())]
    DataLoad { path: PathBuf, reason: String },

    #[error("Cannot reproject from {crs}: {reason}")]
    Crs { crs: String, reason: String },

    #[error("Degenerate input: {0}")]
    DegenerateInput(String),

    #[error("No point fell inside any of the {regions} regions")]
    EmptyJoinResult { regions: usize },

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Failed to write {}: {reason}", .path.display())]
    Output { path: PathBuf, reason: String },
}

impl PipelineError {
    pub fn load(path: impl Into<PathBuf>, reason: impl ToString) -> Self {
        PipelineError::DataLoad { path: path.into(), reason: reason.to_string() }
    }

    pub fn output(path: impl Into<PathBuf>, reason: impl ToString) -> Self {
        PipelineError::Output { path: path.into(), reason: reason.to_string() }
    }
}

pub type Result<T> = std::result::Result<T, PipelineError>;
