//! Errors surfaced by the pipeline controller and SQL sources.

use faultlog_kernel::{CriteriaError, SourceError};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("Invalid config: {0}")]
    Config(String),
    #[error("Invalid criteria: {0}")]
    Criteria(#[from] CriteriaError),
    #[error("Failed to spawn query worker: {0}")]
    Spawn(String),
    #[error("Failed to join run: {0}")]
    Join(String),
    #[error("Source error: {0}")]
    Source(#[from] SourceError),
}
