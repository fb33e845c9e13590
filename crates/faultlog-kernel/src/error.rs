//! Error types shared by query sources and criteria builders.

use thiserror::Error;

/// Failure reported by a [crate::source::LogSource] call.
///
/// Every variant ends the run that observed it; the pipeline never reconciles
/// a partially failed page.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum SourceError {
    #[error("Driver error: {0}")]
    Driver(String),
    #[error("Source unavailable: {0}")]
    Unavailable(String),
    #[error("Invalid id range: start {start} is above end {end}")]
    InvalidRange { start: i64, end: i64 },
}

/// Rejected query criteria.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum CriteriaError {
    #[error("time window starts at {start} which is after its end {end}")]
    InvertedWindow { start: String, end: String },
    #[error("time window spans more than {max_months} months")]
    SpanTooLong { max_months: u32 },
    #[error("malformed alarm code '{0}', expected main-middle-sub")]
    MalformedCode(String),
    #[error("unknown alarm level: {0}")]
    UnknownLevel(i32),
}
