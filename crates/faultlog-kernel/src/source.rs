//! Remote query service contract consumed by the pipeline.

use serde::{Deserialize, Serialize};

use crate::criteria::QueryCriteria;
use crate::error::SourceError;
use crate::record::LogRecord;

/// Inclusive primary-key window `[start_id, end_id]`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct IdRange {
    pub start_id: i64,
    pub end_id: i64,
}

impl IdRange {
    pub fn new(start_id: i64, end_id: i64) -> Result<Self, SourceError> {
        if start_id > end_id {
            return Err(SourceError::InvalidRange {
                start: start_id,
                end: end_id,
            });
        }
        Ok(Self { start_id, end_id })
    }

    pub fn contains(&self, id: i64) -> bool {
        self.start_id <= id && id <= self.end_id
    }
}

/// Paginated query service.
///
/// Calls are synchronous and are only ever issued from the pipeline's
/// producer thread, one at a time. Implementations backed by an async driver
/// block on their own runtime (see the Postgres source).
pub trait LogSource: Send + Sync + 'static {
    type Record: LogRecord;

    /// Total number of rows matching `criteria` right now.
    fn count_matching(&self, criteria: &QueryCriteria) -> Result<u64, SourceError>;

    /// Largest matching primary key, or `None` when nothing matches.
    fn max_matching_id(&self, criteria: &QueryCriteria) -> Result<Option<i64>, SourceError>;

    /// Every matching row with `start_id <= id <= end_id`, in any order.
    /// An empty window is an empty `Vec`, not an error.
    fn page_by_id_range(
        &self,
        criteria: &QueryCriteria,
        range: IdRange,
    ) -> Result<Vec<Self::Record>, SourceError>;
}
