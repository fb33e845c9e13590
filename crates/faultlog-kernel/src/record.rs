//! Records produced by a query source.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::criteria::{AlarmCode, AlarmLevel, QueryCriteria};

/// Minimum a record must expose for the pipeline to page over it.
///
/// The pipeline treats records as opaque; only the primary-key id is read
/// (for de-duplication). [LogRecord::matches] lets in-memory sources apply a
/// [QueryCriteria] without knowing the concrete record type.
pub trait LogRecord: Send + 'static {
    fn record_id(&self) -> i64;

    fn matches(&self, _criteria: &QueryCriteria) -> bool {
        true
    }
}

/// One fault-log entry as returned by the query service.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct AlarmRecord {
    /// Primary key; assigned once, increasing with insertion order.
    pub id: i64,
    pub code: AlarmCode,
    pub level: AlarmLevel,
    pub device_sn: String,
    pub sub_module: Option<String>,
    pub alarm_time: DateTime<Utc>,
    pub name: String,
    pub detail: String,
    pub customer_solution: String,
    pub manager_solution: String,
}

impl LogRecord for AlarmRecord {
    fn record_id(&self) -> i64 {
        self.id
    }

    fn matches(&self, criteria: &QueryCriteria) -> bool {
        criteria.time_range.contains(self.alarm_time)
            && criteria.code.map_or(true, |code| code == self.code)
            && criteria.level.map_or(true, |level| level == self.level)
            && criteria
                .device_sn
                .as_deref()
                .map_or(true, |sn| sn == self.device_sn)
    }
}
