//! Fault-log kernel.
//!
//! Contracts and value types shared by the streaming pipeline: the query
//! [QueryCriteria], the paginated [LogSource] service, the [RecordSink] that
//! receives drained batches, and the concrete [AlarmRecord].

pub mod criteria;
pub mod error;
pub mod in_memory;
pub mod record;
pub mod sink;
pub mod source;

pub use criteria::{AlarmCode, AlarmLevel, QueryCriteria, TimeRange, MAX_WINDOW_MONTHS};
pub use error::{CriteriaError, SourceError};
pub use in_memory::InMemoryLogSource;
pub use record::{AlarmRecord, LogRecord};
pub use sink::{ChannelSink, CollectingSink, RecordSink, SinkEvent};
pub use source::{IdRange, LogSource};
