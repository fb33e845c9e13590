//! In-memory [LogSource]: not durable, for tests and demos.

use std::cmp::Reverse;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{PoisonError, RwLock};

use crate::criteria::QueryCriteria;
use crate::error::SourceError;
use crate::record::LogRecord;
use crate::source::{IdRange, LogSource};

/// Vector-backed log table. Rows are filtered with [LogRecord::matches].
#[derive(Debug)]
pub struct InMemoryLogSource<R> {
    rows: RwLock<Vec<R>>,
    page_calls: AtomicUsize,
}

impl<R> Default for InMemoryLogSource<R> {
    fn default() -> Self {
        Self {
            rows: RwLock::new(Vec::new()),
            page_calls: AtomicUsize::new(0),
        }
    }
}

impl<R: LogRecord + Clone + Sync> InMemoryLogSource<R> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_rows(rows: impl IntoIterator<Item = R>) -> Self {
        let source = Self::new();
        source.insert_all(rows);
        source
    }

    pub fn insert(&self, row: R) {
        self.rows
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push(row);
    }

    pub fn insert_all(&self, rows: impl IntoIterator<Item = R>) {
        self.rows
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .extend(rows);
    }

    /// Removes every row whose id satisfies `pred`; returns how many went.
    pub fn delete_where(&self, pred: impl Fn(i64) -> bool) -> usize {
        let mut rows = self.rows.write().unwrap_or_else(PoisonError::into_inner);
        let before = rows.len();
        rows.retain(|r| !pred(r.record_id()));
        before - rows.len()
    }

    /// Number of `page_by_id_range` calls served so far.
    pub fn page_calls(&self) -> usize {
        self.page_calls.load(Ordering::SeqCst)
    }

    fn read<T>(&self, f: impl FnOnce(&[R]) -> T) -> T {
        let rows = self.rows.read().unwrap_or_else(PoisonError::into_inner);
        f(&rows)
    }
}

impl<R: LogRecord + Clone + Sync> LogSource for InMemoryLogSource<R> {
    type Record = R;

    fn count_matching(&self, criteria: &QueryCriteria) -> Result<u64, SourceError> {
        Ok(self.read(|rows| rows.iter().filter(|r| r.matches(criteria)).count()) as u64)
    }

    fn max_matching_id(&self, criteria: &QueryCriteria) -> Result<Option<i64>, SourceError> {
        Ok(self.read(|rows| {
            rows.iter()
                .filter(|r| r.matches(criteria))
                .map(|r| r.record_id())
                .max()
        }))
    }

    fn page_by_id_range(
        &self,
        criteria: &QueryCriteria,
        range: IdRange,
    ) -> Result<Vec<R>, SourceError> {
        self.page_calls.fetch_add(1, Ordering::SeqCst);
        if range.start_id > range.end_id {
            return Err(SourceError::InvalidRange {
                start: range.start_id,
                end: range.end_id,
            });
        }
        let mut page: Vec<R> = self.read(|rows| {
            rows.iter()
                .filter(|r| range.contains(r.record_id()) && r.matches(criteria))
                .cloned()
                .collect()
        });
        page.sort_by_key(|r| Reverse(r.record_id()));
        Ok(page)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::criteria::TimeRange;

    #[derive(Clone, Debug, PartialEq)]
    struct Row(i64);

    impl LogRecord for Row {
        fn record_id(&self) -> i64 {
            self.0
        }
    }

    fn any_criteria() -> QueryCriteria {
        let now = chrono::Utc::now();
        QueryCriteria::new(TimeRange { start: now, end: now })
    }

    #[test]
    fn serves_count_max_and_windows() {
        let source = InMemoryLogSource::with_rows((1..=25).map(Row));
        let criteria = any_criteria();

        assert_eq!(source.count_matching(&criteria).unwrap(), 25);
        assert_eq!(source.max_matching_id(&criteria).unwrap(), Some(25));

        let page = source
            .page_by_id_range(&criteria, IdRange::new(11, 20).unwrap())
            .unwrap();
        assert_eq!(page.len(), 10);
        assert!(page.iter().all(|r| (11..=20).contains(&r.0)));
        assert_eq!(page.first(), Some(&Row(20)));

        let empty = source
            .page_by_id_range(&criteria, IdRange::new(-10, 0).unwrap())
            .unwrap();
        assert!(empty.is_empty());
        assert_eq!(source.page_calls(), 2);
    }

    #[test]
    fn empty_table_has_no_max_id() {
        let source = InMemoryLogSource::<Row>::new();
        assert_eq!(source.max_matching_id(&any_criteria()).unwrap(), None);
    }

    #[test]
    fn delete_where_removes_rows() {
        let source = InMemoryLogSource::with_rows((1..=10).map(Row));
        assert_eq!(source.delete_where(|id| id % 2 == 0), 5);
        assert_eq!(source.count_matching(&any_criteria()).unwrap(), 5);
    }
}
