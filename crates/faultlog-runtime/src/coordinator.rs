//! Query coordinator: the producer side of a run.
//!
//! Runs on a dedicated worker thread. It snapshots the max id and the
//! matching count, then walks id windows newest to oldest, pushing each page
//! into the relay buffer until the cursor is done, a call fails, or the run
//! is cancelled.

use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;

use faultlog_kernel::{IdRange, LogRecord, LogSource, QueryCriteria, RecordSink, SourceError};
use tracing::{debug, error, info, warn};

use crate::config::PipelineConfig;
use crate::cursor::{CursorStep, DoneReason, IdRangeCursor};
use crate::relay::{PushOutcome, RelayBuffer};
use crate::run::RunState;

/// Producer state machine.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ProducerState {
    Idle,
    Querying,
    Paging,
    Finished,
    Cancelled,
    Failed,
}

impl ProducerState {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            ProducerState::Finished | ProducerState::Cancelled | ProducerState::Failed
        )
    }
}

impl fmt::Display for ProducerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ProducerState::Idle => "idle",
            ProducerState::Querying => "querying",
            ProducerState::Paging => "paging",
            ProducerState::Finished => "finished",
            ProducerState::Cancelled => "cancelled",
            ProducerState::Failed => "failed",
        };
        f.write_str(name)
    }
}

/// Terminal report sent to the drain loop, exactly once per run.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ProducerExit {
    Exhausted,
    Cancelled,
    Failed(String),
}

/// Reason the paging loop stopped early.
enum Halt {
    Cancelled,
    Failed(SourceError),
}

pub(crate) struct QueryCoordinator<S: LogSource> {
    source: Arc<S>,
    criteria: Arc<QueryCriteria>,
    sink: Arc<dyn RecordSink<S::Record>>,
    buffer: Arc<RelayBuffer<S::Record>>,
    run: Arc<RunState>,
    config: PipelineConfig,
    state: ProducerState,
    seen: Option<HashSet<i64>>,
}

impl<S: LogSource> QueryCoordinator<S> {
    pub(crate) fn new(
        source: Arc<S>,
        criteria: Arc<QueryCriteria>,
        sink: Arc<dyn RecordSink<S::Record>>,
        buffer: Arc<RelayBuffer<S::Record>>,
        run: Arc<RunState>,
        config: PipelineConfig,
    ) -> Self {
        let seen = config.dedupe_by_id.then(HashSet::new);
        Self {
            source,
            criteria,
            sink,
            buffer,
            run,
            config,
            state: ProducerState::Idle,
            seen,
        }
    }

    /// Drives the run to a terminal state.
    pub(crate) fn run(&mut self) -> ProducerExit {
        let exit = match self.produce() {
            Ok(()) => {
                self.transition(ProducerState::Finished);
                ProducerExit::Exhausted
            }
            Err(Halt::Cancelled) => {
                self.transition(ProducerState::Cancelled);
                ProducerExit::Cancelled
            }
            Err(Halt::Failed(e)) => {
                error!(run_id = %self.run.id(), error = %e, "fault log query failed");
                self.transition(ProducerState::Failed);
                ProducerExit::Failed(e.to_string())
            }
        };
        let progress = self.run.progress();
        info!(
            run_id = %self.run.id(),
            expected = progress.expected,
            produced = progress.produced,
            state = %self.state,
            "query worker exiting"
        );
        exit
    }

    fn produce(&mut self) -> Result<(), Halt> {
        self.transition(ProducerState::Querying);
        self.check_cancel()?;
        let max_id = self.with_retry("max matching id", |s, c| s.max_matching_id(c))?;
        self.check_cancel()?;
        let expected = self.with_retry("count matching", |s, c| s.count_matching(c))?;
        self.check_cancel()?;

        self.run.set_expected(expected);
        self.sink.reserve_capacity(expected);

        let Some(max_id) = max_id else {
            info!(run_id = %self.run.id(), "no matching rows");
            return Ok(());
        };

        let mut cursor = IdRangeCursor::anchored(
            max_id,
            expected,
            self.config.window_width,
            self.config.id_floor,
        );
        info!(run_id = %self.run.id(), max_id, expected, "cursor anchored");
        self.transition(ProducerState::Paging);

        let mut range = cursor.current();
        loop {
            self.check_cancel()?;
            let page = self.fetch_page(range)?;
            self.check_cancel()?;

            let page = self.admit(page, cursor.remaining());
            let rows = page.len() as u64;
            debug!(
                run_id = %self.run.id(),
                start_id = range.start_id,
                end_id = range.end_id,
                rows,
                "page fetched"
            );
            if rows > 0 {
                if let PushOutcome::Interrupted { delivered } = self.buffer.push(page) {
                    debug!(run_id = %self.run.id(), delivered, "push interrupted");
                    self.run.add_produced(delivered as u64);
                    return Err(Halt::Cancelled);
                }
                self.run.add_produced(rows);
            }
            self.check_cancel()?;

            match cursor.advance(rows) {
                CursorStep::Next(next) => range = next,
                CursorStep::Done(DoneReason::ExhaustedIds) if cursor.remaining() > 0 => {
                    warn!(
                        run_id = %self.run.id(),
                        expected = cursor.expected(),
                        produced = cursor.produced(),
                        id_floor = self.config.id_floor,
                        "id space exhausted before the counted rows were produced"
                    );
                    return Ok(());
                }
                CursorStep::Done(reason) => {
                    debug!(run_id = %self.run.id(), ?reason, "cursor done");
                    return Ok(());
                }
            }
        }
    }

    fn fetch_page(&self, range: IdRange) -> Result<Vec<S::Record>, Halt> {
        self.with_retry("page by id range", |s, c| s.page_by_id_range(c, range))
    }

    /// Drops duplicate ids (when enabled) and trims the page so the run
    /// never produces more rows than were counted at start.
    fn admit(&mut self, mut page: Vec<S::Record>, budget: u64) -> Vec<S::Record> {
        if let Some(seen) = self.seen.as_mut() {
            let before = page.len();
            page.retain(|r| seen.insert(r.record_id()));
            if page.len() < before {
                warn!(
                    run_id = %self.run.id(),
                    dropped = before - page.len(),
                    "duplicate ids dropped"
                );
            }
        }
        let budget = usize::try_from(budget).unwrap_or(usize::MAX);
        if page.len() > budget {
            warn!(
                run_id = %self.run.id(),
                extra = page.len() - budget,
                "page exceeds count snapshot, trimming"
            );
            page.truncate(budget);
        }
        page
    }

    fn with_retry<T>(
        &self,
        what: &str,
        mut call: impl FnMut(&S, &QueryCriteria) -> Result<T, SourceError>,
    ) -> Result<T, Halt> {
        let mut attempt = 0u32;
        loop {
            match call(&*self.source, &*self.criteria) {
                Ok(value) => return Ok(value),
                Err(e) if attempt < self.config.retry.max_retries => {
                    attempt += 1;
                    warn!(
                        run_id = %self.run.id(),
                        call = what,
                        attempt,
                        error = %e,
                        "remote call failed, retrying"
                    );
                    if self.run.wait_cancelled(self.config.retry.backoff()) {
                        return Err(Halt::Cancelled);
                    }
                }
                Err(e) => return Err(Halt::Failed(e)),
            }
        }
    }

    fn check_cancel(&self) -> Result<(), Halt> {
        if self.run.is_cancelled() {
            Err(Halt::Cancelled)
        } else {
            Ok(())
        }
    }

    fn transition(&mut self, next: ProducerState) {
        info!(run_id = %self.run.id(), from = %self.state, to = %next, "producer transition");
        self.state = next;
    }
}
