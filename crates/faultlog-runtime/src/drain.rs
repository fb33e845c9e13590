//! Drain loop: the consumer side of a run.
//!
//! Polls the relay buffer on a fixed period and forwards whatever it finds to
//! the sink. The stop condition is explicit: either the run was cancelled, or
//! the producer has reported its exit and one more drain came back empty.

use std::sync::Arc;
use std::time::Duration;

use faultlog_kernel::RecordSink;
use tokio::sync::oneshot::{self, error::TryRecvError};
use tokio::time::MissedTickBehavior;
use tracing::{debug, info};

use crate::coordinator::ProducerExit;
use crate::relay::RelayBuffer;
use crate::run::{RunOutcome, RunState};

#[derive(Debug)]
enum DrainPhase {
    /// Producer still running.
    Draining,
    /// Producer exited; waiting for a drain that returns nothing.
    Finishing(ProducerExit),
    /// Final drain done.
    Idle(RunOutcome),
}

/// What a single [DrainLoop::tick] decided.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum DrainStep {
    /// Keep ticking.
    Continue,
    /// Cancel observed; buffered records were discarded.
    Cancelled,
    /// Producer finished and the buffer is empty.
    Idle(RunOutcome),
}

pub struct DrainLoop<R> {
    buffer: Arc<RelayBuffer<R>>,
    run: Arc<RunState>,
    sink: Arc<dyn RecordSink<R>>,
    producer_exit: oneshot::Receiver<ProducerExit>,
    phase: DrainPhase,
    forwarded: u64,
}

impl<R: Send + 'static> DrainLoop<R> {
    pub fn new(
        buffer: Arc<RelayBuffer<R>>,
        run: Arc<RunState>,
        sink: Arc<dyn RecordSink<R>>,
        producer_exit: oneshot::Receiver<ProducerExit>,
    ) -> Self {
        Self {
            buffer,
            run,
            sink,
            producer_exit,
            phase: DrainPhase::Draining,
            forwarded: 0,
        }
    }

    /// Records handed to the sink so far.
    pub fn forwarded(&self) -> u64 {
        self.forwarded
    }

    /// One poll of the buffer. Never blocks.
    pub fn tick(&mut self) -> DrainStep {
        if self.run.is_cancelled() {
            let dropped = self.buffer.discard();
            if dropped > 0 {
                debug!(run_id = %self.run.id(), dropped, "discarded records of cancelled run");
            }
            return DrainStep::Cancelled;
        }

        if let DrainPhase::Idle(outcome) = &self.phase {
            return DrainStep::Idle(outcome.clone());
        }

        // Observe the exit before draining so the drain below is the one
        // that follows "query finished".
        if matches!(self.phase, DrainPhase::Draining) {
            match self.producer_exit.try_recv() {
                Ok(exit) => self.phase = DrainPhase::Finishing(exit),
                Err(TryRecvError::Empty) => {}
                Err(TryRecvError::Closed) => {
                    self.phase = DrainPhase::Finishing(ProducerExit::Failed(
                        "query worker exited without reporting".to_string(),
                    ))
                }
            }
        }

        let batch = self.buffer.drain_all();
        let drained = batch.len();
        if drained > 0 {
            self.forwarded += drained as u64;
            self.sink.append_records(batch);
        }

        match &self.phase {
            DrainPhase::Finishing(exit) if drained == 0 => {
                let outcome = self.outcome_for(exit);
                self.phase = DrainPhase::Idle(outcome.clone());
                DrainStep::Idle(outcome)
            }
            _ => DrainStep::Continue,
        }
    }

    /// Ticks every `period` until the run is idle or cancelled.
    ///
    /// On cancellation this still waits for the producer to report its exit
    /// so the run's resources are released together.
    pub async fn run(mut self, period: Duration) -> RunOutcome {
        let mut interval = tokio::time::interval(period);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            interval.tick().await;
            match self.tick() {
                DrainStep::Continue => {}
                DrainStep::Idle(outcome) => return outcome,
                DrainStep::Cancelled => break,
            }
        }

        info!(run_id = %self.run.id(), "drain loop observed cancel, waiting for query worker");
        if matches!(self.phase, DrainPhase::Draining) {
            // Either an exit report or a dropped sender means the worker is done.
            let _ = (&mut self.producer_exit).await;
        }
        self.buffer.discard();
        RunOutcome::Cancelled {
            forwarded: self.forwarded,
        }
    }

    fn outcome_for(&self, exit: &ProducerExit) -> RunOutcome {
        let forwarded = self.forwarded;
        match exit {
            ProducerExit::Exhausted => RunOutcome::Completed { forwarded },
            ProducerExit::Cancelled => RunOutcome::Cancelled { forwarded },
            ProducerExit::Failed(error) => RunOutcome::Failed {
                forwarded,
                error: error.clone(),
            },
        }
    }
}
