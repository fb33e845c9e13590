//! Pipeline controller: run lifecycle, cancellation, completion.
//!
//! One controller owns at most one active run. Starting a new run cancels
//! the previous one and waits for both of its halves (query worker thread and
//! drain task) to stop before the new run touches the sink.

use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread::JoinHandle as ThreadHandle;

use faultlog_kernel::{LogSource, QueryCriteria, RecordSink};
use tokio::sync::{oneshot, watch};
use tokio::task::JoinHandle as TaskHandle;
use tracing::{info, info_span, warn, Instrument};

use crate::config::PipelineConfig;
use crate::coordinator::QueryCoordinator;
use crate::drain::DrainLoop;
use crate::error::PipelineError;
use crate::relay::{Interruptible, RelayBuffer};
use crate::run::{RunId, RunOutcome, RunProgress, RunState};

/// Cancel handle for one run. Cheap to clone, usable from any thread.
#[derive(Clone)]
struct RunControl {
    state: Arc<RunState>,
    buffer: Arc<dyn Interruptible>,
}

impl RunControl {
    fn cancel(&self) {
        if self.state.request_cancel() {
            info!(run_id = %self.state.id(), "cancel requested");
        }
        self.buffer.interrupt();
    }
}

/// Supervised halves of the active run.
struct ActiveRun {
    control: RunControl,
    worker: ThreadHandle<()>,
    drain: TaskHandle<()>,
}

impl ActiveRun {
    /// Waits for the drain task, then joins the worker thread.
    async fn wait(self) -> Result<(), PipelineError> {
        let run_id = self.control.state.id();
        self.drain
            .await
            .map_err(|e| PipelineError::Join(format!("{run_id} drain task: {e}")))?;
        // The drain task only ends after the worker reported its exit, so
        // this join returns promptly.
        let worker = self.worker;
        tokio::task::spawn_blocking(move || worker.join())
            .await
            .map_err(|e| PipelineError::Join(format!("{run_id} worker join: {e}")))?
            .map_err(|_| PipelineError::Join(format!("{run_id} query worker panicked")))
    }
}

/// Observer for one run, returned by [PipelineController::start].
#[derive(Clone)]
pub struct RunHandle {
    control: RunControl,
    outcome: watch::Receiver<Option<RunOutcome>>,
}

impl RunHandle {
    pub fn run_id(&self) -> RunId {
        self.control.state.id()
    }

    pub fn progress(&self) -> RunProgress {
        self.control.state.progress()
    }

    pub fn is_finished(&self) -> bool {
        self.outcome.borrow().is_some()
    }

    /// Outcome if the run has already finished.
    pub fn outcome(&self) -> Option<RunOutcome> {
        self.outcome.borrow().clone()
    }

    /// Cancels this run. No-op once it has finished.
    pub fn cancel(&self) {
        self.control.cancel();
    }

    /// Resolves once the run has finished and its final drain is done.
    pub async fn finished(&self) -> RunOutcome {
        let mut rx = self.outcome.clone();
        let outcome = match rx.wait_for(Option::is_some).await {
            Ok(outcome) => outcome.clone(),
            Err(_) => None,
        };
        outcome.unwrap_or_else(lost_outcome)
    }
}

fn lost_outcome() -> RunOutcome {
    RunOutcome::Failed {
        forwarded: 0,
        error: "run ended without reporting an outcome".to_string(),
    }
}

/// Streams query results from a [LogSource] into a [RecordSink].
pub struct PipelineController<S: LogSource> {
    source: Arc<S>,
    sink: Arc<dyn RecordSink<S::Record>>,
    config: PipelineConfig,
    next_run: AtomicU64,
    /// Control of the run `cancel` should target; cleared when a run ends.
    current: Arc<Mutex<Option<RunControl>>>,
    /// Serializes `start`/`shutdown` and owns the supervised handles.
    active: tokio::sync::Mutex<Option<ActiveRun>>,
    /// `start` calls in flight.
    starting: AtomicUsize,
    /// Cancel that arrived while a `start` was in flight; applied to the run
    /// that `start` installs.
    cancel_pending: AtomicBool,
}

/// Tracks one in-flight `start`; a pending cancel does not outlive the last.
struct StartGuard<'a> {
    starting: &'a AtomicUsize,
    cancel_pending: &'a AtomicBool,
}

impl<'a> StartGuard<'a> {
    fn enter(starting: &'a AtomicUsize, cancel_pending: &'a AtomicBool) -> Self {
        starting.fetch_add(1, Ordering::SeqCst);
        Self {
            starting,
            cancel_pending,
        }
    }
}

impl Drop for StartGuard<'_> {
    fn drop(&mut self) {
        if self.starting.fetch_sub(1, Ordering::SeqCst) == 1 {
            self.cancel_pending.store(false, Ordering::SeqCst);
        }
    }
}

impl<S: LogSource> PipelineController<S> {
    pub fn new(
        source: Arc<S>,
        sink: Arc<dyn RecordSink<S::Record>>,
        config: PipelineConfig,
    ) -> Result<Self, PipelineError> {
        config.validate()?;
        Ok(Self {
            source,
            sink,
            config,
            next_run: AtomicU64::new(1),
            current: Arc::new(Mutex::new(None)),
            active: tokio::sync::Mutex::new(None),
            starting: AtomicUsize::new(0),
            cancel_pending: AtomicBool::new(false),
        })
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    /// Starts a run for `criteria`, superseding any run still in flight.
    ///
    /// Must be called from within a tokio runtime; the drain loop is spawned
    /// onto it. A [PipelineController::cancel] issued while this call is
    /// still waiting for the previous run cancels the new run too.
    pub async fn start(&self, criteria: QueryCriteria) -> Result<RunHandle, PipelineError> {
        criteria.validate()?;
        let _starting = StartGuard::enter(&self.starting, &self.cancel_pending);
        let mut active = self.active.lock().await;
        if let Some(previous) = active.take() {
            info!(run_id = %previous.control.state.id(), "superseding active run");
            previous.control.cancel();
            previous.wait().await?;
        }

        let run_id = RunId(self.next_run.fetch_add(1, Ordering::SeqCst));
        let state = Arc::new(RunState::new(run_id));
        let buffer = Arc::new(RelayBuffer::new(self.config.buffer_capacity));
        let control = RunControl {
            state: Arc::clone(&state),
            buffer: Arc::clone(&buffer) as Arc<dyn Interruptible>,
        };
        let span = info_span!("faultlog_run", run_id = %run_id);
        // Installed before spawning so the drain task's clear cannot race it.
        *lock(&self.current) = Some(control.clone());
        if self.cancel_pending.swap(false, Ordering::SeqCst) {
            control.cancel();
        }

        let (exit_tx, exit_rx) = oneshot::channel();
        let mut coordinator = QueryCoordinator::new(
            Arc::clone(&self.source),
            Arc::new(criteria),
            Arc::clone(&self.sink),
            Arc::clone(&buffer),
            Arc::clone(&state),
            self.config.clone(),
        );
        let worker_span = span.clone();
        let worker = std::thread::Builder::new()
            .name(format!("{}-{}", self.config.worker_thread_name, run_id.0))
            .spawn(move || {
                let _entered = worker_span.enter();
                let exit = coordinator.run();
                let _ = exit_tx.send(exit);
            })
            .map_err(|e| {
                lock(&self.current).take();
                PipelineError::Spawn(e.to_string())
            })?;

        let (outcome_tx, outcome_rx) = watch::channel(None);
        let drain = DrainLoop::new(buffer, Arc::clone(&state), Arc::clone(&self.sink), exit_rx);
        let sink = Arc::clone(&self.sink);
        let current = Arc::clone(&self.current);
        let period = self.config.drain_interval();
        let drain = tokio::spawn(
            async move {
                let outcome = drain.run(period).await;
                {
                    let mut current = lock(&current);
                    if current.as_ref().map(|c| c.state.id()) == Some(run_id) {
                        *current = None;
                    }
                }
                sink.on_pipeline_finished(outcome.is_success());
                match &outcome {
                    RunOutcome::Failed { error, .. } => {
                        warn!(forwarded = outcome.forwarded(), error = %error, "run failed")
                    }
                    _ => info!(
                        forwarded = outcome.forwarded(),
                        success = outcome.is_success(),
                        "run finished"
                    ),
                }
                let _ = outcome_tx.send(Some(outcome));
            }
            .instrument(span),
        );

        *active = Some(ActiveRun {
            control: control.clone(),
            worker,
            drain,
        });
        info!(%run_id, "run started");
        Ok(RunHandle {
            control,
            outcome: outcome_rx,
        })
    }

    /// Requests cancellation of the current run. Idempotent and non-blocking;
    /// a no-op when nothing is running or starting.
    pub fn cancel(&self) {
        // Flag first: a `start` that installs its run after this point still
        // sees the request.
        if self.starting.load(Ordering::SeqCst) > 0 {
            self.cancel_pending.store(true, Ordering::SeqCst);
        }
        if let Some(control) = lock(&self.current).as_ref() {
            control.cancel();
        }
    }

    /// Whether a run is still in flight.
    pub fn is_running(&self) -> bool {
        lock(&self.current).is_some()
    }

    /// Cancels the active run, if any, and waits for it to stop.
    pub async fn shutdown(&self) -> Result<(), PipelineError> {
        let mut active = self.active.lock().await;
        match active.take() {
            Some(run) => {
                run.control.cancel();
                run.wait().await
            }
            None => Ok(()),
        }
    }
}

impl<S: LogSource> Drop for PipelineController<S> {
    fn drop(&mut self) {
        self.cancel();
    }
}

fn lock(current: &Mutex<Option<RunControl>>) -> MutexGuard<'_, Option<RunControl>> {
    current.lock().unwrap_or_else(PoisonError::into_inner)
}
