//! End-to-end runs of the pipeline against in-memory sources.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{NaiveDate, TimeZone, Utc};
use faultlog_kernel::{
    AlarmCode, AlarmLevel, AlarmRecord, CollectingSink, IdRange, InMemoryLogSource, LogSource,
    QueryCriteria, RecordSink, SourceError, TimeRange,
};
use faultlog_runtime::{PipelineConfig, PipelineController, PipelineError, RunOutcome};

fn alarm(id: i64) -> AlarmRecord {
    AlarmRecord {
        id,
        code: AlarmCode::new(2, 1, 4),
        level: AlarmLevel::Caution,
        device_sn: "sn-001".to_string(),
        sub_module: None,
        alarm_time: Utc.with_ymd_and_hms(2024, 1, 10, 0, 0, 0).unwrap()
            + chrono::Duration::seconds(id),
        name: format!("alarm {id}"),
        detail: String::new(),
        customer_solution: String::new(),
        manager_solution: String::new(),
    }
}

fn january() -> QueryCriteria {
    QueryCriteria::new(
        TimeRange::from_dates(
            NaiveDate::from_ymd_opt(2024, 1, 1).unwrap(),
            NaiveDate::from_ymd_opt(2024, 1, 31).unwrap(),
        )
        .unwrap(),
    )
}

/// Wraps an in-memory table with scripted snapshots, failures and latency.
#[derive(Default)]
struct ScriptedSource {
    table: InMemoryLogSource<AlarmRecord>,
    count_override: Option<u64>,
    max_override: Option<Option<i64>>,
    /// 1-based page call that fails.
    fail_page: Option<usize>,
    latency: Duration,
    remote_calls: AtomicUsize,
    page_calls: AtomicUsize,
}

impl ScriptedSource {
    fn with_ids(ids: impl IntoIterator<Item = i64>) -> Self {
        Self {
            table: InMemoryLogSource::with_rows(ids.into_iter().map(alarm)),
            ..Self::default()
        }
    }

    fn remote_call(&self) {
        self.remote_calls.fetch_add(1, Ordering::SeqCst);
        if !self.latency.is_zero() {
            std::thread::sleep(self.latency);
        }
    }
}

impl LogSource for ScriptedSource {
    type Record = AlarmRecord;

    fn count_matching(&self, criteria: &QueryCriteria) -> Result<u64, SourceError> {
        self.remote_call();
        match self.count_override {
            Some(count) => Ok(count),
            None => self.table.count_matching(criteria),
        }
    }

    fn max_matching_id(&self, criteria: &QueryCriteria) -> Result<Option<i64>, SourceError> {
        self.remote_call();
        match self.max_override {
            Some(max) => Ok(max),
            None => self.table.max_matching_id(criteria),
        }
    }

    fn page_by_id_range(
        &self,
        criteria: &QueryCriteria,
        range: IdRange,
    ) -> Result<Vec<AlarmRecord>, SourceError> {
        self.remote_call();
        let call = self.page_calls.fetch_add(1, Ordering::SeqCst) + 1;
        if self.fail_page == Some(call) {
            return Err(SourceError::Driver("connection reset".to_string()));
        }
        self.table.page_by_id_range(criteria, range)
    }
}

/// Records the size of every appended batch.
#[derive(Default)]
struct BatchSizeSink {
    sizes: Mutex<Vec<usize>>,
    finished: Mutex<Vec<bool>>,
}

impl RecordSink<AlarmRecord> for BatchSizeSink {
    fn append_records(&self, records: Vec<AlarmRecord>) {
        self.sizes.lock().unwrap().push(records.len());
    }

    fn on_pipeline_finished(&self, success: bool) {
        self.finished.lock().unwrap().push(success);
    }
}

fn controller(
    source: Arc<ScriptedSource>,
    sink: Arc<dyn RecordSink<AlarmRecord>>,
    config: PipelineConfig,
) -> PipelineController<ScriptedSource> {
    PipelineController::new(source, sink, config).expect("valid config")
}

async fn finish_within(handle: &faultlog_runtime::RunHandle, limit: Duration) -> RunOutcome {
    tokio::time::timeout(limit, handle.finished())
        .await
        .expect("run finished in time")
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn full_scan_pages_three_windows() {
    let source = Arc::new(ScriptedSource::with_ids(1..=2500));
    let sink = Arc::new(CollectingSink::<AlarmRecord>::new());
    let config = PipelineConfig::default()
        .with_window_width(1000)
        .with_buffer_capacity(1000);
    let pipeline = controller(Arc::clone(&source), sink.clone(), config);

    let handle = pipeline.start(january()).await.unwrap();
    let outcome = finish_within(&handle, Duration::from_secs(10)).await;

    assert_eq!(outcome, RunOutcome::Completed { forwarded: 2500 });
    assert_eq!(source.page_calls.load(Ordering::SeqCst), 3);
    assert_eq!(sink.finished(), vec![true]);
    assert_eq!(sink.reservations(), vec![2500]);

    let ids: Vec<_> = sink.records().iter().map(|r| r.id).collect();
    assert_eq!(ids.len(), 2500);
    assert!(ids.windows(2).all(|w| w[0] > w[1]), "newest first, no repeats");
    assert_eq!(handle.progress().produced, 2500);
    assert!(!pipeline.is_running());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn zero_count_finishes_after_one_empty_page() {
    let source = Arc::new(ScriptedSource {
        count_override: Some(0),
        max_override: Some(Some(42)),
        ..ScriptedSource::default()
    });
    let sink = Arc::new(CollectingSink::<AlarmRecord>::new());
    let pipeline = controller(Arc::clone(&source), sink.clone(), PipelineConfig::default());

    let handle = pipeline.start(january()).await.unwrap();
    let outcome = finish_within(&handle, Duration::from_secs(5)).await;

    assert_eq!(outcome, RunOutcome::Completed { forwarded: 0 });
    assert_eq!(source.page_calls.load(Ordering::SeqCst), 1);
    assert_eq!(sink.reservations(), vec![0]);
    assert_eq!(sink.batch_count(), 0);
    assert_eq!(sink.finished(), vec![true]);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn cancel_right_after_start_forwards_nothing() {
    let source = Arc::new(ScriptedSource {
        latency: Duration::from_millis(150),
        ..ScriptedSource::with_ids(1..=500)
    });
    let sink = Arc::new(CollectingSink::<AlarmRecord>::new());
    let pipeline = controller(Arc::clone(&source), sink.clone(), PipelineConfig::default());

    let handle = pipeline.start(january()).await.unwrap();
    pipeline.cancel();
    let outcome = finish_within(&handle, Duration::from_secs(5)).await;

    assert_eq!(outcome, RunOutcome::Cancelled { forwarded: 0 });
    assert_eq!(sink.finished(), vec![false]);
    assert_eq!(sink.batch_count(), 0);
    assert!(source.remote_calls.load(Ordering::SeqCst) <= 1);
    assert_eq!(source.page_calls.load(Ordering::SeqCst), 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn failing_second_window_keeps_first_page() {
    // First window [1000, 2000] holds 800 rows; the rest sit below it.
    let ids = (1201..=2000).chain(1..=199);
    let source = Arc::new(ScriptedSource {
        fail_page: Some(2),
        ..ScriptedSource::with_ids(ids)
    });
    let sink = Arc::new(CollectingSink::<AlarmRecord>::new());
    let pipeline = controller(Arc::clone(&source), sink.clone(), PipelineConfig::default());

    let handle = pipeline.start(january()).await.unwrap();
    let outcome = finish_within(&handle, Duration::from_secs(5)).await;

    assert!(!outcome.is_success());
    assert_eq!(outcome.forwarded(), 800);
    assert!(outcome
        .error_detail()
        .is_some_and(|e| e.contains("connection reset")));
    assert_eq!(sink.record_count(), 800);
    assert_eq!(sink.finished(), vec![false]);
    assert_eq!(source.page_calls.load(Ordering::SeqCst), 2);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn small_buffer_splits_an_oversized_page() {
    let source = Arc::new(ScriptedSource::with_ids(1..=300));
    let sink = Arc::new(BatchSizeSink::default());
    let config = PipelineConfig::default()
        .with_buffer_capacity(100)
        .with_drain_interval(Duration::from_millis(5));
    let pipeline = controller(Arc::clone(&source), sink.clone(), config);

    let handle = pipeline.start(january()).await.unwrap();
    let outcome = finish_within(&handle, Duration::from_secs(5)).await;

    assert_eq!(outcome, RunOutcome::Completed { forwarded: 300 });
    assert_eq!(source.page_calls.load(Ordering::SeqCst), 1);
    let sizes = sink.sizes.lock().unwrap().clone();
    assert!(sizes.len() >= 3, "at least three drains: {sizes:?}");
    assert!(sizes.iter().all(|&n| n <= 100), "buffer overfilled: {sizes:?}");
    assert_eq!(sizes.iter().sum::<usize>(), 300);
    assert_eq!(*sink.finished.lock().unwrap(), vec![true]);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn restart_supersedes_the_running_query() {
    let source = Arc::new(ScriptedSource {
        latency: Duration::from_millis(40),
        ..ScriptedSource::with_ids(1..=50)
    });
    let sink = Arc::new(CollectingSink::<AlarmRecord>::new());
    let pipeline = controller(Arc::clone(&source), sink.clone(), PipelineConfig::default());

    let first = pipeline.start(january()).await.unwrap();
    let second = pipeline.start(january()).await.unwrap();

    assert!(first.is_finished());
    assert!(!first.outcome().unwrap().is_success());
    let outcome = finish_within(&second, Duration::from_secs(5)).await;
    assert_eq!(outcome, RunOutcome::Completed { forwarded: 50 });
    assert_ne!(first.run_id(), second.run_id());
    assert_eq!(sink.finished(), vec![false, true]);
    assert_eq!(sink.record_count(), 50);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn cancel_mid_scan_stops_within_one_call() {
    let source = Arc::new(ScriptedSource {
        latency: Duration::from_millis(20),
        ..ScriptedSource::with_ids(1..=20_000)
    });
    let sink = Arc::new(CollectingSink::<AlarmRecord>::new());
    let config = PipelineConfig::default().with_window_width(100);
    let pipeline = controller(Arc::clone(&source), sink.clone(), config);

    let handle = pipeline.start(january()).await.unwrap();
    tokio::time::sleep(Duration::from_millis(120)).await;
    handle.cancel();
    let calls_at_cancel = source.remote_calls.load(Ordering::SeqCst);
    let outcome = finish_within(&handle, Duration::from_secs(2)).await;

    assert!(matches!(outcome, RunOutcome::Cancelled { .. }));
    assert!(source.remote_calls.load(Ordering::SeqCst) <= calls_at_cancel + 1);
    assert!(sink.record_count() < 20_000);
    assert_eq!(sink.finished(), vec![false]);

    // A second cancel and a shutdown after the fact are no-ops.
    handle.cancel();
    pipeline.shutdown().await.unwrap();
    assert_eq!(sink.finished(), vec![false]);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn cancel_during_restart_reaches_the_new_run() {
    let source = Arc::new(ScriptedSource {
        latency: Duration::from_millis(100),
        ..ScriptedSource::with_ids(1..=50)
    });
    let sink = Arc::new(CollectingSink::<AlarmRecord>::new());
    let pipeline = Arc::new(controller(
        Arc::clone(&source),
        sink.clone(),
        PipelineConfig::default(),
    ));

    let first = pipeline.start(january()).await.unwrap();
    let restart = tokio::spawn({
        let pipeline = Arc::clone(&pipeline);
        async move { pipeline.start(january()).await }
    });
    // The restart is still waiting on the first run's in-flight call.
    tokio::time::sleep(Duration::from_millis(20)).await;
    pipeline.cancel();

    let second = restart.await.unwrap().unwrap();
    let outcome = finish_within(&second, Duration::from_secs(5)).await;

    assert!(!first.outcome().unwrap().is_success());
    assert_eq!(outcome, RunOutcome::Cancelled { forwarded: 0 });
    assert_eq!(sink.record_count(), 0);
    assert_eq!(sink.finished(), vec![false, false]);

    // The request does not linger past the restart it was aimed at.
    let third = pipeline.start(january()).await.unwrap();
    let outcome = finish_within(&third, Duration::from_secs(5)).await;
    assert_eq!(outcome, RunOutcome::Completed { forwarded: 50 });
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn rows_below_the_floor_are_reached_while_windows_return_rows() {
    // With W=1000 the first window is [-990, 10]; -1500 sits in the next one.
    let source = Arc::new(ScriptedSource::with_ids([10, -1500]));
    let sink = Arc::new(CollectingSink::<AlarmRecord>::new());
    let pipeline = controller(Arc::clone(&source), sink.clone(), PipelineConfig::default());

    let handle = pipeline.start(january()).await.unwrap();
    let outcome = finish_within(&handle, Duration::from_secs(5)).await;

    assert_eq!(outcome, RunOutcome::Completed { forwarded: 2 });
    assert_eq!(source.page_calls.load(Ordering::SeqCst), 2);
    let ids: Vec<_> = sink.records().iter().map(|r| r.id).collect();
    assert_eq!(ids, vec![10, -1500]);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn empty_window_at_the_floor_ends_the_run_unless_the_floor_is_lowered() {
    let ids = [10, -5000];

    // Default floor: the empty window [-1991, -991] ends the scan.
    let source = Arc::new(ScriptedSource::with_ids(ids));
    let sink = Arc::new(CollectingSink::<AlarmRecord>::new());
    let pipeline = controller(Arc::clone(&source), sink.clone(), PipelineConfig::default());
    let handle = pipeline.start(january()).await.unwrap();
    let outcome = finish_within(&handle, Duration::from_secs(5)).await;
    assert_eq!(outcome, RunOutcome::Completed { forwarded: 1 });
    assert_eq!(source.page_calls.load(Ordering::SeqCst), 2);
    let progress = handle.progress();
    assert_eq!((progress.expected, progress.produced), (2, 1));

    // Lowered floor: empty windows above it are paged through.
    let source = Arc::new(ScriptedSource::with_ids(ids));
    let sink = Arc::new(CollectingSink::<AlarmRecord>::new());
    let config = PipelineConfig::default().with_id_floor(-6000);
    let pipeline = controller(Arc::clone(&source), sink.clone(), config);
    let handle = pipeline.start(january()).await.unwrap();
    let outcome = finish_within(&handle, Duration::from_secs(5)).await;
    assert_eq!(outcome, RunOutcome::Completed { forwarded: 2 });
    assert_eq!(source.page_calls.load(Ordering::SeqCst), 6);
    assert_eq!(sink.finished(), vec![true]);
}

#[tokio::test]
async fn rejects_invalid_config_and_criteria() {
    let source = Arc::new(ScriptedSource::default());
    let sink: Arc<dyn RecordSink<AlarmRecord>> = Arc::new(CollectingSink::<AlarmRecord>::new());

    let bad = PipelineConfig::default().with_buffer_capacity(0);
    assert!(matches!(
        PipelineController::new(Arc::clone(&source), Arc::clone(&sink), bad),
        Err(PipelineError::Config(_))
    ));

    let pipeline = controller(source, sink, PipelineConfig::default());
    let year = QueryCriteria::new(TimeRange {
        start: Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap(),
        end: Utc.with_ymd_and_hms(2024, 12, 31, 0, 0, 0).unwrap(),
    });
    assert!(matches!(
        pipeline.start(year).await,
        Err(PipelineError::Criteria(_))
    ));
    assert!(!pipeline.is_running());
}
