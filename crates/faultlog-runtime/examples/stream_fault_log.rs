//! Streams a month of fault-log entries out of SQLite, newest first.
//!
//! Seeds a demo table when the database is empty, runs one query, and prints
//! each forwarded record as a JSON line.
//!
//! Run with:
//!   cargo run -p faultlog-runtime --example stream_fault_log --features sqlite-persistence
//!   FAULTLOG_SQLITE_DB=alarms.db RUST_LOG=faultlog_runtime=debug \
//!     cargo run -p faultlog-runtime --example stream_fault_log --features sqlite-persistence

use std::sync::Arc;

use chrono::{Duration, NaiveDate, TimeZone, Utc};
use faultlog_kernel::{
    AlarmCode, AlarmLevel, AlarmRecord, ChannelSink, LogSource, QueryCriteria, SinkEvent,
    TimeRange,
};
use faultlog_runtime::source::SqliteLogSource;
use faultlog_runtime::{PipelineConfig, PipelineController};
use tracing_subscriber::EnvFilter;

const DEMO_ROWS: i64 = 5_000;

fn demo_alarm(id: i64) -> AlarmRecord {
    let level = match id % 7 {
        0 => AlarmLevel::Stop,
        1 | 2 => AlarmLevel::StopSampling,
        _ => AlarmLevel::Caution,
    };
    AlarmRecord {
        id,
        code: AlarmCode::new(1 + (id % 4) as i32, 2, (id % 10) as i32),
        level,
        device_sn: format!("SN-{:03}", id % 3),
        sub_module: (id % 5 == 0).then(|| "sampler".to_string()),
        alarm_time: Utc.with_ymd_and_hms(2024, 6, 1, 0, 0, 0).unwrap()
            + Duration::minutes(id * 7),
        name: format!("alarm {id}"),
        detail: "sensor reading out of range".to_string(),
        customer_solution: "check the probe and restart sampling".to_string(),
        manager_solution: "replace the probe if the alarm repeats".to_string(),
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let db_path = std::env::var("FAULTLOG_SQLITE_DB").unwrap_or_else(|_| ":memory:".to_string());
    let config = match std::env::var("FAULTLOG_CONFIG") {
        Ok(path) => PipelineConfig::from_toml_str(&std::fs::read_to_string(path)?)?,
        Err(_) => PipelineConfig::default(),
    };

    let source = Arc::new(SqliteLogSource::new(&db_path)?);
    let june = QueryCriteria::new(TimeRange::from_dates(
        NaiveDate::from_ymd_opt(2024, 6, 1).ok_or("bad date")?,
        NaiveDate::from_ymd_opt(2024, 6, 30).ok_or("bad date")?,
    )?)
    .with_device_sn("SN-001");

    if source.count_matching(&june)? == 0 {
        let rows: Vec<_> = (1..=DEMO_ROWS).map(demo_alarm).collect();
        let inserted = source.insert_all(&rows)?;
        tracing::info!(inserted, db = %db_path, "seeded demo alarms");
    }

    let (sink, mut events) = ChannelSink::<AlarmRecord>::new();
    let pipeline = PipelineController::new(source, Arc::new(sink), config)?;
    let handle = pipeline.start(june).await?;

    let mut printed = 0u64;
    while let Some(event) = events.recv().await {
        match event {
            SinkEvent::Reserve(n) => tracing::info!(expected = n, "query counted"),
            SinkEvent::Records(batch) => {
                for record in batch {
                    println!("{}", serde_json::to_string(&record)?);
                    printed += 1;
                }
            }
            SinkEvent::Finished { success } => {
                tracing::info!(success, printed, "stream finished");
                break;
            }
        }
    }

    let outcome = handle.finished().await;
    pipeline.shutdown().await?;
    if let Some(error) = outcome.error_detail() {
        return Err(error.into());
    }
    Ok(())
}
