//! SQL-backed [faultlog_kernel::LogSource] implementations.
//!
//! Both backends store one row per alarm in an `alarm_log` table keyed by an
//! increasing integer id, and translate [QueryCriteria] into the same
//! `WHERE` clause.

#[cfg(feature = "kernel-postgres")]
pub mod postgres;
#[cfg(feature = "sqlite-persistence")]
pub mod sqlite;

#[cfg(feature = "kernel-postgres")]
pub use postgres::PostgresLogSource;
#[cfg(feature = "sqlite-persistence")]
pub use sqlite::SqliteLogSource;

#[cfg(any(feature = "sqlite-persistence", feature = "kernel-postgres"))]
pub(crate) use filter::{build_filter, FilterValue, RecordColumns, RECORD_COLUMNS};

#[cfg(any(feature = "sqlite-persistence", feature = "kernel-postgres"))]
mod filter {
    use chrono::{DateTime, TimeZone, Utc};
    use faultlog_kernel::{AlarmCode, AlarmLevel, AlarmRecord, QueryCriteria, SourceError};

    /// Column list shared by every select, in [RecordColumns] order.
    pub(crate) const RECORD_COLUMNS: &str = "id, main_code, middle_code, sub_code, level, \
        device_sn, sub_module, alarm_time_ms, name, detail, customer_solution, manager_solution";

    /// Bind value for a filter placeholder.
    #[derive(Clone, Debug, PartialEq)]
    pub(crate) enum FilterValue {
        Int(i64),
        Text(String),
    }

    /// Builds `WHERE ...` for `criteria` using `placeholder(n)` (1-based)
    /// to render bind markers. Returns the clause and its values in order.
    pub(crate) fn build_filter(
        criteria: &QueryCriteria,
        placeholder: impl Fn(usize) -> String,
    ) -> (String, Vec<FilterValue>) {
        let mut clauses = Vec::new();
        let mut values = Vec::new();
        let mut push = |column: &str, op: &str, value: FilterValue| {
            values.push(value);
            clauses.push(format!("{column} {op} {}", placeholder(values.len())));
        };

        push(
            "alarm_time_ms",
            ">=",
            FilterValue::Int(criteria.time_range.start.timestamp_millis()),
        );
        push(
            "alarm_time_ms",
            "<=",
            FilterValue::Int(criteria.time_range.end.timestamp_millis()),
        );
        if let Some(code) = criteria.code {
            push("main_code", "=", FilterValue::Int(code.main.into()));
            push("middle_code", "=", FilterValue::Int(code.middle.into()));
            push("sub_code", "=", FilterValue::Int(code.sub.into()));
        }
        if let Some(level) = criteria.level {
            push("level", "=", FilterValue::Int(level.as_i32().into()));
        }
        if let Some(device_sn) = &criteria.device_sn {
            push("device_sn", "=", FilterValue::Text(device_sn.clone()));
        }
        (format!("WHERE {}", clauses.join(" AND ")), values)
    }

    /// Raw column values of one `alarm_log` row.
    pub(crate) struct RecordColumns {
        pub id: i64,
        pub main_code: i32,
        pub middle_code: i32,
        pub sub_code: i32,
        pub level: i32,
        pub device_sn: String,
        pub sub_module: Option<String>,
        pub alarm_time_ms: i64,
        pub name: String,
        pub detail: String,
        pub customer_solution: String,
        pub manager_solution: String,
    }

    impl RecordColumns {
        pub(crate) fn into_record(self) -> Result<AlarmRecord, SourceError> {
            let level = AlarmLevel::try_from(self.level)
                .map_err(|e| SourceError::Driver(format!("row {}: {e}", self.id)))?;
            Ok(AlarmRecord {
                id: self.id,
                code: AlarmCode::new(self.main_code, self.middle_code, self.sub_code),
                level,
                device_sn: self.device_sn,
                sub_module: self.sub_module,
                alarm_time: ms_to_dt(self.alarm_time_ms),
                name: self.name,
                detail: self.detail,
                customer_solution: self.customer_solution,
                manager_solution: self.manager_solution,
            })
        }
    }

    pub(crate) fn ms_to_dt(ms: i64) -> DateTime<Utc> {
        Utc.timestamp_millis_opt(ms)
            .single()
            .unwrap_or(DateTime::<Utc>::MIN_UTC)
    }

}
