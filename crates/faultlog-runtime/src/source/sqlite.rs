//! SQLite-backed fault-log source.
//!
//! This module is feature-gated behind `sqlite-persistence`.

use std::path::Path;
use std::sync::{Mutex, MutexGuard, PoisonError};

use faultlog_kernel::{AlarmRecord, IdRange, LogSource, QueryCriteria, SourceError};
use rusqlite::types::Value as SqlValue;
use rusqlite::{params, params_from_iter, Connection, Row};

use super::{build_filter, FilterValue, RecordColumns, RECORD_COLUMNS};

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS alarm_log (
    id INTEGER PRIMARY KEY,
    main_code INTEGER NOT NULL,
    middle_code INTEGER NOT NULL,
    sub_code INTEGER NOT NULL,
    level INTEGER NOT NULL,
    device_sn TEXT NOT NULL,
    sub_module TEXT NULL,
    alarm_time_ms INTEGER NOT NULL,
    name TEXT NOT NULL DEFAULT '',
    detail TEXT NOT NULL DEFAULT '',
    customer_solution TEXT NOT NULL DEFAULT '',
    manager_solution TEXT NOT NULL DEFAULT ''
);
CREATE INDEX IF NOT EXISTS idx_alarm_log_time ON alarm_log(alarm_time_ms);
CREATE INDEX IF NOT EXISTS idx_alarm_log_device ON alarm_log(device_sn, alarm_time_ms);
";

const INSERT_SQL: &str = "INSERT OR REPLACE INTO alarm_log (id, main_code, middle_code, sub_code,
    level, device_sn, sub_module, alarm_time_ms, name, detail, customer_solution, manager_solution)
    VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)";

fn map_driver_err(prefix: &str, e: impl std::fmt::Display) -> SourceError {
    SourceError::Driver(format!("{prefix}: {e}"))
}

fn to_sql_values(values: Vec<FilterValue>) -> Vec<SqlValue> {
    values
        .into_iter()
        .map(|v| match v {
            FilterValue::Int(i) => SqlValue::Integer(i),
            FilterValue::Text(s) => SqlValue::Text(s),
        })
        .collect()
}

fn read_columns(row: &Row<'_>) -> rusqlite::Result<RecordColumns> {
    Ok(RecordColumns {
        id: row.get(0)?,
        main_code: row.get(1)?,
        middle_code: row.get(2)?,
        sub_code: row.get(3)?,
        level: row.get(4)?,
        device_sn: row.get(5)?,
        sub_module: row.get(6)?,
        alarm_time_ms: row.get(7)?,
        name: row.get(8)?,
        detail: row.get(9)?,
        customer_solution: row.get(10)?,
        manager_solution: row.get(11)?,
    })
}

/// [LogSource] over an `alarm_log` table in a SQLite database.
///
/// The connection is guarded by a mutex; the pipeline issues one call at a
/// time so there is no contention in practice.
pub struct SqliteLogSource {
    conn: Mutex<Connection>,
}

impl SqliteLogSource {
    /// Opens (or creates) the database at `path` and bootstraps the schema.
    /// Use `":memory:"` for a private in-memory database.
    pub fn new(path: impl AsRef<Path>) -> Result<Self, SourceError> {
        let conn = Connection::open(path).map_err(|e| map_driver_err("open sqlite", e))?;
        Self::with_connection(conn)
    }

    pub fn with_connection(conn: Connection) -> Result<Self, SourceError> {
        conn.execute_batch(SCHEMA)
            .map_err(|e| map_driver_err("schema bootstrap", e))?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn conn(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Inserts `record` under its own id, replacing any existing row.
    pub fn insert(&self, record: &AlarmRecord) -> Result<(), SourceError> {
        self.insert_all(std::iter::once(record)).map(|_| ())
    }

    /// Inserts all `records` in one transaction.
    pub fn insert_all<'a>(
        &self,
        records: impl IntoIterator<Item = &'a AlarmRecord>,
    ) -> Result<usize, SourceError> {
        let mut conn = self.conn();
        let tx = conn
            .transaction()
            .map_err(|e| map_driver_err("begin insert", e))?;
        let mut inserted = 0;
        {
            let mut stmt = tx
                .prepare(INSERT_SQL)
                .map_err(|e| map_driver_err("prepare insert", e))?;
            for record in records {
                stmt.execute(params![
                    record.id,
                    record.code.main,
                    record.code.middle,
                    record.code.sub,
                    record.level.as_i32(),
                    record.device_sn,
                    record.sub_module,
                    record.alarm_time.timestamp_millis(),
                    record.name,
                    record.detail,
                    record.customer_solution,
                    record.manager_solution,
                ])
                .map_err(|e| map_driver_err("insert alarm", e))?;
                inserted += 1;
            }
        }
        tx.commit().map_err(|e| map_driver_err("commit insert", e))?;
        Ok(inserted)
    }
}

impl LogSource for SqliteLogSource {
    type Record = AlarmRecord;

    fn count_matching(&self, criteria: &QueryCriteria) -> Result<u64, SourceError> {
        let (filter, values) = build_filter(criteria, |n| format!("?{n}"));
        let sql = format!("SELECT COUNT(*) FROM alarm_log {filter}");
        let count: i64 = self
            .conn()
            .query_row(&sql, params_from_iter(to_sql_values(values)), |row| {
                row.get(0)
            })
            .map_err(|e| map_driver_err("count matching", e))?;
        Ok(count.max(0) as u64)
    }

    fn max_matching_id(&self, criteria: &QueryCriteria) -> Result<Option<i64>, SourceError> {
        let (filter, values) = build_filter(criteria, |n| format!("?{n}"));
        let sql = format!("SELECT MAX(id) FROM alarm_log {filter}");
        self.conn()
            .query_row(&sql, params_from_iter(to_sql_values(values)), |row| {
                row.get::<_, Option<i64>>(0)
            })
            .map_err(|e| map_driver_err("max matching id", e))
    }

    fn page_by_id_range(
        &self,
        criteria: &QueryCriteria,
        range: IdRange,
    ) -> Result<Vec<AlarmRecord>, SourceError> {
        let (filter, values) = build_filter(criteria, |n| format!("?{n}"));
        let next = values.len() + 1;
        let sql = format!(
            "SELECT {RECORD_COLUMNS} FROM alarm_log {filter}
               AND id >= ?{next} AND id <= ?{}
             ORDER BY id DESC",
            next + 1
        );
        let mut values = to_sql_values(values);
        values.push(SqlValue::Integer(range.start_id));
        values.push(SqlValue::Integer(range.end_id));

        let conn = self.conn();
        let mut stmt = conn
            .prepare(&sql)
            .map_err(|e| map_driver_err("prepare page", e))?;
        let rows = stmt
            .query_map(params_from_iter(values), read_columns)
            .map_err(|e| map_driver_err("page by id range", e))?;
        let mut page = Vec::new();
        for row in rows {
            let columns = row.map_err(|e| map_driver_err("read alarm row", e))?;
            page.push(columns.into_record()?);
        }
        Ok(page)
    }
}
