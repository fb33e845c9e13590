//! Postgres-backed fault-log source.
//!
//! This module is feature-gated behind `kernel-postgres`. Source calls are
//! synchronous, so each one blocks on a small dedicated runtime rather than
//! the caller's.

use std::sync::{Arc, OnceLock};

use faultlog_kernel::{AlarmRecord, IdRange, LogSource, QueryCriteria, SourceError};
use sqlx::postgres::{PgArguments, PgPoolOptions, PgRow};
use sqlx::query::Query;
use sqlx::{PgPool, Postgres, Row};

use super::{build_filter, FilterValue, RecordColumns, RECORD_COLUMNS};

fn is_valid_schema_ident(schema: &str) -> bool {
    !schema.is_empty()
        && schema
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_')
}

fn new_db_runtime() -> Result<Arc<tokio::runtime::Runtime>, String> {
    static DB_RT: OnceLock<Result<Arc<tokio::runtime::Runtime>, String>> = OnceLock::new();
    DB_RT
        .get_or_init(|| {
            tokio::runtime::Builder::new_multi_thread()
                .enable_all()
                .worker_threads(1)
                .thread_name("faultlog-pg")
                .build()
                .map(Arc::new)
                .map_err(|e| e.to_string())
        })
        .clone()
}

fn map_driver_err(prefix: &str, e: impl std::fmt::Display) -> SourceError {
    SourceError::Driver(format!("{prefix}: {e}"))
}

fn bind_all<'q>(
    mut query: Query<'q, Postgres, PgArguments>,
    values: Vec<FilterValue>,
) -> Query<'q, Postgres, PgArguments> {
    for value in values {
        query = match value {
            FilterValue::Int(i) => query.bind(i),
            FilterValue::Text(s) => query.bind(s),
        };
    }
    query
}

fn read_columns(row: &PgRow) -> Result<RecordColumns, sqlx::Error> {
    Ok(RecordColumns {
        id: row.try_get(0)?,
        main_code: row.try_get(1)?,
        middle_code: row.try_get(2)?,
        sub_code: row.try_get(3)?,
        level: row.try_get(4)?,
        device_sn: row.try_get(5)?,
        sub_module: row.try_get(6)?,
        alarm_time_ms: row.try_get(7)?,
        name: row.try_get(8)?,
        detail: row.try_get(9)?,
        customer_solution: row.try_get(10)?,
        manager_solution: row.try_get(11)?,
    })
}

/// [LogSource] over an `alarm_log` table in a Postgres schema.
#[derive(Clone)]
pub struct PostgresLogSource {
    pool: Option<PgPool>,
    schema: String,
    init_error: Option<String>,
    db_runtime: Option<Arc<tokio::runtime::Runtime>>,
    schema_ready: OnceLock<Result<(), String>>,
}

impl PostgresLogSource {
    /// Lazily connects to `database_url`; nothing is dialed until the first
    /// call.
    pub fn new(database_url: impl Into<String>) -> Self {
        let database_url = database_url.into();
        let db_runtime = new_db_runtime().ok();
        let pool = {
            // The pool spawns its maintenance tasks on whatever runtime is current.
            let _entered = db_runtime.as_ref().map(|rt| rt.enter());
            PgPoolOptions::new()
                .max_connections(2)
                .connect_lazy(&database_url)
                .ok()
        };
        let init_error = if pool.is_some() {
            None
        } else {
            Some("failed to initialize lazy postgres pool".to_string())
        };

        Self {
            pool,
            schema: "public".to_string(),
            init_error,
            db_runtime,
            schema_ready: OnceLock::new(),
        }
    }

    pub fn with_pool(pool: PgPool) -> Self {
        Self {
            pool: Some(pool),
            schema: "public".to_string(),
            init_error: None,
            db_runtime: new_db_runtime().ok(),
            schema_ready: OnceLock::new(),
        }
    }

    pub fn with_schema(mut self, schema: impl Into<String>) -> Self {
        self.schema = schema.into();
        self
    }

    fn runtime(&self) -> Result<&tokio::runtime::Runtime, SourceError> {
        if let Some(err) = &self.init_error {
            return Err(SourceError::Unavailable(err.clone()));
        }
        self.db_runtime
            .as_deref()
            .ok_or_else(|| SourceError::Unavailable("no db runtime".to_string()))
    }

    fn pool(&self) -> Result<&PgPool, SourceError> {
        self.pool
            .as_ref()
            .ok_or_else(|| SourceError::Unavailable("no postgres pool".to_string()))
    }

    fn ensure_schema(&self) -> Result<(), SourceError> {
        if !is_valid_schema_ident(&self.schema) {
            return Err(map_driver_err("invalid schema", &self.schema));
        }

        let result = self.schema_ready.get_or_init(|| {
            let schema = self.schema.clone();
            let sql_schema = format!("CREATE SCHEMA IF NOT EXISTS \"{schema}\"");
            let sql_table = format!(
                "CREATE TABLE IF NOT EXISTS \"{schema}\".alarm_log (
                    id BIGINT PRIMARY KEY,
                    main_code INTEGER NOT NULL,
                    middle_code INTEGER NOT NULL,
                    sub_code INTEGER NOT NULL,
                    level INTEGER NOT NULL,
                    device_sn TEXT NOT NULL,
                    sub_module TEXT NULL,
                    alarm_time_ms BIGINT NOT NULL,
                    name TEXT NOT NULL DEFAULT '',
                    detail TEXT NOT NULL DEFAULT '',
                    customer_solution TEXT NOT NULL DEFAULT '',
                    manager_solution TEXT NOT NULL DEFAULT ''
                )"
            );
            let sql_time_idx = format!(
                "CREATE INDEX IF NOT EXISTS idx_alarm_log_time
                 ON \"{schema}\".alarm_log(alarm_time_ms)"
            );

            let pool = match self.pool() {
                Ok(p) => p.clone(),
                Err(e) => return Err(e.to_string()),
            };
            let rt = match self.runtime() {
                Ok(r) => r,
                Err(e) => return Err(e.to_string()),
            };

            rt.block_on(async {
                sqlx::query(&sql_schema).execute(&pool).await?;
                sqlx::query(&sql_table).execute(&pool).await?;
                sqlx::query(&sql_time_idx).execute(&pool).await?;
                Ok::<(), sqlx::Error>(())
            })
            .map_err(|e| e.to_string())
        });

        result
            .clone()
            .map_err(|e| map_driver_err("schema bootstrap", e))
    }

    /// Inserts `record` under its own id, replacing any existing row.
    pub fn insert(&self, record: &AlarmRecord) -> Result<(), SourceError> {
        self.ensure_schema()?;

        let pool = self.pool()?.clone();
        let rt = self.runtime()?;
        let sql = format!(
            "INSERT INTO \"{}\".alarm_log (id, main_code, middle_code, sub_code, level,
                 device_sn, sub_module, alarm_time_ms, name, detail,
                 customer_solution, manager_solution)
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12)
             ON CONFLICT (id) DO UPDATE SET
                 main_code = EXCLUDED.main_code,
                 middle_code = EXCLUDED.middle_code,
                 sub_code = EXCLUDED.sub_code,
                 level = EXCLUDED.level,
                 device_sn = EXCLUDED.device_sn,
                 sub_module = EXCLUDED.sub_module,
                 alarm_time_ms = EXCLUDED.alarm_time_ms,
                 name = EXCLUDED.name,
                 detail = EXCLUDED.detail,
                 customer_solution = EXCLUDED.customer_solution,
                 manager_solution = EXCLUDED.manager_solution",
            self.schema
        );
        rt.block_on(async move {
            sqlx::query(&sql)
                .bind(record.id)
                .bind(record.code.main)
                .bind(record.code.middle)
                .bind(record.code.sub)
                .bind(record.level.as_i32())
                .bind(&record.device_sn)
                .bind(&record.sub_module)
                .bind(record.alarm_time.timestamp_millis())
                .bind(&record.name)
                .bind(&record.detail)
                .bind(&record.customer_solution)
                .bind(&record.manager_solution)
                .execute(&pool)
                .await
                .map_err(|e| map_driver_err("insert alarm", e))?;
            Ok(())
        })
    }
}

impl LogSource for PostgresLogSource {
    type Record = AlarmRecord;

    fn count_matching(&self, criteria: &QueryCriteria) -> Result<u64, SourceError> {
        self.ensure_schema()?;

        let pool = self.pool()?.clone();
        let rt = self.runtime()?;
        let (filter, values) = build_filter(criteria, |n| format!("${n}"));
        let sql = format!("SELECT COUNT(*) FROM \"{}\".alarm_log {filter}", self.schema);
        rt.block_on(async move {
            let row = bind_all(sqlx::query(&sql), values)
                .fetch_one(&pool)
                .await
                .map_err(|e| map_driver_err("count matching", e))?;
            let count: i64 = row.get(0);
            Ok(count.max(0) as u64)
        })
    }

    fn max_matching_id(&self, criteria: &QueryCriteria) -> Result<Option<i64>, SourceError> {
        self.ensure_schema()?;

        let pool = self.pool()?.clone();
        let rt = self.runtime()?;
        let (filter, values) = build_filter(criteria, |n| format!("${n}"));
        let sql = format!("SELECT MAX(id) FROM \"{}\".alarm_log {filter}", self.schema);
        rt.block_on(async move {
            let row = bind_all(sqlx::query(&sql), values)
                .fetch_one(&pool)
                .await
                .map_err(|e| map_driver_err("max matching id", e))?;
            Ok(row.get::<Option<i64>, _>(0))
        })
    }

    fn page_by_id_range(
        &self,
        criteria: &QueryCriteria,
        range: IdRange,
    ) -> Result<Vec<AlarmRecord>, SourceError> {
        self.ensure_schema()?;

        let pool = self.pool()?.clone();
        let rt = self.runtime()?;
        let (filter, values) = build_filter(criteria, |n| format!("${n}"));
        let next = values.len() + 1;
        let sql = format!(
            "SELECT {RECORD_COLUMNS} FROM \"{}\".alarm_log {filter}
               AND id >= ${next} AND id <= ${}
             ORDER BY id DESC",
            self.schema,
            next + 1
        );
        rt.block_on(async move {
            let rows = bind_all(sqlx::query(&sql), values)
                .bind(range.start_id)
                .bind(range.end_id)
                .fetch_all(&pool)
                .await
                .map_err(|e| map_driver_err("page by id range", e))?;
            rows.iter()
                .map(|row| {
                    read_columns(row)
                        .map_err(|e| map_driver_err("read alarm row", e))?
                        .into_record()
                })
                .collect()
        })
    }
}
