use core::time::Duration;
use std::path::Path;

use parking_lot::Mutex;
use rusqlite::{
    Connection, ErrorCode, TransactionBehavior, params_from_iter, types::Value as SqlValue,
};

#[cfg(feature = "tracing")]
use tracing::instrument;

use crate::{
    error::ExecError,
    store::{Row, SqlExecutor, Value},
};

/// Default bound on how long a statement waits for a competing writer.
pub const DEFAULT_BUSY_TIMEOUT: Duration = Duration::from_secs(5);

/// A [`SqlExecutor`] over a single SQLite connection.
///
/// Statements from different threads are serialized on the connection.
/// Separate executors opened on the same file behave like separate processes:
/// they coordinate only through the database, with SQLite's busy timeout
/// bounding how long a statement waits for a competing writer. Expiry
/// surfaces as [`ExecError::Timeout`].
pub struct SqliteExecutor {
    conn: Mutex<Connection>,
    busy_timeout: Duration,
}

impl SqliteExecutor {
    /// Opens (or creates) the database at `path`.
    ///
    /// # Errors
    ///
    /// Returns [`ExecError::Unavailable`] if the file cannot be opened.
    pub fn open(path: impl AsRef<Path>, busy_timeout: Duration) -> Result<Self, ExecError> {
        let conn = Connection::open(path).map_err(unavailable)?;
        Self::from_connection(conn, busy_timeout)
    }

    /// Opens a private in-memory database.
    ///
    /// # Errors
    ///
    /// Returns [`ExecError::Unavailable`] if SQLite cannot allocate it.
    pub fn open_in_memory() -> Result<Self, ExecError> {
        let conn = Connection::open_in_memory().map_err(unavailable)?;
        Self::from_connection(conn, DEFAULT_BUSY_TIMEOUT)
    }

    fn from_connection(conn: Connection, busy_timeout: Duration) -> Result<Self, ExecError> {
        conn.busy_timeout(busy_timeout).map_err(unavailable)?;
        Ok(Self {
            conn: Mutex::new(conn),
            busy_timeout,
        })
    }

    /// Runs several `;`-separated statements without parameters. Meant for
    /// schema setup and seeding by deployment tooling and tests.
    ///
    /// # Errors
    ///
    /// Returns an [`ExecError`] if any statement fails.
    pub fn execute_batch(&self, sql: &str) -> Result<(), ExecError> {
        self.conn
            .lock()
            .execute_batch(sql)
            .map_err(|e| self.classify(e))
    }

    fn classify(&self, err: rusqlite::Error) -> ExecError {
        let code = match &err {
            rusqlite::Error::SqliteFailure(failure, _) => Some(failure.code),
            _ => None,
        };
        match code {
            Some(ErrorCode::ConstraintViolation) => ExecError::Constraint(err.to_string()),
            Some(ErrorCode::DatabaseBusy | ErrorCode::DatabaseLocked) => ExecError::Timeout {
                waited: self.busy_timeout,
            },
            _ => unavailable(err),
        }
    }
}

impl SqlExecutor for SqliteExecutor {
    #[cfg_attr(feature = "tracing", instrument(level = "trace", skip(self, params)))]
    fn query(&self, sql: &str, params: &[Value]) -> Result<Vec<Row>, ExecError> {
        let conn = self.conn.lock();
        run_query(&conn, sql, params).map_err(|e| self.classify(e))
    }

    #[cfg_attr(feature = "tracing", instrument(level = "trace", skip(self, params)))]
    fn update(&self, sql: &str, params: &[Value]) -> Result<u64, ExecError> {
        let conn = self.conn.lock();
        run_update(&conn, sql, params).map_err(|e| self.classify(e))
    }

    #[cfg_attr(
        feature = "tracing",
        instrument(level = "trace", skip(self, update_params, query_params))
    )]
    fn update_and_query(
        &self,
        update: &str,
        update_params: &[Value],
        query: &str,
        query_params: &[Value],
    ) -> Result<(u64, Vec<Row>), ExecError> {
        let mut conn = self.conn.lock();
        run_update_and_query(&mut conn, update, update_params, query, query_params)
            .map_err(|e| self.classify(e))
    }
}

fn run_query(conn: &Connection, sql: &str, params: &[Value]) -> rusqlite::Result<Vec<Row>> {
    let mut stmt = conn.prepare(sql)?;
    let columns = stmt.column_count();
    let rows = stmt
        .query_map(params_from_iter(params.iter().map(to_sql)), |row| {
            (0..columns)
                .map(|i| row.get::<_, SqlValue>(i).map(from_sql))
                .collect::<rusqlite::Result<Row>>()
        })?
        .collect::<rusqlite::Result<Vec<Row>>>()?;
    Ok(rows)
}

fn run_update(conn: &Connection, sql: &str, params: &[Value]) -> rusqlite::Result<u64> {
    let affected = conn.execute(sql, params_from_iter(params.iter().map(to_sql)))?;
    Ok(affected as u64)
}

fn run_update_and_query(
    conn: &mut Connection,
    update: &str,
    update_params: &[Value],
    query: &str,
    query_params: &[Value],
) -> rusqlite::Result<(u64, Vec<Row>)> {
    // IMMEDIATE takes the write lock up front so the read-back cannot observe
    // another writer's update.
    let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
    let affected = run_update(&tx, update, update_params)?;
    let rows = run_query(&tx, query, query_params)?;
    tx.commit()?;
    Ok((affected, rows))
}

fn to_sql(value: &Value) -> SqlValue {
    match value {
        Value::Null => SqlValue::Null,
        Value::Int(v) => SqlValue::Integer(*v),
        Value::Text(v) => SqlValue::Text(v.clone()),
        Value::Bool(v) => SqlValue::Integer(i64::from(*v)),
    }
}

fn from_sql(value: SqlValue) -> Value {
    match value {
        SqlValue::Integer(v) => Value::Int(v),
        SqlValue::Text(v) => Value::Text(v),
        // Counters written through REAL affinity still read as integers.
        SqlValue::Real(v) if v.fract() == 0.0 && v >= i64::MIN as f64 && v < i64::MAX as f64 => {
            Value::Int(v as i64)
        }
        SqlValue::Real(v) => Value::Text(v.to_string()),
        SqlValue::Null | SqlValue::Blob(_) => Value::Null,
    }
}

fn unavailable(err: rusqlite::Error) -> ExecError {
    ExecError::Unavailable(err.to_string())
}
