use std::time::{Duration, Instant};

use log::{debug, warn};
use rusqlite::types::{FromSql, Value, ValueRef};
use rusqlite::{Connection, Rows};

use crate::error::{StorageError, StorageResult};
use crate::models::Id;
use crate::storage::param::{bind_all, Param};

/// Runs statements against a connection the caller has already locked.
///
/// Every statement is prepared, bound, stepped and finalized inside a single
/// call; the statement handle never outlives it.
pub struct Executor<'conn> {
    conn: &'conn Connection,
    timeout: Duration,
}

impl<'conn> Executor<'conn> {
    pub(crate) fn new(conn: &'conn Connection, timeout: Duration) -> Self {
        Executor { conn, timeout }
    }

    /// Runs a write statement to completion and returns the number of rows it changed.
    pub fn execute(&self, sql: &str, params: &[Param]) -> StorageResult<usize> {
        debug!("execute: {}", sql);
        let _deadline = self.arm_deadline();
        let mut stmt = self.conn.prepare(sql).map_err(|err| log_failure(sql, err))?;
        check_param_count(stmt.parameter_count(), params.len())?;
        bind_all(&mut stmt, params).map_err(|err| log_failure(sql, err))?;
        stmt.raw_execute().map_err(|err| log_failure(sql, err))
    }

    /// Runs an INSERT and returns the row id the store assigned.
    pub fn insert(&self, sql: &str, params: &[Param]) -> StorageResult<Id> {
        self.execute(sql, params)?;
        Ok(Id(self.conn.last_insert_rowid()))
    }

    /// Runs a query and hands its rows to `consume` as a lazy stream.
    ///
    /// `consume` may stop early by not draining the stream; the statement is
    /// finalized when this returns either way.
    pub fn query<T, F>(&self, sql: &str, params: &[Param], consume: F) -> StorageResult<T>
    where
        F: FnOnce(&mut RowStream<'_>) -> StorageResult<T>,
    {
        debug!("query: {}", sql);
        let _deadline = self.arm_deadline();
        let mut stmt = self.conn.prepare(sql).map_err(|err| log_failure(sql, err))?;
        check_param_count(stmt.parameter_count(), params.len())?;
        bind_all(&mut stmt, params).map_err(|err| log_failure(sql, err))?;
        let mut stream = RowStream::new(stmt.raw_query());
        consume(&mut stream).map_err(|err| {
            warn!("query failed: {} | {}", err, sql);
            err
        })
    }

    /// True when `sql` yields at least one row. Stops after the first.
    pub fn exists(&self, sql: &str, params: &[Param]) -> StorageResult<bool> {
        self.query(sql, params, |rows| rows.next().transpose().map(|row| row.is_some()))
    }

    /// Reads the first column of the first row as an integer.
    pub fn scalar(&self, sql: &str, params: &[Param]) -> StorageResult<i64> {
        self.query(sql, params, |rows| match rows.next() {
            Some(row) => row?.get(0),
            None => Err(StorageError::Column {
                index: 0,
                message: "query returned no rows".to_string(),
            }),
        })
    }

    fn arm_deadline(&self) -> DeadlineGuard<'conn> {
        let deadline = Instant::now() + self.timeout;
        self.conn
            .progress_handler(PROGRESS_OPS, Some(move || Instant::now() >= deadline));
        DeadlineGuard { conn: self.conn }
    }
}

/// Number of VM instructions between deadline checks.
const PROGRESS_OPS: i32 = 1000;

/// Clears the progress handler once the statement is done.
struct DeadlineGuard<'conn> {
    conn: &'conn Connection,
}

impl Drop for DeadlineGuard<'_> {
    fn drop(&mut self) {
        self.conn.progress_handler(0, None::<fn() -> bool>);
    }
}

fn check_param_count(expected: usize, given: usize) -> StorageResult<()> {
    if expected != given {
        return Err(StorageError::ParameterCount { expected, given });
    }
    Ok(())
}

fn log_failure(sql: &str, err: rusqlite::Error) -> StorageError {
    warn!("SQLite step failed: {} | {}", err, sql);
    StorageError::from(err)
}

/// Single-pass sequence of result rows. Each row is copied out of the
/// statement as it is stepped.
pub struct RowStream<'stmt> {
    rows: Rows<'stmt>,
    finished: bool,
}

impl<'stmt> RowStream<'stmt> {
    fn new(rows: Rows<'stmt>) -> Self {
        RowStream { rows, finished: false }
    }

    pub fn is_finished(&self) -> bool {
        self.finished
    }
}

impl Iterator for RowStream<'_> {
    type Item = StorageResult<Record>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.finished {
            return None;
        }
        match self.rows.next() {
            Ok(Some(row)) => {
                let width = row.as_ref().column_count();
                let values: rusqlite::Result<Vec<Value>> =
                    (0..width).map(|index| row.get::<_, Value>(index)).collect();
                Some(values.map(Record::new).map_err(StorageError::from))
            }
            Ok(None) => {
                self.finished = true;
                None
            }
            Err(err) => {
                self.finished = true;
                Some(Err(StorageError::from(err)))
            }
        }
    }
}

/// One result row, detached from the statement it came from.
#[derive(Debug, Clone, PartialEq)]
pub struct Record {
    values: Vec<Value>,
}

impl Record {
    fn new(values: Vec<Value>) -> Self {
        Record { values }
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn get<T: FromSql>(&self, index: usize) -> StorageResult<T> {
        let value = self.values.get(index).ok_or_else(|| StorageError::Column {
            index,
            message: format!("row has {} columns", self.values.len()),
        })?;
        T::column_result(ValueRef::from(value)).map_err(|err| StorageError::Column {
            index,
            message: err.to_string(),
        })
    }

    pub fn id(&self, index: usize) -> StorageResult<Id> {
        self.get::<i64>(index).map(Id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::params;

    fn connection() -> Connection {
        let conn = Connection::open_in_memory().unwrap();
        conn.execute_batch(
            "CREATE TABLE items (id INTEGER PRIMARY KEY AUTOINCREMENT, label TEXT UNIQUE);",
        )
        .unwrap();
        conn
    }

    fn executor(conn: &Connection) -> Executor<'_> {
        Executor::new(conn, Duration::from_secs(5))
    }

    #[test]
    fn test_insert_returns_assigned_id() {
        let conn = connection();
        let exec = executor(&conn);
        assert_eq!(exec.insert("INSERT INTO items (label) VALUES (?1)", &params!["a"]).unwrap(), Id(1));
        assert_eq!(exec.insert("INSERT INTO items (label) VALUES (?1)", &params!["b"]).unwrap(), Id(2));
    }

    #[test]
    fn test_constraint_violation_is_reported_not_raised() {
        let conn = connection();
        let exec = executor(&conn);
        exec.execute("INSERT INTO items (label) VALUES (?1)", &params!["a"]).unwrap();
        let err = exec
            .execute("INSERT INTO items (label) VALUES (?1)", &params!["a"])
            .unwrap_err();
        assert!(err.is_constraint_violation());
    }

    #[test]
    fn test_malformed_query_is_an_error() {
        let conn = connection();
        let exec = executor(&conn);
        assert!(exec.execute("INSERT INTO nowhere VALUES (?1)", &params![1_i64]).is_err());
    }

    #[test]
    fn test_parameter_count_mismatch() {
        let conn = connection();
        let exec = executor(&conn);
        let err = exec
            .execute("INSERT INTO items (label) VALUES (?1)", &params![])
            .unwrap_err();
        assert!(matches!(err, StorageError::ParameterCount { expected: 1, given: 0 }));
    }

    #[test]
    fn test_stream_can_stop_after_first_row() {
        let conn = connection();
        let exec = executor(&conn);
        for label in ["a", "b", "c"] {
            exec.execute("INSERT INTO items (label) VALUES (?1)", &params![label]).unwrap();
        }
        let (first, finished) = exec
            .query("SELECT label FROM items ORDER BY id", &params![], |rows| {
                let first: String = rows.next().unwrap()?.get(0)?;
                Ok((first, rows.is_finished()))
            })
            .unwrap();
        assert_eq!(first, "a");
        assert!(!finished);

        // the abandoned statement is gone, so the connection is free for writes
        exec.execute("DELETE FROM items", &params![]).unwrap();
    }

    #[test]
    fn test_stream_is_single_pass() {
        let conn = connection();
        let exec = executor(&conn);
        exec.execute("INSERT INTO items (label) VALUES (?1)", &params!["a"]).unwrap();
        exec.query("SELECT id FROM items", &params![], |rows| {
            assert_eq!(rows.by_ref().count(), 1);
            assert!(rows.is_finished());
            assert!(rows.next().is_none());
            Ok(())
        })
        .unwrap();
    }

    #[test]
    fn test_exists_and_scalar() {
        let conn = connection();
        let exec = executor(&conn);
        assert!(!exec.exists("SELECT 1 FROM items WHERE label = ?1", &params!["x"]).unwrap());
        exec.execute("INSERT INTO items (label) VALUES (?1)", &params!["x"]).unwrap();
        assert!(exec.exists("SELECT 1 FROM items WHERE label = ?1", &params!["x"]).unwrap());
        assert_eq!(exec.scalar("SELECT COUNT(*) FROM items", &params![]).unwrap(), 1);
    }

    #[test]
    fn test_record_reports_bad_columns() {
        let conn = connection();
        let exec = executor(&conn);
        exec.execute("INSERT INTO items (label) VALUES (?1)", &params!["a"]).unwrap();
        exec.query("SELECT label FROM items", &params![], |rows| {
            let record = rows.next().unwrap()?;
            assert_eq!(record.len(), 1);
            assert!(matches!(record.get::<i64>(0), Err(StorageError::Column { index: 0, .. })));
            assert!(matches!(record.get::<String>(3), Err(StorageError::Column { index: 3, .. })));
            Ok(())
        })
        .unwrap();
    }

    #[test]
    fn test_runaway_statement_times_out() {
        let conn = connection();
        let exec = Executor::new(&conn, Duration::from_millis(20));
        let err = exec
            .scalar(
                "WITH RECURSIVE n(x) AS (SELECT 1 UNION ALL SELECT x + 1 FROM n) SELECT COUNT(*) FROM n",
                &params![],
            )
            .unwrap_err();
        assert!(matches!(err, StorageError::TimedOut));
    }
}
