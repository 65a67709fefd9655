//! Embedded SQLite handle.
//!
//! rusqlite is synchronous, so statements run on the blocking pool while the
//! async side waits for either the result or a cancellation request. The
//! connection runs one statement at a time; later statements queue on its
//! lock. Cancelling a statement that is still queued abandons it, while
//! cancelling the running one interrupts it through the [`InterruptHandle`].

use crate::error::{DbmxError, Result};
use crate::models::{BackendKind, ConnectionDescriptor, QueryHandle, StatementOutcome};
use crate::services::connection::{bytes_to_hex, DatabaseHandle};

use async_trait::async_trait;
use parking_lot::Mutex;
use rusqlite::types::{Value, ValueRef};
use rusqlite::{params_from_iter, Connection, InterruptHandle, OpenFlags};
use serde_json::Value as JsonValue;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::select;
use uuid::Uuid;

const MEMORY_PATH: &str = ":memory:";

/// A single rusqlite connection to a user database file.
pub struct SqliteHandle {
    id: Uuid,
    path: String,
    conn: Arc<Mutex<Option<Connection>>>,
    interrupt: Arc<InterruptHandle>,
    closed: AtomicBool,
}

impl SqliteHandle {
    /// Open the database file named by the descriptor.
    pub fn open(descriptor: &ConnectionDescriptor) -> Result<Self> {
        let path = expand_path(&descriptor.database)?;
        tracing::info!(connection_id = %descriptor.id, path = %path, "Opening SQLite database");

        let conn = if path == MEMORY_PATH {
            Connection::open_in_memory().map_err(|e| {
                DbmxError::connect(format!("Failed to open in-memory database: {e}"))
            })?
        } else {
            if !path.starts_with("file:") {
                if let Some(parent) = Path::new(&path).parent() {
                    if !parent.as_os_str().is_empty() && !parent.exists() {
                        return Err(DbmxError::connect_with_hint(
                            format!("Parent directory does not exist: {}", parent.display()),
                            "Check the database file path",
                        ));
                    }
                }
            }

            let flags = OpenFlags::SQLITE_OPEN_READ_WRITE
                | OpenFlags::SQLITE_OPEN_CREATE
                | OpenFlags::SQLITE_OPEN_URI
                | OpenFlags::SQLITE_OPEN_NO_MUTEX;
            Connection::open_with_flags(&path, flags).map_err(|e| {
                DbmxError::connect(format!("Failed to open SQLite database at '{path}': {e}"))
            })?
        };

        conn.busy_timeout(Duration::from_secs(u64::from(descriptor.options.connect_timeout_secs)))
            .map_err(|e| DbmxError::connect(format!("Failed to set busy timeout: {e}")))?;
        conn.pragma_update(None, "foreign_keys", "ON")
            .map_err(|e| DbmxError::connect(format!("Failed to enable foreign keys: {e}")))?;

        let interrupt = Arc::new(conn.get_interrupt_handle());

        Ok(Self {
            id: descriptor.id,
            path,
            conn: Arc::new(Mutex::new(Some(conn))),
            interrupt,
            closed: AtomicBool::new(false),
        })
    }

    /// Resolved path of the database file.
    pub fn path(&self) -> &str {
        &self.path
    }
}

#[async_trait]
impl DatabaseHandle for SqliteHandle {
    fn connection_id(&self) -> Uuid {
        self.id
    }

    fn kind(&self) -> BackendKind {
        BackendKind::Sqlite
    }

    async fn execute(
        &self,
        sql: &str,
        params: &[JsonValue],
        query: &QueryHandle,
    ) -> Result<StatementOutcome> {
        if self.is_closed() {
            return Err(DbmxError::connect("Connection is closed"));
        }

        let conn = Arc::clone(&self.conn);
        let state = Arc::new(Mutex::new(RunState::Queued));
        let worker_state = Arc::clone(&state);
        let query_id = query.id();
        let sql = sql.to_string();
        let params = params.to_vec();
        let mut task = tokio::task::spawn_blocking(move || {
            let guard = conn.lock();
            {
                let mut state = worker_state.lock();
                if *state == RunState::Abandoned {
                    return Err(DbmxError::cancelled(query_id));
                }
                *state = RunState::Running;
            }
            let result = match guard.as_ref() {
                Some(conn) => run_statement(conn, &sql, &params),
                None => Err(DbmxError::connect("Connection is closed")),
            };
            // Settle the state before the next statement can take the connection
            *worker_state.lock() = RunState::Finished;
            drop(guard);
            result
        });

        select! {
            joined = &mut task => {
                joined.map_err(|e| DbmxError::internal(format!("SQLite worker failed: {e}")))?
            }
            _ = query.cancelled() => {
                let interrupted = {
                    let mut state = state.lock();
                    match *state {
                        RunState::Queued => {
                            *state = RunState::Abandoned;
                            false
                        }
                        // Held across the interrupt so it cannot reach the next statement
                        RunState::Running => {
                            self.interrupt.interrupt();
                            true
                        }
                        RunState::Finished | RunState::Abandoned => false,
                    }
                };

                if interrupted {
                    tracing::debug!(query_id = %query_id, "Interrupted SQLite statement");
                    // Wait for the worker so the connection is free again
                    let _ = task.await;
                } else {
                    tracing::debug!(query_id = %query_id, "Abandoned queued SQLite statement");
                }
                Err(DbmxError::cancelled(query_id))
            }
        }
    }

    async fn close(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        self.interrupt.interrupt();
        let conn = Arc::clone(&self.conn);
        let taken = tokio::task::spawn_blocking(move || conn.lock().take())
            .await
            .map_err(|e| DbmxError::internal(format!("SQLite worker failed: {e}")))?;

        if let Some(conn) = taken {
            conn.close().map_err(|(_, e)| {
                DbmxError::connect(format!("Failed to close SQLite database: {e}"))
            })?;
        }

        tracing::info!(connection_id = %self.id, path = %self.path, "SQLite database closed");
        Ok(())
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

/// Progress of one statement through the connection lock.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RunState {
    Queued,
    Running,
    Finished,
    Abandoned,
}

/// Expand `~/` and make relative paths absolute.
fn expand_path(path: &str) -> Result<String> {
    if path == MEMORY_PATH || path.starts_with("file:") {
        return Ok(path.to_string());
    }

    let expanded = match path.strip_prefix("~/") {
        Some(rest) => dirs::home_dir()
            .ok_or_else(|| DbmxError::config("Unable to determine home directory"))?
            .join(rest),
        None => PathBuf::from(path),
    };

    let absolute =
        if expanded.is_relative() { std::env::current_dir()?.join(expanded) } else { expanded };
    Ok(absolute.to_string_lossy().into_owned())
}

fn run_statement(conn: &Connection, sql: &str, params: &[JsonValue]) -> Result<StatementOutcome> {
    let mut stmt = conn.prepare(sql).map_err(statement_error)?;

    let expected = stmt.parameter_count();
    if expected != params.len() {
        return Err(DbmxError::execute(format!(
            "Statement expects {} parameter(s) but {} were supplied",
            expected,
            params.len()
        )));
    }
    let values: Vec<Value> = params.iter().map(json_to_sqlite).collect();

    if stmt.column_count() == 0 {
        let affected = stmt.execute(params_from_iter(values)).map_err(statement_error)?;
        return Ok(StatementOutcome::affected(affected as u64));
    }

    let columns: Vec<String> = stmt.column_names().into_iter().map(String::from).collect();
    let width = columns.len();

    let mut rows = stmt.query(params_from_iter(values)).map_err(statement_error)?;
    let mut out = Vec::new();
    while let Some(row) = rows.next().map_err(statement_error)? {
        let mut values = Vec::with_capacity(width);
        for i in 0..width {
            values.push(sqlite_to_json(row.get_ref(i).map_err(statement_error)?));
        }
        out.push(values);
    }

    drop(rows);

    let mut outcome = StatementOutcome::rows(columns, out);
    // DML with RETURNING yields rows and changes data
    if !stmt.readonly() {
        outcome.rows_affected = conn.changes() as u64;
    }
    Ok(outcome)
}

/// Errors from user statements are execute errors, not metadata storage faults.
fn statement_error(err: rusqlite::Error) -> DbmxError {
    let (code, position) = match &err {
        rusqlite::Error::SqliteFailure(e, _) => (Some(e.extended_code.to_string()), None),
        rusqlite::Error::SqlInputError { error, offset, .. } => {
            (Some(error.extended_code.to_string()), usize::try_from(*offset).ok())
        }
        _ => (None, None),
    };
    DbmxError::execute_with_details(err.to_string(), None, None, position, code)
}

fn json_to_sqlite(value: &JsonValue) -> Value {
    match value {
        JsonValue::Null => Value::Null,
        JsonValue::Bool(b) => Value::Integer(i64::from(*b)),
        JsonValue::Number(n) => match n.as_i64() {
            Some(i) => Value::Integer(i),
            None => n.as_f64().map(Value::Real).unwrap_or(Value::Null),
        },
        JsonValue::String(s) => Value::Text(s.clone()),
        other => Value::Text(other.to_string()),
    }
}

fn sqlite_to_json(value: ValueRef<'_>) -> JsonValue {
    match value {
        ValueRef::Null => JsonValue::Null,
        ValueRef::Integer(i) => JsonValue::Number(i.into()),
        ValueRef::Real(f) => {
            serde_json::Number::from_f64(f).map(JsonValue::Number).unwrap_or(JsonValue::Null)
        }
        ValueRef::Text(t) => JsonValue::String(String::from_utf8_lossy(t).into_owned()),
        ValueRef::Blob(b) => JsonValue::String(bytes_to_hex(b)),
    }
}
