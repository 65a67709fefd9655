//! Query execution models.

use crate::models::tab::Output;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

/// Type of SQL statement, detected from its leading keyword.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum QueryType {
    /// SELECT / WITH query returning rows
    Select,
    /// INSERT operation
    Insert,
    /// UPDATE operation
    Update,
    /// DELETE operation
    Delete,
    /// DDL, PRAGMA, or other statements
    Other,
}

impl QueryType {
    /// Detect the type of a SQL statement.
    pub fn detect(sql: &str) -> Self {
        let trimmed = sql.trim_start().to_uppercase();

        if trimmed.starts_with("SELECT") || trimmed.starts_with("WITH") {
            Self::Select
        } else if trimmed.starts_with("INSERT") {
            Self::Insert
        } else if trimmed.starts_with("UPDATE") {
            Self::Update
        } else if trimmed.starts_with("DELETE") {
            Self::Delete
        } else {
            Self::Other
        }
    }
}

/// Handle for tracking and cancelling a running query.
pub struct QueryHandle {
    /// Unique query identifier
    id: Uuid,
    /// Connection the query runs on
    connection_id: Uuid,
    /// The SQL being executed
    sql: String,
    /// Cancellation token for interrupting the query
    cancel_token: CancellationToken,
    /// Execution start time
    started_at: DateTime<Utc>,
}

impl QueryHandle {
    /// Create a new query handle.
    pub fn new(connection_id: Uuid, sql: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            connection_id,
            sql: sql.into(),
            cancel_token: CancellationToken::new(),
            started_at: Utc::now(),
        }
    }

    /// Get the unique query identifier.
    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Get the associated connection ID.
    pub fn connection_id(&self) -> Uuid {
        self.connection_id
    }

    /// Get the SQL being executed.
    pub fn sql(&self) -> &str {
        &self.sql
    }

    /// Get when execution started.
    pub fn started_at(&self) -> DateTime<Utc> {
        self.started_at
    }

    /// Get elapsed time in milliseconds.
    pub fn elapsed_ms(&self) -> i64 {
        (Utc::now() - self.started_at).num_milliseconds()
    }

    /// Request cancellation of the query.
    pub fn cancel(&self) {
        tracing::debug!(query_id = %self.id, "Cancellation requested");
        self.cancel_token.cancel();
    }

    /// Check if cancellation has been requested.
    pub fn is_cancelled(&self) -> bool {
        self.cancel_token.is_cancelled()
    }

    /// Wait for cancellation.
    pub async fn cancelled(&self) {
        self.cancel_token.cancelled().await
    }
}

impl std::fmt::Debug for QueryHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QueryHandle")
            .field("id", &self.id)
            .field("connection_id", &self.connection_id)
            .field("sql", &self.sql)
            .field("started_at", &self.started_at)
            .field("is_cancelled", &self.is_cancelled())
            .finish()
    }
}

/// Backend-agnostic result of one executed statement.
#[derive(Debug, Clone, PartialEq)]
pub struct StatementOutcome {
    /// Column names; empty for statements that return no rows
    pub columns: Vec<String>,
    /// Row tuples, positionally aligned with `columns`
    pub rows: Vec<Vec<JsonValue>>,
    /// Rows changed by a mutating statement
    pub rows_affected: u64,
    /// Whether the statement produced a result set
    pub returns_rows: bool,
}

impl StatementOutcome {
    /// Outcome of a statement that produced a result set.
    pub fn rows(columns: Vec<String>, rows: Vec<Vec<JsonValue>>) -> Self {
        Self { columns, rows, rows_affected: 0, returns_rows: true }
    }

    /// Outcome of a statement that only changed data.
    pub fn affected(rows_affected: u64) -> Self {
        Self { columns: Vec::new(), rows: Vec::new(), rows_affected, returns_rows: false }
    }
}

/// Results from query execution.
#[derive(Debug, Clone)]
pub struct QueryResult {
    /// The query handle ID
    pub query_id: Uuid,
    /// What the backend produced
    pub outcome: StatementOutcome,
    /// Time to execute in milliseconds
    pub execution_time_ms: u64,
    /// Type of query
    pub query_type: QueryType,
}

impl QueryResult {
    /// Get the number of rows returned.
    pub fn row_count(&self) -> usize {
        self.outcome.rows.len()
    }

    /// Convert into the cache shape stored on a tab.
    pub fn to_output(&self) -> Output {
        Output::new(self.outcome.columns.clone(), self.outcome.rows.clone())
    }
}
