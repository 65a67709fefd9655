//! Query execution with cancellation and statement timeouts.
//!
//! Runs one statement on any [`DatabaseHandle`], timing it and classifying
//! it for the response envelope. A statement timeout is enforced by
//! cancelling the query handle, so backends only need to honour cancellation.

use crate::error::{DbmxError, Result};
use crate::models::{QueryHandle, QueryResult, QueryType};
use crate::services::connection::DatabaseHandle;

use serde_json::Value as JsonValue;
use std::pin::pin;
use std::time::{Duration, Instant};
use tokio::select;

/// Service for executing statements against open handles.
pub struct QueryService;

impl QueryService {
    /// Execute a statement with cancellation and an optional timeout.
    ///
    /// # Arguments
    /// * `handle` - Open database handle
    /// * `sql` - Statement text with positional placeholders
    /// * `params` - Positional parameter values
    /// * `query` - Query handle for tracking and cancellation
    /// * `timeout` - Statement timeout; `None` waits indefinitely
    pub async fn execute(
        handle: &dyn DatabaseHandle,
        sql: &str,
        params: &[JsonValue],
        query: &QueryHandle,
        timeout: Option<Duration>,
    ) -> Result<QueryResult> {
        if sql.trim().is_empty() {
            return Err(DbmxError::execute("Statement is empty"));
        }

        let start = Instant::now();
        let query_type = QueryType::detect(sql);

        tracing::debug!(
            query_id = %query.id(),
            connection_id = %handle.connection_id(),
            query_type = ?query_type,
            param_count = params.len(),
            "Executing query"
        );

        let mut exec = pin!(handle.execute(sql, params, query));
        let outcome = match timeout {
            None => exec.await,
            Some(limit) => {
                select! {
                    result = &mut exec => result,
                    _ = tokio::time::sleep(limit) => {
                        tracing::warn!(query_id = %query.id(), timeout = ?limit, "Statement timed out");
                        query.cancel();
                        // Let the backend abandon the statement before reporting
                        let _ = exec.await;
                        Err(DbmxError::execute_with_details(
                            format!("Statement timed out after {limit:?}"),
                            None,
                            Some("Increase the statement timeout or narrow the query".to_string()),
                            None,
                            None,
                        ))
                    }
                }
            }
        };

        let execution_time_ms = start.elapsed().as_millis() as u64;

        let outcome = match outcome {
            Ok(outcome) => outcome,
            Err(err) => {
                if err.is_cancelled() {
                    tracing::debug!(query_id = %query.id(), "Query cancelled");
                } else {
                    tracing::debug!(query_id = %query.id(), error = %err, "Query failed");
                }
                return Err(err);
            }
        };

        tracing::debug!(
            query_id = %query.id(),
            execution_time_ms,
            row_count = outcome.rows.len(),
            rows_affected = outcome.rows_affected,
            "Query completed"
        );

        Ok(QueryResult { query_id: query.id(), outcome, execution_time_ms, query_type })
    }
}
