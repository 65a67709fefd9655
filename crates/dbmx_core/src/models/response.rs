//! Uniform envelope for statement execution results.

use crate::error::DbmxError;
use crate::models::query::QueryResult;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value as JsonValue};
use std::collections::HashSet;

/// Backend-agnostic response for any executed statement.
///
/// Failures are folded into `ok = false` with the backend's message, so
/// callers never see a backend-specific error type.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GenericResponse {
    /// Whether the statement succeeded
    pub ok: bool,
    /// Row records keyed by column name, in result order
    pub data: Vec<JsonValue>,
    /// Column names for row-returning statements
    #[serde(default)]
    pub columns: Vec<String>,
    /// Rows changed by a mutating statement
    pub rows_affected: u64,
    /// Human-readable status or error text
    pub message: String,
}

impl GenericResponse {
    /// Build a success envelope from a query result.
    ///
    /// Records are keyed by column name. A repeated name gets a numeric
    /// suffix (`id`, `id_2`) so no value is dropped.
    pub fn from_result(result: &QueryResult) -> Self {
        let outcome = &result.outcome;
        let keys = record_keys(&outcome.columns);
        let data = outcome
            .rows
            .iter()
            .map(|row| {
                let record: Map<String, JsonValue> =
                    keys.iter().cloned().zip(row.iter().cloned()).collect();
                JsonValue::Object(record)
            })
            .collect();

        let message = if outcome.returns_rows {
            format!("{} row(s) returned in {}ms", outcome.rows.len(), result.execution_time_ms)
        } else {
            format!("{} row(s) affected in {}ms", outcome.rows_affected, result.execution_time_ms)
        };

        Self {
            ok: true,
            data,
            columns: outcome.columns.clone(),
            rows_affected: outcome.rows_affected,
            message,
        }
    }

    /// Build a failure envelope carrying the error text.
    pub fn from_error(error: &DbmxError) -> Self {
        Self { ok: false, message: error.to_string(), ..Self::default() }
    }
}

/// Unique record keys for a column list, in column order.
fn record_keys(columns: &[String]) -> Vec<String> {
    let mut taken: HashSet<String> = HashSet::with_capacity(columns.len());
    columns
        .iter()
        .map(|name| {
            let mut key = name.clone();
            let mut n = 2;
            while !taken.insert(key.clone()) {
                key = format!("{name}_{n}");
                n += 1;
            }
            key
        })
        .collect()
}
