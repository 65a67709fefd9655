//! Error types for the dbmx workspace core.
//!
//! The taxonomy covers lookups that miss, metadata storage
//! failures, corrupted result caches, and the two backend conditions
//! (connect and execute). Expected conditions carry their message verbatim to
//! the caller; storage and deserialize failures abort the current operation.

use thiserror::Error;
use uuid::Uuid;

/// Result alias used throughout the crate.
pub type Result<T, E = DbmxError> = std::result::Result<T, E>;

/// Main error type for the workspace core.
#[derive(Debug, Error)]
pub enum DbmxError {
    /// Unknown tab or connection identifier.
    #[error("{entity} not found: {id}")]
    NotFound {
        /// Kind of record that was looked up ("Tab", "Connection").
        entity: &'static str,
        /// The identifier as supplied by the caller.
        id: String,
    },

    /// Metadata store read/write failure.
    #[error("Storage error: {message}")]
    Storage {
        /// Human-readable error message.
        message: String,
        /// Actionable hint for the user.
        hint: Option<String>,
        /// Optional underlying error source.
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    /// A cached query result is not valid structured data.
    #[error("Deserialize error: {message}")]
    Deserialize {
        /// Human-readable error message.
        message: String,
        /// Optional underlying error source.
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    /// Backend unreachable, connection refused, or credentials rejected.
    #[error("Connection error: {message}")]
    Connect {
        /// Human-readable error message.
        message: String,
        /// Actionable hint for the user.
        hint: Option<String>,
        /// Optional underlying error source.
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    /// Statement failed against a live backend.
    #[error("{message}")]
    Execute {
        /// Backend error message.
        message: String,
        /// Additional detail from the backend.
        detail: Option<String>,
        /// Backend hint.
        hint: Option<String>,
        /// Position in the statement (1-indexed).
        position: Option<usize>,
        /// SQLSTATE or backend error code (e.g., "42P01").
        code: Option<String>,
    },

    /// Query was cancelled before it completed.
    #[error("Query cancelled")]
    Cancelled {
        /// ID of the cancelled query.
        query_id: Uuid,
    },

    /// Invalid configuration or input.
    #[error("Config error: {message}")]
    Config {
        /// Human-readable error message.
        message: String,
    },

    /// Unexpected internal error.
    #[error("Internal error: {message}")]
    Internal {
        /// Human-readable error message.
        message: String,
    },
}

impl DbmxError {
    // ========== Constructors ==========

    /// Create a not-found error for a tab.
    pub fn tab_not_found(id: i64) -> Self {
        Self::NotFound { entity: "Tab", id: id.to_string() }
    }

    /// Create a not-found error for a connection.
    pub fn connection_not_found(id: impl std::fmt::Display) -> Self {
        Self::NotFound { entity: "Connection", id: id.to_string() }
    }

    /// Create a new storage error.
    pub fn storage(message: impl Into<String>, hint: Option<&str>) -> Self {
        Self::Storage { message: message.into(), hint: hint.map(String::from), source: None }
    }

    /// Create a new storage error with source.
    pub fn storage_with_source(
        message: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self::Storage { message: message.into(), hint: None, source: Some(Box::new(source)) }
    }

    /// Create a new deserialize error with source.
    pub fn deserialize(
        message: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self::Deserialize { message: message.into(), source: Some(Box::new(source)) }
    }

    /// Create a new connect error.
    pub fn connect(message: impl Into<String>) -> Self {
        Self::Connect { message: message.into(), hint: None, source: None }
    }

    /// Create a new connect error with a custom hint.
    pub fn connect_with_hint(message: impl Into<String>, hint: impl Into<String>) -> Self {
        Self::Connect { message: message.into(), hint: Some(hint.into()), source: None }
    }

    /// Create an execute error carrying only a message.
    pub fn execute(message: impl Into<String>) -> Self {
        Self::Execute { message: message.into(), detail: None, hint: None, position: None, code: None }
    }

    /// Create an execute error with full backend details.
    pub fn execute_with_details(
        message: impl Into<String>,
        detail: Option<String>,
        hint: Option<String>,
        position: Option<usize>,
        code: Option<String>,
    ) -> Self {
        Self::Execute { message: message.into(), detail, hint, position, code }
    }

    /// Create a query cancelled error.
    pub fn cancelled(query_id: Uuid) -> Self {
        Self::Cancelled { query_id }
    }

    /// Create a new config error.
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config { message: message.into() }
    }

    /// Create a new internal error.
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal { message: message.into() }
    }

    // ========== Methods ==========

    /// Check if this error is a lookup miss.
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }

    /// Check if this error represents a cancelled query.
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled { .. })
    }

    /// Whether this is a user-actionable condition rather than a fault.
    ///
    /// Storage and deserialize failures are unexpected and abort the
    /// operation; everything else is surfaced to the UI as-is.
    pub fn is_expected(&self) -> bool {
        matches!(
            self,
            Self::NotFound { .. }
                | Self::Connect { .. }
                | Self::Execute { .. }
                | Self::Cancelled { .. }
                | Self::Config { .. }
        )
    }

    /// Get the error category name.
    pub fn category(&self) -> &'static str {
        match self {
            Self::NotFound { .. } => "NotFound",
            Self::Storage { .. } => "Storage",
            Self::Deserialize { .. } => "Deserialize",
            Self::Connect { .. } => "Connect",
            Self::Execute { .. } | Self::Cancelled { .. } => "Execute",
            Self::Config { .. } => "Config",
            Self::Internal { .. } => "Internal",
        }
    }

    /// Get actionable hint for the user.
    pub fn hint(&self) -> Option<&str> {
        match self {
            Self::NotFound { .. } => Some("The item may have been deleted"),
            Self::Storage { hint, .. } => hint.as_deref(),
            Self::Deserialize { .. } => Some("The cached result is corrupted; re-run the query"),
            Self::Connect { hint, .. } => {
                hint.as_deref().or(Some("Check that the database server is running"))
            }
            Self::Execute { hint, .. } => hint.as_deref(),
            Self::Cancelled { .. } => None,
            Self::Config { .. } => None,
            Self::Internal { .. } => Some("Please report this issue"),
        }
    }

    /// Get the backend error code (if applicable).
    pub fn code(&self) -> Option<&str> {
        match self {
            Self::Execute { code, .. } => code.as_deref(),
            _ => None,
        }
    }

    /// Convert to user-displayable error info.
    pub fn to_error_info(&self) -> ErrorInfo {
        let error_type = format!("{} Error", self.category());
        let message = self.to_string();
        let hint = self.hint().map(String::from);

        let technical_detail = match self {
            Self::Execute { detail, code, position, .. } => {
                let mut parts = Vec::new();
                if let Some(code) = code {
                    parts.push(format!("Code: {code}"));
                }
                if let Some(pos) = position {
                    parts.push(format!("Position: {pos}"));
                }
                if let Some(detail) = detail {
                    parts.push(format!("Detail: {detail}"));
                }
                if parts.is_empty() {
                    None
                } else {
                    Some(parts.join("\n"))
                }
            }
            Self::Cancelled { query_id } => Some(format!("Query ID: {query_id}")),
            _ => None,
        };

        ErrorInfo { error_type, message, hint, technical_detail }
    }
}

/// User-displayable error information.
#[derive(Debug, Clone)]
pub struct ErrorInfo {
    /// Category name (e.g., "Connect Error").
    pub error_type: String,
    /// User-friendly message.
    pub message: String,
    /// Actionable suggestion.
    pub hint: Option<String>,
    /// Technical detail for "Show Details" expansion.
    pub technical_detail: Option<String>,
}

// ========== Error Conversions ==========

/// Convert from tokio_postgres::Error to DbmxError.
impl From<tokio_postgres::Error> for DbmxError {
    fn from(err: tokio_postgres::Error) -> Self {
        if let Some(db_err) = err.as_db_error() {
            let message = db_err.message().to_string();
            let code_str = db_err.code().code();

            // Authentication (28xxx) and connection exceptions (08xxx)
            if code_str.starts_with("28") {
                return DbmxError::Connect {
                    message,
                    hint: Some("Check username and password".to_string()),
                    source: None,
                };
            }
            if code_str.starts_with("08") {
                return DbmxError::Connect { message, hint: None, source: Some(Box::new(err)) };
            }

            let position = db_err.position().and_then(|p| match p {
                tokio_postgres::error::ErrorPosition::Original(pos) => Some(*pos as usize),
                tokio_postgres::error::ErrorPosition::Internal { .. } => None,
            });
            return DbmxError::Execute {
                message,
                detail: db_err.detail().map(String::from),
                hint: db_err.hint().map(String::from),
                position,
                code: Some(code_str.to_string()),
            };
        }

        if err.is_closed() {
            return DbmxError::Connect {
                message: "Connection closed".to_string(),
                hint: Some("The server closed the connection; run the query again".to_string()),
                source: Some(Box::new(err)),
            };
        }

        // Client-side failures (type mismatches, protocol errors)
        DbmxError::execute(err.to_string())
    }
}

/// Convert from rusqlite::Error to DbmxError.
impl From<rusqlite::Error> for DbmxError {
    fn from(err: rusqlite::Error) -> Self {
        DbmxError::Storage {
            message: err.to_string(),
            hint: Some("The local database may be corrupted".to_string()),
            source: Some(Box::new(err)),
        }
    }
}

/// Convert from std::io::Error to DbmxError.
impl From<std::io::Error> for DbmxError {
    fn from(err: std::io::Error) -> Self {
        DbmxError::Storage {
            message: err.to_string(),
            hint: Some("Check file permissions and disk space".to_string()),
            source: Some(Box::new(err)),
        }
    }
}

/// Convert from serde_json::Error to DbmxError.
impl From<serde_json::Error> for DbmxError {
    fn from(err: serde_json::Error) -> Self {
        DbmxError::deserialize(format!("Invalid JSON: {err}"), err)
    }
}
