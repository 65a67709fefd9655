//! Live database handles.
//!
//! Every backend kind implements [`DatabaseHandle`]; the registry picks the
//! implementation from the descriptor's [`BackendKind`] tag and only ever
//! talks to the trait.

use crate::error::Result;
use crate::models::{BackendKind, ConnectionDescriptor, QueryHandle, StatementOutcome};
use crate::services::postgres::PostgresHandle;
use crate::services::sqlite::SqliteHandle;

use async_trait::async_trait;
use serde_json::Value as JsonValue;
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

/// Pool sizing for backends that pool connections.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolSettings {
    /// Maximum number of connections per saved connection
    pub max_size: usize,
    /// How long to wait when the pool is exhausted
    pub wait_timeout: Duration,
}

impl Default for PoolSettings {
    fn default() -> Self {
        Self { max_size: 4, wait_timeout: Duration::from_secs(30) }
    }
}

/// An open connection to one saved database.
#[async_trait]
pub trait DatabaseHandle: Send + Sync {
    /// The saved connection this handle belongs to.
    fn connection_id(&self) -> Uuid;

    /// Backend kind of this handle.
    fn kind(&self) -> BackendKind;

    /// Run one statement with positional parameters.
    ///
    /// Returns `DbmxError::Cancelled` if `query` is cancelled first; the
    /// backend is asked to abandon the statement before returning.
    async fn execute(
        &self,
        sql: &str,
        params: &[JsonValue],
        query: &QueryHandle,
    ) -> Result<StatementOutcome>;

    /// Release the handle. Closing an already closed handle is a no-op.
    async fn close(&self) -> Result<()>;

    /// Whether the handle has been closed.
    fn is_closed(&self) -> bool;
}

/// Open a handle for a descriptor, choosing the backend by its kind.
pub async fn open_handle(
    descriptor: &ConnectionDescriptor,
    pool: PoolSettings,
) -> Result<Arc<dyn DatabaseHandle>> {
    tracing::debug!(
        connection_id = %descriptor.id,
        kind = %descriptor.kind,
        url = %descriptor.display_url(),
        "Opening database handle"
    );

    let handle: Arc<dyn DatabaseHandle> = match descriptor.kind {
        BackendKind::Postgres => Arc::new(PostgresHandle::connect(descriptor, pool).await?),
        BackendKind::Sqlite => Arc::new(SqliteHandle::open(descriptor)?),
    };
    Ok(handle)
}

/// Render binary column data the way psql prints bytea.
pub(crate) fn bytes_to_hex(bytes: &[u8]) -> String {
    let mut out = String::with_capacity(2 + bytes.len() * 2);
    out.push_str("\\x");
    for byte in bytes {
        out.push_str(&format!("{byte:02x}"));
    }
    out
}
