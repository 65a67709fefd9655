//! Connection registry.
//!
//! Owns the saved connection descriptors and the live handles opened from
//! them. Handles are opened lazily on first use and cached until the
//! descriptor is updated or removed, or the registry is terminated.
//! Handle creation and teardown are serialized through one async mutex so a
//! connection is never opened twice or closed while being opened.

use crate::error::{DbmxError, Result};
use crate::models::{ConnectionDescriptor, GenericResponse, QueryHandle, QueryResult};
use crate::services::connection::{open_handle, DatabaseHandle, PoolSettings};
use crate::services::query::QueryService;
use crate::services::storage::LocalStorage;

use parking_lot::RwLock;
use serde_json::Value as JsonValue;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use uuid::Uuid;

/// Parse a connection identifier as stored on a tab.
///
/// Anything that is not a valid identifier cannot name a saved connection,
/// so it is reported as not found.
pub fn parse_connection_id(raw: &str) -> Result<Uuid> {
    Uuid::parse_str(raw.trim()).map_err(|_| DbmxError::connection_not_found(raw))
}

/// Outcome of closing every open handle at shutdown.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct TerminationReport {
    /// Handles closed successfully
    pub closed: usize,
    /// Handles whose close failed, with the error text
    pub failures: Vec<(Uuid, String)>,
}

impl TerminationReport {
    /// Whether every handle closed cleanly.
    pub fn is_clean(&self) -> bool {
        self.failures.is_empty()
    }
}

/// Registry of saved connections and their live handles.
pub struct ConnectionRegistry {
    /// Metadata store holding saved descriptors
    storage: Arc<LocalStorage>,
    /// Saved descriptors keyed by connection id
    descriptors: RwLock<HashMap<Uuid, ConnectionDescriptor>>,
    /// Open handles; the async lock serializes open/close
    handles: Mutex<HashMap<Uuid, Arc<dyn DatabaseHandle>>>,
    /// Running queries that may be cancelled
    active_queries: RwLock<HashMap<Uuid, Arc<QueryHandle>>>,
    pool_settings: PoolSettings,
    /// Applies when a descriptor sets no timeout of its own
    default_statement_timeout: Option<Duration>,
    terminated: AtomicBool,
}

impl ConnectionRegistry {
    /// Create a registry, loading saved descriptors from storage.
    pub fn new(
        storage: Arc<LocalStorage>,
        pool_settings: PoolSettings,
        default_statement_timeout: Option<Duration>,
    ) -> Result<Self> {
        let descriptors: HashMap<Uuid, ConnectionDescriptor> =
            storage.load_all_connections()?.into_iter().map(|d| (d.id, d)).collect();

        tracing::debug!(saved = descriptors.len(), "Connection registry initialized");

        Ok(Self {
            storage,
            descriptors: RwLock::new(descriptors),
            handles: Mutex::new(HashMap::new()),
            active_queries: RwLock::new(HashMap::new()),
            pool_settings,
            default_statement_timeout,
            terminated: AtomicBool::new(false),
        })
    }

    // ========== Descriptors ==========

    /// Register and persist a new descriptor.
    pub fn add(&self, descriptor: ConnectionDescriptor) -> Result<ConnectionDescriptor> {
        descriptor.validate().map_err(DbmxError::config)?;
        if self.descriptors.read().contains_key(&descriptor.id) {
            return Err(DbmxError::config(format!(
                "Connection already exists: {}",
                descriptor.id
            )));
        }

        self.storage.save_connection(&descriptor)?;
        self.descriptors.write().insert(descriptor.id, descriptor.clone());

        tracing::info!(
            connection_id = %descriptor.id,
            name = %descriptor.name,
            kind = %descriptor.kind,
            "Connection added"
        );
        Ok(descriptor)
    }

    /// Replace a saved descriptor. An open handle is closed so the next use
    /// reconnects with the new settings.
    pub async fn update(&self, descriptor: ConnectionDescriptor) -> Result<()> {
        descriptor.validate().map_err(DbmxError::config)?;
        let id = descriptor.id;
        if !self.descriptors.read().contains_key(&id) {
            return Err(DbmxError::connection_not_found(id));
        }

        let mut handles = self.handles.lock().await;
        self.storage.save_connection(&descriptor)?;
        self.descriptors.write().insert(id, descriptor);

        if let Some(handle) = handles.remove(&id) {
            self.close_handle(id, handle.as_ref()).await;
        }

        tracing::info!(connection_id = %id, "Connection updated");
        Ok(())
    }

    /// Close any open handle, then forget and delete the descriptor.
    ///
    /// Tabs referencing the connection keep their reference; it resolves to
    /// not found from then on.
    pub async fn remove(&self, id: Uuid) -> Result<()> {
        if !self.descriptors.read().contains_key(&id) {
            return Err(DbmxError::connection_not_found(id));
        }

        let mut handles = self.handles.lock().await;
        self.cancel_queries_for(id);
        if let Some(handle) = handles.remove(&id) {
            self.close_handle(id, handle.as_ref()).await;
        }

        self.storage.delete_connection(id)?;
        self.descriptors.write().remove(&id);

        tracing::info!(connection_id = %id, "Connection removed");
        Ok(())
    }

    /// Get a saved descriptor.
    pub fn get(&self, id: Uuid) -> Option<ConnectionDescriptor> {
        self.descriptors.read().get(&id).cloned()
    }

    /// All saved descriptors, sorted by name.
    pub fn descriptors(&self) -> Vec<ConnectionDescriptor> {
        let mut all: Vec<_> = self.descriptors.read().values().cloned().collect();
        all.sort_by(|a, b| a.name.cmp(&b.name).then(a.id.cmp(&b.id)));
        all
    }

    // ========== Handles ==========

    /// Return the live handle for a connection, opening it on first use.
    pub async fn resolve(&self, id: Uuid) -> Result<Arc<dyn DatabaseHandle>> {
        if self.terminated.load(Ordering::SeqCst) {
            return Err(DbmxError::connect("Connection registry has been shut down"));
        }

        let mut handles = self.handles.lock().await;
        // terminate_all may have drained the map while this call waited
        if self.terminated.load(Ordering::SeqCst) {
            return Err(DbmxError::connect("Connection registry has been shut down"));
        }
        if let Some(handle) = handles.get(&id) {
            if !handle.is_closed() {
                return Ok(Arc::clone(handle));
            }
            handles.remove(&id);
        }

        let descriptor = self.get(id).ok_or_else(|| DbmxError::connection_not_found(id))?;
        let handle = open_handle(&descriptor, self.pool_settings).await?;
        handles.insert(id, Arc::clone(&handle));
        drop(handles);

        if let Err(e) = self.storage.update_last_connected(id) {
            tracing::warn!(connection_id = %id, error = %e, "Failed to record last connection time");
        }

        tracing::info!(connection_id = %id, kind = %descriptor.kind, "Connection opened");
        Ok(handle)
    }

    /// Whether a live handle is cached for a connection.
    pub async fn is_open(&self, id: Uuid) -> bool {
        self.handles.lock().await.get(&id).is_some_and(|h| !h.is_closed())
    }

    /// Ids of connections with a live handle.
    pub async fn open_handle_ids(&self) -> Vec<Uuid> {
        self.handles
            .lock()
            .await
            .iter()
            .filter(|(_, h)| !h.is_closed())
            .map(|(id, _)| *id)
            .collect()
    }

    /// Open a throwaway handle for a descriptor, run a trivial statement and
    /// close it again. The descriptor does not need to be saved.
    pub async fn test_connection(&self, descriptor: &ConnectionDescriptor) -> Result<()> {
        descriptor.validate().map_err(DbmxError::config)?;

        let handle = open_handle(descriptor, PoolSettings { max_size: 1, ..self.pool_settings })
            .await?;
        let query = QueryHandle::new(descriptor.id, "SELECT 1");
        let timeout = Some(Duration::from_secs(u64::from(descriptor.options.connect_timeout_secs)));
        let result = QueryService::execute(handle.as_ref(), "SELECT 1", &[], &query, timeout).await;

        if let Err(e) = handle.close().await {
            tracing::warn!(connection_id = %descriptor.id, error = %e, "Failed to close test connection");
        }
        result.map(|_| ())
    }

    // ========== Execution ==========

    /// Run a statement and fold the outcome into a response envelope.
    pub async fn execute(&self, id: Uuid, sql: &str, params: &[JsonValue]) -> GenericResponse {
        match self.execute_query(id, sql, params).await {
            Ok(result) => GenericResponse::from_result(&result),
            Err(err) => {
                if !err.is_expected() {
                    tracing::warn!(connection_id = %id, error = %err, "Statement execution failed");
                }
                GenericResponse::from_error(&err)
            }
        }
    }

    /// Run a statement, returning the typed result.
    pub async fn execute_query(
        &self,
        id: Uuid,
        sql: &str,
        params: &[JsonValue],
    ) -> Result<QueryResult> {
        let handle = self.resolve(id).await?;
        let timeout = self.statement_timeout_for(id);

        let query = self.register_query(QueryHandle::new(id, sql));
        let result = QueryService::execute(handle.as_ref(), sql, params, &query, timeout).await;
        self.unregister_query(query.id());

        result
    }

    fn statement_timeout_for(&self, id: Uuid) -> Option<Duration> {
        self.descriptors
            .read()
            .get(&id)
            .and_then(|d| d.options.statement_timeout_secs)
            .map(|secs| Duration::from_secs(u64::from(secs)))
            .or(self.default_statement_timeout)
    }

    // ========== Query Tracking ==========

    fn register_query(&self, query: QueryHandle) -> Arc<QueryHandle> {
        let id = query.id();
        let query = Arc::new(query);
        self.active_queries.write().insert(id, Arc::clone(&query));
        tracing::trace!(query_id = %id, "Query registered");
        query
    }

    fn unregister_query(&self, id: Uuid) {
        if self.active_queries.write().remove(&id).is_some() {
            tracing::trace!(query_id = %id, "Query unregistered");
        }
    }

    /// Request cancellation of a running query.
    ///
    /// Returns true if the query was found.
    pub fn cancel_query(&self, id: Uuid) -> bool {
        match self.active_queries.read().get(&id) {
            Some(query) => {
                query.cancel();
                true
            }
            None => false,
        }
    }

    /// Ids of queries currently running.
    pub fn active_query_ids(&self) -> Vec<Uuid> {
        self.active_queries.read().keys().copied().collect()
    }

    fn cancel_queries_for(&self, connection_id: Uuid) {
        for query in self.active_queries.read().values() {
            if query.connection_id() == connection_id {
                query.cancel();
            }
        }
    }

    // ========== Shutdown ==========

    /// Close every open handle.
    ///
    /// Individual close failures are logged and reported but never stop the
    /// remaining handles from being closed. Calling this again closes nothing.
    pub async fn terminate_all(&self) -> TerminationReport {
        self.terminated.store(true, Ordering::SeqCst);

        for query in self.active_queries.read().values() {
            query.cancel();
        }

        let drained: Vec<(Uuid, Arc<dyn DatabaseHandle>)> =
            self.handles.lock().await.drain().collect();

        let mut report = TerminationReport::default();
        for (id, handle) in drained {
            if handle.is_closed() {
                continue;
            }
            match handle.close().await {
                Ok(()) => report.closed += 1,
                Err(e) => {
                    tracing::warn!(connection_id = %id, error = %e, "Failed to close connection");
                    report.failures.push((id, e.to_string()));
                }
            }
        }

        tracing::info!(
            closed = report.closed,
            failed = report.failures.len(),
            "Connection registry terminated"
        );
        report
    }

    async fn close_handle(&self, id: Uuid, handle: &dyn DatabaseHandle) {
        if let Err(e) = handle.close().await {
            tracing::warn!(connection_id = %id, error = %e, "Failed to close connection");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{BackendKind, ConnectionOptions};
    use serde_json::json;
    use tempfile::TempDir;

    fn registry() -> ConnectionRegistry {
        let storage = Arc::new(LocalStorage::open_in_memory().unwrap());
        ConnectionRegistry::new(storage, PoolSettings::default(), None).unwrap()
    }

    fn scratch() -> ConnectionDescriptor {
        ConnectionDescriptor::sqlite("scratch", ":memory:")
    }

    #[tokio::test]
    async fn test_execute_rows_and_mutations() {
        let registry = registry();
        let id = registry.add(scratch()).unwrap().id;

        let created = registry.execute(id, "CREATE TABLE t (a INTEGER, b TEXT)", &[]).await;
        assert!(created.ok, "{}", created.message);

        let inserted = registry
            .execute(id, "INSERT INTO t VALUES (?1, ?2), (2, 'y')", &[json!(1), json!("x")])
            .await;
        assert!(inserted.ok);
        assert_eq!(inserted.rows_affected, 2);
        assert!(inserted.data.is_empty());

        let selected = registry.execute(id, "SELECT a, b FROM t ORDER BY a", &[]).await;
        assert!(selected.ok);
        assert_eq!(selected.columns, vec!["a", "b"]);
        assert_eq!(selected.data, vec![json!({"a": 1, "b": "x"}), json!({"a": 2, "b": "y"})]);
    }

    #[tokio::test]
    async fn test_execute_keeps_duplicate_column_names() {
        let registry = registry();
        let id = registry.add(scratch()).unwrap().id;

        let response = registry.execute(id, "SELECT 1 AS a, 2 AS a", &[]).await;
        assert!(response.ok, "{}", response.message);
        assert_eq!(response.columns, vec!["a", "a"]);
        assert_eq!(response.data, vec![json!({"a": 1, "a_2": 2})]);
        assert_eq!(response.data[0].as_object().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_execute_unknown_connection_is_not_found() {
        let registry = registry();
        let missing = Uuid::new_v4();

        let response = registry.execute(missing, "SELECT 1", &[]).await;
        assert!(!response.ok);
        assert_eq!(response.message, format!("Connection not found: {missing}"));

        let err = registry.resolve(missing).await.err().unwrap();
        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn test_statement_error_folds_into_envelope() {
        let registry = registry();
        let id = registry.add(scratch()).unwrap().id;

        let response = registry.execute(id, "SELECT * FROM missing_table", &[]).await;
        assert!(!response.ok);
        assert!(response.message.contains("missing_table"));
        assert_eq!(response.rows_affected, 0);
    }

    #[tokio::test]
    async fn test_add_rejects_invalid_descriptor() {
        let registry = registry();
        let err = registry.add(ConnectionDescriptor::sqlite("", ":memory:")).unwrap_err();
        assert_eq!(err.category(), "Config");
        assert!(registry.descriptors().is_empty());
    }

    #[tokio::test]
    async fn test_resolve_opens_once_and_caches() {
        let registry = registry();
        let id = registry.add(scratch()).unwrap().id;
        assert!(!registry.is_open(id).await);

        let first = registry.resolve(id).await.unwrap();
        let second = registry.resolve(id).await.unwrap();
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(first.kind(), BackendKind::Sqlite);
        assert_eq!(registry.open_handle_ids().await, vec![id]);
    }

    #[tokio::test]
    async fn test_remove_closes_handle_and_forgets() {
        let registry = registry();
        let id = registry.add(scratch()).unwrap().id;
        let handle = registry.resolve(id).await.unwrap();

        registry.remove(id).await.unwrap();
        assert!(handle.is_closed());
        assert!(!registry.is_open(id).await);
        assert!(registry.get(id).is_none());
        assert!(registry.storage.load_connection(id).unwrap().is_none());

        let err = registry.remove(id).await.unwrap_err();
        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn test_update_drops_open_handle() {
        let registry = registry();
        let descriptor = registry.add(scratch()).unwrap();
        let handle = registry.resolve(descriptor.id).await.unwrap();

        let renamed = ConnectionDescriptor { name: "renamed".to_string(), ..descriptor.clone() };
        registry.update(renamed).await.unwrap();

        assert!(handle.is_closed());
        assert!(!registry.is_open(descriptor.id).await);
        assert_eq!(registry.get(descriptor.id).unwrap().name, "renamed");

        let unknown = ConnectionDescriptor::sqlite("other", ":memory:");
        assert!(registry.update(unknown).await.unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn test_descriptors_survive_reload() {
        let storage = Arc::new(LocalStorage::open_in_memory().unwrap());
        let registry =
            ConnectionRegistry::new(Arc::clone(&storage), PoolSettings::default(), None).unwrap();
        let id = registry.add(scratch().with_env("dev")).unwrap().id;

        let reloaded = ConnectionRegistry::new(storage, PoolSettings::default(), None).unwrap();
        let descriptor = reloaded.get(id).unwrap();
        assert_eq!(descriptor.env, "dev");
        assert_eq!(descriptor.kind, BackendKind::Sqlite);
    }

    #[tokio::test]
    async fn test_terminate_all_is_idempotent() {
        let registry = registry();
        let a = registry.add(scratch()).unwrap().id;
        let b = registry.add(scratch()).unwrap().id;
        let handle_a = registry.resolve(a).await.unwrap();
        registry.resolve(b).await.unwrap();

        let first = registry.terminate_all().await;
        assert_eq!(first.closed, 2);
        assert!(first.is_clean());
        assert!(handle_a.is_closed());

        let second = registry.terminate_all().await;
        assert_eq!(second, TerminationReport::default());

        let err = registry.resolve(a).await.err().unwrap();
        assert_eq!(err.category(), "Connect");
    }

    #[tokio::test]
    async fn test_resolve_waiting_on_shutdown_opens_nothing() {
        let registry = Arc::new(registry());
        let id = registry.add(scratch()).unwrap().id;

        // Hold the handle map so resolve passes its first check and then waits
        let guard = registry.handles.lock().await;
        let resolver = Arc::clone(&registry);
        let pending = tokio::spawn(async move { resolver.resolve(id).await });
        tokio::time::sleep(Duration::from_millis(50)).await;

        registry.terminated.store(true, Ordering::SeqCst);
        drop(guard);

        let err = pending.await.unwrap().err().unwrap();
        assert_eq!(err.category(), "Connect");
        assert!(registry.open_handle_ids().await.is_empty());
    }

    #[tokio::test]
    async fn test_statement_timeout_is_execute_failure() {
        let storage = Arc::new(LocalStorage::open_in_memory().unwrap());
        let registry = ConnectionRegistry::new(
            storage,
            PoolSettings::default(),
            Some(Duration::from_millis(100)),
        )
        .unwrap();
        let id = registry.add(scratch()).unwrap().id;

        let sql = "WITH RECURSIVE c(x) AS (SELECT 1 UNION ALL SELECT x + 1 FROM c) SELECT count(*) FROM c";
        let err = registry.execute_query(id, sql, &[]).await.unwrap_err();
        assert_eq!(err.category(), "Execute");
        assert!(err.to_string().contains("timed out"));
        assert!(registry.active_query_ids().is_empty());

        // The handle is still usable afterwards
        assert!(registry.execute(id, "SELECT 1", &[]).await.ok);
    }

    #[tokio::test]
    async fn test_per_connection_timeout_overrides_default() {
        let registry = registry();
        let options = ConnectionOptions { statement_timeout_secs: Some(5), ..Default::default() };
        let id = registry.add(scratch().with_options(options)).unwrap().id;

        assert_eq!(registry.statement_timeout_for(id), Some(Duration::from_secs(5)));
        assert_eq!(registry.statement_timeout_for(Uuid::new_v4()), None);
    }

    #[tokio::test]
    async fn test_cancel_running_query() {
        let registry = Arc::new(registry());
        let id = registry.add(scratch()).unwrap().id;

        let runner = Arc::clone(&registry);
        let task = tokio::spawn(async move {
            let sql = "WITH RECURSIVE c(x) AS (SELECT 1 UNION ALL SELECT x + 1 FROM c) SELECT count(*) FROM c";
            runner.execute_query(id, sql, &[]).await
        });

        let query_id = loop {
            if let Some(query_id) = registry.active_query_ids().first().copied() {
                break query_id;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        };
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(registry.cancel_query(query_id));

        let err = task.await.unwrap().unwrap_err();
        assert!(err.is_cancelled());
        assert!(!registry.cancel_query(query_id));
    }

    #[tokio::test]
    async fn test_test_connection() {
        let registry = registry();
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("probe.sqlite3");

        let ok = ConnectionDescriptor::sqlite("probe", path.to_string_lossy());
        registry.test_connection(&ok).await.unwrap();

        let missing_dir = dir.path().join("nope").join("probe.sqlite3");
        let bad = ConnectionDescriptor::sqlite("probe", missing_dir.to_string_lossy());
        let err = registry.test_connection(&bad).await.unwrap_err();
        assert_eq!(err.category(), "Connect");

        // Nothing is registered by a test
        assert!(registry.descriptors().is_empty());
    }

    #[test]
    fn test_parse_connection_id() {
        let id = Uuid::new_v4();
        assert_eq!(parse_connection_id(&id.to_string()).unwrap(), id);

        let err = parse_connection_id("pg-prod").unwrap_err();
        assert!(err.is_not_found());
        assert_eq!(err.to_string(), "Connection not found: pg-prod");
    }
}
