//! Process-level workspace state.
//!
//! A [`Workspace`] is constructed once by the shell that owns the process
//! lifecycle and torn down with [`Workspace::shutdown`]. Tests build
//! independent instances with [`Workspace::in_memory`].

use crate::error::{DbmxError, Result};
use crate::models::GenericResponse;
use crate::services::registry::{parse_connection_id, TerminationReport};
use crate::services::{ConnectionRegistry, LocalStorage, PoolSettings, TabService};

use serde_json::Value as JsonValue;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Overrides the data directory.
pub const DATA_DIR_ENV: &str = "DBMX_DATA_DIR";
/// Default statement timeout in seconds; `0` disables it.
pub const STATEMENT_TIMEOUT_ENV: &str = "DBMX_STATEMENT_TIMEOUT_SECS";

const DEFAULT_STATEMENT_TIMEOUT: Duration = Duration::from_secs(300);

/// Workspace configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkspaceConfig {
    /// Directory holding the metadata store
    pub data_dir: PathBuf,
    /// Directory for rolling log files
    pub log_dir: PathBuf,
    /// Statement timeout for connections that do not set their own
    pub statement_timeout: Option<Duration>,
    /// Pool sizing for pooled backends
    pub pool: PoolSettings,
    /// Worker threads for the async runtime
    pub worker_threads: usize,
}

impl Default for WorkspaceConfig {
    fn default() -> Self {
        Self::with_data_dir(crate::services::storage::default_data_dir())
    }
}

impl WorkspaceConfig {
    /// Configuration rooted at a data directory; logs go in `logs/` below it.
    pub fn with_data_dir(data_dir: PathBuf) -> Self {
        Self {
            log_dir: data_dir.join("logs"),
            data_dir,
            statement_timeout: Some(DEFAULT_STATEMENT_TIMEOUT),
            pool: PoolSettings::default(),
            worker_threads: 2,
        }
    }

    /// Build configuration from the process environment.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build configuration from an arbitrary variable lookup.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let mut config = match lookup(DATA_DIR_ENV).filter(|v| !v.trim().is_empty()) {
            Some(dir) => Self::with_data_dir(PathBuf::from(dir)),
            None => Self::default(),
        };

        if let Some(raw) = lookup(STATEMENT_TIMEOUT_ENV) {
            let secs: u64 = raw.trim().parse().map_err(|_| {
                DbmxError::config(format!(
                    "{STATEMENT_TIMEOUT_ENV} must be a whole number of seconds, got '{raw}'"
                ))
            })?;
            config.statement_timeout = (secs > 0).then(|| Duration::from_secs(secs));
        }

        Ok(config)
    }
}

/// Central workspace state: metadata store, tabs, connections and runtime.
pub struct Workspace {
    storage: Arc<LocalStorage>,
    tabs: TabService,
    registry: ConnectionRegistry,
    config: WorkspaceConfig,
    /// Tokio runtime for database operations
    runtime: tokio::runtime::Runtime,
    shut_down: AtomicBool,
}

impl Workspace {
    /// Open the workspace described by `config`.
    pub fn new(config: WorkspaceConfig) -> Result<Self> {
        let storage = LocalStorage::open(&config.data_dir)?;
        let workspace = Self::with_storage(config, storage)?;
        tracing::info!(data_dir = %workspace.config.data_dir.display(), "Workspace opened");
        Ok(workspace)
    }

    /// A throwaway workspace over an in-memory metadata store.
    pub fn in_memory() -> Result<Self> {
        Self::with_storage(WorkspaceConfig::default(), LocalStorage::open_in_memory()?)
    }

    fn with_storage(config: WorkspaceConfig, storage: LocalStorage) -> Result<Self> {
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(config.worker_threads.max(1))
            .enable_all()
            .build()
            .map_err(|e| DbmxError::internal(format!("Failed to create tokio runtime: {e}")))?;

        let storage = Arc::new(storage);
        let tabs = TabService::new(Arc::clone(&storage));
        let registry =
            ConnectionRegistry::new(Arc::clone(&storage), config.pool, config.statement_timeout)?;

        Ok(Self { storage, tabs, registry, config, runtime, shut_down: AtomicBool::new(false) })
    }

    // ========== Accessors ==========

    /// The tab state machine.
    pub fn tabs(&self) -> &TabService {
        &self.tabs
    }

    /// The connection registry.
    pub fn registry(&self) -> &ConnectionRegistry {
        &self.registry
    }

    /// The metadata store.
    pub fn storage(&self) -> &LocalStorage {
        &self.storage
    }

    /// The configuration the workspace was opened with.
    pub fn config(&self) -> &WorkspaceConfig {
        &self.config
    }

    /// Block on a future using the workspace runtime.
    ///
    /// Must not be called from inside an async context.
    pub fn block_on<F, T>(&self, future: F) -> T
    where
        F: std::future::Future<Output = T>,
    {
        self.runtime.block_on(future)
    }

    /// Spawn a future on the workspace runtime.
    pub fn spawn<F, T>(&self, future: F) -> tokio::task::JoinHandle<T>
    where
        F: std::future::Future<Output = T> + Send + 'static,
        T: Send + 'static,
    {
        self.runtime.spawn(future)
    }

    // ========== Operations ==========

    /// Run a statement on the connection a tab references and cache the result.
    ///
    /// Every failure, including a tab without a connection or a dangling
    /// reference, comes back as an `ok = false` envelope.
    pub async fn run_tab_query(
        &self,
        tab_id: i64,
        sql: &str,
        params: &[JsonValue],
    ) -> GenericResponse {
        match self.try_run_tab_query(tab_id, sql, params).await {
            Ok(response) => response,
            Err(err) => {
                if err.is_expected() {
                    tracing::debug!(tab_id, error = %err, "Tab query failed");
                } else {
                    tracing::warn!(tab_id, error = %err, "Tab query failed");
                }
                GenericResponse::from_error(&err)
            }
        }
    }

    async fn try_run_tab_query(
        &self,
        tab_id: i64,
        sql: &str,
        params: &[JsonValue],
    ) -> Result<GenericResponse> {
        let reference = self.tabs.connection_reference(tab_id)?;
        let raw_id = reference
            .id
            .ok_or_else(|| DbmxError::connection_not_found(format!("(tab {tab_id} has none)")))?;
        let connection_id = parse_connection_id(&raw_id)?;

        let result = self.registry.execute_query(connection_id, sql, params).await?;
        self.tabs.save_tab_output(tab_id, &result.to_output())?;

        Ok(GenericResponse::from_result(&result))
    }

    /// Close every open connection. Only the first call does any work.
    pub fn shutdown(&self) -> TerminationReport {
        if self.shut_down.swap(true, Ordering::SeqCst) {
            return TerminationReport::default();
        }

        let report = self.runtime.block_on(self.registry.terminate_all());
        if !report.is_clean() {
            tracing::warn!(failed = report.failures.len(), "Some connections failed to close");
        }
        report
    }
}
