//! Local SQLite metadata store.
//!
//! Holds workspace tabs and saved connection descriptors.
//!
//! # Data Directory Locations
//!
//! - **macOS**: `~/Library/Application Support/dev.dbmx.Dbmx`
//! - **Windows**: `%APPDATA%\dbmx\Dbmx`
//! - **Linux**: `~/.local/share/dbmx`
//! - **Debug builds**: `./dbmx_data` in current directory

use crate::error::{DbmxError, Result};
use crate::models::{BackendKind, ConnectionDescriptor, ConnectionOptions};

use chrono::Utc;
use parking_lot::{Mutex, MutexGuard};
use rusqlite::{params, Connection, OptionalExtension};
use std::path::{Path, PathBuf};
use uuid::Uuid;

/// File name of the metadata database inside the data directory.
pub const METADATA_DB_FILE: &str = "dbmx.db";

/// Get the default data directory for the application.
///
/// Debug builds use `./dbmx_data` in the current directory.
pub fn default_data_dir() -> PathBuf {
    #[cfg(debug_assertions)]
    {
        PathBuf::from("./dbmx_data")
    }

    #[cfg(not(debug_assertions))]
    {
        dirs::data_dir()
            .map(|d| {
                #[cfg(target_os = "macos")]
                {
                    d.join("dev.dbmx.Dbmx")
                }
                #[cfg(target_os = "windows")]
                {
                    d.join("dbmx").join("Dbmx")
                }
                #[cfg(not(any(target_os = "macos", target_os = "windows")))]
                {
                    d.join("dbmx")
                }
            })
            .unwrap_or_else(|| PathBuf::from("./dbmx_data"))
    }
}

/// Initialize the data directory, creating it if needed.
pub fn init_data_dir(path: &Path) -> Result<()> {
    if path.exists() {
        if !path.is_dir() {
            return Err(DbmxError::storage(
                format!("Data path exists but is not a directory: {}", path.display()),
                Some("Select a different location or remove the existing file"),
            ));
        }
        return Ok(());
    }

    std::fs::create_dir_all(path).map_err(|e| {
        DbmxError::storage(
            format!("Failed to create data directory '{}': {}", path.display(), e),
            Some("Check permissions or select a different location"),
        )
    })?;

    tracing::info!(path = %path.display(), "Created data directory");
    Ok(())
}

/// SQLite-based metadata storage.
///
/// Thread-safe via internal Mutex. Every statement runs against the one
/// connection, so callers observe operations in the order they were issued.
pub struct LocalStorage {
    /// Thread-safe SQLite connection
    connection: Mutex<Connection>,
    /// Database file path (None for in-memory stores)
    db_path: Option<PathBuf>,
}

impl LocalStorage {
    /// Open or create the metadata store in the given data directory.
    pub fn open(data_dir: &Path) -> Result<Self> {
        init_data_dir(data_dir)?;
        Self::open_with_path(data_dir.join(METADATA_DB_FILE))
    }

    /// Open storage at a specific database path.
    pub fn open_with_path(db_path: PathBuf) -> Result<Self> {
        let connection = Connection::open(&db_path).map_err(|e| {
            DbmxError::storage(
                format!("Failed to open database '{}': {}", db_path.display(), e),
                Some("The database file may be corrupted. Try deleting it to start fresh."),
            )
        })?;

        Self::configure_connection(&connection)?;

        let storage = Self { connection: Mutex::new(connection), db_path: Some(db_path) };
        storage.run_migrations()?;

        tracing::info!(path = ?storage.db_path, "Metadata store opened");
        Ok(storage)
    }

    /// Open a private in-memory store (for tests and ephemeral sessions).
    pub fn open_in_memory() -> Result<Self> {
        let connection = Connection::open_in_memory().map_err(|e| {
            DbmxError::storage(format!("Failed to open in-memory database: {e}"), None)
        })?;

        Self::configure_connection(&connection)?;

        let storage = Self { connection: Mutex::new(connection), db_path: None };
        storage.run_migrations()?;

        tracing::debug!("In-memory metadata store opened");
        Ok(storage)
    }

    /// Configure SQLite connection pragmas.
    fn configure_connection(conn: &Connection) -> Result<()> {
        conn.execute_batch(
            "
            PRAGMA journal_mode = WAL;
            PRAGMA synchronous = NORMAL;
            PRAGMA busy_timeout = 5000;
            PRAGMA temp_store = MEMORY;
            ",
        )
        .map_err(|e| DbmxError::storage(format!("Failed to configure database: {e}"), None))
    }

    /// Bootstrap the schema hosting tabs and saved connections.
    fn run_migrations(&self) -> Result<()> {
        const DOMAIN: &str = "core";
        let conn = self.connection.lock();

        conn.execute(
            "CREATE TABLE IF NOT EXISTS migrations (
                domain TEXT NOT NULL,
                step INTEGER NOT NULL,
                migration TEXT NOT NULL,
                PRIMARY KEY(domain, step)
            ) STRICT",
            [],
        )
        .map_err(|e| DbmxError::storage(format!("Failed to create migrations table: {e}"), None))?;

        let current_step: i64 = conn
            .query_row(
                "SELECT COALESCE(MAX(step), 0) FROM migrations WHERE domain = ?",
                [DOMAIN],
                |row| row.get(0),
            )
            .map_err(|e| DbmxError::storage(format!("Failed to read migrations: {e}"), None))?;

        if current_step < 1 {
            conn.execute_batch(
                "
                -- Workspace tabs; active_db_* is a weak reference with no foreign key
                CREATE TABLE tabs (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    name TEXT NOT NULL,
                    editor TEXT NOT NULL DEFAULT '',
                    output TEXT NOT NULL DEFAULT '',
                    is_active INTEGER NOT NULL DEFAULT 0,
                    active_db_id TEXT,
                    active_db TEXT,
                    active_db_colour TEXT
                ) STRICT;

                -- Saved connection descriptors
                CREATE TABLE connections (
                    connection_id TEXT PRIMARY KEY,
                    name TEXT NOT NULL,
                    kind TEXT NOT NULL DEFAULT 'postgres',
                    host TEXT NOT NULL DEFAULT '',
                    port INTEGER NOT NULL DEFAULT 5432,
                    username TEXT NOT NULL DEFAULT '',
                    password TEXT NOT NULL DEFAULT '',
                    database_name TEXT NOT NULL,
                    env TEXT NOT NULL DEFAULT '',
                    colour TEXT,
                    connect_timeout_secs INTEGER NOT NULL DEFAULT 10,
                    statement_timeout_secs INTEGER,
                    application_name TEXT NOT NULL DEFAULT 'dbmx',
                    created_at TEXT NOT NULL,
                    updated_at TEXT NOT NULL,
                    last_connected_at TEXT
                ) STRICT;

                CREATE INDEX idx_tabs_active ON tabs(is_active);
                ",
            )
            .map_err(|e| DbmxError::storage(format!("Migration 1 failed: {e}"), None))?;

            conn.execute(
                "INSERT INTO migrations (domain, step, migration) VALUES (?, 1, 'initial_schema')",
                [DOMAIN],
            )
            .map_err(|e| DbmxError::storage(format!("Failed to record migration: {e}"), None))?;

            tracing::info!("Applied migration 1: initial_schema");
        }

        Ok(())
    }

    /// Get the database file path, if file-backed.
    pub fn db_path(&self) -> Option<&Path> {
        self.db_path.as_deref()
    }

    /// Lock the underlying connection for a sequence of statements.
    pub(crate) fn lock(&self) -> MutexGuard<'_, Connection> {
        self.connection.lock()
    }

    // ========== Connection Descriptor Operations ==========

    /// Save (insert or update) a connection descriptor.
    pub fn save_connection(&self, descriptor: &ConnectionDescriptor) -> Result<()> {
        let conn = self.connection.lock();
        let now = Utc::now().to_rfc3339();

        conn.execute(
            "INSERT INTO connections (
                connection_id, name, kind, host, port, username, password,
                database_name, env, colour, connect_timeout_secs,
                statement_timeout_secs, application_name, created_at, updated_at
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?14)
            ON CONFLICT(connection_id) DO UPDATE SET
                name = excluded.name,
                kind = excluded.kind,
                host = excluded.host,
                port = excluded.port,
                username = excluded.username,
                password = excluded.password,
                database_name = excluded.database_name,
                env = excluded.env,
                colour = excluded.colour,
                connect_timeout_secs = excluded.connect_timeout_secs,
                statement_timeout_secs = excluded.statement_timeout_secs,
                application_name = excluded.application_name,
                updated_at = excluded.updated_at",
            params![
                descriptor.id.to_string(),
                descriptor.name,
                descriptor.kind.as_str(),
                descriptor.host,
                descriptor.port,
                descriptor.username,
                descriptor.password,
                descriptor.database,
                descriptor.env,
                descriptor.colour,
                descriptor.options.connect_timeout_secs,
                descriptor.options.statement_timeout_secs,
                descriptor.options.application_name,
                now,
            ],
        )
        .map_err(|e| DbmxError::storage(format!("Failed to save connection: {e}"), None))?;

        tracing::debug!(connection_id = %descriptor.id, name = %descriptor.name, "Connection saved");
        Ok(())
    }

    /// Load a connection descriptor by ID.
    pub fn load_connection(&self, id: Uuid) -> Result<Option<ConnectionDescriptor>> {
        let conn = self.connection.lock();

        let row = conn
            .query_row(
                "SELECT connection_id, name, kind, host, port, username, password,
                        database_name, env, colour, connect_timeout_secs,
                        statement_timeout_secs, application_name
                 FROM connections WHERE connection_id = ?",
                [id.to_string()],
                ConnectionRow::from_row,
            )
            .optional()
            .map_err(|e| DbmxError::storage(format!("Failed to load connection: {e}"), None))?;

        row.map(ConnectionRow::into_descriptor).transpose()
    }

    /// Load all saved connection descriptors.
    pub fn load_all_connections(&self) -> Result<Vec<ConnectionDescriptor>> {
        let conn = self.connection.lock();

        let mut stmt = conn
            .prepare(
                "SELECT connection_id, name, kind, host, port, username, password,
                        database_name, env, colour, connect_timeout_secs,
                        statement_timeout_secs, application_name
                 FROM connections ORDER BY last_connected_at DESC NULLS LAST, name",
            )
            .map_err(|e| DbmxError::storage(format!("Failed to prepare query: {e}"), None))?;

        let rows = stmt
            .query_map([], ConnectionRow::from_row)
            .map_err(|e| DbmxError::storage(format!("Failed to query connections: {e}"), None))?;

        let mut descriptors = Vec::new();
        for row_result in rows {
            let row = row_result
                .map_err(|e| DbmxError::storage(format!("Failed to read row: {e}"), None))?;
            descriptors.push(row.into_descriptor()?);
        }

        Ok(descriptors)
    }

    /// Delete a connection descriptor. Returns whether a row was removed.
    ///
    /// Tabs referencing the connection are left untouched.
    pub fn delete_connection(&self, id: Uuid) -> Result<bool> {
        let conn = self.connection.lock();

        let deleted = conn
            .execute("DELETE FROM connections WHERE connection_id = ?", [id.to_string()])
            .map_err(|e| DbmxError::storage(format!("Failed to delete connection: {e}"), None))?;

        tracing::debug!(connection_id = %id, deleted, "Connection deleted");
        Ok(deleted > 0)
    }

    /// Update the last connected timestamp.
    pub fn update_last_connected(&self, id: Uuid) -> Result<()> {
        let conn = self.connection.lock();
        let now = Utc::now().to_rfc3339();

        conn.execute(
            "UPDATE connections SET last_connected_at = ? WHERE connection_id = ?",
            params![now, id.to_string()],
        )
        .map_err(|e| DbmxError::storage(format!("Failed to update last_connected: {e}"), None))?;

        Ok(())
    }
}

/// Internal struct for reading connection rows.
struct ConnectionRow {
    id: String,
    name: String,
    kind: String,
    host: String,
    port: u16,
    username: String,
    password: String,
    database: String,
    env: String,
    colour: Option<String>,
    connect_timeout_secs: u32,
    statement_timeout_secs: Option<u32>,
    application_name: String,
}

impl ConnectionRow {
    fn from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            name: row.get(1)?,
            kind: row.get(2)?,
            host: row.get(3)?,
            port: row.get(4)?,
            username: row.get(5)?,
            password: row.get(6)?,
            database: row.get(7)?,
            env: row.get(8)?,
            colour: row.get(9)?,
            connect_timeout_secs: row.get(10)?,
            statement_timeout_secs: row.get(11)?,
            application_name: row.get(12)?,
        })
    }

    fn into_descriptor(self) -> Result<ConnectionDescriptor> {
        let id = Uuid::parse_str(&self.id)
            .map_err(|e| DbmxError::storage(format!("Invalid connection ID: {e}"), None))?;
        let kind = BackendKind::parse(&self.kind).ok_or_else(|| {
            DbmxError::storage(format!("Unknown backend kind '{}'", self.kind), None)
        })?;

        Ok(ConnectionDescriptor {
            id,
            name: self.name,
            kind,
            host: self.host,
            port: self.port,
            username: self.username,
            password: self.password,
            database: self.database,
            env: self.env,
            colour: self.colour,
            options: ConnectionOptions {
                connect_timeout_secs: self.connect_timeout_secs,
                statement_timeout_secs: self.statement_timeout_secs,
                application_name: self.application_name,
            },
        })
    }
}
