//! Saved connection descriptors.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Database engine behind a saved connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    /// PostgreSQL server, pooled via deadpool-postgres
    #[default]
    Postgres,
    /// Embedded SQLite database file
    Sqlite,
}

impl BackendKind {
    /// Convert to string representation for storage.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Postgres => "postgres",
            Self::Sqlite => "sqlite",
        }
    }

    /// Parse from string representation.
    pub fn parse(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "postgres" | "postgresql" | "pg" => Some(Self::Postgres),
            "sqlite" | "sqlite3" => Some(Self::Sqlite),
            _ => None,
        }
    }
}

impl std::fmt::Display for BackendKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Additional connection options.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectionOptions {
    /// Connection timeout in seconds
    pub connect_timeout_secs: u32,
    /// Statement timeout in seconds (None = workspace default)
    pub statement_timeout_secs: Option<u32>,
    /// Application name sent to PostgreSQL
    pub application_name: String,
}

impl Default for ConnectionOptions {
    fn default() -> Self {
        Self {
            connect_timeout_secs: 10,
            statement_timeout_secs: None,
            application_name: "dbmx".to_string(),
        }
    }
}

/// Saved, non-live configuration for reaching a database.
///
/// Every backend kind shares this shape. For [`BackendKind::Sqlite`] the
/// `database` field holds the file path (or `:memory:`) and the network
/// fields are left empty.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectionDescriptor {
    /// Unique identifier
    pub id: Uuid,
    /// Display name (1-255 chars)
    pub name: String,
    /// Backend tag selecting the handle implementation
    pub kind: BackendKind,
    /// Server hostname or IP
    pub host: String,
    /// Server port
    pub port: u16,
    /// Login username
    pub username: String,
    /// Login password, held in memory and in the local metadata store only
    #[serde(skip_serializing, default)]
    pub password: String,
    /// Database name, or file path for embedded databases
    pub database: String,
    /// Free-form environment label ("prod", "dev", ...)
    pub env: String,
    /// UI accent colour (hex format, e.g., "#FF5733")
    pub colour: Option<String>,
    /// Additional options
    pub options: ConnectionOptions,
}

impl ConnectionDescriptor {
    /// Create a PostgreSQL descriptor with required fields.
    pub fn postgres(
        name: impl Into<String>,
        host: impl Into<String>,
        database: impl Into<String>,
        username: impl Into<String>,
        password: impl Into<String>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            name: name.into(),
            kind: BackendKind::Postgres,
            host: host.into(),
            port: 5432,
            username: username.into(),
            password: password.into(),
            database: database.into(),
            env: String::new(),
            colour: None,
            options: ConnectionOptions::default(),
        }
    }

    /// Create an embedded SQLite descriptor for a file path.
    pub fn sqlite(name: impl Into<String>, path: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            name: name.into(),
            kind: BackendKind::Sqlite,
            host: String::new(),
            port: 0,
            username: String::new(),
            password: String::new(),
            database: path.into(),
            env: String::new(),
            colour: None,
            options: ConnectionOptions::default(),
        }
    }

    /// Set the port.
    pub fn with_port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    /// Set the environment label.
    pub fn with_env(mut self, env: impl Into<String>) -> Self {
        self.env = env.into();
        self
    }

    /// Set the UI colour.
    pub fn with_colour(mut self, colour: impl Into<String>) -> Self {
        self.colour = Some(colour.into());
        self
    }

    /// Set connection options.
    pub fn with_options(mut self, options: ConnectionOptions) -> Self {
        self.options = options;
        self
    }

    /// Validate the descriptor.
    pub fn validate(&self) -> Result<(), String> {
        if self.name.is_empty() || self.name.len() > 255 {
            return Err("Name must be 1-255 characters".to_string());
        }
        match self.kind {
            BackendKind::Postgres => {
                if self.host.is_empty() {
                    return Err("Host is required".to_string());
                }
                if self.port == 0 {
                    return Err("Port must be between 1 and 65535".to_string());
                }
                if self.database.is_empty() || self.database.len() > 63 {
                    return Err("Database name must be 1-63 characters".to_string());
                }
                if self.username.is_empty() {
                    return Err("Username is required".to_string());
                }
            }
            BackendKind::Sqlite => {
                if self.database.is_empty() {
                    return Err("Database file path is required".to_string());
                }
            }
        }
        if let Some(ref colour) = self.colour {
            if !colour.starts_with('#') || colour.len() != 7 {
                return Err("Colour must be in hex format (#RRGGBB)".to_string());
            }
        }
        Ok(())
    }

    /// Get the display connection string (without password).
    pub fn display_url(&self) -> String {
        match self.kind {
            BackendKind::Postgres => format!(
                "postgresql://{}@{}:{}/{}",
                self.username, self.host, self.port, self.database
            ),
            BackendKind::Sqlite => format!("sqlite://{}", self.database),
        }
    }
}

impl std::fmt::Debug for ConnectionDescriptor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionDescriptor")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("kind", &self.kind)
            .field("host", &self.host)
            .field("port", &self.port)
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .field("database", &self.database)
            .field("env", &self.env)
            .field("colour", &self.colour)
            .field("options", &self.options)
            .finish()
    }
}
