//! Backend services for the dbmx workspace core.
//!
//! - `storage` - Local SQLite metadata store (tabs and saved connections)
//! - `tabs` - Tab state machine over the metadata store
//! - `connection` - The `DatabaseHandle` capability and backend dispatch
//! - `postgres` / `sqlite` - Handle implementations per backend kind
//! - `query` - Statement execution with cancellation and timeouts
//! - `registry` - Saved connections and their live handles

pub mod connection;
pub mod postgres;
pub mod query;
pub mod registry;
pub mod sqlite;
pub mod storage;
pub mod tabs;

pub use connection::{open_handle, DatabaseHandle, PoolSettings};
pub use postgres::PostgresHandle;
pub use query::QueryService;
pub use registry::{parse_connection_id, ConnectionRegistry, TerminationReport};
pub use sqlite::SqliteHandle;
pub use storage::LocalStorage;
pub use tabs::TabService;
