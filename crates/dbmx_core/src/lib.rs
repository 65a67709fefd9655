//! Workspace state core for the dbmx SQL client.
//!
//! - **error**: Error taxonomy shared by every component
//! - **models**: Tabs, cached outputs, connection descriptors, response envelope
//! - **services**: Metadata store, tab state machine, connection registry, backends
//! - **state**: Process-level workspace and its configuration
//! - **logging**: Structured logging setup

pub mod error;
pub mod logging;
pub mod models;
pub mod services;
pub mod state;

pub use error::{DbmxError, ErrorInfo, Result};
pub use models::{
    BackendKind, ConnectionDescriptor, ConnectionOptions, ConnectionRef, DeleteOutcome,
    GenericResponse, Output, QueryHandle, QueryResult, QueryType, StatementOutcome, Tab,
};
pub use services::{
    ConnectionRegistry, DatabaseHandle, LocalStorage, PoolSettings, QueryService, TabService,
    TerminationReport,
};
pub use state::{Workspace, WorkspaceConfig};
