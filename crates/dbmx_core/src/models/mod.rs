//! Data models for the dbmx workspace core.
//!
//! - `tab` - Tab, Output, ConnectionRef, DeleteOutcome
//! - `connection` - ConnectionDescriptor, BackendKind, ConnectionOptions
//! - `query` - QueryHandle, QueryResult, StatementOutcome, QueryType
//! - `response` - GenericResponse envelope

pub mod connection;
pub mod query;
pub mod response;
pub mod tab;

pub use connection::{BackendKind, ConnectionDescriptor, ConnectionOptions};
pub use query::{QueryHandle, QueryResult, QueryType, StatementOutcome};
pub use response::GenericResponse;
pub use tab::{ConnectionRef, DeleteOutcome, Output, Tab, DEFAULT_TAB_NAME};
