//! Persistence layer: libSQL-backed activity log and processed ledger.

pub mod libsql_backend;
pub mod migrations;
pub mod traits;

pub use libsql_backend::LibSqlBackend;
pub use traits::{ActivityCounts, ActivityEntry, ActivityStatus, Database, ProcessedRecord};
