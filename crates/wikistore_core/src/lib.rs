//! Transactional storage core for a multi-tenant wiki.
//! Sessions, tenant routing, schema synchronization and revision archives.

pub mod archive;
pub mod config;
pub mod context;
pub mod engine;
pub mod error;
pub mod logging;
pub mod model;
pub mod router;
pub mod schema;
pub mod session;
pub mod store;

pub use archive::{ArchiveKey, ArchiveState, DocumentArchive, Revision, Version, VersionedDocument};
pub use config::{StoreSettings, TenantConfig};
pub use context::StoreContext;
pub use engine::{DatabaseProduct, EngineError, Session, SessionFactory};
pub use error::{StoreError, StoreResult};
pub use logging::{default_log_level, init_logging, logging_status};
pub use model::document::Document;
pub use router::DatabaseRouter;
pub use schema::{ClassMapping, ColumnType, SchemaUpdateReport};
pub use session::{CleanupReport, ConnectionRecord, TransactionManager, TransactionMode};
pub use store::WikiStore;

/// Returns the core crate version.
pub fn core_version() -> &'static str {
    env!("CARGO_PKG_VERSION")
}
