//! Schema synchronization: logical mapping, diff and execution.

pub mod diff;
pub mod mapping;
pub mod sync;

pub use diff::generate_update_script;
pub use mapping::{
    ClassMapping, ClassMappingBuilder, ColumnMapping, ColumnType, SchemaMapping, TableMapping,
};
pub use sync::{FailedStatement, SchemaSynchronizer, SchemaUpdateReport};
