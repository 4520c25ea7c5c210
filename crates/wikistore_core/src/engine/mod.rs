//! Relational engine seams consumed by the store.
//!
//! # Responsibility
//! - Define the session/connection capabilities the store relies on.
//! - Keep engine-specific behavior (catalogs, schema statements, column
//!   types) behind `DatabaseProduct` and the `Session` trait.
//!
//! # Invariants
//! - A `Session` owns at most one physical connection at a time.
//! - `physical_connection()` reports the pooled connection behind the
//!   session, never the session's own identity.
//!
//! # See also
//! - `engine::sqlite` for the bundled backend.

use std::collections::{BTreeMap, BTreeSet};
use std::error::Error;
use std::fmt::{Display, Formatter};
use uuid::Uuid;

pub mod sqlite;
#[cfg(test)]
pub(crate) mod testing;

pub type EngineResult<T> = Result<T, EngineError>;

/// Low-level failure reported by an engine implementation.
///
/// Never returned from the public store API directly; callers see it only
/// as the `source()` of a `StoreError`.
#[derive(Debug)]
pub enum EngineError {
    Sqlite(rusqlite::Error),
    Io(std::io::Error),
    UnknownDatabase(String),
    InvalidDatabaseName(String),
    InTransaction,
    Closed,
    Unsupported(String),
}

impl Display for EngineError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Sqlite(err) => write!(f, "{err}"),
            Self::Io(err) => write!(f, "{err}"),
            Self::UnknownDatabase(name) => write!(f, "database does not exist: {name}"),
            Self::InvalidDatabaseName(name) => write!(f, "invalid database name `{name}`"),
            Self::InTransaction => write!(f, "operation not allowed inside an open transaction"),
            Self::Closed => write!(f, "session or pool is closed"),
            Self::Unsupported(message) => write!(f, "unsupported operation: {message}"),
        }
    }
}

impl Error for EngineError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            Self::Sqlite(err) => Some(err),
            Self::Io(err) => Some(err),
            _ => None,
        }
    }
}

impl From<rusqlite::Error> for EngineError {
    fn from(value: rusqlite::Error) -> Self {
        Self::Sqlite(value)
    }
}

impl From<std::io::Error> for EngineError {
    fn from(value: std::io::Error) -> Self {
        Self::Io(value)
    }
}

/// Identity of one session handle (the wrapper, not the connection).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SessionId(pub Uuid);

impl SessionId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for SessionId {
    fn default() -> Self {
        Self::new()
    }
}

impl Display for SessionId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Identity of one physical connection inside a pool.
///
/// Stable for the lifetime of the connection, so a connection recycled to
/// another session reports the same id again.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PhysicalConnectionId(pub u64);

impl Display for PhysicalConnectionId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "conn-{}", self.0)
    }
}

/// How an engine isolates tenants.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TenantSwitch {
    /// A session-scoped statement selects the current schema.
    SchemaStatement,
    /// The connection catalog is switched.
    Catalog,
}

/// Database products the store knows how to route and map.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DatabaseProduct {
    Sqlite,
    MySql,
    PostgreSql,
    Oracle,
    Derby,
    Hsqldb,
    Unknown,
}

impl DatabaseProduct {
    /// Maps a driver-reported product name to a known product.
    pub fn from_product_name(name: &str) -> Self {
        let normalized = name.trim().to_ascii_lowercase();
        if normalized.contains("sqlite") {
            Self::Sqlite
        } else if normalized.contains("mysql") || normalized.contains("mariadb") {
            Self::MySql
        } else if normalized.contains("postgres") {
            Self::PostgreSql
        } else if normalized.contains("oracle") {
            Self::Oracle
        } else if normalized.contains("derby") {
            Self::Derby
        } else if normalized.contains("hsql") {
            Self::Hsqldb
        } else {
            Self::Unknown
        }
    }

    pub fn tenant_switch(self) -> TenantSwitch {
        match self {
            Self::Oracle | Self::Derby | Self::Hsqldb => TenantSwitch::SchemaStatement,
            Self::Sqlite | Self::MySql | Self::PostgreSql | Self::Unknown => TenantSwitch::Catalog,
        }
    }

    /// Whether tenants live in schemas of one database rather than in
    /// separate databases.
    pub fn models_tenants_as_schemas(self) -> bool {
        self.tenant_switch() == TenantSwitch::SchemaStatement
    }

    /// Statement selecting `schema` for the rest of the session.
    pub fn schema_statement(self, schema: &str) -> Option<String> {
        match self {
            Self::Oracle => Some(format!("alter session set current_schema = {schema}")),
            Self::Derby | Self::Hsqldb => Some(format!("SET SCHEMA {schema}")),
            _ => None,
        }
    }

    /// Schema name used for the main tenant, when the product has a fixed one.
    pub fn main_schema(self) -> Option<&'static str> {
        match self {
            Self::Derby => Some("APP"),
            Self::Hsqldb => Some("PUBLIC"),
            _ => None,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            Self::Sqlite => "sqlite",
            Self::MySql => "mysql",
            Self::PostgreSql => "postgresql",
            Self::Oracle => "oracle",
            Self::Derby => "derby",
            Self::Hsqldb => "hsqldb",
            Self::Unknown => "unknown",
        }
    }
}

/// Live table metadata as introspected from the engine.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LiveSchema {
    tables: BTreeMap<String, BTreeSet<String>>,
}

impl LiveSchema {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records one table and its columns. Names compare case-insensitively.
    pub fn add_table<I, S>(&mut self, table: &str, columns: I)
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let entry = self.tables.entry(table.to_ascii_lowercase()).or_default();
        entry.extend(columns.into_iter().map(|c| c.as_ref().to_ascii_lowercase()));
    }

    pub fn has_table(&self, table: &str) -> bool {
        self.tables.contains_key(&table.to_ascii_lowercase())
    }

    pub fn has_column(&self, table: &str, column: &str) -> bool {
        self.tables
            .get(&table.to_ascii_lowercase())
            .is_some_and(|columns| columns.contains(&column.to_ascii_lowercase()))
    }

    pub fn table_names(&self) -> impl Iterator<Item = &str> {
        self.tables.keys().map(String::as_str)
    }
}

/// Source of new sessions, typically backed by a connection pool.
pub trait SessionFactory: Send + Sync {
    fn product(&self) -> DatabaseProduct;
    fn open_session(&self) -> EngineResult<Box<dyn Session>>;
    /// Closes pooled resources. Sessions opened afterwards fail.
    fn shutdown(&self) -> EngineResult<()>;
}

/// One unit-of-work handle over a physical connection.
pub trait Session: Send {
    fn id(&self) -> SessionId;
    fn product(&self) -> DatabaseProduct;

    /// Unwraps the physical connection currently held by this session.
    ///
    /// Returns `None` when the session holds no connection, e.g. after the
    /// engine released it on commit.
    fn physical_connection(&self) -> Option<PhysicalConnectionId>;

    fn begin(&mut self) -> EngineResult<()>;
    fn commit(&mut self) -> EngineResult<()>;
    fn rollback(&mut self) -> EngineResult<()>;
    fn close(self: Box<Self>) -> EngineResult<()>;

    /// Runs one statement on a statement handle scoped to the call.
    fn execute(&mut self, sql: &str) -> EngineResult<usize>;

    fn catalog(&mut self) -> EngineResult<Option<String>>;
    fn set_catalog(&mut self, catalog: &str) -> EngineResult<()>;

    /// Schema selected by the last schema statement, when the session
    /// tracks it. `None` means unknown.
    fn current_schema(&mut self) -> EngineResult<Option<String>> {
        Ok(None)
    }

    /// Introspects tables visible to the session, optionally limited to `schema`.
    fn live_schema(&mut self, schema: Option<&str>) -> EngineResult<LiveSchema>;

    fn load_archive(&mut self, full_name: &str) -> EngineResult<Option<String>>;
    /// Inserts an archive row unless one exists. Returns whether a row was created.
    fn insert_archive_if_absent(&mut self, full_name: &str, archive: &str) -> EngineResult<bool>;
    fn save_archive(&mut self, full_name: &str, archive: &str) -> EngineResult<()>;
}
