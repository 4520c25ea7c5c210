//! SQLite engine backend with one database file per tenant.
//!
//! # Responsibility
//! - Pool physical SQLite connections per tenant database.
//! - Implement `Session` over a pooled connection, switching tenants by
//!   swapping the connection's catalog (database file).
//!
//! # Invariants
//! - Every pooled connection has `foreign_keys=ON` and a busy timeout.
//! - A connection is returned to the pool as soon as its transaction ends;
//!   connections never re-enter the pool with an open transaction.
//! - Catalog switches are refused while a transaction is open.

use super::{
    DatabaseProduct, EngineError, EngineResult, LiveSchema, PhysicalConnectionId, Session,
    SessionFactory, SessionId,
};
use log::{debug, info, warn};
use once_cell::sync::Lazy;
use parking_lot::Mutex;
use regex::Regex;
use rusqlite::{params, Connection, OpenFlags, OptionalExtension};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

const DATABASE_FILE_EXTENSION: &str = "sqlite3";

static DATABASE_NAME_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[A-Za-z0-9_]{1,64}$").expect("valid database name regex"));

/// Options for the SQLite backend.
#[derive(Debug, Clone)]
pub struct SqliteOptions {
    /// Directory holding one `<database>.sqlite3` file per tenant.
    pub data_dir: PathBuf,
    /// Database opened by fresh sessions before any routing.
    pub main_database: String,
    pub busy_timeout: Duration,
    /// When false, routing to a database whose file is missing fails.
    pub create_missing: bool,
}

impl SqliteOptions {
    pub fn new(data_dir: impl Into<PathBuf>, main_database: impl Into<String>) -> Self {
        Self {
            data_dir: data_dir.into(),
            main_database: main_database.into(),
            busy_timeout: Duration::from_secs(5),
            create_missing: true,
        }
    }
}

struct PooledConnection {
    id: PhysicalConnectionId,
    database: String,
    conn: Connection,
    created_at: Instant,
}

struct SqlitePool {
    options: SqliteOptions,
    idle: Mutex<HashMap<String, Vec<PooledConnection>>>,
    next_id: AtomicU64,
    closed: AtomicBool,
}

impl SqlitePool {
    fn checkout(&self, database: &str) -> EngineResult<PooledConnection> {
        if self.closed.load(Ordering::Acquire) {
            return Err(EngineError::Closed);
        }
        if !DATABASE_NAME_RE.is_match(database) {
            return Err(EngineError::InvalidDatabaseName(database.to_string()));
        }

        let reused = self
            .idle
            .lock()
            .get_mut(database)
            .and_then(|connections| connections.pop());
        match reused {
            Some(pooled) => Ok(pooled),
            None => self.connect(database),
        }
    }

    fn connect(&self, database: &str) -> EngineResult<PooledConnection> {
        let path = self
            .options
            .data_dir
            .join(format!("{database}.{DATABASE_FILE_EXTENSION}"));
        let may_create = self.options.create_missing || database == self.options.main_database;
        if !may_create && !path.exists() {
            return Err(EngineError::UnknownDatabase(database.to_string()));
        }

        std::fs::create_dir_all(&self.options.data_dir)?;
        let mut flags = OpenFlags::default();
        if !may_create {
            flags.remove(OpenFlags::SQLITE_OPEN_CREATE);
        }
        let conn = Connection::open_with_flags(&path, flags)?;
        conn.execute_batch("PRAGMA foreign_keys = ON;")?;
        conn.busy_timeout(self.options.busy_timeout)?;

        let id = PhysicalConnectionId(self.next_id.fetch_add(1, Ordering::Relaxed) + 1);
        debug!(
            "event=db_connect module=engine status=ok connection={} database={}",
            id, database
        );
        Ok(PooledConnection {
            id,
            database: database.to_string(),
            conn,
            created_at: Instant::now(),
        })
    }

    fn checkin(&self, pooled: PooledConnection) {
        if !pooled.conn.is_autocommit() {
            // A failed COMMIT can leave the transaction open.
            if let Err(err) = pooled.conn.execute_batch("ROLLBACK;") {
                warn!(
                    "event=db_checkin module=engine status=error connection={} error={}",
                    pooled.id, err
                );
                return;
            }
        }
        if self.closed.load(Ordering::Acquire) {
            return;
        }
        self.idle
            .lock()
            .entry(pooled.database.clone())
            .or_default()
            .push(pooled);
    }

    fn idle_count(&self) -> usize {
        self.idle.lock().values().map(Vec::len).sum()
    }
}

/// Session factory over a per-tenant SQLite connection pool.
#[derive(Clone)]
pub struct SqliteSessionFactory {
    pool: Arc<SqlitePool>,
}

impl SqliteSessionFactory {
    pub fn new(options: SqliteOptions) -> EngineResult<Self> {
        if !DATABASE_NAME_RE.is_match(&options.main_database) {
            return Err(EngineError::InvalidDatabaseName(options.main_database));
        }
        std::fs::create_dir_all(&options.data_dir)?;
        info!(
            "event=pool_open module=engine status=ok data_dir={} main_database={}",
            options.data_dir.display(),
            options.main_database
        );
        Ok(Self {
            pool: Arc::new(SqlitePool {
                options,
                idle: Mutex::new(HashMap::new()),
                next_id: AtomicU64::new(0),
                closed: AtomicBool::new(false),
            }),
        })
    }

    /// Number of connections currently parked in the pool.
    pub fn idle_connections(&self) -> usize {
        self.pool.idle_count()
    }
}

impl SessionFactory for SqliteSessionFactory {
    fn product(&self) -> DatabaseProduct {
        DatabaseProduct::Sqlite
    }

    fn open_session(&self) -> EngineResult<Box<dyn Session>> {
        let database = self.pool.options.main_database.clone();
        let pooled = self.pool.checkout(&database)?;
        Ok(Box::new(SqliteSession {
            id: SessionId::new(),
            pool: Arc::clone(&self.pool),
            database,
            conn: Some(pooled),
            in_transaction: false,
        }))
    }

    fn shutdown(&self) -> EngineResult<()> {
        self.pool.closed.store(true, Ordering::Release);
        let drained: usize = self.pool.idle.lock().drain().map(|(_, c)| c.len()).sum();
        info!(
            "event=pool_close module=engine status=ok closed_connections={}",
            drained
        );
        Ok(())
    }
}

/// Session over one pooled SQLite connection.
pub struct SqliteSession {
    id: SessionId,
    pool: Arc<SqlitePool>,
    database: String,
    conn: Option<PooledConnection>,
    in_transaction: bool,
}

impl SqliteSession {
    fn connection(&mut self) -> EngineResult<&Connection> {
        if self.conn.is_none() {
            self.conn = Some(self.pool.checkout(&self.database)?);
        }
        match self.conn.as_ref() {
            Some(pooled) => Ok(&pooled.conn),
            None => Err(EngineError::Closed),
        }
    }

    fn release(&mut self) {
        if let Some(pooled) = self.conn.take() {
            debug!(
                "event=db_release module=engine status=ok connection={} age_ms={}",
                pooled.id,
                pooled.created_at.elapsed().as_millis()
            );
            self.pool.checkin(pooled);
        }
    }

    fn finish(&mut self, sql: &str) -> EngineResult<()> {
        if !self.in_transaction {
            return Ok(());
        }
        self.in_transaction = false;
        let result = self
            .connection()
            .and_then(|conn| conn.execute_batch(sql).map_err(EngineError::from));
        // Connections go back to the pool as soon as the transaction ends.
        self.release();
        result
    }
}

impl Session for SqliteSession {
    fn id(&self) -> SessionId {
        self.id
    }

    fn product(&self) -> DatabaseProduct {
        DatabaseProduct::Sqlite
    }

    fn physical_connection(&self) -> Option<PhysicalConnectionId> {
        self.conn.as_ref().map(|pooled| pooled.id)
    }

    fn begin(&mut self) -> EngineResult<()> {
        if self.in_transaction {
            return Err(EngineError::InTransaction);
        }
        self.connection()?.execute_batch("BEGIN IMMEDIATE;")?;
        self.in_transaction = true;
        Ok(())
    }

    fn commit(&mut self) -> EngineResult<()> {
        self.finish("COMMIT;")
    }

    fn rollback(&mut self) -> EngineResult<()> {
        self.finish("ROLLBACK;")
    }

    fn close(mut self: Box<Self>) -> EngineResult<()> {
        let result = self.rollback();
        self.release();
        result
    }

    fn execute(&mut self, sql: &str) -> EngineResult<usize> {
        let conn = self.connection()?;
        let mut stmt = conn.prepare(sql)?;
        let changed = stmt.execute([])?;
        Ok(changed)
    }

    fn catalog(&mut self) -> EngineResult<Option<String>> {
        Ok(Some(self.database.clone()))
    }

    fn set_catalog(&mut self, catalog: &str) -> EngineResult<()> {
        if catalog == self.database {
            return Ok(());
        }
        if self.in_transaction {
            return Err(EngineError::InTransaction);
        }
        let next = self.pool.checkout(catalog)?;
        self.release();
        self.conn = Some(next);
        self.database = catalog.to_string();
        Ok(())
    }

    fn live_schema(&mut self, _schema: Option<&str>) -> EngineResult<LiveSchema> {
        let conn = self.connection()?;
        let mut tables_stmt = conn.prepare(
            "SELECT name
             FROM sqlite_master
             WHERE type = 'table'
               AND name NOT LIKE 'sqlite_%'
             ORDER BY name;",
        )?;
        let table_names = tables_stmt
            .query_map([], |row| row.get::<_, String>(0))?
            .collect::<Result<Vec<_>, _>>()?;

        let mut live = LiveSchema::new();
        for table in table_names {
            let mut columns_stmt = conn.prepare(&format!("PRAGMA table_info(\"{table}\");"))?;
            let mut rows = columns_stmt.query([])?;
            let mut columns = Vec::new();
            while let Some(row) = rows.next()? {
                columns.push(row.get::<_, String>(1)?);
            }
            live.add_table(&table, columns);
        }
        Ok(live)
    }

    fn load_archive(&mut self, full_name: &str) -> EngineResult<Option<String>> {
        let archive = self
            .connection()?
            .query_row(
                "SELECT archive FROM wikiarchive WHERE fullname = ?1;",
                [full_name],
                |row| row.get::<_, String>(0),
            )
            .optional()?;
        Ok(archive)
    }

    fn insert_archive_if_absent(&mut self, full_name: &str, archive: &str) -> EngineResult<bool> {
        let changed = self.connection()?.execute(
            "INSERT INTO wikiarchive (fullname, archive, updated_at)
             VALUES (?1, ?2, (strftime('%s', 'now') * 1000))
             ON CONFLICT(fullname) DO NOTHING;",
            params![full_name, archive],
        )?;
        Ok(changed == 1)
    }

    fn save_archive(&mut self, full_name: &str, archive: &str) -> EngineResult<()> {
        self.connection()?.execute(
            "INSERT INTO wikiarchive (fullname, archive, updated_at)
             VALUES (?1, ?2, (strftime('%s', 'now') * 1000))
             ON CONFLICT(fullname) DO UPDATE SET
                archive = excluded.archive,
                updated_at = excluded.updated_at;",
            params![full_name, archive],
        )?;
        Ok(())
    }
}

impl Drop for SqliteSession {
    fn drop(&mut self) {
        if self.in_transaction {
            self.in_transaction = false;
            if let Some(pooled) = self.conn.as_ref() {
                let _ = pooled.conn.execute_batch("ROLLBACK;");
            }
        }
        self.release();
    }
}
