//! In-memory engine that records every call, for unit tests.

use super::{
    DatabaseProduct, EngineError, EngineResult, LiveSchema, PhysicalConnectionId, Session,
    SessionFactory, SessionId,
};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

/// Calls that fail while set.
#[derive(Debug, Clone, Copy, Default)]
pub(crate) struct Failures {
    pub begin: bool,
    pub commit: bool,
    pub rollback: bool,
    pub execute: bool,
}

type Hook = Box<dyn Fn() + Send + Sync>;

struct Shared {
    product: DatabaseProduct,
    log: Mutex<Vec<String>>,
    failures: Mutex<Failures>,
    on_commit: Mutex<Option<Hook>>,
    live: Mutex<LiveSchema>,
    archives: Mutex<HashMap<String, String>>,
    next_connection: AtomicU64,
    opened: AtomicUsize,
    closed: AtomicUsize,
}

#[derive(Clone)]
pub(crate) struct RecordingFactory {
    shared: Arc<Shared>,
}

impl RecordingFactory {
    pub fn new(product: DatabaseProduct) -> Self {
        Self {
            shared: Arc::new(Shared {
                product,
                log: Mutex::new(Vec::new()),
                failures: Mutex::new(Failures::default()),
                on_commit: Mutex::new(None),
                live: Mutex::new(LiveSchema::new()),
                archives: Mutex::new(HashMap::new()),
                next_connection: AtomicU64::new(1),
                opened: AtomicUsize::new(0),
                closed: AtomicUsize::new(0),
            }),
        }
    }

    pub fn fail(&self, failures: Failures) {
        *self.shared.failures.lock() = failures;
    }

    pub fn on_commit(&self, hook: impl Fn() + Send + Sync + 'static) {
        *self.shared.on_commit.lock() = Some(Box::new(hook));
    }

    pub fn set_live_schema(&self, live: LiveSchema) {
        *self.shared.live.lock() = live;
    }

    pub fn log(&self) -> Vec<String> {
        self.shared.log.lock().clone()
    }

    /// SQL passed to `execute`, in call order.
    pub fn statements(&self) -> Vec<String> {
        self.log()
            .into_iter()
            .filter_map(|entry| entry.strip_prefix("execute:").map(str::to_string))
            .collect()
    }

    pub fn opened(&self) -> usize {
        self.shared.opened.load(Ordering::SeqCst)
    }

    pub fn closed(&self) -> usize {
        self.shared.closed.load(Ordering::SeqCst)
    }
}

impl SessionFactory for RecordingFactory {
    fn product(&self) -> DatabaseProduct {
        self.shared.product
    }

    fn open_session(&self) -> EngineResult<Box<dyn Session>> {
        self.shared.opened.fetch_add(1, Ordering::SeqCst);
        let connection = self.shared.next_connection.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(RecordingSession {
            id: SessionId::new(),
            shared: Arc::clone(&self.shared),
            connection: PhysicalConnectionId(connection),
            catalog: "main".to_string(),
            schema: None,
        }))
    }

    fn shutdown(&self) -> EngineResult<()> {
        self.shared.log.lock().push("shutdown".to_string());
        Ok(())
    }
}

struct RecordingSession {
    id: SessionId,
    shared: Arc<Shared>,
    connection: PhysicalConnectionId,
    catalog: String,
    schema: Option<String>,
}

impl RecordingSession {
    fn record(&self, entry: impl Into<String>) {
        self.shared.log.lock().push(entry.into());
    }

    fn forced(&self, failing: bool, call: &str) -> EngineResult<()> {
        if failing {
            return Err(EngineError::Unsupported(format!("forced {call} failure")));
        }
        Ok(())
    }
}

impl Session for RecordingSession {
    fn id(&self) -> SessionId {
        self.id
    }

    fn product(&self) -> DatabaseProduct {
        self.shared.product
    }

    fn physical_connection(&self) -> Option<PhysicalConnectionId> {
        Some(self.connection)
    }

    fn begin(&mut self) -> EngineResult<()> {
        self.record("begin");
        self.forced(self.shared.failures.lock().begin, "begin")
    }

    fn commit(&mut self) -> EngineResult<()> {
        if let Some(hook) = self.shared.on_commit.lock().as_ref() {
            hook();
        }
        self.record("commit");
        self.forced(self.shared.failures.lock().commit, "commit")
    }

    fn rollback(&mut self) -> EngineResult<()> {
        self.record("rollback");
        self.forced(self.shared.failures.lock().rollback, "rollback")
    }

    fn close(self: Box<Self>) -> EngineResult<()> {
        self.record("close");
        self.shared.closed.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn execute(&mut self, sql: &str) -> EngineResult<usize> {
        self.record(format!("execute:{sql}"));
        self.forced(self.shared.failures.lock().execute, "execute")?;
        let selected = sql
            .strip_prefix("alter session set current_schema = ")
            .or_else(|| sql.strip_prefix("SET SCHEMA "));
        if let Some(schema) = selected {
            self.schema = Some(schema.to_string());
        }
        Ok(0)
    }

    fn catalog(&mut self) -> EngineResult<Option<String>> {
        Ok(Some(self.catalog.clone()))
    }

    fn set_catalog(&mut self, catalog: &str) -> EngineResult<()> {
        self.record(format!("set_catalog:{catalog}"));
        self.catalog = catalog.to_string();
        Ok(())
    }

    fn current_schema(&mut self) -> EngineResult<Option<String>> {
        Ok(self.schema.clone())
    }

    fn live_schema(&mut self, schema: Option<&str>) -> EngineResult<LiveSchema> {
        self.record(format!("live_schema:{}", schema.unwrap_or("-")));
        Ok(self.shared.live.lock().clone())
    }

    fn load_archive(&mut self, full_name: &str) -> EngineResult<Option<String>> {
        Ok(self.shared.archives.lock().get(full_name).cloned())
    }

    fn insert_archive_if_absent(&mut self, full_name: &str, archive: &str) -> EngineResult<bool> {
        let mut archives = self.shared.archives.lock();
        if archives.contains_key(full_name) {
            return Ok(false);
        }
        archives.insert(full_name.to_string(), archive.to_string());
        Ok(true)
    }

    fn save_archive(&mut self, full_name: &str, archive: &str) -> EngineResult<()> {
        self.shared
            .archives
            .lock()
            .insert(full_name.to_string(), archive.to_string());
        Ok(())
    }
}
