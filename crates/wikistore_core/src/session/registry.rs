//! Leak-tracking registry of physical connections.
//!
//! # Invariants
//! - A record exists exactly while a context-held session owns the
//!   physical connection it names.
//! - Records are removed before the owning transaction commits or rolls
//!   back, because the engine may hand the connection to another session
//!   right after.
//! - Connection ids are only unique within one pool, so records are keyed
//!   by pool and id.

use crate::engine::{PhysicalConnectionId, SessionFactory};
use crate::model::document::now_epoch_ms;
use log::warn;
use parking_lot::RwLock;
use std::backtrace::Backtrace;
use std::collections::HashMap;
use std::fmt::{Display, Formatter};
use std::sync::Arc;

/// Identity of the factory (pool) a connection was checked out from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PoolId(pub usize);

impl PoolId {
    pub fn of(factory: &Arc<dyn SessionFactory>) -> Self {
        Self(Arc::as_ptr(factory) as *const () as usize)
    }
}

impl Display for PoolId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "pool-{:x}", self.0)
    }
}

/// Diagnostic metadata about one open physical connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionRecord {
    pub pool: PoolId,
    pub connection: PhysicalConnectionId,
    /// Unix epoch milliseconds.
    pub opened_at: i64,
    /// Captured stack trace of the opener, when enabled.
    pub call_site: Option<String>,
    pub request_url: Option<String>,
}

#[derive(Debug, Default)]
pub struct ConnectionRegistry {
    records: RwLock<HashMap<(PoolId, PhysicalConnectionId), ConnectionRecord>>,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(
        &self,
        pool: PoolId,
        connection: PhysicalConnectionId,
        request_url: Option<&str>,
        capture_call_site: bool,
    ) {
        let record = ConnectionRecord {
            pool,
            connection,
            opened_at: now_epoch_ms(),
            call_site: capture_call_site.then(|| Backtrace::force_capture().to_string()),
            request_url: request_url.map(str::to_string),
        };
        let previous = self.records.write().insert((pool, connection), record);
        if let Some(previous) = previous {
            warn!(
                "event=connection_register module=session status=leak pool={} connection={} opened_at={} request_url={}",
                pool,
                connection,
                previous.opened_at,
                previous.request_url.as_deref().unwrap_or("-")
            );
        }
    }

    pub fn deregister(
        &self,
        pool: PoolId,
        connection: PhysicalConnectionId,
    ) -> Option<ConnectionRecord> {
        self.records.write().remove(&(pool, connection))
    }

    pub fn contains(&self, pool: PoolId, connection: PhysicalConnectionId) -> bool {
        self.records.read().contains_key(&(pool, connection))
    }

    pub fn len(&self) -> usize {
        self.records.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.read().is_empty()
    }

    /// Snapshot of all records, ordered by pool then connection id.
    pub fn records(&self) -> Vec<ConnectionRecord> {
        let mut records: Vec<_> = self.records.read().values().cloned().collect();
        records.sort_by_key(|record| (record.pool, record.connection));
        records
    }

    /// Records opened more than `max_age_ms` ago; likely leaks.
    pub fn older_than(&self, max_age_ms: i64) -> Vec<ConnectionRecord> {
        let cutoff = now_epoch_ms() - max_age_ms;
        self.records()
            .into_iter()
            .filter(|record| record.opened_at < cutoff)
            .collect()
    }
}
