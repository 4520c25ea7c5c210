//! Session and transaction lifecycle.
//!
//! # Responsibility
//! - Open, route, begin, commit/rollback and close engine sessions bound to
//!   a `StoreContext`.
//! - Keep the connection leak registry in step with context-held sessions.
//! - Provide a scoped unit-of-work wrapper for read and write operations.
//!
//! # Invariants
//! - A context holds either both a session and a transaction, or neither.
//!   An inconsistent pair is reported and left untouched by `begin`.
//! - `begin_transaction` is reentrant: if the context already holds a
//!   session it returns `false` and does nothing.
//! - `end_transaction` clears both context slots before touching the engine,
//!   always closes the session, and deregisters the physical connection
//!   before commit/rollback.
//! - Re-routing a held session keeps its registry record pointing at the
//!   physical connection the session ends up on.

pub mod registry;

use crate::context::StoreContext;
use crate::engine::{Session, SessionFactory, SessionId};
use crate::error::{StoreError, StoreResult};
use crate::router::DatabaseRouter;
use log::{debug, error, warn};
use once_cell::sync::OnceCell;
use std::sync::Arc;
use std::time::{Duration, Instant};
use uuid::Uuid;

pub use registry::{ConnectionRecord, ConnectionRegistry, PoolId};

/// Builds the session factory on first use.
pub type FactorySource = Box<dyn Fn() -> StoreResult<Arc<dyn SessionFactory>> + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionMode {
    /// A real engine transaction was begun.
    Explicit,
    /// The session runs statement by statement; commit and rollback are
    /// no-ops.
    Autocommit,
}

/// Unit of work bound to a context-held session.
#[derive(Debug, Clone)]
pub struct TransactionHandle {
    id: Uuid,
    session: SessionId,
    pool: PoolId,
    mode: TransactionMode,
    started_at: Instant,
}

impl TransactionHandle {
    fn new(session: SessionId, pool: PoolId, mode: TransactionMode) -> Self {
        Self {
            id: Uuid::new_v4(),
            session,
            pool,
            mode,
            started_at: Instant::now(),
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn session_id(&self) -> SessionId {
        self.session
    }

    /// Factory the session was opened from.
    pub fn pool(&self) -> PoolId {
        self.pool
    }

    pub fn mode(&self) -> TransactionMode {
        self.mode
    }

    pub fn elapsed(&self) -> Duration {
        self.started_at.elapsed()
    }
}

/// Outcome of a best-effort cleanup.
#[derive(Debug, Default)]
pub struct CleanupReport {
    /// Whether a dangling session or transaction had to be ended.
    pub ended_transaction: bool,
    /// Errors logged and swallowed during cleanup.
    pub swallowed: Vec<StoreError>,
}

impl CleanupReport {
    pub fn is_clean(&self) -> bool {
        !self.ended_transaction && self.swallowed.is_empty()
    }
}

pub struct TransactionManager {
    factory_source: FactorySource,
    factory: OnceCell<Arc<dyn SessionFactory>>,
    router: DatabaseRouter,
    registry: ConnectionRegistry,
    capture_call_sites: bool,
}

impl TransactionManager {
    pub fn new(factory_source: FactorySource, router: DatabaseRouter) -> Self {
        Self {
            factory_source,
            factory: OnceCell::new(),
            router,
            registry: ConnectionRegistry::new(),
            capture_call_sites: false,
        }
    }

    /// Records the opener's stack trace with every registered connection.
    pub fn capture_call_sites(mut self, enabled: bool) -> Self {
        self.capture_call_sites = enabled;
        self
    }

    /// Builds the session factory once per process lifetime of the manager.
    ///
    /// Returns `true` only for the call that performed the build. Concurrent
    /// callers block until it is done; a failed build is retried by the next
    /// caller.
    pub fn init_factory(&self) -> StoreResult<bool> {
        let mut built = false;
        self.factory.get_or_try_init(|| {
            built = true;
            let factory = (self.factory_source)()?;
            debug!(
                "event=factory_init module=session status=ok product={}",
                factory.product().name()
            );
            Ok::<_, StoreError>(factory)
        })?;
        Ok(built)
    }

    pub fn factory(&self) -> Option<&Arc<dyn SessionFactory>> {
        self.factory.get()
    }

    pub fn router(&self) -> &DatabaseRouter {
        &self.router
    }

    pub fn registry(&self) -> &ConnectionRegistry {
        &self.registry
    }

    /// Opens, routes and begins a session for `ctx` unless it already holds
    /// one.
    ///
    /// `factory` overrides the manager's own factory. With
    /// `with_transaction == false` no engine transaction is begun and the
    /// session runs in autocommit mode.
    ///
    /// # Errors
    /// - `NotInitialized` when no factory is available.
    /// - `SwitchDatabase` when routing to the context tenant fails.
    /// - `Engine` when opening the session or beginning fails.
    ///
    /// The freshly opened session is closed before any error is returned.
    pub fn begin_transaction(
        &self,
        factory: Option<&Arc<dyn SessionFactory>>,
        with_transaction: bool,
        ctx: &mut StoreContext,
    ) -> StoreResult<bool> {
        let has_session = ctx.has_session();
        let has_transaction = ctx.transaction().is_some();
        if has_session != has_transaction {
            warn!(
                "event=tx_begin module=session status=inconsistent session={} transaction={}",
                has_session, has_transaction
            );
            return Ok(false);
        }
        if has_session {
            return Ok(false);
        }

        let factory = match factory {
            Some(factory) => Arc::clone(factory),
            None => Arc::clone(self.factory.get().ok_or(StoreError::NotInitialized)?),
        };
        let mut session = factory
            .open_session()
            .map_err(StoreError::engine("open_session"))?;

        if let Err(err) = self.router.set_database(session.as_mut(), ctx) {
            close_quietly(session);
            return Err(err);
        }

        let mode = if with_transaction {
            TransactionMode::Explicit
        } else {
            TransactionMode::Autocommit
        };
        if mode == TransactionMode::Explicit {
            if let Err(source) = session.begin() {
                close_quietly(session);
                return Err(StoreError::Engine {
                    operation: "begin",
                    source,
                });
            }
        }

        let pool = PoolId::of(&factory);
        let handle = TransactionHandle::new(session.id(), pool, mode);
        let physical = session.physical_connection();
        debug!(
            "event=tx_begin module=session status=ok session={} mode={:?} tenant={}",
            handle.session_id(),
            mode,
            ctx.tenant().unwrap_or("-")
        );
        ctx.set_session(Some(session));
        ctx.set_transaction(Some(handle));
        if let Some(physical) = physical {
            self.registry
                .register(pool, physical, ctx.request_url(), self.capture_call_sites);
        }
        Ok(true)
    }

    /// Routes the context-held session to `tenant`.
    ///
    /// `None` routes back to the main tenant. When the engine moves the
    /// session to another physical connection, the registry record follows.
    ///
    /// # Errors
    /// - `NoActiveSession` when the context holds no session.
    /// - `SwitchDatabase` when the engine refuses the switch, e.g. inside an
    ///   open transaction on catalog-per-file engines.
    pub(crate) fn reroute(&self, ctx: &mut StoreContext, tenant: Option<&str>) -> StoreResult<()> {
        let pool = ctx.transaction().map(TransactionHandle::pool);
        let request_url = ctx.request_url().map(str::to_string);
        let tenant = tenant.unwrap_or(self.router.main_tenant());
        let session = active_session(ctx)?;
        let before = session.physical_connection();
        self.router.route(session, Some(tenant))?;
        let after = session.physical_connection();

        let Some(pool) = pool else {
            return Ok(());
        };
        if before == after {
            return Ok(());
        }
        if let Some(before) = before {
            self.registry.deregister(pool, before);
        }
        if let Some(after) = after {
            self.registry.register(
                pool,
                after,
                request_url.as_deref(),
                self.capture_call_sites,
            );
        }
        debug!(
            "event=connection_reroute module=session status=ok tenant={} from={} to={}",
            tenant,
            before.map_or_else(|| "-".to_string(), |id| id.to_string()),
            after.map_or_else(|| "-".to_string(), |id| id.to_string())
        );
        Ok(())
    }

    /// Ends the context's unit of work and closes its session.
    ///
    /// Does nothing when the context holds no session. Both context slots
    /// are empty on return, whatever the outcome.
    ///
    /// # Errors
    /// Returns the commit/rollback failure if any, otherwise the close
    /// failure.
    pub fn end_transaction(&self, ctx: &mut StoreContext, commit: bool) -> StoreResult<()> {
        let session = ctx.take_session();
        let transaction = ctx.take_transaction();
        let Some(mut session) = session else {
            return Ok(());
        };

        let mut outcome = Ok(());
        if let Some(transaction) = transaction {
            self.pre_close_session(session.as_ref(), transaction.pool());
            if transaction.mode() == TransactionMode::Explicit {
                let (operation, result) = if commit {
                    ("commit", session.commit())
                } else {
                    ("rollback", session.rollback())
                };
                debug!(
                    "event=tx_end module=session status={} session={} operation={} elapsed_ms={}",
                    if result.is_ok() { "ok" } else { "error" },
                    transaction.session_id(),
                    operation,
                    transaction.elapsed().as_millis()
                );
                outcome = result.map_err(StoreError::engine(operation));
            }
        }

        let closed = session.close().map_err(StoreError::engine("close_session"));
        match (outcome, closed) {
            (Err(err), Err(close_err)) => {
                warn!(
                    "event=session_close module=session status=error error={}",
                    close_err
                );
                Err(err)
            }
            (Err(err), Ok(())) => Err(err),
            (Ok(()), closed) => closed,
        }
    }

    fn pre_close_session(&self, session: &dyn Session, pool: PoolId) {
        let Some(physical) = session.physical_connection() else {
            return;
        };
        if let Some(record) = self.registry.deregister(pool, physical) {
            debug!(
                "event=connection_release module=session status=ok connection={} held_ms={}",
                physical,
                crate::model::document::now_epoch_ms() - record.opened_at
            );
        }
    }

    /// Rolls back and closes whatever the context still holds.
    ///
    /// Never fails; errors are logged and collected in the report.
    pub fn clean_up(&self, ctx: &mut StoreContext) -> CleanupReport {
        let mut report = CleanupReport::default();
        if !ctx.has_session() && ctx.transaction().is_none() {
            return report;
        }
        warn!(
            "event=cleanup module=session status=dangling tenant={} request_url={}",
            ctx.tenant().unwrap_or("-"),
            ctx.request_url().unwrap_or("-")
        );
        report.ended_transaction = true;
        if let Err(err) = self.end_transaction(ctx, false) {
            warn!("event=cleanup module=session status=error error={}", err);
            report.swallowed.push(err);
        }
        report
    }

    /// Cleans up `ctx` and shuts the factory down.
    pub fn shutdown(&self, ctx: &mut StoreContext) -> CleanupReport {
        let mut report = self.clean_up(ctx);
        if let Some(factory) = self.factory.get() {
            if let Err(source) = factory.shutdown() {
                warn!("event=shutdown module=session status=error error={}", source);
                report.swallowed.push(StoreError::Engine {
                    operation: "shutdown",
                    source,
                });
            }
        }
        report
    }

    /// Runs `action` inside a unit of work.
    ///
    /// When `with_transaction` is set and the context holds no session, a
    /// transaction is begun before and ended after `action`: committed when
    /// `commit` is set and `action` succeeded, rolled back otherwise. An
    /// already open transaction is reused and left to its owner.
    pub fn execute<T, F>(
        &self,
        ctx: &mut StoreContext,
        with_transaction: bool,
        commit: bool,
        action: F,
    ) -> StoreResult<T>
    where
        F: FnOnce(&mut StoreContext) -> StoreResult<T>,
    {
        let began = if with_transaction {
            self.begin_transaction(None, true, ctx)?
        } else {
            false
        };
        let result = action(ctx);
        if !began {
            return result;
        }
        match self.end_transaction(ctx, commit && result.is_ok()) {
            Ok(()) => result,
            Err(err) if result.is_ok() => Err(err),
            Err(err) => {
                error!(
                    "event=tx_end module=session status=error after_failure=true error={}",
                    err
                );
                result
            }
        }
    }

    pub fn execute_read<T, F>(
        &self,
        ctx: &mut StoreContext,
        with_transaction: bool,
        action: F,
    ) -> StoreResult<T>
    where
        F: FnOnce(&mut StoreContext) -> StoreResult<T>,
    {
        self.execute(ctx, with_transaction, false, action)
    }

    pub fn execute_write<T, F>(
        &self,
        ctx: &mut StoreContext,
        with_transaction: bool,
        action: F,
    ) -> StoreResult<T>
    where
        F: FnOnce(&mut StoreContext) -> StoreResult<T>,
    {
        self.execute(ctx, with_transaction, true, action)
    }

    /// Number of physical connections held by contexts right now.
    pub fn open_connections(&self) -> usize {
        self.registry.len()
    }
}

/// The context-held session, for code running inside a unit of work.
pub(crate) fn active_session(ctx: &mut StoreContext) -> StoreResult<&mut (dyn Session + 'static)> {
    ctx.session_mut().ok_or(StoreError::NoActiveSession)
}

fn close_quietly(session: Box<dyn Session>) {
    if let Err(err) = session.close() {
        warn!("event=session_close module=session status=error error={}", err);
    }
}
