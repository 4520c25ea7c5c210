//! `WikiStore` facade.
//!
//! # Responsibility
//! - Compose the transaction manager, router, schema synchronizer and
//!   archive store behind one entry point.
//! - Initialize lazily: the session factory is built on first use and each
//!   tenant's schema is synchronized on that tenant's first use.
//!
//! # Invariants
//! - The factory is built at most once per store.
//! - Automatic schema synchronization succeeds at most once per tenant; its
//!   failure is logged, does not fail the operation and is retried on the
//!   tenant's next use.

use crate::archive::{ArchiveStore, DocumentArchive, Version, VersionedDocument};
use crate::config::{StoreSettings, TenantConfig};
use crate::context::StoreContext;
use crate::engine::sqlite::{SqliteOptions, SqliteSessionFactory};
use crate::engine::{DatabaseProduct, SessionFactory};
use crate::error::{StoreError, StoreResult};
use crate::model::document::Document;
use crate::router::DatabaseRouter;
use crate::schema::{ClassMapping, SchemaMapping, SchemaSynchronizer, SchemaUpdateReport};
use crate::session::{CleanupReport, ConnectionRecord, FactorySource, TransactionManager};
use log::{debug, error, info};
use once_cell::sync::OnceCell;
use parking_lot::Mutex;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

pub struct WikiStore {
    transactions: TransactionManager,
    schema: SchemaSynchronizer,
    archives: ArchiveStore,
    initialized: OnceCell<()>,
    synced_tenants: Mutex<HashSet<String>>,
}

impl WikiStore {
    /// Builds a store backed by one SQLite file per tenant under
    /// `settings.data_dir`.
    ///
    /// Nothing is opened until the first operation.
    pub fn open(settings: StoreSettings) -> StoreResult<Self> {
        settings.validate()?;
        let router = DatabaseRouter::new(settings.virtual_mode, settings.main_tenant.clone());
        let mut options = SqliteOptions::new(
            settings.data_dir.clone(),
            router.schema_name(&settings.main_tenant, DatabaseProduct::Sqlite),
        );
        options.busy_timeout = Duration::from_millis(settings.busy_timeout_ms);
        options.create_missing = settings.create_missing_databases;

        let source: FactorySource = Box::new(move || {
            let factory = SqliteSessionFactory::new(options.clone())
                .map_err(StoreError::engine("open_pool"))?;
            Ok(Arc::new(factory) as Arc<dyn SessionFactory>)
        });
        let config = Arc::new(settings.clone());
        Ok(Self::from_parts(&settings, config, source))
    }

    /// Builds a store over any engine.
    pub fn from_parts(
        settings: &StoreSettings,
        config: Arc<dyn TenantConfig>,
        factory_source: FactorySource,
    ) -> Self {
        let router = DatabaseRouter::new(settings.virtual_mode, settings.main_tenant.clone());
        Self {
            transactions: TransactionManager::new(factory_source, router)
                .capture_call_sites(settings.capture_call_sites),
            schema: SchemaSynchronizer::new(SchemaMapping::core(), config),
            archives: ArchiveStore::new(settings.main_tenant.clone()),
            initialized: OnceCell::new(),
            synced_tenants: Mutex::new(HashSet::new()),
        }
    }

    pub fn transactions(&self) -> &TransactionManager {
        &self.transactions
    }

    pub fn archives(&self) -> &ArchiveStore {
        &self.archives
    }

    /// Builds the session factory once per store and synchronizes the
    /// context tenant's schema on that tenant's first use.
    ///
    /// Concurrent callers wait until the first one is done.
    ///
    /// # Errors
    /// Only factory construction failures, which leave the store
    /// uninitialized; schema failures are logged.
    pub fn ensure_initialized(&self, ctx: &mut StoreContext) -> StoreResult<()> {
        self.initialized.get_or_try_init(|| {
            self.transactions.init_factory()?;
            info!(
                "event=store_init module=store status=ok tenant={}",
                ctx.tenant().unwrap_or("-")
            );
            Ok::<(), StoreError>(())
        })?;
        self.ensure_tenant_schema(ctx);
        Ok(())
    }

    /// Like `ensure_initialized`, and also synchronizes the schema of the
    /// tenant `doc` lives in.
    fn ensure_document_tenant(&self, doc: &Document, ctx: &mut StoreContext) -> StoreResult<()> {
        self.ensure_initialized(ctx)?;
        let Some(tenant) = doc.tenant.as_deref() else {
            return Ok(());
        };
        if ctx.tenant() == Some(tenant) {
            return Ok(());
        }
        let previous = ctx.replace_tenant(Some(tenant.to_string()));
        self.ensure_tenant_schema(ctx);
        ctx.set_tenant(previous);
        Ok(())
    }

    /// Tenants whose schema was synchronized automatically.
    pub fn synchronized_tenants(&self) -> Vec<String> {
        let mut tenants: Vec<_> = self.synced_tenants.lock().iter().cloned().collect();
        tenants.sort();
        tenants
    }

    fn ensure_tenant_schema(&self, ctx: &mut StoreContext) {
        let router = self.transactions.router();
        let tenant = match ctx.tenant() {
            Some(tenant) if router.is_virtual() => tenant.to_string(),
            _ => router.main_tenant().to_string(),
        };
        let mut synced = self.synced_tenants.lock();
        if synced.contains(&tenant) {
            return;
        }
        if ctx.has_session() {
            debug!(
                "event=schema_update module=store status=deferred tenant={} reason=session_held",
                tenant
            );
            return;
        }
        match self.schema.update_schema(&self.transactions, ctx, false) {
            Ok(_) => {
                synced.insert(tenant);
            }
            Err(err) => error!(
                "event=store_init module=store status=degraded phase=schema_update tenant={} error={}",
                tenant, err
            ),
        }
    }

    /// Begins an explicit transaction on the store's own factory.
    pub fn begin_transaction(&self, ctx: &mut StoreContext) -> StoreResult<bool> {
        self.ensure_initialized(ctx)?;
        self.transactions.begin_transaction(None, true, ctx)
    }

    /// Begins a unit of work on `factory`, or on the store's own factory.
    pub fn begin_transaction_with(
        &self,
        factory: Option<&Arc<dyn SessionFactory>>,
        with_transaction: bool,
        ctx: &mut StoreContext,
    ) -> StoreResult<bool> {
        if factory.is_none() {
            self.ensure_initialized(ctx)?;
        }
        self.transactions
            .begin_transaction(factory, with_transaction, ctx)
    }

    pub fn end_transaction(&self, ctx: &mut StoreContext, commit: bool) -> StoreResult<()> {
        self.transactions.end_transaction(ctx, commit)
    }

    pub fn clean_up(&self, ctx: &mut StoreContext) -> CleanupReport {
        self.transactions.clean_up(ctx)
    }

    pub fn shutdown(&self, ctx: &mut StoreContext) -> CleanupReport {
        self.transactions.shutdown(ctx)
    }

    pub fn update_schema(
        &self,
        ctx: &mut StoreContext,
        force: bool,
    ) -> StoreResult<SchemaUpdateReport> {
        self.ensure_initialized(ctx)?;
        self.schema.update_schema(&self.transactions, ctx, force)
    }

    pub fn update_class_schema(
        &self,
        class: &ClassMapping,
        ctx: &mut StoreContext,
    ) -> StoreResult<Option<SchemaUpdateReport>> {
        self.ensure_initialized(ctx)?;
        self.schema.update_class_schema(&self.transactions, class, ctx)
    }

    pub fn get_document_archive(
        &self,
        doc: &Document,
        ctx: &mut StoreContext,
    ) -> StoreResult<DocumentArchive> {
        self.ensure_document_tenant(doc, ctx)?;
        self.archives
            .get_document_archive(&self.transactions, doc, ctx)
    }

    pub fn load_archive(
        &self,
        archive: &mut DocumentArchive,
        with_transaction: bool,
        ctx: &mut StoreContext,
    ) -> StoreResult<()> {
        self.ensure_initialized(ctx)?;
        self.archives
            .load_archive(&self.transactions, archive, with_transaction, ctx)
    }

    pub fn save_archive(
        &self,
        archive: &mut DocumentArchive,
        with_transaction: bool,
        ctx: &mut StoreContext,
    ) -> StoreResult<()> {
        self.ensure_initialized(ctx)?;
        self.archives
            .save_archive(&self.transactions, archive, with_transaction, ctx)
    }

    pub fn list_versions(
        &self,
        doc: &Document,
        ctx: &mut StoreContext,
    ) -> StoreResult<Vec<Version>> {
        self.ensure_document_tenant(doc, ctx)?;
        self.archives.list_versions(&self.transactions, doc, ctx)
    }

    pub fn load_at_version(
        &self,
        base_doc: &Document,
        version: &str,
        ctx: &mut StoreContext,
    ) -> StoreResult<VersionedDocument> {
        self.ensure_document_tenant(base_doc, ctx)?;
        self.archives
            .load_at_version(&self.transactions, base_doc, version, ctx)
    }

    pub fn reset_archive(
        &self,
        doc: &Document,
        with_transaction: bool,
        ctx: &mut StoreContext,
    ) -> StoreResult<DocumentArchive> {
        self.ensure_document_tenant(doc, ctx)?;
        self.archives
            .reset_archive(&self.transactions, doc, with_transaction, ctx)
    }

    pub fn append_revision(
        &self,
        doc: &Document,
        snapshot: &str,
        with_transaction: bool,
        ctx: &mut StoreContext,
    ) -> StoreResult<Version> {
        self.ensure_document_tenant(doc, ctx)?;
        self.archives
            .append_revision(&self.transactions, doc, snapshot, with_transaction, ctx)
    }

    /// Archives the current state of `doc` as its next revision.
    pub fn archive_document(
        &self,
        doc: &Document,
        with_transaction: bool,
        ctx: &mut StoreContext,
    ) -> StoreResult<Version> {
        let snapshot = doc.to_snapshot()?;
        self.append_revision(doc, &snapshot, with_transaction, ctx)
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
        self.ensure_initialized(ctx)?;
        self.transactions.execute_read(ctx, with_transaction, action)
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
        self.ensure_initialized(ctx)?;
        self.transactions
            .execute_write(ctx, with_transaction, action)
    }

    pub fn open_connections(&self) -> usize {
        self.transactions.open_connections()
    }

    pub fn connection_records(&self) -> Vec<ConnectionRecord> {
        self.transactions.registry().records()
    }
}
