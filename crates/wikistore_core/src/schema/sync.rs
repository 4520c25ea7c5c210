//! Schema synchronization against the live engine.
//!
//! # Responsibility
//! - Bring a tenant's physical schema up to the logical mapping.
//! - Run the fixed data fix-up batch after every synchronization.
//!
//! # Invariants
//! - Updates are serialized per synchronizer.
//! - A failing statement is recorded and the batch continues; only failures
//!   to open, route or introspect abort the update.
//! - Schema overrides applied for schema-based tenancy are always restored,
//!   including on error paths.

use super::diff::generate_update_script;
use super::mapping::{ClassMapping, SchemaMapping};
use crate::config::{TenantConfig, SCHEMA_UPDATE_KEY};
use crate::context::StoreContext;
use crate::engine::DatabaseProduct;
use crate::error::{StoreError, StoreResult};
use crate::session::{active_session, TransactionManager};
use log::{debug, error, info, warn};
use parking_lot::Mutex;
use std::ops::Deref;
use std::sync::Arc;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FailedStatement {
    pub sql: String,
    pub error: String,
}

/// What one synchronization did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SchemaUpdateReport {
    pub tenant: Option<String>,
    /// Disabled by tenant configuration.
    pub skipped: bool,
    /// Statements coming from the mapping diff, fix-ups excluded.
    pub generated: usize,
    pub executed: Vec<String>,
    pub failed: Vec<FailedStatement>,
}

impl SchemaUpdateReport {
    fn for_tenant(tenant: Option<&str>) -> Self {
        Self {
            tenant: tenant.map(str::to_string),
            ..Self::default()
        }
    }

    pub fn statement_count(&self) -> usize {
        self.executed.len() + self.failed.len()
    }
}

pub struct SchemaSynchronizer {
    mapping: Mutex<SchemaMapping>,
    config: Arc<dyn TenantConfig>,
}

impl SchemaSynchronizer {
    pub fn new(mapping: SchemaMapping, config: Arc<dyn TenantConfig>) -> Self {
        Self {
            mapping: Mutex::new(mapping),
            config,
        }
    }

    pub fn mapping(&self) -> SchemaMapping {
        self.mapping.lock().clone()
    }

    /// Synchronizes the context tenant's schema with the core mapping.
    ///
    /// Skipped when the tenant sets `store.schema.update` to `0`, unless
    /// `force` is set.
    ///
    /// # Errors
    /// - `SchemaUpdate` when the script cannot be generated or the batch
    ///   transaction cannot be opened or committed.
    pub fn update_schema(
        &self,
        tx: &TransactionManager,
        ctx: &mut StoreContext,
        force: bool,
    ) -> StoreResult<SchemaUpdateReport> {
        let tenant = ctx.tenant().map(str::to_string);
        let tenant_label = tenant.as_deref().unwrap_or("-");
        if !force && self.config.get(tenant.as_deref(), SCHEMA_UPDATE_KEY, "1") == "0" {
            debug!(
                "event=schema_update module=schema status=skipped tenant={}",
                tenant_label
            );
            let mut report = SchemaUpdateReport::for_tenant(tenant.as_deref());
            report.skipped = true;
            return Ok(report);
        }

        info!(
            "event=schema_update module=schema status=start tenant={} force={}",
            tenant_label, force
        );
        let mut mapping = self.mapping.lock();
        let result = self
            .schema_update_script(tx, &mut mapping, ctx)
            .and_then(|(mut script, product)| {
                let generated = script.len();
                script.extend(fixup_statements(product));
                let mut report = execute_script(tx, ctx, &script)?;
                report.generated = generated;
                Ok(report)
            })
            .map_err(|source| StoreError::SchemaUpdate {
                tenant: tenant_label.to_string(),
                source: Box::new(source),
            });
        match &result {
            Ok(report) => info!(
                "event=schema_update module=schema status=ok tenant={} generated={} executed={} failed={}",
                tenant_label,
                report.generated,
                report.executed.len(),
                report.failed.len()
            ),
            Err(err) => error!(
                "event=schema_update module=schema status=error tenant={} error={}",
                tenant_label, err
            ),
        }
        result
    }

    /// Creates or extends the dedicated table of a custom-mapped class.
    ///
    /// Returns `Ok(None)` when the class stores its objects in the generic
    /// tables.
    pub fn update_class_schema(
        &self,
        tx: &TransactionManager,
        class: &ClassMapping,
        ctx: &mut StoreContext,
    ) -> StoreResult<Option<SchemaUpdateReport>> {
        if !class.has_dedicated_table() {
            return Ok(None);
        }
        let tenant = ctx.tenant().unwrap_or("-").to_string();
        let mut mapping = class.to_schema_mapping();
        let report = self
            .schema_update_script(tx, &mut mapping, ctx)
            .and_then(|(script, _)| execute_script(tx, ctx, &script))
            .map_err(|source| StoreError::SchemaUpdate {
                tenant: tenant.clone(),
                source: Box::new(source),
            })?;
        info!(
            "event=class_schema_update module=schema status=ok tenant={} class={} executed={} failed={}",
            tenant,
            class.class_name(),
            report.executed.len(),
            report.failed.len()
        );
        Ok(Some(report))
    }

    /// Diffs `mapping` against the live schema of the context tenant.
    ///
    /// Introspection runs in an autocommit unit of work unless the context
    /// already holds a session.
    pub fn schema_update_script(
        &self,
        tx: &TransactionManager,
        mapping: &mut SchemaMapping,
        ctx: &mut StoreContext,
    ) -> StoreResult<(Vec<String>, DatabaseProduct)> {
        let began = tx.begin_transaction(None, false, ctx)?;
        let result = introspect_and_diff(tx, mapping, ctx);
        if began {
            if let Err(err) = tx.end_transaction(ctx, false) {
                warn!(
                    "event=schema_introspect module=schema status=error phase=close error={}",
                    err
                );
            }
        }
        result
    }
}

fn introspect_and_diff(
    tx: &TransactionManager,
    mapping: &mut SchemaMapping,
    ctx: &mut StoreContext,
) -> StoreResult<(Vec<String>, DatabaseProduct)> {
    let router = tx.router();
    let tenant = ctx.tenant().map(str::to_string);
    let session = active_session(ctx)?;
    router.route(session, tenant.as_deref())?;

    let product = session.product();
    let tenant_schema = tenant
        .as_deref()
        .filter(|_| router.is_virtual() && product.models_tenants_as_schemas())
        .map(|tenant| router.schema_name(tenant, product));
    let mapping = SchemaOverride::apply(mapping, tenant_schema.as_deref());
    let live = session
        .live_schema(tenant_schema.as_deref())
        .map_err(StoreError::engine("introspect_schema"))?;
    let script = generate_update_script(&mapping, &live, product);
    debug!(
        "event=schema_script module=schema status=ok tenant={} statements={}",
        tenant.as_deref().unwrap_or("-"),
        script.len()
    );
    Ok((script, product))
}

fn execute_script(
    tx: &TransactionManager,
    ctx: &mut StoreContext,
    statements: &[String],
) -> StoreResult<SchemaUpdateReport> {
    let began = tx.begin_transaction(None, true, ctx)?;
    let mut report = SchemaUpdateReport::for_tenant(ctx.tenant());
    let session = match active_session(ctx) {
        Ok(session) => session,
        Err(err) => {
            if began {
                tx.end_transaction(ctx, false)?;
            }
            return Err(err);
        }
    };
    for sql in statements {
        match session.execute(sql) {
            Ok(_) => {
                debug!("event=schema_statement module=schema status=ok sql={}", sql);
                report.executed.push(sql.clone());
            }
            Err(err) => {
                error!(
                    "event=schema_statement module=schema status=error sql={} error={}",
                    sql, err
                );
                report.failed.push(FailedStatement {
                    sql: sql.clone(),
                    error: err.to_string(),
                });
            }
        }
    }
    if began {
        tx.end_transaction(ctx, true)?;
    }
    Ok(report)
}

/// Data fix-ups run after every synchronization. Each statement is
/// idempotent.
pub fn fixup_statements(product: DatabaseProduct) -> Vec<String> {
    let full_name = if product == DatabaseProduct::MySql {
        "concat(space,'.',name)"
    } else {
        "space || '.' || name"
    };
    vec![
        "update wikidoc set translation=0 where translation is null".to_string(),
        "update wikidoc set language='' where language is null".to_string(),
        "update wikidoc set default_language='' where default_language is null".to_string(),
        format!("update wikidoc set fullname={full_name} where fullname is null"),
        "update wikidoc set elements=3 where elements is null".to_string(),
        "delete from wikiproperties where name like 'editbox_%' and classtype='LongProperty'"
            .to_string(),
        "delete from wikilongs where name like 'editbox_%'".to_string(),
    ]
}

/// Points a mapping at a tenant schema until dropped.
struct SchemaOverride<'a> {
    mapping: &'a mut SchemaMapping,
    saved_default: Option<String>,
    saved_tables: Vec<Option<String>>,
}

impl<'a> SchemaOverride<'a> {
    fn apply(mapping: &'a mut SchemaMapping, schema: Option<&str>) -> Self {
        let saved_default = mapping.default_schema.clone();
        let saved_tables = mapping
            .tables
            .iter()
            .map(|table| table.schema.clone())
            .collect();
        if let Some(schema) = schema {
            mapping.default_schema = Some(schema.to_string());
            for table in &mut mapping.tables {
                table.schema = Some(schema.to_string());
            }
        }
        Self {
            mapping,
            saved_default,
            saved_tables,
        }
    }
}

impl Deref for SchemaOverride<'_> {
    type Target = SchemaMapping;

    fn deref(&self) -> &SchemaMapping {
        self.mapping
    }
}

impl Drop for SchemaOverride<'_> {
    fn drop(&mut self) {
        self.mapping.default_schema = self.saved_default.take();
        for (table, schema) in self.mapping.tables.iter_mut().zip(self.saved_tables.drain(..)) {
            table.schema = schema;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{fixup_statements, SchemaSynchronizer};
    use crate::config::StoreSettings;
    use crate::context::StoreContext;
    use crate::engine::testing::{Failures, RecordingFactory};
    use crate::engine::{DatabaseProduct, LiveSchema, SessionFactory};
    use crate::error::StoreError;
    use crate::router::DatabaseRouter;
    use crate::schema::mapping::{ClassMapping, ColumnType, SchemaMapping};
    use crate::session::{FactorySource, TransactionManager};
    use std::sync::Arc;

    fn setup(
        product: DatabaseProduct,
        settings: StoreSettings,
    ) -> (RecordingFactory, TransactionManager, SchemaSynchronizer) {
        let factory = RecordingFactory::new(product);
        let shared: Arc<dyn SessionFactory> = Arc::new(factory.clone());
        let source: FactorySource = Box::new(move || Ok(Arc::clone(&shared)));
        let tx = TransactionManager::new(source, DatabaseRouter::new(true, "main"));
        tx.init_factory().unwrap();
        let sync = SchemaSynchronizer::new(SchemaMapping::core(), Arc::new(settings));
        (factory, tx, sync)
    }

    #[test]
    fn schema_tenancy_qualifies_ddl_and_restores_mapping() {
        let (factory, tx, sync) = setup(DatabaseProduct::Oracle, StoreSettings::default());
        let mut ctx = StoreContext::for_tenant("acme");

        let report = sync.update_schema(&tx, &mut ctx, false).unwrap();

        assert_eq!(report.generated, 5);
        let ddl = factory.statements();
        assert!(ddl
            .iter()
            .filter(|sql| sql.starts_with("create table"))
            .all(|sql| sql.starts_with("create table acme.")));
        assert!(factory.log().contains(&"live_schema:acme".to_string()));
        let mapping = sync.mapping();
        assert!(mapping.default_schema.is_none());
        assert!(mapping.tables.iter().all(|table| table.schema.is_none()));
        assert_eq!(tx.open_connections(), 0);
    }

    #[test]
    fn catalog_tenancy_leaves_ddl_unqualified() {
        let (factory, tx, sync) = setup(DatabaseProduct::PostgreSql, StoreSettings::default());
        let mut ctx = StoreContext::for_tenant("acme");
        sync.update_schema(&tx, &mut ctx, false).unwrap();
        assert!(factory.statements().contains(
            &"update wikidoc set fullname=space || '.' || name where fullname is null".to_string()
        ));
        assert!(factory
            .statements()
            .iter()
            .any(|sql| sql.starts_with("create table wikidoc (")));
        assert!(factory.log().contains(&"live_schema:-".to_string()));
    }

    #[test]
    fn failing_statements_do_not_abort_the_batch() {
        let (factory, tx, sync) = setup(DatabaseProduct::MySql, StoreSettings::default());
        let mut live = LiveSchema::new();
        for table in SchemaMapping::core().tables {
            live.add_table(&table.name, table.columns.iter().map(|c| c.name.clone()));
        }
        factory.set_live_schema(live);
        factory.fail(Failures {
            execute: true,
            ..Failures::default()
        });
        let mut ctx = StoreContext::new();

        let report = sync.update_schema(&tx, &mut ctx, false).unwrap();

        assert_eq!(report.generated, 0);
        assert!(report.executed.is_empty());
        assert_eq!(report.failed.len(), fixup_statements(DatabaseProduct::MySql).len());
        assert!(factory.log().contains(&"commit".to_string()));
    }

    #[test]
    fn disabled_tenant_is_skipped_unless_forced() {
        let settings =
            StoreSettings::default().with_tenant_property("acme", "store.schema.update", "0");
        let (factory, tx, sync) = setup(DatabaseProduct::MySql, settings);
        let mut ctx = StoreContext::for_tenant("acme");

        let report = sync.update_schema(&tx, &mut ctx, false).unwrap();
        assert!(report.skipped);
        assert_eq!(report.statement_count(), 0);
        assert_eq!(factory.opened(), 0);

        let forced = sync.update_schema(&tx, &mut ctx, true).unwrap();
        assert!(!forced.skipped);
        assert!(forced.statement_count() > 0);
    }

    #[test]
    fn routing_failure_aborts_with_schema_update_error() {
        let (factory, tx, sync) = setup(DatabaseProduct::Oracle, StoreSettings::default());
        factory.fail(Failures {
            execute: true,
            ..Failures::default()
        });
        let mut ctx = StoreContext::for_tenant("acme");

        let err = sync.update_schema(&tx, &mut ctx, false).unwrap_err();
        match err {
            StoreError::SchemaUpdate { tenant, source } => {
                assert_eq!(tenant, "acme");
                assert!(matches!(*source, StoreError::SwitchDatabase { .. }));
            }
            other => panic!("unexpected error: {other}"),
        }
        assert!(!ctx.has_session());
    }

    #[test]
    fn class_schema_creates_dedicated_table() {
        let (factory, tx, sync) = setup(DatabaseProduct::MySql, StoreSettings::default());
        let class = ClassMapping::builder("Blog.BlogPostClass")
            .property("title", "title", ColumnType::Varchar(255))
            .build()
            .unwrap();
        let mut ctx = StoreContext::new();

        let report = sync.update_class_schema(&tx, &class, &mut ctx).unwrap().unwrap();
        assert_eq!(
            report.executed,
            vec!["create table wikicustom_blog_blogpostclass (wo_id bigint not null, title varchar(255), primary key (wo_id))"]
        );
        assert_eq!(factory.statements().len(), 1);
    }
}
