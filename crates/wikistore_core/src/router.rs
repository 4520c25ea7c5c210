//! Virtual-database routing.
//!
//! # Responsibility
//! - Point a freshly opened session at the context tenant's storage.
//!
//! # Invariants
//! - Routing is a no-op outside virtual mode or when the context names no
//!   tenant.
//! - A session is switched only when its current catalog or schema differs
//!   from the target, or is unknown.

use crate::context::StoreContext;
use crate::engine::{DatabaseProduct, EngineError, EngineResult, Session, TenantSwitch};
use crate::error::{StoreError, StoreResult};
use log::{debug, error};

#[derive(Debug, Clone)]
pub struct DatabaseRouter {
    virtual_mode: bool,
    main_tenant: String,
}

impl DatabaseRouter {
    pub fn new(virtual_mode: bool, main_tenant: impl Into<String>) -> Self {
        Self {
            virtual_mode,
            main_tenant: main_tenant.into(),
        }
    }

    pub fn is_virtual(&self) -> bool {
        self.virtual_mode
    }

    pub fn main_tenant(&self) -> &str {
        &self.main_tenant
    }

    /// Engine-side name of a tenant's schema or catalog.
    ///
    /// The main tenant maps to the engine's default schema where it has one.
    /// `-` is not valid in unquoted identifiers and becomes `_`.
    pub fn schema_name(&self, tenant: &str, product: DatabaseProduct) -> String {
        if tenant == self.main_tenant {
            if let Some(schema) = product.main_schema() {
                return schema.to_string();
            }
        }
        tenant.replace('-', "_")
    }

    /// Routes `session` to the context tenant.
    pub fn set_database(&self, session: &mut dyn Session, ctx: &StoreContext) -> StoreResult<()> {
        self.route(session, ctx.tenant())
    }

    pub fn route(&self, session: &mut dyn Session, tenant: Option<&str>) -> StoreResult<()> {
        if !self.virtual_mode {
            return Ok(());
        }
        let Some(tenant) = tenant else {
            return Ok(());
        };

        let product = session.product();
        let schema = self.schema_name(tenant, product);
        switch(session, product, &schema).map_err(|source| {
            error!(
                "event=switch_database module=router status=error tenant={} schema={} error={}",
                tenant, schema, source
            );
            StoreError::SwitchDatabase {
                tenant: tenant.to_string(),
                source,
            }
        })?;
        debug!(
            "event=switch_database module=router status=ok tenant={} schema={} product={}",
            tenant,
            schema,
            product.name()
        );
        Ok(())
    }
}

fn switch(session: &mut dyn Session, product: DatabaseProduct, schema: &str) -> EngineResult<()> {
    match product.tenant_switch() {
        TenantSwitch::SchemaStatement => {
            if session.current_schema()?.as_deref() == Some(schema) {
                return Ok(());
            }
            let sql = product.schema_statement(schema).ok_or_else(|| {
                EngineError::Unsupported(format!("{} has no schema statement", product.name()))
            })?;
            session.execute(&sql).map(|_| ())
        }
        TenantSwitch::Catalog => {
            if session.catalog()?.as_deref() == Some(schema) {
                return Ok(());
            }
            session.set_catalog(schema)
        }
    }
}
