//! Store settings and per-tenant configuration lookups.
//!
//! # Responsibility
//! - Load deployment settings from JSON.
//! - Answer `get(tenant, key, default)` lookups with tenant overrides.
//!
//! # Invariants
//! - Tenant-specific values win over global `properties`.
//! - Tenant names are validated before a store is built from settings.

use crate::error::{StoreError, StoreResult};
use once_cell::sync::Lazy;
use regex::Regex;
use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

/// Configuration key toggling schema synchronization; `"0"` disables it.
pub const SCHEMA_UPDATE_KEY: &str = "store.schema.update";

static TENANT_NAME_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[A-Za-z0-9][A-Za-z0-9_-]{0,63}$").expect("valid tenant name regex"));

/// Per-tenant configuration source.
pub trait TenantConfig: Send + Sync {
    fn get(&self, tenant: Option<&str>, key: &str, default: &str) -> String;
}

/// Deployment settings for one store instance.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct StoreSettings {
    /// Multi-tenant mode: sessions are routed to the context tenant.
    pub virtual_mode: bool,
    pub main_tenant: String,
    /// Directory of the SQLite backend.
    pub data_dir: PathBuf,
    pub busy_timeout_ms: u64,
    pub create_missing_databases: bool,
    /// Record a backtrace for every checked-out connection.
    pub capture_call_sites: bool,
    pub properties: BTreeMap<String, String>,
    pub tenant_properties: BTreeMap<String, BTreeMap<String, String>>,
}

impl Default for StoreSettings {
    fn default() -> Self {
        Self {
            virtual_mode: true,
            main_tenant: "main".to_string(),
            data_dir: PathBuf::from("data"),
            busy_timeout_ms: 5_000,
            create_missing_databases: true,
            capture_call_sites: false,
            properties: BTreeMap::new(),
            tenant_properties: BTreeMap::new(),
        }
    }
}

impl StoreSettings {
    pub fn from_json_str(raw: &str) -> StoreResult<Self> {
        let settings: Self = serde_json::from_str(raw)?;
        settings.validate()?;
        Ok(settings)
    }

    pub fn from_path(path: impl AsRef<Path>) -> StoreResult<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|err| {
            StoreError::Config(format!("cannot read `{}`: {err}", path.display()))
        })?;
        Self::from_json_str(&raw)
    }

    pub fn validate(&self) -> StoreResult<()> {
        if !is_valid_tenant_name(&self.main_tenant) {
            return Err(StoreError::Config(format!(
                "main_tenant `{}` is not a valid tenant name",
                self.main_tenant
            )));
        }
        if let Some(invalid) = self
            .tenant_properties
            .keys()
            .find(|tenant| !is_valid_tenant_name(tenant))
        {
            return Err(StoreError::Config(format!(
                "tenant_properties contains invalid tenant name `{invalid}`"
            )));
        }
        Ok(())
    }

    /// Sets one global property.
    pub fn with_property(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.properties.insert(key.into(), value.into());
        self
    }

    /// Sets one property for a single tenant.
    pub fn with_tenant_property(
        mut self,
        tenant: impl Into<String>,
        key: impl Into<String>,
        value: impl Into<String>,
    ) -> Self {
        self.tenant_properties
            .entry(tenant.into())
            .or_default()
            .insert(key.into(), value.into());
        self
    }
}

impl TenantConfig for StoreSettings {
    fn get(&self, tenant: Option<&str>, key: &str, default: &str) -> String {
        tenant
            .and_then(|tenant| self.tenant_properties.get(tenant))
            .and_then(|properties| properties.get(key))
            .or_else(|| self.properties.get(key))
            .cloned()
            .unwrap_or_else(|| default.to_string())
    }
}

pub fn is_valid_tenant_name(value: &str) -> bool {
    TENANT_NAME_RE.is_match(value)
}
