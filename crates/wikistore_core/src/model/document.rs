//! Document value persisted through the archive store.
//!
//! # Responsibility
//! - Carry the identity (tenant, space, name) and current content of a
//!   wiki document.
//! - Serialize to and from the textual snapshot stored in revisions.
//!
//! # Invariants
//! - `full_name()` is `space.name` and identifies the document inside its
//!   tenant.
//! - A snapshot round-trips every field.

use serde::{Deserialize, Serialize};
use std::time::{SystemTime, UNIX_EPOCH};

/// Wiki document as seen by the storage layer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Document {
    /// Owning tenant. `None` means the tenant of the ambient context.
    pub tenant: Option<String>,
    pub space: String,
    pub name: String,
    #[serde(default)]
    pub language: String,
    /// Version label of the current content, e.g. `1.3`.
    #[serde(default)]
    pub version: String,
    #[serde(default)]
    pub author: String,
    #[serde(default)]
    pub content: String,
    /// Unix epoch milliseconds of the last content change.
    #[serde(default)]
    pub updated_at: i64,
}

impl Document {
    pub fn new(space: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            tenant: None,
            space: space.into(),
            name: name.into(),
            language: String::new(),
            version: String::new(),
            author: String::new(),
            content: String::new(),
            updated_at: now_epoch_ms(),
        }
    }

    pub fn in_tenant(mut self, tenant: impl Into<String>) -> Self {
        self.tenant = Some(tenant.into());
        self
    }

    pub fn with_content(mut self, content: impl Into<String>) -> Self {
        self.content = content.into();
        self
    }

    pub fn with_author(mut self, author: impl Into<String>) -> Self {
        self.author = author.into();
        self
    }

    pub fn full_name(&self) -> String {
        format!("{}.{}", self.space, self.name)
    }

    /// Serializes the document into the text stored in a revision.
    pub fn to_snapshot(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string_pretty(self)
    }

    /// Whether `text` looks like a serialized document rather than raw content.
    pub fn is_snapshot(text: &str) -> bool {
        text.trim_start().starts_with('{')
    }

    pub fn from_snapshot(text: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(text)
    }

    /// Moves this document to the identity of `other`, keeping content.
    ///
    /// Historical content may have been saved under an older name.
    pub fn rename_like(&mut self, other: &Document) {
        self.tenant = other.tenant.clone();
        self.space = other.space.clone();
        self.name = other.name.clone();
    }
}

pub(crate) fn now_epoch_ms() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_millis() as i64)
        .unwrap_or_default()
}
