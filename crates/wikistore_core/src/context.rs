//! Request-scoped store context.
//!
//! # Responsibility
//! - Carry the ambient tenant and request URL of one request.
//! - Hold the request's session, transaction and loaded archives.
//!
//! # Invariants
//! - A context is owned by exactly one thread for its whole lifetime.
//! - Sessions stored here are never shared with another context.

use crate::archive::document_archive::{ArchiveKey, DocumentArchive};
use crate::engine::Session;
use crate::session::TransactionHandle;
use std::collections::HashMap;

#[derive(Default)]
pub struct StoreContext {
    tenant: Option<String>,
    request_url: Option<String>,
    session: Option<Box<dyn Session>>,
    transaction: Option<TransactionHandle>,
    archives: HashMap<ArchiveKey, DocumentArchive>,
}

impl StoreContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn for_tenant(tenant: impl Into<String>) -> Self {
        Self {
            tenant: Some(tenant.into()),
            ..Self::default()
        }
    }

    pub fn with_request_url(mut self, url: impl Into<String>) -> Self {
        self.request_url = Some(url.into());
        self
    }

    pub fn tenant(&self) -> Option<&str> {
        self.tenant.as_deref()
    }

    pub fn set_tenant(&mut self, tenant: Option<String>) {
        self.tenant = tenant;
    }

    /// Sets the tenant and returns the previous one.
    pub fn replace_tenant(&mut self, tenant: Option<String>) -> Option<String> {
        std::mem::replace(&mut self.tenant, tenant)
    }

    pub fn request_url(&self) -> Option<&str> {
        self.request_url.as_deref()
    }

    pub fn has_session(&self) -> bool {
        self.session.is_some()
    }

    pub fn session(&self) -> Option<&dyn Session> {
        self.session.as_deref()
    }

    pub fn session_mut(&mut self) -> Option<&mut (dyn Session + 'static)> {
        self.session.as_deref_mut()
    }

    pub fn transaction(&self) -> Option<&TransactionHandle> {
        self.transaction.as_ref()
    }

    pub(crate) fn set_session(&mut self, session: Option<Box<dyn Session>>) {
        self.session = session;
    }

    pub(crate) fn set_transaction(&mut self, transaction: Option<TransactionHandle>) {
        self.transaction = transaction;
    }

    pub(crate) fn take_session(&mut self) -> Option<Box<dyn Session>> {
        self.session.take()
    }

    pub(crate) fn take_transaction(&mut self) -> Option<TransactionHandle> {
        self.transaction.take()
    }

    pub fn cached_archive(&self, key: &ArchiveKey) -> Option<&DocumentArchive> {
        self.archives.get(key)
    }

    pub(crate) fn cache_archive(&mut self, archive: DocumentArchive) {
        self.archives.insert(archive.key().clone(), archive);
    }

    pub fn cached_archive_count(&self) -> usize {
        self.archives.len()
    }
}
