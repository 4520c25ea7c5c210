//! Version archive store.
//!
//! # Responsibility
//! - Load, create and persist the revision archive of each document.
//! - Reconstruct a document as it was at a given version.
//!
//! # Invariants
//! - Load-or-create for one archive key runs inside a per-key critical
//!   section, so concurrent first access creates exactly one storage row.
//! - The ambient tenant of the context is restored after every operation
//!   that switched it to a document's tenant. A session the context already
//!   holds is routed to the document's tenant and back.
//! - Appending reads the stored archive inside the same unit of work that
//!   writes it, never the context cache.
//! - A successful save refreshes the context's cached archive.

use super::document_archive::{ArchiveKey, DocumentArchive};
use super::locks::KeyedLocks;
use super::version::Version;
use crate::context::StoreContext;
use crate::error::{StoreError, StoreResult};
use crate::model::document::{now_epoch_ms, Document};
use crate::session::{active_session, TransactionManager};
use log::{debug, info, warn};

/// Outcome of reading a document at a version label.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VersionedDocument {
    Loaded(Document),
    /// The label resolved to a revision with a different label, so no
    /// content is available for it. `stub` carries identity only.
    ContentUnavailable {
        requested: String,
        resolved: Version,
        stub: Document,
    },
}

impl VersionedDocument {
    pub fn document(&self) -> &Document {
        match self {
            Self::Loaded(document) => document,
            Self::ContentUnavailable { stub, .. } => stub,
        }
    }

    pub fn into_document(self) -> Document {
        match self {
            Self::Loaded(document) => document,
            Self::ContentUnavailable { stub, .. } => stub,
        }
    }

    pub fn is_loaded(&self) -> bool {
        matches!(self, Self::Loaded(_))
    }
}

pub struct ArchiveStore {
    locks: KeyedLocks,
    main_tenant: String,
}

impl ArchiveStore {
    pub fn new(main_tenant: impl Into<String>) -> Self {
        Self {
            locks: KeyedLocks::new(),
            main_tenant: main_tenant.into(),
        }
    }

    /// Key of `doc`'s archive: its own tenant, else the ambient tenant,
    /// else the main tenant.
    pub fn archive_key(&self, doc: &Document, ctx: &StoreContext) -> ArchiveKey {
        let tenant = doc
            .tenant
            .as_deref()
            .or(ctx.tenant())
            .unwrap_or(&self.main_tenant);
        ArchiveKey::new(tenant, doc.full_name())
    }

    /// Archive keys currently locked or waited on.
    pub fn active_locks(&self) -> usize {
        self.locks.active_keys()
    }

    /// Returns the archive of `doc`, creating an empty storage row on first
    /// access.
    ///
    /// # Errors
    /// - `ReadingArchive` when the row cannot be read, created or decoded.
    /// - `SwitchDatabase` / `NotInitialized` as raised by the session layer.
    pub fn get_document_archive(
        &self,
        tx: &TransactionManager,
        doc: &Document,
        ctx: &mut StoreContext,
    ) -> StoreResult<DocumentArchive> {
        let key = self.archive_key(doc, ctx);
        let _guard = self.locks.lock(&key.to_string());
        self.archive_locked(tx, doc, key, ctx)
    }

    fn archive_locked(
        &self,
        tx: &TransactionManager,
        doc: &Document,
        key: ArchiveKey,
        ctx: &mut StoreContext,
    ) -> StoreResult<DocumentArchive> {
        if let Some(archive) = ctx.cached_archive(&key) {
            return Ok(archive.clone());
        }
        let document = key.full_name.clone();
        let mut archive = DocumentArchive::new(key);
        with_document_tenant(tx, ctx, doc, |ctx| load_or_create(tx, &mut archive, ctx))
            .map_err(|err| wrap(err, |source| StoreError::ReadingArchive { document, source }))?;
        ctx.cache_archive(archive.clone());
        Ok(archive)
    }

    /// Replaces `archive`'s history with the stored one. A missing row
    /// yields an empty history.
    pub fn load_archive(
        &self,
        tx: &TransactionManager,
        archive: &mut DocumentArchive,
        with_transaction: bool,
        ctx: &mut StoreContext,
    ) -> StoreResult<()> {
        let document = archive.key().full_name.clone();
        let full_name = document.clone();
        let blob = tx
            .execute_read(ctx, with_transaction, |ctx| {
                active_session(ctx)?
                    .load_archive(&full_name)
                    .map_err(StoreError::engine("load_archive"))
            })
            .map_err(|err| {
                wrap(err, |source| StoreError::ReadingArchive {
                    document: document.clone(),
                    source,
                })
            })?;
        archive
            .mark_loaded(blob.as_deref())
            .map_err(|err| wrap(err, |source| StoreError::ReadingArchive { document, source }))
    }

    /// Writes `archive` back, replacing any stored content.
    pub fn save_archive(
        &self,
        tx: &TransactionManager,
        archive: &mut DocumentArchive,
        with_transaction: bool,
        ctx: &mut StoreContext,
    ) -> StoreResult<()> {
        let document = archive.key().full_name.clone();
        let saving = |source: Box<StoreError>| StoreError::SavingArchive {
            document: document.clone(),
            source,
        };
        let blob = archive.to_blob().map_err(|err| wrap(err, saving))?;
        tx.execute_write(ctx, with_transaction, |ctx| {
            active_session(ctx)?
                .save_archive(&document, &blob)
                .map_err(StoreError::engine("save_archive"))
        })
        .map_err(|err| wrap(err, saving))?;
        archive.mark_saved();
        ctx.cache_archive(archive.clone());
        debug!(
            "event=archive_save module=archive status=ok key={} revisions={}",
            archive.key(),
            archive.revisions().len()
        );
        Ok(())
    }

    /// Version labels of `doc` in change-log order.
    pub fn list_versions(
        &self,
        tx: &TransactionManager,
        doc: &Document,
        ctx: &mut StoreContext,
    ) -> StoreResult<Vec<Version>> {
        self.get_document_archive(tx, doc, ctx)
            .map(|archive| archive.versions())
            .map_err(|err| {
                wrap(err, |source| StoreError::ReadingRevisions {
                    document: doc.full_name(),
                    source,
                })
            })
    }

    /// Reconstructs `base_doc` as it was at `version`.
    ///
    /// # Errors
    /// - `UnexistantVersion` when no revision matches the label.
    /// - `ReadingVersion` when the archive or the stored snapshot cannot be
    ///   read.
    pub fn load_at_version(
        &self,
        tx: &TransactionManager,
        base_doc: &Document,
        version: &str,
        ctx: &mut StoreContext,
    ) -> StoreResult<VersionedDocument> {
        let document = base_doc.full_name();
        let reading = |source: Box<StoreError>| StoreError::ReadingVersion {
            document: document.clone(),
            version: version.to_string(),
            source,
        };
        let archive = self
            .get_document_archive(tx, base_doc, ctx)
            .map_err(|err| wrap(err, reading))?;
        let revision = archive
            .resolve(version)
            .ok_or_else(|| StoreError::UnexistantVersion {
                document: document.clone(),
                version: version.to_string(),
            })?;

        if revision.version.to_string() != version {
            let mut stub = Document::new(&base_doc.space, &base_doc.name);
            stub.tenant = base_doc.tenant.clone();
            stub.version = version.to_string();
            return Ok(VersionedDocument::ContentUnavailable {
                requested: version.to_string(),
                resolved: revision.version,
                stub,
            });
        }

        let text = revision.text();
        let mut loaded = if Document::is_snapshot(&text) {
            Document::from_snapshot(&text).map_err(|err| reading(Box::new(err.into())))?
        } else {
            let mut raw = base_doc.clone();
            raw.content = text;
            raw.author = revision.author.clone();
            raw.updated_at = revision.date;
            raw
        };
        loaded.version = revision.version.to_string();
        loaded.rename_like(base_doc);
        Ok(VersionedDocument::Loaded(loaded))
    }

    /// Drops all history of `doc` and seeds it with the current snapshot.
    pub fn reset_archive(
        &self,
        tx: &TransactionManager,
        doc: &Document,
        with_transaction: bool,
        ctx: &mut StoreContext,
    ) -> StoreResult<DocumentArchive> {
        let key = self.archive_key(doc, ctx);
        let _guard = self.locks.lock(&key.to_string());

        let version = doc.version.parse::<Version>().unwrap_or(Version::INITIAL);
        let mut seeded = doc.clone();
        seeded.version = version.to_string();
        let snapshot = seeded.to_snapshot().map_err(|err| StoreError::SavingArchive {
            document: key.full_name.clone(),
            source: Box::new(err.into()),
        })?;

        let mut archive = DocumentArchive::new(key);
        archive.reset(version, &doc.author, now_epoch_ms(), &snapshot);
        with_document_tenant(tx, ctx, doc, |ctx| {
            self.save_archive(tx, &mut archive, with_transaction, ctx)
        })?;
        info!(
            "event=archive_reset module=archive status=ok key={} version={}",
            archive.key(),
            version
        );
        Ok(archive)
    }

    /// Appends `snapshot` as the next minor revision of `doc` and persists
    /// the archive.
    ///
    /// The stored archive is re-read in the unit of work that saves it, so
    /// revisions appended through other contexts are kept.
    ///
    /// # Errors
    /// - `SavingArchive` when the row cannot be read or written, or when the
    ///   latest version has no successor (`VersionOverflow`).
    /// - `SwitchDatabase` when a held session cannot be routed to the
    ///   document's tenant.
    pub fn append_revision(
        &self,
        tx: &TransactionManager,
        doc: &Document,
        snapshot: &str,
        with_transaction: bool,
        ctx: &mut StoreContext,
    ) -> StoreResult<Version> {
        let key = self.archive_key(doc, ctx);
        let _guard = self.locks.lock(&key.to_string());

        let document = key.full_name.clone();
        let mut archive = DocumentArchive::new(key);
        let version = with_document_tenant(tx, ctx, doc, |ctx| {
            tx.execute_write(ctx, with_transaction, |ctx| {
                let session = active_session(ctx)?;
                let stored = session
                    .load_archive(&document)
                    .map_err(StoreError::engine("load_archive"))?;
                archive.mark_loaded(stored.as_deref())?;
                let version = archive.append(&doc.author, now_epoch_ms(), snapshot)?;
                session
                    .save_archive(&document, &archive.to_blob()?)
                    .map_err(StoreError::engine("save_archive"))?;
                Ok(version)
            })
        })
        .map_err(|err| {
            wrap(err, |source| StoreError::SavingArchive {
                document: document.clone(),
                source,
            })
        })?;
        archive.mark_saved();
        ctx.cache_archive(archive.clone());
        debug!(
            "event=archive_append module=archive status=ok key={} version={}",
            archive.key(),
            version
        );
        Ok(version)
    }
}

fn load_or_create(
    tx: &TransactionManager,
    archive: &mut DocumentArchive,
    ctx: &mut StoreContext,
) -> StoreResult<()> {
    let full_name = archive.key().full_name.clone();
    tx.execute_write(ctx, true, |ctx| {
        let session = active_session(ctx)?;
        let stored = session
            .load_archive(&full_name)
            .map_err(StoreError::engine("load_archive"))?;
        archive.mark_loaded(stored.as_deref())?;
        if archive.is_persisted() {
            return Ok(());
        }
        let created = session
            .insert_archive_if_absent(&full_name, &archive.to_blob()?)
            .map_err(StoreError::engine("create_archive"))?;
        if created {
            debug!(
                "event=archive_create module=archive status=ok key={}",
                archive.key()
            );
            archive.mark_saved();
        } else {
            let stored = session
                .load_archive(&full_name)
                .map_err(StoreError::engine("load_archive"))?;
            archive.mark_loaded(stored.as_deref())?;
        }
        Ok(())
    })
}

/// Runs `action` with the context tenant switched to `doc`'s tenant, if it
/// has one.
///
/// A session already held by the context is routed to that tenant first and
/// back to the ambient tenant afterwards. A failure to route back is
/// returned only when `action` succeeded.
fn with_document_tenant<T>(
    tx: &TransactionManager,
    ctx: &mut StoreContext,
    doc: &Document,
    action: impl FnOnce(&mut StoreContext) -> StoreResult<T>,
) -> StoreResult<T> {
    let Some(tenant) = doc.tenant.clone() else {
        return action(ctx);
    };
    let reroute = ctx.has_session() && ctx.tenant() != Some(tenant.as_str());
    let previous = ctx.replace_tenant(Some(tenant.clone()));
    if reroute {
        if let Err(err) = tx.reroute(ctx, Some(tenant.as_str())) {
            ctx.set_tenant(previous);
            return Err(err);
        }
    }

    let mut result = action(ctx);

    if reroute && ctx.has_session() {
        if let Err(err) = tx.reroute(ctx, previous.as_deref()) {
            if result.is_ok() {
                result = Err(err);
            } else {
                warn!(
                    "event=switch_database module=archive status=error after_failure=true tenant={} error={}",
                    previous.as_deref().unwrap_or("-"),
                    err
                );
            }
        }
    }
    ctx.set_tenant(previous);
    result
}

/// Wraps `err` in an archive error unless it is a routing, initialization
/// or lookup failure the caller must see as is.
fn wrap(err: StoreError, wrapper: impl FnOnce(Box<StoreError>) -> StoreError) -> StoreError {
    match err {
        StoreError::SwitchDatabase { .. }
        | StoreError::NotInitialized
        | StoreError::UnexistantVersion { .. } => err,
        other => wrapper(Box::new(other)),
    }
}
