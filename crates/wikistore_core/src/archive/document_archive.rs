//! In-memory revision history of one document.
//!
//! # Responsibility
//! - Hold the ordered, append-only list of revisions for one document.
//! - Track the archive lifecycle: unloaded, loaded, updated.
//! - Encode/decode the archive blob stored in `wikiarchive.archive`.
//!
//! # Invariants
//! - Revision versions are unique and strictly increasing in list order.
//! - Revisions are never edited once appended; `reset` replaces them all.

use super::version::Version;
use crate::error::{StoreError, StoreResult};
use serde::{Deserialize, Serialize};
use std::fmt::{Display, Formatter};

const ARCHIVE_FORMAT: u32 = 1;

/// Storage identity of one archive: tenant plus document full name.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ArchiveKey {
    pub tenant: String,
    pub full_name: String,
}

impl ArchiveKey {
    pub fn new(tenant: impl Into<String>, full_name: impl Into<String>) -> Self {
        Self {
            tenant: tenant.into(),
            full_name: full_name.into(),
        }
    }
}

impl Display for ArchiveKey {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.tenant, self.full_name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArchiveState {
    Unloaded,
    Loaded,
    /// Holds revisions not yet saved.
    Updated,
}

/// One immutable historical snapshot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Revision {
    pub version: Version,
    pub author: String,
    /// Unix epoch milliseconds.
    pub date: i64,
    pub lines: Vec<String>,
}

impl Revision {
    /// Full text of the revision.
    pub fn text(&self) -> String {
        self.lines.join("\n")
    }
}

#[derive(Serialize, Deserialize)]
struct ArchiveBlob {
    format: u32,
    revisions: Vec<Revision>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DocumentArchive {
    key: ArchiveKey,
    revisions: Vec<Revision>,
    state: ArchiveState,
    persisted: bool,
}

impl DocumentArchive {
    pub fn new(key: ArchiveKey) -> Self {
        Self {
            key,
            revisions: Vec::new(),
            state: ArchiveState::Unloaded,
            persisted: false,
        }
    }

    pub fn key(&self) -> &ArchiveKey {
        &self.key
    }

    pub fn state(&self) -> ArchiveState {
        self.state
    }

    /// Whether a storage row backs this archive.
    pub fn is_persisted(&self) -> bool {
        self.persisted
    }

    pub fn revisions(&self) -> &[Revision] {
        &self.revisions
    }

    pub fn is_empty(&self) -> bool {
        self.revisions.is_empty()
    }

    /// Version labels in change-log order.
    pub fn versions(&self) -> Vec<Version> {
        self.revisions.iter().map(|revision| revision.version).collect()
    }

    pub fn latest_version(&self) -> Option<Version> {
        self.revisions.last().map(|revision| revision.version)
    }

    /// Appends the next minor revision and returns its version.
    ///
    /// # Errors
    /// `VersionOverflow` when the latest minor number has no successor; the
    /// history is left unchanged.
    pub fn append(&mut self, author: &str, date: i64, text: &str) -> StoreResult<Version> {
        let version = match self.latest_version() {
            None => Version::INITIAL,
            Some(latest) => latest.next_minor().ok_or_else(|| StoreError::VersionOverflow {
                document: self.key.full_name.clone(),
                version: latest.to_string(),
            })?,
        };
        self.push(version, author, date, text);
        Ok(version)
    }

    /// Drops all history and seeds a single revision.
    pub fn reset(&mut self, version: Version, author: &str, date: i64, text: &str) {
        self.revisions.clear();
        self.push(version, author, date, text);
    }

    fn push(&mut self, version: Version, author: &str, date: i64, text: &str) {
        self.revisions.push(Revision {
            version,
            author: author.to_string(),
            date,
            lines: text.split('\n').map(str::to_string).collect(),
        });
        self.state = ArchiveState::Updated;
    }

    /// Finds the revision a label refers to.
    ///
    /// `M.m` matches exactly; a bare branch number `M` resolves to the
    /// latest revision of that branch.
    pub fn resolve(&self, label: &str) -> Option<&Revision> {
        let label = label.trim();
        if let Ok(version) = label.parse::<Version>() {
            return self
                .revisions
                .iter()
                .find(|revision| revision.version == version);
        }
        let major = label.parse::<u32>().ok()?;
        self.revisions
            .iter()
            .filter(|revision| revision.version.major == major)
            .max_by_key(|revision| revision.version)
    }

    pub fn to_blob(&self) -> StoreResult<String> {
        let blob = ArchiveBlob {
            format: ARCHIVE_FORMAT,
            revisions: self.revisions.clone(),
        };
        Ok(serde_json::to_string(&blob)?)
    }

    /// Replaces the in-memory history with a stored blob, or with an empty
    /// history when no row exists.
    pub(crate) fn mark_loaded(&mut self, blob: Option<&str>) -> StoreResult<()> {
        let revisions = match blob {
            Some(raw) => decode_revisions(raw)?,
            None => Vec::new(),
        };
        self.revisions = revisions;
        self.persisted = blob.is_some();
        self.state = ArchiveState::Loaded;
        Ok(())
    }

    pub(crate) fn mark_saved(&mut self) {
        self.persisted = true;
        self.state = ArchiveState::Loaded;
    }
}

fn decode_revisions(raw: &str) -> StoreResult<Vec<Revision>> {
    let blob: ArchiveBlob = serde_json::from_str(raw)?;
    if blob.format != ARCHIVE_FORMAT {
        return Err(StoreError::CorruptArchive(format!(
            "unsupported archive format {}",
            blob.format
        )));
    }
    for pair in blob.revisions.windows(2) {
        if pair[0].version >= pair[1].version {
            return Err(StoreError::CorruptArchive(format!(
                "revision {} stored after {}",
                pair[1].version, pair[0].version
            )));
        }
    }
    Ok(blob.revisions)
}
