//! Domain errors surfaced by the store.
//!
//! # Invariants
//! - Engine failures are always wrapped with the document, tenant or
//!   operation they happened in; `EngineError` never escapes unwrapped.

use crate::engine::EngineError;
use std::error::Error;
use std::fmt::{Display, Formatter};

pub type StoreResult<T> = Result<T, StoreError>;

#[derive(Debug)]
pub enum StoreError {
    /// No session factory is available yet.
    NotInitialized,
    /// The operation expected a session opened by the caller.
    NoActiveSession,
    Engine {
        operation: &'static str,
        source: EngineError,
    },
    SwitchDatabase {
        tenant: String,
        source: EngineError,
    },
    SchemaUpdate {
        tenant: String,
        source: Box<StoreError>,
    },
    ReadingArchive {
        document: String,
        source: Box<StoreError>,
    },
    SavingArchive {
        document: String,
        source: Box<StoreError>,
    },
    ReadingRevisions {
        document: String,
        source: Box<StoreError>,
    },
    UnexistantVersion {
        document: String,
        version: String,
    },
    ReadingVersion {
        document: String,
        version: String,
        source: Box<StoreError>,
    },
    /// The archive's latest revision has no successor label.
    VersionOverflow {
        document: String,
        version: String,
    },
    CorruptArchive(String),
    Serialization(serde_json::Error),
    Config(String),
}

impl StoreError {
    pub(crate) fn engine(operation: &'static str) -> impl FnOnce(EngineError) -> Self {
        move |source| Self::Engine { operation, source }
    }
}

impl Display for StoreError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::NotInitialized => write!(f, "store is not initialized"),
            Self::NoActiveSession => write!(f, "no active session in context"),
            Self::Engine { operation, source } => {
                write!(f, "engine failure during {operation}: {source}")
            }
            Self::SwitchDatabase { tenant, .. } => {
                write!(f, "exception while switching to database {tenant}")
            }
            Self::SchemaUpdate { tenant, .. } => {
                write!(f, "failed updating schema for wiki {tenant}")
            }
            Self::ReadingArchive { document, .. } => {
                write!(f, "exception while loading archive of document {document}")
            }
            Self::SavingArchive { document, .. } => {
                write!(f, "exception while saving archive of document {document}")
            }
            Self::ReadingRevisions { document, .. } => {
                write!(f, "exception while reading document {document} revisions")
            }
            Self::UnexistantVersion { document, version } => {
                write!(f, "unexistant version {version} of document {document}")
            }
            Self::ReadingVersion {
                document, version, ..
            } => write!(f, "exception while reading document {document} version {version}"),
            Self::VersionOverflow { document, version } => {
                write!(f, "no version after {version} for document {document}")
            }
            Self::CorruptArchive(message) => write!(f, "corrupt archive data: {message}"),
            Self::Serialization(err) => write!(f, "serialization failure: {err}"),
            Self::Config(message) => write!(f, "invalid configuration: {message}"),
        }
    }
}

impl Error for StoreError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            Self::Engine { source, .. } | Self::SwitchDatabase { source, .. } => Some(source),
            Self::SchemaUpdate { source, .. }
            | Self::ReadingArchive { source, .. }
            | Self::SavingArchive { source, .. }
            | Self::ReadingRevisions { source, .. }
            | Self::ReadingVersion { source, .. } => Some(source.as_ref()),
            Self::Serialization(err) => Some(err),
            Self::NotInitialized
            | Self::NoActiveSession
            | Self::UnexistantVersion { .. }
            | Self::VersionOverflow { .. }
            | Self::CorruptArchive(_)
            | Self::Config(_) => None,
        }
    }
}

impl From<serde_json::Error> for StoreError {
    fn from(value: serde_json::Error) -> Self {
        Self::Serialization(value)
    }
}
