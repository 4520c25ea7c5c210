//! Per-document revision archives.

pub mod document_archive;
pub mod locks;
pub mod store;
pub mod version;

pub use document_archive::{ArchiveKey, ArchiveState, DocumentArchive, Revision};
pub use store::{ArchiveStore, VersionedDocument};
pub use version::{InvalidVersion, Version};
