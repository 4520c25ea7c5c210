//! Domain values exchanged with the store.
//!
//! # Responsibility
//! - Define the document shape the archive store snapshots and rebuilds.
//!
//! # Invariants
//! - A document is identified by tenant plus `space.name`.

pub mod document;
