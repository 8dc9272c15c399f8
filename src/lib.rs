//! vetshop-sync: bidirectional user/customer reconciliation for the
//! pet-store admin backend.
//!
//! The backend keeps auth-capable accounts (Users) and commerce profiles
//! (Customers) in two separately-mutated collections. This crate keeps the
//! two sides consistent: every observed mutation on one side is normalized,
//! matched against the opposite collection, and pushed through a single
//! reconcile path. A local SQLite mirror remembers the last-known state of
//! everything touched so partial failures degrade gracefully and unfinished
//! create-then-link sagas can be repaired.
//!
//! Entry points:
//! - [`SyncEngine::reconcile`] for one observed mutation
//! - [`SyncEngine::sync_all`] for a full bulk pass
//! - [`SyncEngine::repair_pending_links`] to finish interrupted link sagas
//! - [`SyncEngine::verify_linkage`] for a read-only consistency check

pub mod api;
pub mod bulk;
pub mod matcher;
pub mod mirror;
pub mod normalize;
pub mod notify;
pub mod reconcile;
pub mod records;

#[cfg(test)]
mod testutil;

pub use api::{ApiError, Collection, HttpCollection, RemoteConfig};
pub use bulk::{BulkReport, LinkageReport, SyncDirection, SyncReport};
pub use matcher::{find_customer_for_user, find_user_for_customer};
pub use mirror::{LinkState, MirrorEntry, MirrorStore};
pub use notify::{StatusEvent, StatusNotifier};
pub use reconcile::SyncEngine;
pub use records::{
    CustomerRecord, EntityKind, SyncOperation, UserRecord, CUSTOMER_ROLE_ID,
};
