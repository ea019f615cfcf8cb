//! Store contracts consumed by the protocol runtime.
//!
//! The daemon never touches store files directly; users, groups and
//! zipscript state flow exclusively through these traits. Implementations
//! are internally synchronized: every method takes `&self` and must present
//! a consistent view of a single entity per call. The bundled in-memory
//! implementations back the daemon by default and the test suite throughout.

mod memory;

pub use memory::{
    hash_password, MemoryGroupStore, MemoryStoreAdmin, MemoryUserStore, MemoryZipscriptDb,
};

use std::collections::BTreeMap;

use thiserror::Error;

use crate::users::{Group, User};

/// Failure inside a store implementation.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("duplicate entry: {0}")]
    Duplicate(String),
    #[error("no such entry: {0}")]
    Missing(String),
    #[error("store backend error: {0}")]
    Backend(String),
}

pub type StoreResult<T> = Result<T, StoreError>;

/// User account persistence and authentication.
pub trait UserStore: Send + Sync {
    /// Validates credentials; `None` when the name or password is wrong.
    /// Disabled accounts still authenticate here; the access gate rejects
    /// them afterwards, so the failure is reported with the right reason.
    fn try_authenticate(&self, name: &str, password: &str) -> Option<User>;

    /// Case-insensitive lookup.
    fn find(&self, name: &str) -> Option<User>;

    fn all(&self) -> Vec<User>;

    fn try_add(&self, user: User) -> StoreResult<()>;

    fn try_update(&self, user: User) -> StoreResult<()>;

    /// Hook invoked when a session for this account ends.
    fn on_logout(&self, user: &User);
}

/// Group persistence.
pub trait GroupStore: Send + Sync {
    fn find(&self, name: &str) -> Option<Group>;

    fn all(&self) -> Vec<Group>;

    fn try_add(&self, group: Group) -> StoreResult<()>;

    fn try_update(&self, group: Group) -> StoreResult<()>;

    fn try_delete(&self, name: &str) -> StoreResult<()>;

    fn try_rename(&self, from: &str, to: &str) -> StoreResult<()>;
}

/// Opaque zipscript release persistence, keyed by `(section, release_path)`.
///
/// The engine operates on its in-memory projection and flushes through this
/// contract on every state change.
pub trait ZipscriptDb: Send + Sync {
    fn get(&self, key: &str) -> Option<String>;

    fn put(&self, key: &str, value: String);

    fn delete(&self, key: &str) -> bool;

    /// Snapshot of all stored pairs.
    fn iterate(&self) -> BTreeMap<String, String>;
}

/// Administrative surface shared by the store bundle (`SITE DBBACKUP` and
/// friends delegate here).
pub trait StoreAdmin: Send + Sync {
    /// Persists a backup, returning a human-readable description of it.
    fn backup(&self) -> StoreResult<String>;

    /// Consistency check, returning a findings report.
    fn fsck(&self) -> StoreResult<Vec<String>>;

    /// One-line-per-store summary for `SITE DBSUMMARY`.
    fn summary(&self) -> Vec<String>;
}
