//! External collaborator: the content-addressed object store (§6.1).
//!
//! The core never parses commit objects or repository internals itself;
//! it only needs a commit checked out into a directory, a handful of
//! metadata fields off that commit, and a way to ask the store to reclaim
//! space once a write completes. Remote fetch, signature verification, and
//! the on-disk object format are all out of scope and live behind this
//! trait.

use cap_std_ext::cap_std::fs::Dir;
use std::collections::BTreeMap;

use crate::error::Result;

/// The handful of commit metadata fields the writer consults (menu title
/// synthesis in particular); everything else in a commit's variant is
/// opaque to the core.
#[derive(Debug, Clone, Default)]
pub struct CommitMetadata {
    /// Commit creation time, seconds since the epoch.
    pub timestamp: Option<i64>,
    /// One-line commit subject, if set.
    pub subject: Option<String>,
    /// Extended commit body, if set.
    pub body: Option<String>,
    /// `version` metadata key, used verbatim in bootloader entry titles.
    pub version: Option<String>,
    /// Any other metadata keys the store chooses to surface, preserved
    /// without interpretation.
    pub extra: BTreeMap<String, String>,
}

/// What a [`ObjectStore::prune`] call should reclaim.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PruneMode {
    /// Only drop refs no longer reachable from any deployment; don't touch
    /// loose objects.
    RefsOnly,
    /// Full mark-and-sweep over the object store.
    Full,
}

/// Counters returned from a prune pass, folded into the writer's summary
/// log line.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PruneStats {
    /// Number of objects removed.
    pub objects_pruned: u64,
    /// Approximate bytes reclaimed.
    pub size_freed: u64,
}

/// The content-addressed object store, consumed by the core as a
/// borrow-only collaborator for the duration of a single writer call
/// (§9: no cyclic sysroot↔repo reference is modeled here).
pub trait ObjectStore {
    /// Materialize `commit`'s tree into `target_dir`, preserving
    /// ownership, mode, and extended attributes.
    fn checkout(&self, commit: &str, target_dir: &Dir) -> Result<()>;

    /// Read the metadata fields of `commit` needed for menu synthesis.
    fn load_commit_metadata(&self, commit: &str) -> Result<CommitMetadata>;

    /// Garbage-collect objects no longer referenced by any deployment.
    fn prune(&self, mode: PruneMode) -> Result<PruneStats>;
}
