//! Data model shared by the sync engine and the archive.
//!
//! `RepoMeta` and `Update` values are transient: they are created per sync
//! run and dropped once committed. Everything persisted goes through
//! `crate::sync::relations` and `crate::archive`.

use std::time::Duration;

/// Local archive file identifier.
pub type FileId = u64;

/// SHA-256 content hash, as used both remotely and as the archive's
/// secondary hash.
pub type ContentHash = [u8; 32];

// ---------------------------------------------------------------------------
// Remote feed
// ---------------------------------------------------------------------------

/// Result of an incremental metadata query.
///
/// `hashes` is in the remote log's append order, which must be preserved
/// end-to-end.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RepoMeta {
    /// Number of updates covered by this metadata; the resume counter
    /// advances by this much after a successful run.
    pub count: u64,
    /// Ordered update-blob identifiers.
    pub hashes: Vec<String>,
}

/// Introduces remote integer ids for content hashes and tag strings.
///
/// Entries keep their wire order so that a later reuse of an id overwrites
/// an earlier one when applied.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DefinitionUpdate {
    pub hashes: Vec<(u64, ContentHash)>,
    pub tags: Vec<(u64, String)>,
}

/// One remote tag applied to a set of remote hash ids.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContentRow {
    pub tag_id: u64,
    pub hash_ids: Vec<u64>,
}

/// Purely additive tag assignments. Removals on the feed are skipped by the
/// decoder.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ContentUpdate {
    pub rows: Vec<ContentRow>,
}

/// One decoded update blob.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Update {
    Definition(DefinitionUpdate),
    Content(ContentUpdate),
}

impl Update {
    pub fn kind(&self) -> &'static str {
        match self {
            Update::Definition(_) => "definition",
            Update::Content(_) => "content",
        }
    }
}

// ---------------------------------------------------------------------------
// Progress and reporting
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncPhase {
    Fetching,
    Loading,
    Reconciling,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SyncProgress {
    pub phase: SyncPhase,
    pub done: usize,
    pub total: usize,
}

/// Counters from one reconciliation pass.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReconcileStats {
    /// Records carrying a secondary hash that were examined.
    pub examined: usize,
    /// Records whose tag set grew.
    pub updated: usize,
    /// Total tags added across all records.
    pub tags_added: usize,
}

/// Summary of one `sync_tag_repository` run.
#[derive(Debug, Clone, Default)]
pub struct SyncReport {
    pub counter_before: u64,
    pub counter_after: u64,
    pub updates_applied: usize,
    pub hash_rows: u64,
    pub pair_rows: u64,
    pub tag_rows: u64,
    pub reconcile: ReconcileStats,
    pub elapsed: Duration,
}
