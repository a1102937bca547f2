//! tagvault core library: a content-addressed media archive with tag search,
//! and the engine that keeps its tags in sync with a remote tag repository.
//!
//! The sync engine pulls the repository's append-only update log, decodes
//! each update, bulk-loads the remote `hash -> id`, `hash:tag` and
//! `id -> tag` relations through an external sort, and finally merges the
//! learned tags into locally imported files.

pub mod archive;
pub mod config;
pub mod errors;
pub mod models;
pub mod store;
pub mod sync;
pub mod tags;

pub use archive::Archive;
pub use config::Config;
pub use errors::{ErrorKind, VaultError, VaultResult};
pub use store::Store;
pub use sync::{FeedClient, SyncEngine, TagFeed};
