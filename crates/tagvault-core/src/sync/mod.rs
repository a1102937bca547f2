//! Tag repository synchronization.
//!
//! [`engine::SyncEngine`] drives one run: the [`feed`] is read through the
//! ordered [`pool`], each decoded update goes through the [`commit`]
//! pipeline and its [`sorter`]s into the store, and [`reconcile`] finally
//! merges the learned tags into local records.

pub mod commit;
pub mod decoder;
pub mod engine;
pub mod feed;
pub mod pool;
pub mod reconcile;
pub mod relations;
pub mod sorter;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use indicatif::ProgressBar;

use crate::models::{SyncPhase, SyncProgress};

pub use engine::SyncEngine;
pub use feed::{FeedClient, Session, TagFeed};

/// Trait for receiving sync progress updates
pub trait SyncProgressCallback: Send {
    fn progress(&mut self, progress: SyncProgress);
}

impl<F: FnMut(SyncProgress) + Send> SyncProgressCallback for F {
    fn progress(&mut self, progress: SyncProgress) {
        self(progress);
    }
}

impl SyncProgressCallback for () {
    fn progress(&mut self, _progress: SyncProgress) {}
}

impl SyncProgressCallback for ProgressBar {
    fn progress(&mut self, progress: SyncProgress) {
        self.update(|state| {
            state.set_len(progress.total as u64);
            state.set_pos(progress.done as u64);
        });
        self.set_message(match progress.phase {
            SyncPhase::Fetching => "fetching updates",
            SyncPhase::Loading => "loading relations",
            SyncPhase::Reconciling => "reconciling tags",
        });
    }
}

/// Cooperative cancellation shared between a run and its caller.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::Release);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }
}
