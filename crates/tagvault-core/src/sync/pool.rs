//! Concurrent fetch and decode with in-order delivery.
//!
//! Every feed position gets its own single-use `bounded(1)` slot, allocated
//! up front. Workers publish into the slot of the position they fetched and
//! the consumer drains slots `0, 1, 2, ...` in turn, so completion order
//! never matters. At most `window` fetches are outstanding: position
//! `i + window` is dispatched only after position `i` has been consumed.
//!
//! The first worker error is parked in a one-element error channel before
//! the shared abort flag is raised. Workers that start after the flag is up
//! exit without fetching, which disconnects their slot.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crossbeam_channel::{bounded, select, Receiver, Sender};
use tracing::{debug, error, warn};

use crate::config::Config;
use crate::errors::{VaultError, VaultResult};
use crate::models::Update;
use crate::sync::decoder;
use crate::sync::feed::{Session, TagFeed};
use crate::sync::CancelToken;

/// Default number of outstanding fetches.
pub const DEFAULT_WINDOW: usize = 30;

#[derive(Debug, Clone)]
pub struct FetchOptions {
    pub workers: usize,
    pub window: usize,
}

impl FetchOptions {
    pub fn from_config(config: &Config) -> Self {
        Self {
            workers: config.effective_fetch_workers(),
            window: config.fetch_window,
        }
    }
}

impl Default for FetchOptions {
    fn default() -> Self {
        Self {
            workers: (num_cpus::get() * 2).max(8),
            window: DEFAULT_WINDOW,
        }
    }
}

struct Dispatcher<F> {
    pool: rayon::ThreadPool,
    feed: Arc<F>,
    session: Arc<Session>,
    blob_ids: Vec<Arc<str>>,
    slots: Vec<Option<Sender<Update>>>,
    errors: Sender<(usize, VaultError)>,
    abort: Arc<AtomicBool>,
    cancel: CancelToken,
}

impl<F: TagFeed + 'static> Dispatcher<F> {
    fn dispatch(&mut self, idx: usize) {
        let Some(slot) = self.slots.get_mut(idx).and_then(Option::take) else {
            return;
        };
        let feed = Arc::clone(&self.feed);
        let session = Arc::clone(&self.session);
        let blob_id = Arc::clone(&self.blob_ids[idx]);
        let errors = self.errors.clone();
        let abort = Arc::clone(&self.abort);
        let cancel = self.cancel.clone();

        self.pool.spawn(move || {
            if abort.load(Ordering::Acquire) || cancel.is_cancelled() {
                return;
            }
            let result = feed
                .get_update(&session, &blob_id)
                .and_then(|raw| decoder::decode_update(&raw));
            match result {
                Ok(update) => {
                    let _ = slot.send(update);
                }
                Err(e) => {
                    warn!(index = idx, blob = %blob_id, error = %e, "update fetch failed");
                    let _ = errors.try_send((idx, e));
                    abort.store(true, Ordering::Release);
                }
            }
        });
    }
}

/// Fetch and decode every blob in `blob_ids`, calling `consume` with each
/// update in list order. Returns the number of updates consumed.
///
/// Stops at the first fetch, decode or `consume` error, or when `cancel`
/// fires; outstanding work is abandoned.
pub fn fetch_ordered<F, C>(
    feed: Arc<F>,
    session: &Session,
    blob_ids: &[String],
    options: &FetchOptions,
    cancel: &CancelToken,
    mut consume: C,
) -> VaultResult<usize>
where
    F: TagFeed + 'static,
    C: FnMut(usize, Update) -> VaultResult<()>,
{
    let total = blob_ids.len();
    if total == 0 {
        return Ok(0);
    }

    let pool = rayon::ThreadPoolBuilder::new()
        .num_threads(options.workers.max(1))
        .thread_name(|i| format!("tag-fetch-{i}"))
        .panic_handler(|_| error!("tag fetch worker panicked"))
        .build()
        .map_err(|e| VaultError::Pool(e.to_string()))?;

    let mut receivers: Vec<Receiver<Update>> = Vec::with_capacity(total);
    let mut senders: Vec<Option<Sender<Update>>> = Vec::with_capacity(total);
    for _ in 0..total {
        let (tx, rx) = bounded(1);
        senders.push(Some(tx));
        receivers.push(rx);
    }
    let (err_tx, err_rx) = bounded::<(usize, VaultError)>(1);

    let abort = Arc::new(AtomicBool::new(false));
    let mut dispatcher = Dispatcher {
        pool,
        feed,
        session: Arc::new(session.clone()),
        blob_ids: blob_ids.iter().map(|s| Arc::from(s.as_str())).collect(),
        slots: senders,
        errors: err_tx,
        abort: Arc::clone(&abort),
        cancel: cancel.clone(),
    };

    let window = options.window.max(1);
    for idx in 0..window.min(total) {
        dispatcher.dispatch(idx);
    }

    let result = (|| -> VaultResult<usize> {
        for (idx, slot) in receivers.iter().enumerate() {
            if cancel.is_cancelled() {
                return Err(VaultError::Cancelled);
            }
            if let Ok((_, e)) = err_rx.try_recv() {
                return Err(e);
            }
            let update = select! {
                recv(err_rx) -> failed => match failed {
                    Ok((_, e)) => return Err(e),
                    Err(_) => return Err(VaultError::Pool("error channel closed".into())),
                },
                recv(slot) -> delivered => match delivered {
                    Ok(update) => update,
                    Err(_) => return Err(abandoned(idx, &err_rx, cancel)),
                },
            };

            consume(idx, update)?;
            dispatcher.dispatch(idx + window);
        }
        Ok(total)
    })();

    if result.is_err() {
        abort.store(true, Ordering::Release);
    }
    debug!(total, ok = result.is_ok(), "ordered fetch finished");
    result
}

/// Error for a slot whose worker exited without publishing.
fn abandoned(
    idx: usize,
    errors: &Receiver<(usize, VaultError)>,
    cancel: &CancelToken,
) -> VaultError {
    if let Ok((_, e)) = errors.try_recv() {
        return e;
    }
    if cancel.is_cancelled() {
        return VaultError::Cancelled;
    }
    VaultError::Pool(format!("worker for update {idx} exited without a result"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::RepoMeta;
    use std::sync::atomic::AtomicUsize;

    /// Serves `[34,0,[[0,[[0,[[<n>,[<n>]]]]]]]]` for blob id `n`.
    struct NumberedFeed {
        fail_at: Option<usize>,
        fetched: AtomicUsize,
    }

    impl TagFeed for NumberedFeed {
        fn get_session(&self) -> VaultResult<Session> {
            Ok(Session::new("s"))
        }

        fn get_repo_meta(&self, _: &Session, _: u64) -> VaultResult<RepoMeta> {
            Ok(RepoMeta::default())
        }

        fn get_update(&self, _: &Session, blob_id: &str) -> VaultResult<Vec<u8>> {
            self.fetched.fetch_add(1, Ordering::SeqCst);
            let n: usize = blob_id.parse().unwrap();
            if Some(n) == self.fail_at {
                return Err(VaultError::Status { status: 503, url: blob_id.into() });
            }
            Ok(format!("[34,0,[[0,[[0,[[{n},[{n}]]]]]]]]").into_bytes())
        }
    }

    fn tag_id(update: &Update) -> u64 {
        match update {
            Update::Content(c) => c.rows[0].tag_id,
            other => panic!("unexpected update {other:?}"),
        }
    }

    fn ids(n: usize) -> Vec<String> {
        (0..n).map(|i| i.to_string()).collect()
    }

    #[test]
    fn test_delivers_in_order() {
        let feed = Arc::new(NumberedFeed { fail_at: None, fetched: AtomicUsize::new(0) });
        let opts = FetchOptions { workers: 4, window: 3 };
        let mut seen = Vec::new();
        let n = fetch_ordered(feed, &Session::new("s"), &ids(20), &opts, &CancelToken::new(), |i, u| {
            assert_eq!(tag_id(&u), i as u64);
            seen.push(i);
            Ok(())
        })
        .unwrap();
        assert_eq!(n, 20);
        assert_eq!(seen, (0..20).collect::<Vec<_>>());
    }

    #[test]
    fn test_empty_list() {
        let feed = Arc::new(NumberedFeed { fail_at: None, fetched: AtomicUsize::new(0) });
        let n = fetch_ordered(
            feed,
            &Session::new("s"),
            &[],
            &FetchOptions::default(),
            &CancelToken::new(),
            |_, _| Ok(()),
        )
        .unwrap();
        assert_eq!(n, 0);
    }

    #[test]
    fn test_worker_error_aborts_run() {
        let feed = Arc::new(NumberedFeed { fail_at: Some(5), fetched: AtomicUsize::new(0) });
        let opts = FetchOptions { workers: 2, window: 2 };
        let mut consumed = 0;
        let err = fetch_ordered(
            Arc::clone(&feed),
            &Session::new("s"),
            &ids(50),
            &opts,
            &CancelToken::new(),
            |_, _| {
                consumed += 1;
                Ok(())
            },
        )
        .unwrap_err();
        assert!(matches!(err, VaultError::Status { status: 503, .. }));
        assert!(consumed <= 5);
        // The window bounds how far fetching got past the failure.
        assert!(feed.fetched.load(Ordering::SeqCst) <= 5 + 1 + opts.window);
    }

    #[test]
    fn test_consumer_error_stops_dispatch() {
        let feed = Arc::new(NumberedFeed { fail_at: None, fetched: AtomicUsize::new(0) });
        let opts = FetchOptions { workers: 2, window: 2 };
        let err = fetch_ordered(
            Arc::clone(&feed),
            &Session::new("s"),
            &ids(100),
            &opts,
            &CancelToken::new(),
            |i, _| {
                if i == 3 {
                    Err(VaultError::Store("disk full".into()))
                } else {
                    Ok(())
                }
            },
        )
        .unwrap_err();
        assert!(matches!(err, VaultError::Store(_)));
        assert!(feed.fetched.load(Ordering::SeqCst) <= 3 + 1 + opts.window);
    }

    #[test]
    fn test_cancel_token() {
        let feed = Arc::new(NumberedFeed { fail_at: None, fetched: AtomicUsize::new(0) });
        let cancel = CancelToken::new();
        let trigger = cancel.clone();
        let err = fetch_ordered(
            feed,
            &Session::new("s"),
            &ids(10),
            &FetchOptions { workers: 2, window: 2 },
            &cancel,
            |i, _| {
                if i == 1 {
                    trigger.cancel();
                }
                Ok(())
            },
        )
        .unwrap_err();
        assert!(matches!(err, VaultError::Cancelled));
    }
}
