mod common;

use std::sync::Arc;

use common::{content_blob, MemoryFeed};
use tagvault_core::models::Update;
use tagvault_core::sync::pool::{fetch_ordered, FetchOptions};
use tagvault_core::sync::{CancelToken, Session};
use tagvault_core::VaultError;

/// Blob `i` carries a single content row with tag id `i`.
fn numbered_blobs(n: u64) -> Vec<Vec<u8>> {
    (0..n)
        .map(|i| {
            let hashes = [i];
            content_blob(&[(i, &hashes[..])])
        })
        .collect()
}

fn tag_of(update: &Update) -> u64 {
    match update {
        Update::Content(c) => c.rows[0].tag_id,
        other => panic!("unexpected update: {other:?}"),
    }
}

#[test]
fn delivery_order_survives_random_latency() {
    for seed in 0..6u64 {
        let feed = MemoryFeed::new(numbered_blobs(48)).with_latency(6, seed);
        let ids = feed.blob_ids();
        let fetched = Arc::clone(&feed.fetched);
        let opts = FetchOptions { workers: 8, window: 8 };

        let mut delivered = Vec::new();
        let count = fetch_ordered(
            Arc::new(feed),
            &Session::new("s"),
            &ids,
            &opts,
            &CancelToken::new(),
            |idx, update| {
                assert_eq!(tag_of(&update), idx as u64, "seed {seed}");
                delivered.push(idx);
                Ok(())
            },
        )
        .unwrap();

        assert_eq!(count, 48);
        assert_eq!(delivered, (0..48).collect::<Vec<_>>(), "seed {seed}");
        // Completion order is scrambled; delivery order is not.
        assert_eq!(fetched.lock().len(), 48);
    }
}

#[test]
fn window_of_one_is_sequential() {
    let feed = MemoryFeed::new(numbered_blobs(10)).with_latency(2, 99);
    let ids = feed.blob_ids();
    let fetched = Arc::clone(&feed.fetched);
    fetch_ordered(
        Arc::new(feed),
        &Session::new("s"),
        &ids,
        &FetchOptions { workers: 4, window: 1 },
        &CancelToken::new(),
        |_, _| Ok(()),
    )
    .unwrap();
    assert_eq!(*fetched.lock(), ids);
}

#[test]
fn first_failure_reaches_the_consumer() {
    let mut blobs = numbered_blobs(40);
    blobs[17] = b"{\"not\":\"a tuple\"}".to_vec();
    let feed = MemoryFeed::new(blobs).with_latency(3, 7);
    let ids = feed.blob_ids();

    let mut last = None;
    let err = fetch_ordered(
        Arc::new(feed),
        &Session::new("s"),
        &ids,
        &FetchOptions { workers: 6, window: 6 },
        &CancelToken::new(),
        |idx, _| {
            last = Some(idx);
            Ok(())
        },
    )
    .unwrap_err();

    assert!(matches!(err, VaultError::Decode { .. }));
    assert!(last.map_or(true, |i| i < 17));
}

#[test]
fn cancellation_from_another_thread() {
    let feed = MemoryFeed::new(numbered_blobs(200)).with_latency(5, 3);
    let ids = feed.blob_ids();
    let cancel = CancelToken::new();
    let trigger = cancel.clone();
    let canceller = std::thread::spawn(move || {
        std::thread::sleep(std::time::Duration::from_millis(30));
        trigger.cancel();
    });

    let mut consumed = 0;
    let err = fetch_ordered(
        Arc::new(feed),
        &Session::new("s"),
        &ids,
        &FetchOptions { workers: 4, window: 4 },
        &cancel,
        |_, _| {
            consumed += 1;
            Ok(())
        },
    )
    .unwrap_err();
    canceller.join().unwrap();

    assert!(matches!(err, VaultError::Cancelled));
    assert!(consumed < 200);
}
