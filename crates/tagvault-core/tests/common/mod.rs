#![allow(dead_code)]

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde_json::{json, Value};

use tagvault_core::models::{ContentHash, RepoMeta};
use tagvault_core::sync::{Session, TagFeed};
use tagvault_core::{Config, VaultError, VaultResult};

/// In-memory repository serving pre-built update blobs.
pub struct MemoryFeed {
    blobs: Vec<(String, Vec<u8>)>,
    /// Random per-blob delay up to this many milliseconds.
    max_latency_ms: u64,
    seed: u64,
    pub fetched: Arc<Mutex<Vec<String>>>,
}

impl MemoryFeed {
    pub fn new(blobs: Vec<Vec<u8>>) -> Self {
        Self {
            blobs: blobs
                .into_iter()
                .enumerate()
                .map(|(i, b)| (format!("{i:064x}"), b))
                .collect(),
            max_latency_ms: 0,
            seed: 0,
            fetched: Arc::new(Mutex::new(Vec::new())),
        }
    }

    pub fn with_latency(mut self, max_ms: u64, seed: u64) -> Self {
        self.max_latency_ms = max_ms;
        self.seed = seed;
        self
    }

    pub fn blob_ids(&self) -> Vec<String> {
        self.blobs.iter().map(|(id, _)| id.clone()).collect()
    }
}

impl TagFeed for MemoryFeed {
    fn get_session(&self) -> VaultResult<Session> {
        Ok(Session::new("memory"))
    }

    fn get_repo_meta(&self, _session: &Session, since: u64) -> VaultResult<RepoMeta> {
        let pending: Vec<String> = self
            .blobs
            .iter()
            .skip(since as usize)
            .map(|(id, _)| id.clone())
            .collect();
        Ok(RepoMeta {
            count: pending.len() as u64,
            hashes: pending,
        })
    }

    fn get_update(&self, _session: &Session, blob_id: &str) -> VaultResult<Vec<u8>> {
        let idx = self
            .blobs
            .iter()
            .position(|(id, _)| id == blob_id)
            .ok_or_else(|| VaultError::Status { status: 404, url: blob_id.to_string() })?;
        if self.max_latency_ms > 0 {
            let mut rng = fastrand::Rng::with_seed(self.seed.wrapping_mul(31).wrapping_add(idx as u64));
            std::thread::sleep(Duration::from_millis(rng.u64(0..=self.max_latency_ms)));
        }
        self.fetched.lock().push(blob_id.to_string());
        Ok(self.blobs[idx].1.clone())
    }
}

pub fn definition_blob(hashes: &[(u64, ContentHash)], tags: &[(u64, &str)]) -> Vec<u8> {
    let mut payload = Vec::new();
    if !hashes.is_empty() {
        let rows: Vec<Value> = hashes.iter().map(|(id, h)| json!([id, hex::encode(h)])).collect();
        payload.push(json!([0, rows]));
    }
    if !tags.is_empty() {
        let rows: Vec<Value> = tags.iter().map(|(id, t)| json!([id, t])).collect();
        payload.push(json!([1, rows]));
    }
    serde_json::to_vec(&json!([36, "definitions", payload])).unwrap()
}

/// Content blob with `rows` as additions and one ignored removal.
pub fn content_blob(rows: &[(u64, &[u64])]) -> Vec<u8> {
    let additions: Vec<Value> = rows.iter().map(|(tag, hashes)| json!([tag, hashes])).collect();
    serde_json::to_vec(&json!([34, "content", [[0, [[0, additions], [1, [[999, [1]]]]]]]])).unwrap()
}

pub fn test_config(dir: &Path) -> Config {
    Config {
        service_key: "test".into(),
        db_path: dir.join("vault.db"),
        temp_dir: Some(dir.join("spill")),
        sort_buffer_bytes: 256,
        commit_batch_size: 3,
        fetch_window: 4,
        fetch_workers: 4,
        reconcile_batch_size: 2,
        ..Config::default()
    }
}

pub fn strings(v: &[&str]) -> Vec<String> {
    v.iter().map(|s| s.to_string()).collect()
}
