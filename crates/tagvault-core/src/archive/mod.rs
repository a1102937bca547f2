//! Local media archive: content-addressed records and the tag index.
//!
//! One [`parking_lot::RwLock`] guards the tag index and, by convention, every
//! write to records or the `tags` bucket. Writers hold it for the whole
//! read-modify-write so the index always matches the persisted tags.

pub mod record;
pub mod tag_index;

use std::time::{SystemTime, UNIX_EPOCH};

use parking_lot::{RwLock, RwLockReadGuard, RwLockWriteGuard};
use sha2::{Digest, Sha256};
use tracing::{debug, info};

use crate::errors::VaultResult;
use crate::models::{ContentHash, FileId};
use crate::store::database::{buckets, decode_counter, encode_counter, Store, Txn};
use crate::sync::relations::lookup_remote_tags;
use crate::tags;

pub use record::{decode_record_key, record_key, Record};
pub use tag_index::{StagedTags, TagIndex};

const NEXT_FILE_ID_KEY: &[u8] = b"next_file_id";

enum Inserted {
    New(FileId, StagedTags),
    Existing(FileId),
}

pub struct Archive {
    store: Store,
    index: RwLock<TagIndex>,
}

impl Archive {
    /// Open the archive over `store` and load the tag index.
    pub fn open(store: Store) -> VaultResult<Self> {
        let index = store.with_read_txn(TagIndex::load)?;
        info!(tags = index.len(), db = %store.db_path().display(), "archive opened");
        Ok(Self {
            store,
            index: RwLock::new(index),
        })
    }

    pub fn store(&self) -> &Store {
        &self.store
    }

    pub fn read_index(&self) -> RwLockReadGuard<'_, TagIndex> {
        self.index.read()
    }

    /// Exclusive access for a tag-mutating write.
    pub fn write_index(&self) -> RwLockWriteGuard<'_, TagIndex> {
        self.index.write()
    }

    /// Content-address `data` and add it with `tags`. Re-importing known
    /// content returns the existing id unchanged.
    pub fn import(&self, data: &[u8], tags: &[String]) -> VaultResult<FileId> {
        let sha256: ContentHash = Sha256::digest(data).into();
        let import_time = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or(0);
        self.insert_record(Record {
            sha256: Some(hex::encode(sha256)),
            import_time,
            size: data.len() as u64,
            tags: tags.to_vec(),
        })
    }

    /// Store a new record under the next file id. Tags are normalized and,
    /// when the record has a secondary hash, merged with the remote tags
    /// already known for it. A record whose secondary hash is already
    /// stored is not added; the existing id is returned instead.
    pub fn insert_record(&self, mut record: Record) -> VaultResult<FileId> {
        let normalized: Vec<String> = record
            .tags
            .iter()
            .map(|t| tags::normalize(t))
            .filter(|t| !t.is_empty())
            .collect();
        record.tags = tags::merge_tag_sets(&normalized, std::iter::empty());
        let sha256 = record.sha256_bytes()?;

        let mut index = self.index.write();
        let inserted = self.store.with_txn(|txn| {
            if let Some(hash) = &sha256 {
                if let Some(raw) = txn.get(buckets::SHA256, hash)? {
                    return Ok(Inserted::Existing(decode_record_key(&raw)?));
                }
            }
            let id = next_file_id(txn)?;
            if let Some(hash) = &sha256 {
                let remote = lookup_remote_tags(txn, hash)?;
                record.tags = tags::merge_tag_sets(&record.tags, &remote);
                txn.put(buckets::SHA256, hash, &record_key(id))?;
            }
            txn.put(buckets::RECORDS, &record_key(id), &record.encode()?)?;
            let staged = index.stage(record.tags.iter().map(|t| (t.as_str(), id)));
            TagIndex::persist(txn, &staged)?;
            Ok(Inserted::New(id, staged))
        })?;
        let (id, staged) = match inserted {
            Inserted::New(id, staged) => (id, staged),
            Inserted::Existing(existing) => {
                debug!(id = existing, "content already imported");
                return Ok(existing);
            }
        };
        index.apply(staged);
        debug!(id, tags = record.tags.len(), "record inserted");
        Ok(id)
    }

    pub fn get_record(&self, id: FileId) -> VaultResult<Option<Record>> {
        match self.store.get(buckets::RECORDS, &record_key(id))? {
            Some(raw) => Ok(Some(Record::decode(&raw)?)),
            None => Ok(None),
        }
    }

    pub fn find_by_sha256(&self, sha256: &ContentHash) -> VaultResult<Option<FileId>> {
        match self.store.get(buckets::SHA256, sha256)? {
            Some(raw) => Ok(Some(decode_record_key(&raw)?)),
            None => Ok(None),
        }
    }

    /// Visit every record in file id order over one snapshot.
    pub fn iterate_records<F>(&self, mut f: F) -> VaultResult<()>
    where
        F: FnMut(FileId, &Record) -> VaultResult<()>,
    {
        self.store.with_read_txn(|txn| {
            txn.for_each_prefix(buckets::RECORDS, &[], |key, value| {
                f(decode_record_key(key)?, &Record::decode(value)?)
            })
        })
    }

    /// Files carrying all of `query`. Tags are normalized before lookup.
    pub fn search(&self, query: &[String]) -> Vec<FileId> {
        let query: Vec<String> = query
            .iter()
            .map(|t| tags::normalize(t))
            .filter(|t| !t.is_empty())
            .collect();
        self.index.read().search(&query)
    }

    /// Remote tags currently known for `sha256`.
    pub fn remote_tags(&self, sha256: &ContentHash) -> VaultResult<Vec<String>> {
        let found = self
            .store
            .with_read_txn(|txn| lookup_remote_tags(txn, sha256))?;
        Ok(tags::merge_tag_sets(&found, std::iter::empty()))
    }
}

fn next_file_id(txn: &Txn<'_>) -> VaultResult<FileId> {
    let id = match txn.get(buckets::META, NEXT_FILE_ID_KEY)? {
        Some(raw) => decode_counter(&raw)?,
        None => 1,
    };
    txn.put(buckets::META, NEXT_FILE_ID_KEY, &encode_counter(id + 1))?;
    Ok(id)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sync::relations::{encode_id, encode_pair};

    fn open() -> (tempfile::TempDir, Archive) {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::open(dir.path().join("a.db")).unwrap();
        (dir, Archive::open(store).unwrap())
    }

    fn strings(v: &[&str]) -> Vec<String> {
        v.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_import_is_content_addressed() {
        let (_dir, archive) = open();
        let a = archive.import(b"hello", &strings(&["Blue Sky"])).unwrap();
        let again = archive.import(b"hello", &strings(&["other"])).unwrap();
        let b = archive.import(b"world", &[]).unwrap();
        assert_eq!(a, again);
        assert_ne!(a, b);

        let record = archive.get_record(a).unwrap().unwrap();
        assert_eq!(record.size, 5);
        assert_eq!(record.tags, vec!["blue_sky"]);
        assert_eq!(
            record.sha256.as_deref(),
            Some("2cf24dba5fb0a30e26e83b2ac5b9e29e1b161e5c1fa7425e73043362938b9824")
        );
    }

    #[test]
    fn test_search_uses_index() {
        let (_dir, archive) = open();
        let a = archive.import(b"1", &strings(&["x", "y"])).unwrap();
        let b = archive.import(b"2", &strings(&["y"])).unwrap();
        assert_eq!(archive.search(&strings(&["Y"])), vec![a, b]);
        assert_eq!(archive.search(&strings(&["x", "y"])), vec![a]);
    }

    #[test]
    fn test_index_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("a.db");
        let id = {
            let archive = Archive::open(Store::open(&path).unwrap()).unwrap();
            archive.import(b"data", &strings(&["kept"])).unwrap()
        };
        let archive = Archive::open(Store::open(&path).unwrap()).unwrap();
        assert_eq!(archive.search(&strings(&["kept"])), vec![id]);
    }

    #[test]
    fn test_import_maps_known_remote_tags() {
        let (_dir, archive) = open();
        let sha: ContentHash = Sha256::digest(b"remote").into();
        archive
            .store()
            .with_txn(|txn| {
                txn.put(buckets::HASH_TO_ID, &sha, &encode_id(9))?;
                txn.put(buckets::HASH_TAG, &encode_pair(9, 1), b"")?;
                txn.put(buckets::ID_TO_TAG, &encode_id(1), b"sky")
            })
            .unwrap();

        assert_eq!(archive.remote_tags(&sha).unwrap(), vec!["sky"]);
        let id = archive.import(b"remote", &strings(&["local"])).unwrap();
        let record = archive.get_record(id).unwrap().unwrap();
        assert_eq!(record.tags, vec!["local", "sky"]);
        assert_eq!(archive.search(&strings(&["sky"])), vec![id]);
    }

    #[test]
    fn test_iterate_records_in_id_order() {
        let (_dir, archive) = open();
        for i in 0..3u8 {
            archive.import(&[i], &[]).unwrap();
        }
        let mut ids = Vec::new();
        archive
            .iterate_records(|id, _| {
                ids.push(id);
                Ok(())
            })
            .unwrap();
        assert_eq!(ids, vec![1, 2, 3]);
    }

    #[test]
    fn test_concurrent_imports_of_same_content() {
        let (_dir, archive) = open();
        let ids: Vec<FileId> = std::thread::scope(|scope| {
            let handles: Vec<_> = (0..8)
                .map(|i| {
                    let archive = &archive;
                    scope.spawn(move || archive.import(b"same bytes", &[format!("t{i}")]).unwrap())
                })
                .collect();
            handles.into_iter().map(|h| h.join().unwrap()).collect()
        });
        assert!(ids.iter().all(|id| *id == ids[0]));

        let mut records = 0;
        archive
            .iterate_records(|_, _| {
                records += 1;
                Ok(())
            })
            .unwrap();
        assert_eq!(records, 1);
    }

    #[test]
    fn test_insert_record_with_known_hash_returns_existing_id() {
        let (_dir, archive) = open();
        let id = archive.import(b"x", &strings(&["a"])).unwrap();
        let record = archive.get_record(id).unwrap().unwrap();
        let again = archive
            .insert_record(Record {
                tags: strings(&["b"]),
                ..record
            })
            .unwrap();
        assert_eq!(again, id);
        assert_eq!(archive.get_record(id).unwrap().unwrap().tags, vec!["a"]);
        assert!(archive.search(&strings(&["b"])).is_empty());
    }
}
