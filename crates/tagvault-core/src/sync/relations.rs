//! Binary layout of the remote relations and the lookup that joins them.
//!
//! * `remote:hash->id`  key: hash (32 bytes), value: hash id (u64 LE)
//! * `remote:hash:tag`  key: hash id (u64 LE) ++ tag id (u64 LE), no value
//! * `remote:id->tag`   key: tag id (u64 LE), value: normalized tag text
//!
//! Hash ids are little-endian on disk, so the pair keys group by hash id
//! (prefix scans work) but do not sort numerically.

use tracing::warn;

use crate::errors::{VaultError, VaultResult};
use crate::models::ContentHash;
use crate::store::database::{buckets, Txn};

/// Sorter record for `hash->id`: hash followed by the id.
pub const HASH_RECORD_WIDTH: usize = 40;
/// Sorter record and key for `hash:tag`.
pub const PAIR_WIDTH: usize = 16;

pub fn encode_id(id: u64) -> [u8; 8] {
    id.to_le_bytes()
}

pub fn decode_id(raw: &[u8]) -> VaultResult<u64> {
    let bytes: [u8; 8] = raw
        .try_into()
        .map_err(|_| VaultError::Store(format!("remote id has {} bytes, expected 8", raw.len())))?;
    Ok(u64::from_le_bytes(bytes))
}

pub fn encode_hash_record(hash: &ContentHash, id: u64) -> [u8; HASH_RECORD_WIDTH] {
    let mut record = [0u8; HASH_RECORD_WIDTH];
    record[..32].copy_from_slice(hash);
    record[32..].copy_from_slice(&encode_id(id));
    record
}

/// Split a sorted hash record into its store key and value.
pub fn split_hash_record(record: &[u8]) -> VaultResult<(&[u8], &[u8])> {
    if record.len() != HASH_RECORD_WIDTH {
        return Err(VaultError::Store(format!(
            "hash record has {} bytes, expected {HASH_RECORD_WIDTH}",
            record.len()
        )));
    }
    Ok(record.split_at(32))
}

pub fn encode_pair(hash_id: u64, tag_id: u64) -> [u8; PAIR_WIDTH] {
    let mut key = [0u8; PAIR_WIDTH];
    key[..8].copy_from_slice(&encode_id(hash_id));
    key[8..].copy_from_slice(&encode_id(tag_id));
    key
}

pub fn decode_pair(key: &[u8]) -> VaultResult<(u64, u64)> {
    if key.len() != PAIR_WIDTH {
        return Err(VaultError::Store(format!(
            "hash:tag key has {} bytes, expected {PAIR_WIDTH}",
            key.len()
        )));
    }
    Ok((decode_id(&key[..8])?, decode_id(&key[8..])?))
}

/// Remote tags recorded for a content hash, in pair-key order. Pairs whose
/// tag id was never defined are skipped.
pub fn lookup_remote_tags(txn: &Txn<'_>, sha256: &ContentHash) -> VaultResult<Vec<String>> {
    let Some(hash_id) = txn.get(buckets::HASH_TO_ID, sha256)? else {
        return Ok(Vec::new());
    };
    if hash_id.len() != 8 {
        return Err(VaultError::Store(format!(
            "hash id for {} has {} bytes, expected 8",
            hex::encode(sha256),
            hash_id.len()
        )));
    }

    let mut tags = Vec::new();
    let mut undefined = 0usize;
    txn.for_each_prefix(buckets::HASH_TAG, &hash_id, |key, _| {
        let (_, tag_id) = decode_pair(key)?;
        match txn.get(buckets::ID_TO_TAG, &encode_id(tag_id))? {
            Some(raw) => tags.push(String::from_utf8(raw).map_err(|e| {
                VaultError::Store(format!("tag {tag_id} is not valid UTF-8: {e}"))
            })?),
            None => undefined += 1,
        }
        Ok(())
    })?;
    if undefined > 0 {
        warn!(
            hash = %hex::encode(sha256),
            undefined,
            "hash references tag ids with no definition"
        );
    }
    Ok(tags)
}
