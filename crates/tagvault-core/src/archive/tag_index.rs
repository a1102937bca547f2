//! In-memory `tag -> file set` index, mirrored in the `tags` bucket.

use std::collections::{BTreeMap, BTreeSet, HashMap};

use crate::errors::{VaultError, VaultResult};
use crate::models::FileId;
use crate::store::database::{buckets, Txn};

/// New file sets for the tags touched by a pending write. Built from the
/// index, persisted in the same transaction as the records, and applied to
/// the index only after that transaction commits.
pub type StagedTags = BTreeMap<String, BTreeSet<FileId>>;

#[derive(Debug, Default, Clone)]
pub struct TagIndex {
    tags: HashMap<String, BTreeSet<FileId>>,
}

impl TagIndex {
    pub fn load(txn: &Txn<'_>) -> VaultResult<Self> {
        let mut tags = HashMap::new();
        txn.for_each_prefix(buckets::TAGS, &[], |key, value| {
            let tag = std::str::from_utf8(key)
                .map_err(|e| VaultError::Store(format!("tag key is not valid UTF-8: {e}")))?;
            tags.insert(tag.to_string(), decode_file_set(value)?);
            Ok(())
        })?;
        Ok(Self { tags })
    }

    pub fn len(&self) -> usize {
        self.tags.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tags.is_empty()
    }

    pub fn files(&self, tag: &str) -> Option<&BTreeSet<FileId>> {
        self.tags.get(tag)
    }

    /// Files carrying every tag in `tags`, ascending. An empty query matches
    /// nothing.
    pub fn search(&self, tags: &[String]) -> Vec<FileId> {
        let mut sets = Vec::with_capacity(tags.len());
        for tag in tags {
            match self.tags.get(tag) {
                Some(set) => sets.push(set),
                None => return Vec::new(),
            }
        }
        sets.sort_by_key(|s| s.len());
        let Some((smallest, rest)) = sets.split_first() else {
            return Vec::new();
        };
        smallest
            .iter()
            .filter(|id| rest.iter().all(|s| s.contains(*id)))
            .copied()
            .collect()
    }

    /// Merge `additions` into copies of the affected file sets.
    pub fn stage<'a, I>(&self, additions: I) -> StagedTags
    where
        I: IntoIterator<Item = (&'a str, FileId)>,
    {
        let mut staged = StagedTags::new();
        for (tag, id) in additions {
            if !staged.contains_key(tag) {
                let current = self.tags.get(tag).cloned().unwrap_or_default();
                staged.insert(tag.to_string(), current);
            }
            if let Some(set) = staged.get_mut(tag) {
                set.insert(id);
            }
        }
        staged
    }

    /// Write staged sets to the `tags` bucket.
    pub fn persist(txn: &Txn<'_>, staged: &StagedTags) -> VaultResult<()> {
        for (tag, files) in staged {
            txn.put(buckets::TAGS, tag.as_bytes(), &encode_file_set(files))?;
        }
        Ok(())
    }

    /// Publish committed sets to readers.
    pub fn apply(&mut self, staged: StagedTags) {
        self.tags.extend(staged);
    }
}

pub fn encode_file_set(files: &BTreeSet<FileId>) -> Vec<u8> {
    let mut out = Vec::with_capacity(files.len() * 8);
    for id in files {
        out.extend_from_slice(&id.to_be_bytes());
    }
    out
}

pub fn decode_file_set(raw: &[u8]) -> VaultResult<BTreeSet<FileId>> {
    if raw.len() % 8 != 0 {
        return Err(VaultError::Store(format!(
            "file set of {} bytes is not a multiple of 8",
            raw.len()
        )));
    }
    Ok(raw
        .chunks_exact(8)
        .map(|c| {
            let mut b = [0u8; 8];
            b.copy_from_slice(c);
            FileId::from_be_bytes(b)
        })
        .collect())
}
