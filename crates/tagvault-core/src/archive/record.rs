//! Per-file archive record.

use serde::{Deserialize, Serialize};

use crate::errors::{VaultError, VaultResult};
use crate::models::{ContentHash, FileId};

/// Stored as JSON under its big-endian file id in the `records` bucket.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Record {
    /// Hex SHA-256 of the file contents, when known.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sha256: Option<String>,
    /// Seconds since the Unix epoch.
    #[serde(default)]
    pub import_time: u64,
    #[serde(default)]
    pub size: u64,
    #[serde(default)]
    pub tags: Vec<String>,
}

impl Record {
    pub fn encode(&self) -> VaultResult<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    pub fn decode(raw: &[u8]) -> VaultResult<Self> {
        Ok(serde_json::from_slice(raw)?)
    }

    /// The secondary hash as raw bytes.
    pub fn sha256_bytes(&self) -> VaultResult<Option<ContentHash>> {
        let Some(text) = &self.sha256 else {
            return Ok(None);
        };
        let mut hash = [0u8; 32];
        hex::decode_to_slice(text, &mut hash)
            .map_err(|e| VaultError::Store(format!("record sha256 `{text}`: {e}")))?;
        Ok(Some(hash))
    }
}

pub fn record_key(id: FileId) -> [u8; 8] {
    id.to_be_bytes()
}

pub fn decode_record_key(raw: &[u8]) -> VaultResult<FileId> {
    let bytes: [u8; 8] = raw
        .try_into()
        .map_err(|_| VaultError::Store(format!("file id has {} bytes, expected 8", raw.len())))?;
    Ok(FileId::from_be_bytes(bytes))
}
