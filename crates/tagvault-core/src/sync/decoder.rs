//! Decoder for the feed's tuple-encoded JSON.
//!
//! Every update blob is a JSON array `[type, _, payload]`. Type `36` is a
//! definition update, `34` a content update. Structural mismatches are
//! reported with the offending fragment and are never coerced.

use serde_json::Value;
use tracing::warn;

use crate::errors::{VaultError, VaultResult};
use crate::models::{ContentHash, ContentRow, ContentUpdate, DefinitionUpdate, RepoMeta, Update};
use crate::tags;

pub const DEFINITION_UPDATE: u64 = 36;
pub const CONTENT_UPDATE: u64 = 34;

/// Definition payload entry types.
const HASH_ROWS: u64 = 0;
const TAG_ROWS: u64 = 1;

/// Path from a content payload to its additions. The sibling positions hold
/// removals, which are not applied.
const CONTENT_ADDITIONS_PATH: &[usize] = &[0, 1, 0, 1];

/// Path from the metadata body to the list of `(x, [blob ids])` entries.
const METADATA_UPDATES_PATH: &[usize] = &[2, 1, 0, 1, 2, 0];

/// Decode one decompressed update blob.
pub fn decode_update(raw: &[u8]) -> VaultResult<Update> {
    let root = parse(raw)?;
    let outer = tuple(&root, 3)?;
    match as_u64(&outer[0])? {
        DEFINITION_UPDATE => decode_definition(&outer[2]).map(Update::Definition),
        CONTENT_UPDATE => decode_content(&outer[2]).map(Update::Content),
        other => Err(VaultError::decode(
            format!("unknown update type {other}"),
            outer[0].to_string(),
        )),
    }
}

/// Decode a decompressed metadata response into the ordered blob list.
pub fn decode_repo_meta(raw: &[u8]) -> VaultResult<RepoMeta> {
    let root = parse(raw)?;
    let entries = array(traverse(&root, METADATA_UPDATES_PATH)?)?;

    let mut meta = RepoMeta {
        count: entries.len() as u64,
        hashes: Vec::with_capacity(entries.len()),
    };
    for entry in entries {
        let entry = tuple(entry, 2)?;
        for id in array(&entry[1])? {
            meta.hashes.push(as_str(id)?.to_string());
        }
    }
    Ok(meta)
}

fn decode_definition(payload: &Value) -> VaultResult<DefinitionUpdate> {
    let entries = array(payload)?;
    if entries.is_empty() {
        return Err(VaultError::decode("empty definition payload", payload.to_string()));
    }

    let mut update = DefinitionUpdate::default();
    for entry in entries {
        let typed = tuple(entry, 2)?;
        let rows = array(&typed[1])?;
        match as_u64(&typed[0])? {
            HASH_ROWS => {
                update.hashes.reserve(rows.len());
                for row in rows {
                    let row = tuple(row, 2)?;
                    update.hashes.push((as_u64(&row[0])?, decode_hash(&row[1])?));
                }
            }
            TAG_ROWS => {
                update.tags.reserve(rows.len());
                for row in rows {
                    let row = tuple(row, 2)?;
                    let id = as_u64(&row[0])?;
                    let tag = tags::normalize(as_str(&row[1])?);
                    if tag.is_empty() {
                        warn!(tag_id = id, raw = %row[1], "tag normalizes to nothing, skipped");
                        continue;
                    }
                    update.tags.push((id, tag));
                }
            }
            other => {
                return Err(VaultError::decode(
                    format!("unknown definition entry type {other}"),
                    entry.to_string(),
                ))
            }
        }
    }
    Ok(update)
}

fn decode_content(payload: &Value) -> VaultResult<ContentUpdate> {
    let rows = array(traverse(payload, CONTENT_ADDITIONS_PATH)?)?;
    let mut update = ContentUpdate {
        rows: Vec::with_capacity(rows.len()),
    };
    for row in rows {
        let row = tuple(row, 2)?;
        let tag_id = as_u64(&row[0])?;
        let hash_ids = array(&row[1])?
            .iter()
            .map(as_u64)
            .collect::<VaultResult<Vec<u64>>>()?;
        update.rows.push(ContentRow { tag_id, hash_ids });
    }
    Ok(update)
}

// ---------------------------------------------------------------------------
// Value helpers
// ---------------------------------------------------------------------------

fn parse(raw: &[u8]) -> VaultResult<Value> {
    serde_json::from_slice(raw)
        .map_err(|e| VaultError::decode(format!("invalid JSON: {e}"), String::from_utf8_lossy(raw)))
}

fn array(v: &Value) -> VaultResult<&[Value]> {
    v.as_array()
        .map(Vec::as_slice)
        .ok_or_else(|| VaultError::decode("expected array", v.to_string()))
}

/// An array with at least `min_len` elements.
fn tuple(v: &Value, min_len: usize) -> VaultResult<&[Value]> {
    let items = array(v)?;
    if items.len() < min_len {
        return Err(VaultError::decode(
            format!("expected tuple of at least {min_len} elements, got {}", items.len()),
            v.to_string(),
        ));
    }
    Ok(items)
}

fn as_u64(v: &Value) -> VaultResult<u64> {
    v.as_u64()
        .ok_or_else(|| VaultError::decode("expected unsigned integer", v.to_string()))
}

fn as_str(v: &Value) -> VaultResult<&str> {
    v.as_str()
        .ok_or_else(|| VaultError::decode("expected string", v.to_string()))
}

/// Follow a fixed index path through nested arrays.
fn traverse<'a>(mut v: &'a Value, path: &[usize]) -> VaultResult<&'a Value> {
    for &idx in path {
        v = &tuple(v, idx + 1)?[idx];
    }
    Ok(v)
}

fn decode_hash(v: &Value) -> VaultResult<ContentHash> {
    let text = as_str(v)?;
    let bytes = hex::decode(text)
        .map_err(|e| VaultError::decode(format!("invalid hex hash: {e}"), v.to_string()))?;
    ContentHash::try_from(bytes.as_slice()).map_err(|_| {
        VaultError::decode(
            format!("hash is {} bytes, expected 32", bytes.len()),
            v.to_string(),
        )
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    const HASH_HEX: &str = "aabbccddeeff00112233445566778899aabbccddeeff00112233445566778899";

    fn hash_bytes() -> ContentHash {
        let mut out = [0u8; 32];
        hex::decode_to_slice(HASH_HEX, &mut out).unwrap();
        out
    }

    #[test]
    fn test_definition_hash_row() {
        let raw = format!(r#"[36,"ignored",[[0,[[1,"{HASH_HEX}"]]]]]"#);
        let update = decode_update(raw.as_bytes()).unwrap();
        assert_eq!(
            update,
            Update::Definition(DefinitionUpdate {
                hashes: vec![(1, hash_bytes())],
                tags: vec![],
            })
        );
    }

    #[test]
    fn test_definition_tag_rows_are_normalized_in_order() {
        let raw = br#"[36,null,[[1,[[7,"Blue Sky"],[3,"artist:Some One"],[7,"red"]]]]]"#;
        match decode_update(raw).unwrap() {
            Update::Definition(def) => {
                assert!(def.hashes.is_empty());
                assert_eq!(
                    def.tags,
                    vec![
                        (7, "blue_sky".to_string()),
                        (3, "author:some_one".to_string()),
                        (7, "red".to_string()),
                    ]
                );
            }
            other => panic!("unexpected update: {other:?}"),
        }
    }

    #[test]
    fn test_definition_with_both_entry_types() {
        let raw = format!(r#"[36,0,[[0,[[5,"{HASH_HEX}"]]],[1,[[9,"cat"]]]]]"#);
        match decode_update(raw.as_bytes()).unwrap() {
            Update::Definition(def) => {
                assert_eq!(def.hashes, vec![(5, hash_bytes())]);
                assert_eq!(def.tags, vec![(9, "cat".to_string())]);
            }
            other => panic!("unexpected update: {other:?}"),
        }
    }

    #[test]
    fn test_content_update_takes_additions_only() {
        let raw = br#"[34,0,[[0,[[0,[[4,[10,11]],[5,[12]]]],[1,[[99,[1]]]]]]]]"#;
        let update = decode_update(raw).unwrap();
        assert_eq!(
            update,
            Update::Content(ContentUpdate {
                rows: vec![
                    ContentRow { tag_id: 4, hash_ids: vec![10, 11] },
                    ContentRow { tag_id: 5, hash_ids: vec![12] },
                ]
            })
        );
    }

    #[test]
    fn test_truncated_outer_tuple_is_an_error() {
        let err = decode_update(br#"[36,"ignored"]"#).unwrap_err();
        match err {
            VaultError::Decode { fragment, .. } => assert_eq!(fragment, r#"[36,"ignored"]"#),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_unknown_update_type() {
        assert!(matches!(
            decode_update(br#"[35,0,[]]"#),
            Err(VaultError::Decode { .. })
        ));
    }

    #[test]
    fn test_short_hash_is_rejected() {
        let raw = br#"[36,0,[[0,[[1,"aabb"]]]]]"#;
        assert!(matches!(decode_update(raw), Err(VaultError::Decode { .. })));
    }

    #[test]
    fn test_wrong_element_type_is_not_coerced() {
        let raw = br#"[34,0,[[0,[[0,[["4",[10]]]]]]]]"#;
        assert!(matches!(decode_update(raw), Err(VaultError::Decode { .. })));
        let raw = br#"[36,0,[[1,[[-1,"x"]]]]]"#;
        assert!(matches!(decode_update(raw), Err(VaultError::Decode { .. })));
    }

    #[test]
    fn test_invalid_json_is_a_decode_error() {
        assert!(matches!(decode_update(b"[36,"), Err(VaultError::Decode { .. })));
    }

    #[test]
    fn test_repo_meta_flattens_blob_ids_in_order() {
        let raw = br#"[0,0,[0,[[0,[0,0,[[[1,["a","b"]],[2,["c"]]]]]]]]]"#;
        let meta = decode_repo_meta(raw).unwrap();
        assert_eq!(meta.count, 2);
        assert_eq!(meta.hashes, vec!["a", "b", "c"]);
    }

    #[test]
    fn test_repo_meta_wrong_shape() {
        assert!(matches!(
            decode_repo_meta(br#"[0,0,[0]]"#),
            Err(VaultError::Decode { .. })
        ));
    }
}
