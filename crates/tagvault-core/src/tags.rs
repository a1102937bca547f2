//! Tag normalization shared by every tag source in the archive.

use indexmap::IndexSet;

/// Canonical namespaces. Anything else before a `:` is dropped.
const NAMESPACE_ALIASES: &[(&str, &str)] = &[
    ("artist", "author"),
    ("author", "author"),
    ("series", "series"),
    ("copyright", "series"),
    ("character", "character"),
    ("rating", "rating"),
];

/// Convert any externally-input tag to the internal representation.
///
/// ASCII letters are lower-cased, spaces and NUL become `_`, and `"` becomes
/// `'` so tags never need JSON escaping. A namespace prefix is canonicalized
/// or stripped. May return an empty string; callers drop those.
pub fn normalize(raw: &str) -> String {
    let trimmed = raw.trim();
    let (namespace, body) = match trimmed.find(':') {
        Some(first) => {
            let prefix = trimmed[..first].to_ascii_lowercase();
            let last = trimmed.rfind(':').unwrap_or(first);
            let namespace = NAMESPACE_ALIASES
                .iter()
                .find(|(alias, _)| *alias == prefix)
                .map(|(_, canonical)| *canonical);
            (namespace, &trimmed[last + 1..])
        }
        None => (None, trimmed),
    };

    let mut out = String::with_capacity(body.len() + 10);
    if let Some(ns) = namespace {
        if body.is_empty() {
            return String::new();
        }
        out.push_str(ns);
        out.push(':');
    }
    for ch in body.chars() {
        match ch {
            ' ' | '\0' => out.push('_'),
            '"' => out.push('\''),
            c => out.push(c.to_ascii_lowercase()),
        }
    }
    out
}

/// Split a space-delimited list of tags and normalize each, skipping empties.
pub fn split_tag_string(s: &str) -> Vec<String> {
    s.split(' ')
        .map(normalize)
        .filter(|t| !t.is_empty())
        .collect()
}

/// Set union of two tag lists. Existing tags keep their position; new ones
/// are appended in order of first appearance.
pub fn merge_tag_sets<'a, A, B>(existing: A, incoming: B) -> Vec<String>
where
    A: IntoIterator<Item = &'a String>,
    B: IntoIterator<Item = &'a String>,
{
    let mut merged: IndexSet<&str> = IndexSet::new();
    for tag in existing.into_iter().chain(incoming) {
        if !tag.is_empty() {
            merged.insert(tag.as_str());
        }
    }
    merged.into_iter().map(str::to_string).collect()
}
