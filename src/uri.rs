//! Request-URI cracking: path segments plus query parameters (spec §8.5),
//! grounded in the original `seasocks::CrackedUri`.

use crate::error::{Error, Result};

/// A request-URI split into percent-decoded path segments and query
/// parameters. `query_params` preserves duplicates and insertion order so
/// `all_query_params` can return every value for a repeated key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CrackedUri {
    path: Vec<String>,
    query_params: Vec<(String, String)>,
}

impl CrackedUri {
    /// Parses a raw request-URI (`/a/b/c.html?x=1&x=2`) into path segments
    /// and query parameters. The URI must start with `/`.
    pub fn parse(uri: &str) -> Result<Self> {
        if !uri.starts_with('/') {
            return Err(Error::MalformedUri(uri.to_string()));
        }
        let without_leading_slash = &uri[1..];
        let (path_part, query_part) = match without_leading_slash.find('?') {
            Some(idx) => (&without_leading_slash[..idx], &without_leading_slash[idx + 1..]),
            None => (without_leading_slash, ""),
        };

        let path = path_part
            .split('/')
            .map(unescape)
            .collect::<Result<Vec<_>>>()?;

        let mut query_params = Vec::new();
        if !query_part.is_empty() {
            for pair in query_part.split('&') {
                if pair.is_empty() {
                    continue;
                }
                let mut parts = pair.splitn(2, '=');
                let key = unescape(parts.next().unwrap_or(""))?;
                let value = match parts.next() {
                    Some(v) => unescape(v)?,
                    None => String::new(),
                };
                query_params.push((key, value));
            }
        }

        Ok(CrackedUri { path, query_params })
    }

    pub fn path(&self) -> &[String] {
        &self.path
    }

    pub fn has_param(&self, name: &str) -> bool {
        self.query_params.iter().any(|(k, _)| k == name)
    }

    pub fn query_param(&self, name: &str, default: &str) -> String {
        self.query_params
            .iter()
            .find(|(k, _)| k == name)
            .map(|(_, v)| v.clone())
            .unwrap_or_else(|| default.to_string())
    }

    pub fn all_query_params(&self, name: &str) -> Vec<String> {
        self.query_params
            .iter()
            .filter(|(k, _)| k == name)
            .map(|(_, v)| v.clone())
            .collect()
    }

    /// Returns a copy with the first path segment removed (used to strip a
    /// mount-point prefix before delegating to a nested handler).
    pub fn shift(&self) -> Self {
        let path = if self.path.len() > 1 {
            self.path[1..].to_vec()
        } else {
            vec![String::new()]
        };
        CrackedUri {
            path,
            query_params: self.query_params.clone(),
        }
    }
}

fn from_hex(c: u8) -> Option<u8> {
    match c {
        b'0'..=b'9' => Some(c - b'0'),
        b'a'..=b'f' => Some(c - b'a' + 10),
        b'A'..=b'F' => Some(c - b'A' + 10),
        _ => None,
    }
}

/// Percent-decodes a single path segment or query component, treating `+`
/// as a literal space the way form-encoded query strings do.
fn unescape(segment: &str) -> Result<String> {
    let bytes = segment.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        match bytes[i] {
            b'+' => {
                out.push(b' ');
                i += 1;
            }
            b'%' => {
                if i + 2 >= bytes.len() {
                    return Err(Error::TruncatedEscape(segment.to_string()));
                }
                let (hi, lo) = (from_hex(bytes[i + 1]), from_hex(bytes[i + 2]));
                match (hi, lo) {
                    (Some(hi), Some(lo)) => {
                        out.push((hi << 4) | lo);
                        i += 3;
                    }
                    _ => return Err(Error::BadEscape(segment.to_string())),
                }
            }
            b => {
                out.push(b);
                i += 1;
            }
        }
    }
    String::from_utf8(out).map_err(|e| Error::BadEscape(e.to_string()))
}
