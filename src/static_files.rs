//! Static file responder — component E. Path resolution, MIME sniffing by
//! extension, Range requests, and caching headers (spec §4.D). There is no
//! direct teacher analogue (the teacher is a pure WebSocket library); this
//! is grounded in the response-writer idioms of `write.rs`/`connection.rs`
//! and enriched from the pack's HTTP-serving examples for the Range/MIME
//! conventions.

use std::path::{Path, PathBuf};

use time::format_description::well_known::Rfc2822;
use time::OffsetDateTime;

use crate::error::{Error, Result};

/// One resolved byte range within a file of `total_len` bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ByteRange {
    pub start: u64,
    pub end_inclusive: u64,
}

impl ByteRange {
    pub fn len(&self) -> u64 {
        self.end_inclusive - self.start + 1
    }
}

/// Parses a `Range: bytes=...` header value into the set of byte ranges it
/// names, resolved against `total_len` (spec §4.D / §8.6):
/// - `A-B` — bytes A through B inclusive.
/// - `-N` — the last N bytes.
/// - `A-` — from A to end of file.
/// - Comma-separated for multiple ranges; ranges are not merged even if
///   overlapping.
pub fn parse_range(header_value: &str, total_len: u64) -> Result<Vec<ByteRange>> {
    let value = header_value.trim();
    let spec = value
        .strip_prefix("bytes=")
        .ok_or_else(|| Error::MalformedRange(header_value.to_string()))?;

    let mut ranges = Vec::new();
    for piece in spec.split(',') {
        let piece = piece.trim();
        if piece.is_empty() {
            return Err(Error::MalformedRange(header_value.to_string()));
        }
        let (start_str, end_str) = piece
            .split_once('-')
            .ok_or_else(|| Error::MalformedRange(header_value.to_string()))?;

        let range = if start_str.is_empty() {
            // "-N": last N bytes.
            let n: u64 = end_str
                .parse()
                .map_err(|_| Error::MalformedRange(header_value.to_string()))?;
            if n == 0 || total_len == 0 {
                return Err(Error::MalformedRange(header_value.to_string()));
            }
            let n = n.min(total_len);
            ByteRange {
                start: total_len - n,
                end_inclusive: total_len - 1,
            }
        } else if end_str.is_empty() {
            // "A-": from A to EOF.
            let start: u64 = start_str
                .parse()
                .map_err(|_| Error::MalformedRange(header_value.to_string()))?;
            if start >= total_len {
                return Err(Error::MalformedRange(header_value.to_string()));
            }
            ByteRange {
                start,
                end_inclusive: total_len - 1,
            }
        } else {
            let start: u64 = start_str
                .parse()
                .map_err(|_| Error::MalformedRange(header_value.to_string()))?;
            let end: u64 = end_str
                .parse()
                .map_err(|_| Error::MalformedRange(header_value.to_string()))?;
            if start > end || start >= total_len {
                return Err(Error::MalformedRange(header_value.to_string()));
            }
            ByteRange {
                start,
                end_inclusive: end.min(total_len - 1),
            }
        };
        ranges.push(range);
    }

    Ok(ranges)
}

/// Resolves a request path against the configured static root. `?query` is
/// assumed already stripped by the caller (the `CrackedUri`'s path is used,
/// not the raw URI). A trailing empty segment (the URI ended in `/`)
/// resolves to `index.html`.
pub fn resolve_path(static_root: &Path, segments: &[String]) -> Option<PathBuf> {
    let mut path = static_root.to_path_buf();
    for segment in segments {
        if segment.is_empty() {
            continue;
        }
        if segment == ".." {
            // Reject path traversal outright rather than trying to
            // normalize it away.
            return None;
        }
        path.push(segment);
    }
    if segments.last().map(|s| s.is_empty()).unwrap_or(true) {
        path.push("index.html");
    }
    Some(path)
}

/// Content-Type table (spec §4.D's minimum list). Unknown extensions map to
/// `text/html`, matching the spec exactly.
pub fn content_type_for_extension(path: &Path) -> &'static str {
    let ext = path
        .extension()
        .and_then(|e| e.to_str())
        .unwrap_or("")
        .to_ascii_lowercase();
    match ext.as_str() {
        "txt" => "text/plain",
        "css" => "text/css",
        "csv" => "text/csv",
        "htm" | "html" => "text/html",
        "xml" => "text/xml",
        "js" => "text/javascript",
        "xhtml" => "application/xhtml+xml",
        "json" => "application/json",
        "pdf" => "application/pdf",
        "zip" => "application/zip",
        "tar" => "application/x-tar",
        "gif" => "image/gif",
        "jpeg" | "jpg" => "image/jpeg",
        "tiff" | "tif" => "image/tiff",
        "png" => "image/png",
        "svg" => "image/svg+xml",
        "ico" => "image/x-icon",
        "swf" => "application/x-shockwave-flash",
        "mp3" => "audio/mpeg",
        "wav" => "audio/wav",
        "ttf" => "font/ttf",
        _ => "text/html",
    }
}

/// Only `.mp3` and `.wav` are marked cacheable (spec §4.D).
pub fn is_cacheable_extension(path: &Path) -> bool {
    matches!(
        path.extension().and_then(|e| e.to_str()).map(|e| e.to_ascii_lowercase()).as_deref(),
        Some("mp3") | Some("wav")
    )
}

pub fn format_http_date(time: OffsetDateTime) -> String {
    time.format(&Rfc2822).unwrap_or_default()
}
