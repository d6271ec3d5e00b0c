//! Embedded asset endpoints (spec §6): a handful of fixed responses the
//! static file responder falls back to when the configured static root
//! doesn't have them. The original's asset set is generated at build time
//! from binary files (out of scope per spec §1); these are small, handwritten
//! stand-ins that satisfy the same endpoint contract.

pub const ERROR_TEMPLATE: &str = include_str!("../assets/_error.html");
const FAVICON: &[u8] = include_bytes!("../assets/favicon.ico");
const NOT_FOUND_PNG: &[u8] = include_bytes!("../assets/_404.png");
const ERROR_CSS: &str = include_str!("../assets/_error.css");
const STATS_HTML: &str = include_str!("../assets/_stats.html");
const SEASOCKS_CSS: &str = include_str!("../assets/_seasocks.css");
const JQUERY_JS: &str = include_str!("../assets/_jquery.min.js");

pub struct Asset {
    pub content_type: &'static str,
    pub body: &'static [u8],
}

/// Looks up one of the fixed embedded-asset paths (spec §6). `/_livestats.js`
/// is handled separately since its body is generated per-request from live
/// connection state rather than fixed at compile time.
pub fn lookup(path: &str) -> Option<Asset> {
    match path {
        "/favicon.ico" => Some(Asset {
            content_type: "image/x-icon",
            body: FAVICON,
        }),
        "/_404.png" => Some(Asset {
            content_type: "image/png",
            body: NOT_FOUND_PNG,
        }),
        "/_error.css" => Some(Asset {
            content_type: "text/css",
            body: ERROR_CSS.as_bytes(),
        }),
        "/_stats.html" => Some(Asset {
            content_type: "text/html",
            body: STATS_HTML.as_bytes(),
        }),
        "/_seasocks.css" => Some(Asset {
            content_type: "text/css",
            body: SEASOCKS_CSS.as_bytes(),
        }),
        "/_jquery.min.js" => Some(Asset {
            content_type: "text/javascript",
            body: JQUERY_JS.as_bytes(),
        }),
        _ => None,
    }
}
