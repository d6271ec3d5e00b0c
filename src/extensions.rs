//! `Sec-WebSocket-Extensions` parsing and negotiation, grounded in the
//! teacher's `compression.rs` (renamed here to separate "what the client
//! offered" from the inflate/deflate codec itself, which lives in
//! `deflate.rs`).

const PERMESSAGE_DEFLATE: &str = "permessage-deflate";
const CLIENT_NO_CONTEXT_TAKEOVER: &str = "client_no_context_takeover";
const SERVER_NO_CONTEXT_TAKEOVER: &str = "server_no_context_takeover";
const CLIENT_MAX_WINDOW_BITS: &str = "client_max_window_bits";
const SERVER_MAX_WINDOW_BITS: &str = "server_max_window_bits";

/// What a client's `Sec-WebSocket-Extensions: permessage-deflate, ...` offer
/// asked for. `client_no_context_takeover`/`server_no_context_takeover`
/// affect whether we reset our own compression context between messages and
/// whether we must reset our decompression context respectively; the
/// `max_window_bits` pair only bound the window size, never force a reset.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PermessageDeflateParams {
    pub client_no_context_takeover: bool,
    pub server_no_context_takeover: bool,
    pub client_max_window_bits: Option<u8>,
    pub server_max_window_bits: Option<u8>,
}

/// Parses a `Sec-WebSocket-Extensions` header value and returns the
/// permessage-deflate parameters the client offered, or `None` if the
/// client did not mention the extension at all.
pub fn parse_permessage_deflate(header_value: &str) -> Option<PermessageDeflateParams> {
    let mut saw_permessage_deflate = false;
    let mut params = PermessageDeflateParams::default();

    for offer in header_value.split(',') {
        for token in offer.split(';') {
            let token = token.trim();
            if token == PERMESSAGE_DEFLATE {
                saw_permessage_deflate = true;
            } else if token.starts_with(CLIENT_NO_CONTEXT_TAKEOVER) {
                params.client_no_context_takeover = true;
            } else if token.starts_with(SERVER_NO_CONTEXT_TAKEOVER) {
                params.server_no_context_takeover = true;
            } else if let Some(rest) = token.strip_prefix(CLIENT_MAX_WINDOW_BITS) {
                params.client_max_window_bits = parse_window_bits(rest);
            } else if let Some(rest) = token.strip_prefix(SERVER_MAX_WINDOW_BITS) {
                params.server_max_window_bits = parse_window_bits(rest);
            }
        }
    }

    if saw_permessage_deflate {
        Some(params)
    } else {
        None
    }
}

fn parse_window_bits(rest: &str) -> Option<u8> {
    let rest = rest.trim();
    if rest.is_empty() {
        return Some(15);
    }
    rest.strip_prefix('=')?.trim().trim_matches('"').parse().ok()
}

/// Builds the `Sec-WebSocket-Extensions` response header value the server
/// sends back once it accepts the client's offer (spec §4.B: the server only
/// echoes the parameters the client asked for, it never imposes a
/// window-bits preference the client didn't request).
pub fn build_response_header(params: &PermessageDeflateParams) -> String {
    let mut parts = vec![PERMESSAGE_DEFLATE.to_string()];
    if params.client_no_context_takeover {
        parts.push(CLIENT_NO_CONTEXT_TAKEOVER.to_string());
    }
    if params.server_no_context_takeover {
        parts.push(SERVER_NO_CONTEXT_TAKEOVER.to_string());
    }
    if let Some(bits) = params.client_max_window_bits {
        parts.push(format!("{CLIENT_MAX_WINDOW_BITS}={bits}"));
    }
    if let Some(bits) = params.server_max_window_bits {
        parts.push(format!("{SERVER_MAX_WINDOW_BITS}={bits}"));
    }
    parts.join("; ")
}
