use std::io;
use std::string::FromUtf8Error;
use thiserror::Error;

/// Crate-wide error type. Every fallible operation returns one of these
/// variants; handler-facing failures are translated into HTTP 500 responses
/// at the connection boundary (see `connection::Connection`) rather than
/// propagated further.
#[derive(Error, Debug)]
pub enum Error {
    // General Errors
    #[error("{source}")]
    IOError {
        #[from]
        source: io::Error,
    },

    #[error("{source}")]
    FromUtf8Error {
        #[from]
        source: FromUtf8Error,
    },

    #[error("{source}")]
    HttpParseError {
        #[from]
        source: httparse::Error,
    },

    // Handshake / request-line errors
    #[error("request headers exceeded the 64KiB limit before a blank line was found")]
    HeadersTooLarge,

    #[error("malformed HTTP request line")]
    MalformedRequestLine,

    #[error("unsupported HTTP version, only HTTP/1.1 is supported")]
    UnsupportedHttpVersion,

    #[error("Connection: Upgrade header missing in the request")]
    NoConnectionHeaderPresent,

    #[error("Upgrade: websocket header missing in the request")]
    NoUpgradeHeaderPresent,

    #[error("only GET is legal for a WebSocket upgrade request")]
    UpgradeRequestNotGet,

    #[error("Couldn't find Sec-WebSocket-Key header in the request")]
    NoSecWebsocketKey,

    #[error("Sec-WebSocket-Key1/Key2 header missing from a Hixie-76 upgrade request")]
    NoHixieKeys,

    #[error("unsupported Sec-WebSocket-Version: {0}")]
    UnsupportedWebSocketVersion(String),

    #[error("no WebSocket handler registered for endpoint `{0}`")]
    NoSuchWebSocketEndpoint(String),

    #[error("Origin `{0}` is not allowed for this endpoint")]
    OriginNotAllowed(String),

    // Framing Errors
    #[error("RSV2/RSV3 set without a matching extension")]
    RSVNotZero,

    #[error("RSV1 set but permessage-deflate was not negotiated for this connection")]
    UnexpectedDeflateBit,

    #[error("client frame was not masked")]
    UnmaskedClientFrame,

    #[error("Control frames must not be fragmented")]
    ControlFramesFragmented,

    #[error("Control frame payload exceeds 125 bytes")]
    ControlFramePayloadSize,

    #[error("invalid opcode {0:#x}")]
    InvalidOpcode(u8),

    #[error("frame of {0} bytes exceeds the configured max frame size of {1} bytes")]
    MaxFrameSize(usize, usize),

    #[error("message of {0} bytes exceeds the configured max message size of {1} bytes")]
    MaxMessageSize(usize, usize),

    // Fragmentation Errors
    #[error("a new data frame started while a fragmented message was already in progress")]
    FragmentedInProgress,

    #[error("continuation frame received with no fragmented message in progress")]
    InvalidContinuationFrame,

    // URI cracker (property #5)
    #[error("malformed URI: `{0}`")]
    MalformedUri(String),

    #[error("truncated percent-escape in URI: `{0}`")]
    TruncatedEscape(String),

    #[error("bad hex digit in percent-escape: `{0}`")]
    BadEscape(String),

    // Range requests (property #6)
    #[error("malformed Range header: `{0}`")]
    MalformedRange(String),

    // Handler / programmer errors
    #[error("handler raised an error: {0}")]
    Handler(String),

    #[error("{0}")]
    Internal(String),

    #[error("ResponseWriter/Connection method invoked from a thread other than the reactor thread")]
    WrongThread,
}

pub type Result<T> = std::result::Result<T, Error>;
