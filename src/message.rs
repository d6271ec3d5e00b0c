//! User-facing WebSocket message type handed to/from a [`crate::handlers::WebSocketHandler`]
//! (spec §4.C's receive dispatch: "Text message ⇒ ... passed to the
//! WebSocket handler. Binary message ⇒ raw byte span."), grounded in the
//! teacher's `Message` enum.

use crate::error::{Error, Result};
use crate::frame::{self, MessageKind, OpCode};

#[derive(Debug, Clone, PartialEq)]
pub enum Message {
    Text(String),
    Binary(Vec<u8>),
}

impl Message {
    pub(crate) fn from_decoded(kind: MessageKind, payload: Vec<u8>) -> Result<Self> {
        match kind {
            MessageKind::Text => Ok(Message::Text(String::from_utf8(payload)?)),
            MessageKind::Binary => Ok(Message::Binary(payload)),
            other => Err(Error::Internal(format!(
                "{other:?} is a control frame, not a data message"
            ))),
        }
    }

    /// Encodes this message as a single, unfragmented Hybi frame (spec §4.A:
    /// server-emitted frames are never fragmented). `deflate` compresses the
    /// payload first and sets RSV1, when permessage-deflate was negotiated
    /// for this connection.
    pub(crate) fn encode(&self, deflate: bool) -> Vec<u8> {
        let (opcode, payload): (OpCode, &[u8]) = match self {
            Message::Text(text) => (OpCode::Text, text.as_bytes()),
            Message::Binary(data) => (OpCode::Binary, data.as_slice()),
        };
        frame::encode(opcode, payload, deflate)
    }

    pub fn as_binary(&self) -> &[u8] {
        match self {
            Message::Text(text) => text.as_bytes(),
            Message::Binary(data) => data,
        }
    }
}
