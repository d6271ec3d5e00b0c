//! Hybi (RFC 6455) frame decode/encode — component A. Operates purely on an
//! in-memory buffer; it knows nothing about the socket that filled it
//! (grounded in the teacher's `OpCode`/`Frame` split, generalized into a
//! stateful decoder that also owns fragmentation bookkeeping per spec §4.A).

use bytes::{Buf, BytesMut};

use crate::error::{Error, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpCode {
    Continue,
    Text,
    Binary,
    Close,
    Ping,
    Pong,
}

impl OpCode {
    fn from_byte(byte: u8) -> Result<Self> {
        match byte {
            0x0 => Ok(OpCode::Continue),
            0x1 => Ok(OpCode::Text),
            0x2 => Ok(OpCode::Binary),
            0x8 => Ok(OpCode::Close),
            0x9 => Ok(OpCode::Ping),
            0xA => Ok(OpCode::Pong),
            other => Err(Error::InvalidOpcode(other)),
        }
    }

    fn as_byte(self) -> u8 {
        match self {
            OpCode::Continue => 0x0,
            OpCode::Text => 0x1,
            OpCode::Binary => 0x2,
            OpCode::Close => 0x8,
            OpCode::Ping => 0x9,
            OpCode::Pong => 0xA,
        }
    }

    fn is_control(self) -> bool {
        matches!(self, OpCode::Close | OpCode::Ping | OpCode::Pong)
    }
}

/// A decoded, defragmented message ready to hand to a WebSocket handler or
/// to the connection's own control-frame logic (spec §4.C's dispatch rules).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MessageKind {
    Text,
    Binary,
    Ping,
    Pong,
    Close,
}

/// Result of one `decode_next` call.
pub enum Decoded {
    /// A complete message was assembled. `deflate_needed` mirrors RSV1 on
    /// the frame(s) that made it up — the caller must inflate `payload`
    /// before delivering it to a handler.
    Message {
        kind: MessageKind,
        payload: Vec<u8>,
        deflate_needed: bool,
    },
    /// Not enough bytes were buffered to complete the next frame. No bytes
    /// were consumed; the caller should retry once more data arrives
    /// (spec §8.1: "a truncated frame reports NoMessage and consumes zero
    /// bytes").
    NoMessage,
}

struct InProgressFragment {
    kind: MessageKind,
    deflate_needed: bool,
    payload: Vec<u8>,
}

/// Stateful Hybi frame decoder. One instance lives per connection; it owns
/// the fragmentation bookkeeping spec §4.A assigns to the framing codec
/// (FIN=0 begins a series whose type is remembered, Cont frames accumulate,
/// control frames may interleave without disturbing it).
pub struct FrameDecoder {
    fragment: Option<InProgressFragment>,
    max_frame_size: usize,
}

impl Default for FrameDecoder {
    fn default() -> Self {
        Self::new()
    }
}

impl FrameDecoder {
    /// An unbounded decoder; prefer [`FrameDecoder::with_max_frame_size`] on
    /// a live connection so an attacker-controlled length field can't claim
    /// an unreasonable amount of memory (spec §6's `max_frame_size`).
    pub fn new() -> Self {
        Self::with_max_frame_size(usize::MAX)
    }

    pub fn with_max_frame_size(max_frame_size: usize) -> Self {
        FrameDecoder {
            fragment: None,
            max_frame_size,
        }
    }

    /// Attempts to decode the next complete message out of `buf`, advancing
    /// `buf` past whatever bytes were consumed. Returns `Decoded::NoMessage`
    /// (consuming nothing) if `buf` does not yet hold a full frame.
    pub fn decode_next(&mut self, buf: &mut BytesMut) -> Result<Decoded> {
        loop {
            match self.decode_one_frame(buf)? {
                None => return Ok(Decoded::NoMessage),
                Some((fin, rsv1, opcode, payload)) => {
                    if opcode.is_control() {
                        let kind = match opcode {
                            OpCode::Close => MessageKind::Close,
                            OpCode::Ping => MessageKind::Ping,
                            OpCode::Pong => MessageKind::Pong,
                            _ => unreachable!("is_control() only true for Close/Ping/Pong"),
                        };
                        return Ok(Decoded::Message {
                            kind,
                            payload,
                            deflate_needed: false,
                        });
                    }

                    match opcode {
                        OpCode::Text | OpCode::Binary => {
                            if self.fragment.is_some() {
                                return Err(Error::FragmentedInProgress);
                            }
                            let kind = if opcode == OpCode::Text {
                                MessageKind::Text
                            } else {
                                MessageKind::Binary
                            };
                            if fin {
                                return Ok(Decoded::Message {
                                    kind,
                                    payload,
                                    deflate_needed: rsv1,
                                });
                            }
                            self.fragment = Some(InProgressFragment {
                                kind,
                                deflate_needed: rsv1,
                                payload,
                            });
                        }
                        OpCode::Continue => {
                            let mut in_progress = self
                                .fragment
                                .take()
                                .ok_or(Error::InvalidContinuationFrame)?;
                            in_progress.payload.extend_from_slice(&payload);
                            if fin {
                                return Ok(Decoded::Message {
                                    kind: in_progress.kind,
                                    payload: in_progress.payload,
                                    deflate_needed: in_progress.deflate_needed,
                                });
                            }
                            self.fragment = Some(in_progress);
                        }
                        _ => unreachable!("control opcodes handled above"),
                    }
                    // A completed fragment series returns above; otherwise
                    // keep consuming frames until one completes a message or
                    // the buffer runs dry.
                }
            }
        }
    }

    /// Decodes a single frame header + payload from `buf` without performing
    /// any fragmentation bookkeeping. Returns `None` (consuming nothing) if
    /// `buf` does not hold a complete frame yet.
    fn decode_one_frame(
        &self,
        buf: &mut BytesMut,
    ) -> Result<Option<(bool, bool, OpCode, Vec<u8>)>> {
        if buf.len() < 2 {
            return Ok(None);
        }
        let b0 = buf[0];
        let b1 = buf[1];

        let fin = (b0 & 0b1000_0000) != 0;
        let rsv1 = (b0 & 0b0100_0000) != 0;
        let rsv2 = (b0 & 0b0010_0000) != 0;
        let rsv3 = (b0 & 0b0001_0000) != 0;
        if rsv2 || rsv3 {
            return Err(Error::RSVNotZero);
        }
        let opcode = OpCode::from_byte(b0 & 0b0000_1111)?;

        if !fin && opcode.is_control() {
            return Err(Error::ControlFramesFragmented);
        }

        let masked = (b1 & 0b1000_0000) != 0;
        if !masked {
            return Err(Error::UnmaskedClientFrame);
        }
        let len_field = b1 & 0b0111_1111;
        if opcode.is_control() && len_field > 125 {
            return Err(Error::ControlFramePayloadSize);
        }

        let mut header_len = 2usize;
        let payload_len: u64 = match len_field {
            126 => {
                header_len += 2;
                if buf.len() < header_len {
                    return Ok(None);
                }
                u16::from_be_bytes([buf[2], buf[3]]) as u64
            }
            127 => {
                header_len += 8;
                if buf.len() < header_len {
                    return Ok(None);
                }
                u64::from_be_bytes(buf[2..10].try_into().unwrap())
            }
            n => n as u64,
        };

        let mask_offset = header_len;
        header_len += 4; // mask key, always present (masked == true, checked above)
        if buf.len() < header_len {
            return Ok(None);
        }

        if payload_len > self.max_frame_size as u64 {
            return Err(Error::MaxFrameSize(payload_len as usize, self.max_frame_size));
        }
        let total_len = header_len
            .checked_add(payload_len as usize)
            .ok_or(Error::MaxFrameSize(payload_len as usize, self.max_frame_size))?;
        if buf.len() < total_len {
            return Ok(None);
        }

        let mask: [u8; 4] = buf[mask_offset..mask_offset + 4].try_into().unwrap();
        let mut payload = buf[header_len..total_len].to_vec();
        for (i, byte) in payload.iter_mut().enumerate() {
            *byte ^= mask[i % 4];
        }

        buf.advance(total_len);
        Ok(Some((fin, rsv1, opcode, payload)))
    }
}

/// Encodes a single, unfragmented server-to-client frame (spec §4.A: server
/// frames are never fragmented and never masked, and use the minimal-length
/// encoding).
pub fn encode(opcode: OpCode, payload: &[u8], deflate: bool) -> Vec<u8> {
    let mut out = Vec::with_capacity(payload.len() + 10);
    let mut first_byte = 0b1000_0000 | opcode.as_byte(); // FIN=1 always
    if deflate {
        first_byte |= 0b0100_0000; // RSV1
    }
    out.push(first_byte);

    let len = payload.len();
    if len <= 125 {
        out.push(len as u8);
    } else if len <= 0xFFFF {
        out.push(126);
        out.extend_from_slice(&(len as u16).to_be_bytes());
    } else {
        out.push(127);
        out.extend_from_slice(&(len as u64).to_be_bytes());
    }
    out.extend_from_slice(payload);
    out
}

pub fn encode_close() -> Vec<u8> {
    encode(OpCode::Close, &[], false)
}

pub fn encode_pong(payload: &[u8]) -> Vec<u8> {
    encode(OpCode::Pong, payload, false)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn hex(s: &str) -> BytesMut {
        let bytes: Vec<u8> = (0..s.len())
            .step_by(2)
            .map(|i| u8::from_str_radix(&s[i..i + 2], 16).unwrap())
            .collect();
        BytesMut::from(&bytes[..])
    }

    #[test]
    fn unmasked_frame_is_a_protocol_error() {
        let mut buf = hex("810548656c6c6f");
        let mut dec = FrameDecoder::new();
        assert!(matches!(
            dec.decode_next(&mut buf),
            Err(Error::UnmaskedClientFrame)
        ));
    }

    fn masked_frame(opcode: OpCode, payload: &[u8], fin: bool) -> Vec<u8> {
        let mask = [0u8; 4];
        let mut out = Vec::new();
        let first = (if fin { 0x80 } else { 0x00 }) | opcode.as_byte();
        out.push(first);
        let len = payload.len();
        if len <= 125 {
            out.push(0x80 | len as u8);
        } else if len <= 0xFFFF {
            out.push(0x80 | 126);
            out.extend_from_slice(&(len as u16).to_be_bytes());
        } else {
            out.push(0x80 | 127);
            out.extend_from_slice(&(len as u64).to_be_bytes());
        }
        out.extend_from_slice(&mask);
        out.extend_from_slice(payload);
        out
    }

    #[test]
    fn decodes_masked_text_hello() {
        let mut buf = BytesMut::from(&masked_frame(OpCode::Text, b"Hello", true)[..]);
        let mut dec = FrameDecoder::new();
        match dec.decode_next(&mut buf).unwrap() {
            Decoded::Message {
                kind,
                payload,
                deflate_needed,
            } => {
                assert_eq!(kind, MessageKind::Text);
                assert_eq!(payload, b"Hello");
                assert!(!deflate_needed);
            }
            Decoded::NoMessage => panic!("expected a message"),
        }
        assert!(buf.is_empty());
    }

    #[test]
    fn decodes_ping_and_binary() {
        let mut buf = BytesMut::from(&masked_frame(OpCode::Ping, b"Hello", true)[..]);
        let mut dec = FrameDecoder::new();
        match dec.decode_next(&mut buf).unwrap() {
            Decoded::Message { kind, payload, .. } => {
                assert_eq!(kind, MessageKind::Ping);
                assert_eq!(payload, b"Hello");
            }
            Decoded::NoMessage => panic!("expected a message"),
        }

        let payload = [0x00u8, 0x01, 0x02];
        let mut buf = BytesMut::from(&masked_frame(OpCode::Binary, &payload, true)[..]);
        let mut dec = FrameDecoder::new();
        match dec.decode_next(&mut buf).unwrap() {
            Decoded::Message { kind, payload: p, .. } => {
                assert_eq!(kind, MessageKind::Binary);
                assert_eq!(p, payload);
            }
            Decoded::NoMessage => panic!("expected a message"),
        }
    }

    #[test]
    fn decodes_126_and_127_length_extensions() {
        let payload_256 = vec![0x42u8; 256];
        let mut buf = BytesMut::from(&masked_frame(OpCode::Binary, &payload_256, true)[..]);
        let mut dec = FrameDecoder::new();
        match dec.decode_next(&mut buf).unwrap() {
            Decoded::Message { payload, .. } => assert_eq!(payload.len(), 256),
            Decoded::NoMessage => panic!("expected message"),
        }

        let payload_64k = vec![0x7eu8; 65536];
        let mut buf = BytesMut::from(&masked_frame(OpCode::Binary, &payload_64k, true)[..]);
        let mut dec = FrameDecoder::new();
        match dec.decode_next(&mut buf).unwrap() {
            Decoded::Message { payload, .. } => assert_eq!(payload.len(), 65536),
            Decoded::NoMessage => panic!("expected message"),
        }
    }

    #[test]
    fn two_concatenated_frames_decode_to_two_messages() {
        let mut raw = masked_frame(OpCode::Text, b"one", true);
        raw.extend(masked_frame(OpCode::Text, b"two", true));
        let mut buf = BytesMut::from(&raw[..]);
        let mut dec = FrameDecoder::new();

        match dec.decode_next(&mut buf).unwrap() {
            Decoded::Message { payload, .. } => assert_eq!(payload, b"one"),
            Decoded::NoMessage => panic!("expected message"),
        }
        match dec.decode_next(&mut buf).unwrap() {
            Decoded::Message { payload, .. } => assert_eq!(payload, b"two"),
            Decoded::NoMessage => panic!("expected message"),
        }
        assert!(buf.is_empty());
    }

    #[test]
    fn truncated_frame_reports_no_message_and_consumes_nothing() {
        let full = masked_frame(OpCode::Text, b"Hello", true);
        let mut buf = BytesMut::from(&full[..full.len() - 2]);
        let len_before = buf.len();
        let mut dec = FrameDecoder::new();
        match dec.decode_next(&mut buf).unwrap() {
            Decoded::NoMessage => {}
            Decoded::Message { .. } => panic!("did not expect a full message"),
        }
        assert_eq!(buf.len(), len_before);
    }

    #[test]
    fn fragmented_message_reassembles_across_continuation_frames() {
        let mut raw = masked_frame(OpCode::Text, b"Hel", false);
        raw.extend(masked_frame(OpCode::Continue, b"lo", true));
        let mut buf = BytesMut::from(&raw[..]);
        let mut dec = FrameDecoder::new();
        match dec.decode_next(&mut buf).unwrap() {
            Decoded::Message { kind, payload, .. } => {
                assert_eq!(kind, MessageKind::Text);
                assert_eq!(payload, b"Hello");
            }
            Decoded::NoMessage => panic!("expected reassembled message"),
        }
    }

    #[test]
    fn control_frame_interleaves_with_fragment_in_progress() {
        let mut raw = masked_frame(OpCode::Text, b"Hel", false);
        raw.extend(masked_frame(OpCode::Ping, b"pp", true));
        raw.extend(masked_frame(OpCode::Continue, b"lo", true));
        let mut buf = BytesMut::from(&raw[..]);
        let mut dec = FrameDecoder::new();

        match dec.decode_next(&mut buf).unwrap() {
            Decoded::Message { kind, payload, .. } => {
                assert_eq!(kind, MessageKind::Ping);
                assert_eq!(payload, b"pp");
            }
            Decoded::NoMessage => panic!("expected ping to interleave"),
        }
        match dec.decode_next(&mut buf).unwrap() {
            Decoded::Message { kind, payload, .. } => {
                assert_eq!(kind, MessageKind::Text);
                assert_eq!(payload, b"Hello");
            }
            Decoded::NoMessage => panic!("expected reassembled text"),
        }
    }

    #[test]
    fn rejects_continuation_with_no_fragment_in_progress() {
        let mut buf = BytesMut::from(&masked_frame(OpCode::Continue, b"lo", true)[..]);
        let mut dec = FrameDecoder::new();
        assert!(matches!(
            dec.decode_next(&mut buf),
            Err(Error::InvalidContinuationFrame)
        ));
    }

    #[test]
    fn oversized_frame_length_is_rejected_without_panicking() {
        // A 64-bit length field claiming far more than the configured
        // max_frame_size, followed by only a few real bytes: a naive
        // `header_len + payload_len as usize` would wrap around and let a
        // subsequent slice index panic instead of surfacing an error.
        let mut raw = vec![0x82u8, 0xFF]; // FIN=1, Binary, masked, len=127 (64-bit ext)
        raw.extend_from_slice(&u64::MAX.to_be_bytes());
        raw.extend_from_slice(&[0u8; 4]); // mask
        raw.extend_from_slice(&[0u8; 4]); // a few payload bytes, far short of u64::MAX
        let mut buf = BytesMut::from(&raw[..]);
        let mut dec = FrameDecoder::with_max_frame_size(1024);
        assert!(matches!(
            dec.decode_next(&mut buf),
            Err(Error::MaxFrameSize(_, 1024))
        ));
    }

    #[test]
    fn frame_within_max_frame_size_still_decodes() {
        let payload = vec![0x11u8; 32];
        let mut buf = BytesMut::from(&masked_frame(OpCode::Binary, &payload, true)[..]);
        let mut dec = FrameDecoder::with_max_frame_size(64);
        match dec.decode_next(&mut buf).unwrap() {
            Decoded::Message { payload: p, .. } => assert_eq!(p, payload),
            Decoded::NoMessage => panic!("expected message"),
        }
    }

    #[test]
    fn encode_produces_fin_single_frame_without_mask() {
        let encoded = encode(OpCode::Text, b"pong", false);
        assert_eq!(encoded[0], 0b1000_0001); // FIN=1, RSV1=0, opcode=Text
        assert_eq!(encoded[1] & 0x80, 0); // mask bit must never be set
        assert_eq!(&encoded[2..], b"pong");
    }
}
