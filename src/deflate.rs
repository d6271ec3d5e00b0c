//! permessage-deflate (RFC 7692) codec, grounded in the teacher's
//! `decoder.rs`/`encoder.rs` pair — the encoder half was commented out there;
//! this restores it in the same style to satisfy the Hybi extension's
//! compression contract (spec §4.A, §9 design note on context takeover).

use bytes::BytesMut;
use flate2::{Compress, Compression, Decompress, FlushCompress, FlushDecompress, Status};

use crate::error::{Error, Result};

const DEFLATE_TRAILER: [u8; 4] = [0, 0, 0xff, 0xff];

fn calculate_buffer_size(payload_size: usize) -> usize {
    if payload_size <= 4096 {
        4096
    } else if payload_size <= 65536 {
        16384
    } else {
        65536
    }
}

/// Per-connection inflate side of permessage-deflate. `reset_context`
/// mirrors whichever side negotiated `server_no_context_takeover` (the
/// decoder here undoes bytes emitted by the *peer*, so it resets according
/// to what the peer promised, not what we promised about our own output).
pub struct Decoder {
    decompressor: Decompress,
    reset_context: bool,
}

impl Decoder {
    pub fn new(reset_context: bool, window_bits: Option<u8>) -> Self {
        let decompressor = match window_bits {
            Some(bits) => Decompress::new_with_window_bits(false, bits),
            None => Decompress::new(false),
        };
        Self {
            decompressor,
            reset_context,
        }
    }

    /// Inflates one message's payload. The caller passes the raw Hybi
    /// payload (RSV1 set, trailing 4-byte sync-flush marker already
    /// stripped by the peer per the spec); this appends the canonical
    /// `00 00 ff ff` trailer back on before inflating, matching what a
    /// zlib stream expects to see after a `Z_SYNC_FLUSH`.
    pub fn decompress(&mut self, payload: &[u8]) -> Result<Vec<u8>> {
        let mut input = BytesMut::from(payload);
        input.extend_from_slice(&DEFLATE_TRAILER);

        let buffer_size = calculate_buffer_size(input.len());
        let mut decompressed = Vec::with_capacity(buffer_size);
        let mut buffer = Vec::with_capacity(buffer_size);

        if self.reset_context {
            self.decompressor.reset(false);
        }

        let before_in = self.decompressor.total_in();
        while self.decompressor.total_in() - before_in < input.len() as u64 {
            let consumed_so_far = (self.decompressor.total_in() - before_in) as usize;
            let chunk = &input[consumed_so_far..];
            match self
                .decompressor
                .decompress_vec(chunk, &mut buffer, FlushDecompress::Sync)
                .map_err(|e| Error::Internal(format!("permessage-deflate inflate failed: {e}")))?
            {
                Status::Ok => {
                    decompressed.extend_from_slice(&buffer);
                    buffer.clear();
                }
                Status::StreamEnd => break,
                Status::BufError => break,
            }
        }
        Ok(decompressed)
    }
}

/// Per-connection deflate side of permessage-deflate. `reset_context`
/// mirrors our own `server_no_context_takeover` promise.
pub struct Encoder {
    compressor: Compress,
    reset_context: bool,
}

impl Encoder {
    pub fn new(reset_context: bool, window_bits: Option<u8>) -> Self {
        let compressor = Compress::new_with_window_bits(
            Compression::default(),
            false,
            window_bits.unwrap_or(15),
        );
        Self {
            compressor,
            reset_context,
        }
    }

    /// Deflates `payload` and strips the trailing `00 00 ff ff` sync-flush
    /// marker, which RFC 7692 says the sender omits and the receiver must
    /// re-add before inflating.
    pub fn compress(&mut self, payload: &[u8]) -> Result<Vec<u8>> {
        if self.reset_context {
            self.compressor.reset();
        }

        let buffer_size = calculate_buffer_size(payload.len()).max(64);
        let mut compressed = Vec::with_capacity(buffer_size);
        let mut buffer = vec![0u8; buffer_size];

        let before_in = self.compressor.total_in();
        loop {
            let consumed_so_far = (self.compressor.total_in() - before_in) as usize;
            let input = &payload[consumed_so_far..];
            let status = self
                .compressor
                .compress(input, &mut buffer, FlushCompress::Sync)
                .map_err(|e| Error::Internal(format!("permessage-deflate deflate failed: {e}")))?;

            let written = self.compressor.total_out() as usize - compressed.len();
            compressed.extend_from_slice(&buffer[..written]);

            let all_input_consumed =
                (self.compressor.total_in() - before_in) as usize >= payload.len();
            if all_input_consumed || matches!(status, Status::StreamEnd) {
                break;
            }
        }

        if compressed.ends_with(&DEFLATE_TRAILER) {
            compressed.truncate(compressed.len() - DEFLATE_TRAILER.len());
        }
        if compressed.is_empty() {
            // RFC 7692's sync-flush trim can leave nothing behind (e.g. an
            // empty payload); a zero-length frame body is ambiguous with "no
            // frame", so emit a single null byte instead (spec §4.A).
            compressed.push(0x00);
        }
        Ok(compressed)
    }
}
