//! WebSocket handshake completion — both the Hybi (RFC 6455) accept-key
//! computation every connection uses, and the legacy Hixie-76 key/challenge
//! math kept behind the `hixie76` feature (spec §9's open question on legacy
//! client support). Grounded in the teacher's `generate_websocket_accept_value`.

use base64::engine::general_purpose::STANDARD as BASE64_STANDARD;
use base64::Engine;
use sha1::{Digest, Sha1};

const WEBSOCKET_GUID: &str = "258EAFA5-E914-47DA-95CA-C5AB0DC85B11";

/// Computes `Sec-WebSocket-Accept` from the client's `Sec-WebSocket-Key`
/// (spec §8.2: `getAcceptKey("dGhlIHNhbXBsZSBub25jZQ==")` must equal
/// `"s3pPLMBiTxaQ9kYGzzhZRbK+xOo="`).
pub fn accept_key(client_key: &str) -> String {
    let mut hasher = Sha1::new();
    hasher.update(client_key.as_bytes());
    hasher.update(WEBSOCKET_GUID.as_bytes());
    BASE64_STANDARD.encode(hasher.finalize())
}

#[cfg(feature = "hixie76")]
pub mod hixie76 {
    //! The pre-RFC6455 "Hixie-76" draft handshake: the server must derive an
    //! 8-byte MD5 digest from two numeric keys embedded in
    //! `Sec-WebSocket-Key1`/`Sec-WebSocket-Key2` plus an 8-byte body the
    //! client sends after its headers (spec §8.3).

    use crate::error::{Error, Result};

    /// Extracts the digits from `key` and divides by the count of spaces in
    /// it, per the Hixie-76 draft's key-to-number derivation.
    fn key_number(key: &str) -> Option<u32> {
        let digits: String = key.chars().filter(|c| c.is_ascii_digit()).collect();
        let number: u64 = digits.parse().ok()?;
        let spaces = key.chars().filter(|c| *c == ' ').count() as u64;
        if spaces == 0 {
            return None;
        }
        let value = number.checked_div(spaces)?;
        u32::try_from(value).ok()
    }

    /// Computes the 16-byte MD5 response body from `key1`, `key2`, and the
    /// 8-byte `key3` the client sends immediately after its headers.
    pub fn compute_response(key1: &str, key2: &str, key3: &[u8; 8]) -> Result<[u8; 16]> {
        let n1 = key_number(key1).ok_or(Error::NoHixieKeys)?;
        let n2 = key_number(key2).ok_or(Error::NoHixieKeys)?;

        let mut challenge = [0u8; 16];
        challenge[0..4].copy_from_slice(&n1.to_be_bytes());
        challenge[4..8].copy_from_slice(&n2.to_be_bytes());
        challenge[8..16].copy_from_slice(key3);

        Ok(md5(&challenge))
    }

    // A small self-contained MD5 implementation: the crate's dependency
    // stack carries sha1 for Hybi but not md5, and this legacy path is only
    // compiled in behind `hixie76`.
    fn md5(input: &[u8]) -> [u8; 16] {
        const S: [u32; 64] = [
            7, 12, 17, 22, 7, 12, 17, 22, 7, 12, 17, 22, 7, 12, 17, 22, 5, 9, 14, 20, 5, 9, 14, 20,
            5, 9, 14, 20, 5, 9, 14, 20, 4, 11, 16, 23, 4, 11, 16, 23, 4, 11, 16, 23, 4, 11, 16, 23,
            6, 10, 15, 21, 6, 10, 15, 21, 6, 10, 15, 21, 6, 10, 15, 21,
        ];
        const K: [u32; 64] = [
            0xd76aa478, 0xe8c7b756, 0x242070db, 0xc1bdceee, 0xf57c0faf, 0x4787c62a, 0xa8304613,
            0xfd469501, 0x698098d8, 0x8b44f7af, 0xffff5bb1, 0x895cd7be, 0x6b901122, 0xfd987193,
            0xa679438e, 0x49b40821, 0xf61e2562, 0xc040b340, 0x265e5a51, 0xe9b6c7aa, 0xd62f105d,
            0x02441453, 0xd8a1e681, 0xe7d3fbc8, 0x21e1cde6, 0xc33707d6, 0xf4d50d87, 0x455a14ed,
            0xa9e3e905, 0xfcefa3f8, 0x676f02d9, 0x8d2a4c8a, 0xfffa3942, 0x8771f681, 0x6d9d6122,
            0xfde5380c, 0xa4beea44, 0x4bdecfa9, 0xf6bb4b60, 0xbebfbc70, 0x289b7ec6, 0xeaa127fa,
            0xd4ef3085, 0x04881d05, 0xd9d4d039, 0xe6db99e5, 0x1fa27cf8, 0xc4ac5665, 0xf4292244,
            0x432aff97, 0xab9423a7, 0xfc93a039, 0x655b59c3, 0x8f0ccc92, 0xffeff47d, 0x85845dd1,
            0x6fa87e4f, 0xfe2ce6e0, 0xa3014314, 0x4e0811a1, 0xf7537e82, 0xbd3af235, 0x2ad7d2bb,
            0xeb86d391,
        ];

        let mut a0: u32 = 0x67452301;
        let mut b0: u32 = 0xefcdab89;
        let mut c0: u32 = 0x98badcfe;
        let mut d0: u32 = 0x10325476;

        let original_len_bits = (input.len() as u64).wrapping_mul(8);
        let mut msg = input.to_vec();
        msg.push(0x80);
        while msg.len() % 64 != 56 {
            msg.push(0);
        }
        msg.extend_from_slice(&original_len_bits.to_le_bytes());

        for chunk in msg.chunks(64) {
            let mut m = [0u32; 16];
            for (i, word) in chunk.chunks(4).enumerate() {
                m[i] = u32::from_le_bytes(word.try_into().unwrap());
            }

            let (mut a, mut b, mut c, mut d) = (a0, b0, c0, d0);
            for i in 0..64 {
                let (f, g) = if i < 16 {
                    ((b & c) | (!b & d), i)
                } else if i < 32 {
                    ((d & b) | (!d & c), (5 * i + 1) % 16)
                } else if i < 48 {
                    (b ^ c ^ d, (3 * i + 5) % 16)
                } else {
                    (c ^ (b | !d), (7 * i) % 16)
                };
                let f = f
                    .wrapping_add(a)
                    .wrapping_add(K[i])
                    .wrapping_add(m[g]);
                a = d;
                d = c;
                c = b;
                b = b.wrapping_add(f.rotate_left(S[i]));
            }

            a0 = a0.wrapping_add(a);
            b0 = b0.wrapping_add(b);
            c0 = c0.wrapping_add(c);
            d0 = d0.wrapping_add(d);
        }

        let mut out = [0u8; 16];
        out[0..4].copy_from_slice(&a0.to_le_bytes());
        out[4..8].copy_from_slice(&b0.to_le_bytes());
        out[8..12].copy_from_slice(&c0.to_le_bytes());
        out[12..16].copy_from_slice(&d0.to_le_bytes());
        out
    }

}
