//! Draft-76 numeric challenge calculator.
//!
//! Draft 76 proves to the client that the server actually read the handshake: the
//! two `Sec-WebSocket-Key*` headers each hide a number among garbage characters, an
//! 8-byte nonce follows the headers, and the server must answer with the MD5 digest
//! of the recovered numbers and the nonce.

use bytes::{BufMut, BytesMut};
use md5::{Digest, Md5};

use crate::{Result, WebSocketError};

/// Computes the 16-byte challenge digest from the two handshake keys and the nonce.
///
/// For each key the digits are extracted in scanning order and parsed as an unsigned
/// integer, the literal spaces are counted, and the quotient of the two (integer
/// division, truncated to 32 bits) becomes one 4-byte big-endian quarter of the
/// digest input. The nonce fills the remaining 8 bytes and the whole 16-byte buffer
/// is hashed with MD5.
///
/// # Errors
/// Returns [`WebSocketError::MalformedChallengeKey`] when a key holds no digits, no
/// spaces (a division by zero in the draft algorithm, which must reject the
/// handshake rather than crash the server), or a digit string too long to parse.
pub fn compute(key1: &str, key2: &str, key3: &[u8; 8]) -> Result<[u8; 16]> {
    let part1 = key_part(key1)?;
    let part2 = key_part(key2)?;

    let mut material = BytesMut::with_capacity(16);
    material.put_i32(part1);
    material.put_i32(part2);
    material.put_slice(key3);

    let mut md5 = Md5::new();
    md5.update(&material);
    Ok(md5.finalize().into())
}

/// Reduces one handshake key to its 32-bit quarter of the digest input.
fn key_part(key: &str) -> Result<i32> {
    let digits: String = key.chars().filter(|c| c.is_ascii_digit()).collect();
    if digits.is_empty() {
        return Err(WebSocketError::MalformedChallengeKey("key holds no digits"));
    }

    let key_number: u64 = digits
        .parse()
        .map_err(|_| WebSocketError::MalformedChallengeKey("key number out of range"))?;

    let spaces = key.chars().filter(|&c| c == ' ').count() as u64;
    if spaces == 0 {
        return Err(WebSocketError::MalformedChallengeKey("key holds no spaces"));
    }

    // truncating cast mirrors the draft's 64-to-32-bit narrowing
    Ok((key_number / spaces) as i32)
}
