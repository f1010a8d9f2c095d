//! Legacy delimiter-based frame codec.
//!
//! Drafts 75 and 76 frame a text message as `0x00 <payload bytes> 0xFF`, with no
//! length prefix and no masking. The format provides no escaping either: a payload
//! byte that happens to equal `0xFF` terminates the frame early. That hazard is
//! inherited from the draft and deliberately not worked around here.
//!
//! Payload bytes are turned into characters one byte at a time, the way draft-era
//! implementations widened each octet into a code unit. This is not UTF-8 decoding;
//! byte `0xE9` decodes to `'é'` regardless of what encoding the client intended.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio_util::codec;

use crate::WebSocketError;

/// Marker byte opening a frame.
pub const FRAME_START: u8 = 0x00;

/// Marker byte terminating a frame.
pub const FRAME_END: u8 = 0xFF;

/// Second byte of the client-error marker.
///
/// The draft-era read model reported the two-byte value `0xFFFC` when the client
/// signalled an error. On a plain byte stream that surfaces as `0xFF 0xFC` observed
/// where a start marker is expected.
const ERROR_MARK: u8 = 0xFC;

/// Represents the reading state of a legacy frame.
enum ReadState {
    /// Scanning for a `0x00` start marker; bytes seen before it are discarded.
    Scan,
    /// Accumulating payload bytes until the `0xFF` end marker.
    Payload(BytesMut),
}

/// Combined encoder and decoder for the legacy framing.
///
/// The decoder is stateful: partially received frames survive across `decode` calls,
/// so the codec can sit inside a `FramedRead`/`FramedWrite` pair over any byte
/// stream. One instance must not be shared between connections.
pub struct Codec {
    state: ReadState,
}

impl Codec {
    /// Creates a codec in the initial scanning state.
    pub fn new() -> Self {
        Self {
            state: ReadState::Scan,
        }
    }
}

impl Default for Codec {
    fn default() -> Self {
        Self::new()
    }
}

/// Encodes a text message into a single legacy frame.
///
/// Each character is truncated to its low byte, the inverse of the decoder's
/// byte-per-character widening. Characters above U+00FF therefore do not survive a
/// round trip; the draft framing simply cannot carry them.
pub fn encode_text(text: &str) -> Bytes {
    let mut buf = BytesMut::with_capacity(text.len() + 2);
    buf.put_u8(FRAME_START);
    for ch in text.chars() {
        buf.put_u8(ch as u32 as u8);
    }
    buf.put_u8(FRAME_END);
    buf.freeze()
}

impl codec::Decoder for Codec {
    type Item = String;
    type Error = WebSocketError;

    /// Decodes the next complete message from the inbound byte stream.
    ///
    /// Bytes encountered while scanning for a start marker are discarded, except the
    /// `0xFF 0xFC` pair which surfaces as [`WebSocketError::ClientError`]. A lone
    /// `0xFF` at the end of the buffer waits for the following byte before it is
    /// classified.
    ///
    /// # Returns
    /// - `Ok(Some(message))` once a full `0x00 .. 0xFF` frame has been consumed.
    /// - `Ok(None)` when more data is needed; the end of the underlying stream then
    ///   reads as normal closure, not an error.
    /// - `Err(WebSocketError::ClientError)` if the client sent the error marker.
    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        loop {
            match &mut self.state {
                ReadState::Scan => loop {
                    if !src.has_remaining() {
                        return Ok(None);
                    }
                    match src[0] {
                        FRAME_START => {
                            src.advance(1);
                            self.state = ReadState::Payload(BytesMut::new());
                            break;
                        }
                        FRAME_END => {
                            if src.remaining() < 2 {
                                return Ok(None);
                            }
                            if src[1] == ERROR_MARK {
                                return Err(WebSocketError::ClientError);
                            }
                            src.advance(1);
                        }
                        // noise before a start marker
                        _ => src.advance(1),
                    }
                },
                ReadState::Payload(payload) => {
                    while src.has_remaining() {
                        let byte = src.get_u8();
                        if byte == FRAME_END {
                            let message = payload.iter().map(|&b| b as char).collect();
                            self.state = ReadState::Scan;
                            return Ok(Some(message));
                        }
                        payload.put_u8(byte);
                    }
                    return Ok(None);
                }
            }
        }
    }

    /// Classifies the bytes left over when the stream ends.
    ///
    /// A client that disconnects mid-frame, or right after a stray end marker, has
    /// simply gone away; the remainder is dropped and the stream reads as a normal
    /// closure. Only a complete error marker still surfaces as
    /// [`WebSocketError::ClientError`].
    fn decode_eof(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        match self.decode(src)? {
            Some(message) => Ok(Some(message)),
            None => {
                src.clear();
                self.state = ReadState::Scan;
                Ok(None)
            }
        }
    }
}

impl codec::Encoder<String> for Codec {
    type Error = WebSocketError;

    fn encode(&mut self, item: String, dst: &mut BytesMut) -> Result<(), Self::Error> {
        dst.extend_from_slice(&encode_text(&item));
        Ok(())
    }
}
