//! RFC 6455 frame header layout, opcodes, and payload masking.
//!
//! Wire format of a frame header:
//! ```text
//! byte 0: [FIN:1][RSV1-3:3][opcode:4]
//! byte 1: [MASK:1][len:7]
//! len == 126  ⇒ 2-byte big-endian extended length follows
//! len == 127  ⇒ 8-byte big-endian extended length follows
//! MASK set    ⇒ 4-byte masking key follows the length
//! ```
//! The functions here operate on byte slices only; reading from and writing to
//! a socket is the job of [`crate::websocket::conn::WsConnection`].

use std::io;

use thiserror::Error;

// ── Header constants ──────────────────────────────────────────────────────────

/// FIN bit: this frame is the last one of its message.
pub const HEADER0_FIN: u8 = 0x80;
/// RSV1..RSV3. No extension is negotiated, so these must always be zero.
pub const HEADER0_RSV: u8 = 0x70;
pub const HEADER0_OPCODE_MASK: u8 = 0x0F;
/// MASK bit: a 4-byte masking key follows the length field.
pub const HEADER1_MASK: u8 = 0x80;
pub const HEADER1_LEN_MASK: u8 = 0x7F;

/// Largest payload length encoded directly in the 7-bit field.
pub const MAX_SHORT_LEN: u64 = 125;
/// 7-bit length marker for a 16-bit extended length.
pub const LEN_MARKER_16: u8 = 126;
/// 7-bit length marker for a 64-bit extended length.
pub const LEN_MARKER_64: u8 = 127;

/// Upper bound for a single frame payload (16 MiB).
pub const MAX_FRAME_SIZE: u64 = 16 * 1024 * 1024;

/// Largest possible header: 2 base bytes + 8 extended length + 4 mask.
pub const MAX_HEADER_SIZE: usize = 14;

// ── Opcodes ───────────────────────────────────────────────────────────────────

/// Frame opcodes understood by this implementation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Opcode {
    Continuation = 0x0,
    Text = 0x1,
    Binary = 0x2,
    Close = 0x8,
    Ping = 0x9,
    Pong = 0xA,
}

impl Opcode {
    /// Control frames (close/ping/pong) have the high opcode bit set.
    pub fn is_control(self) -> bool {
        (self as u8) & 0x08 != 0
    }
}

impl TryFrom<u8> for Opcode {
    type Error = ();

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0x0 => Ok(Opcode::Continuation),
            0x1 => Ok(Opcode::Text),
            0x2 => Ok(Opcode::Binary),
            0x8 => Ok(Opcode::Close),
            0x9 => Ok(Opcode::Ping),
            0xA => Ok(Opcode::Pong),
            _ => Err(()),
        }
    }
}

// ── Close codes ───────────────────────────────────────────────────────────────

/// Status codes carried in the payload of a close frame we send.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u16)]
pub enum CloseCode {
    Normal = 1000,
    ProtocolError = 1002,
    TooLarge = 1009,
}

impl CloseCode {
    pub fn to_payload(self) -> [u8; 2] {
        (self as u16).to_be_bytes()
    }
}

// ── Errors ────────────────────────────────────────────────────────────────────

/// Errors raised while reading or writing frames.
///
/// Every variant except [`FrameError::Io`], [`FrameError::ClosedByPeer`] and
/// [`FrameError::NotConnected`] is a protocol violation by the peer and is
/// answered with a close frame (see [`FrameError::close_code`]).
#[derive(Debug, Error)]
pub enum FrameError {
    /// Socket read/write failure or EOF in the middle of a frame.
    #[error("transport error: {0}")]
    Io(#[from] io::Error),

    #[error("reserved bits set in frame header (0x{0:02X})")]
    ReservedBits(u8),

    /// Client frames must be masked, server frames must not be.
    #[error("unexpected masking: frame mask bit is {masked}")]
    BadMasking { masked: bool },

    #[error("unknown opcode 0x{0:X}")]
    UnknownOpcode(u8),

    #[error("frame too large: {size} > {max} bytes")]
    TooLarge { size: u64, max: u64 },

    #[error("message too large: {size} > {max} bytes")]
    MessageTooLarge { size: usize, max: usize },

    #[error("fragmented control frame (opcode 0x{0:X})")]
    FragmentedControl(u8),

    #[error("control frame payload too long ({0} bytes)")]
    ControlTooLong(u64),

    /// Data frame order broken: a continuation without a start frame or a new
    /// message started while another was still open.
    #[error("unexpected {0:?} frame in message sequence")]
    UnexpectedOpcode(Opcode),

    #[error("connection closed by peer")]
    ClosedByPeer,

    #[error("no connection")]
    NotConnected,
}

impl FrameError {
    /// Close code to send before tearing the connection down, if any.
    pub fn close_code(&self) -> Option<CloseCode> {
        match self {
            FrameError::Io(_) | FrameError::NotConnected => None,
            // We answer the peer's close frame with our own.
            FrameError::ClosedByPeer => Some(CloseCode::Normal),
            FrameError::TooLarge { .. } | FrameError::MessageTooLarge { .. } => {
                Some(CloseCode::TooLarge)
            }
            _ => Some(CloseCode::ProtocolError),
        }
    }
}

// ── Header ────────────────────────────────────────────────────────────────────

/// A decoded frame header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameHeader {
    pub fin: bool,
    pub opcode: Opcode,
    /// Masking key, present only on client-to-server frames.
    pub mask_key: Option<[u8; 4]>,
    pub payload_len: u64,
}

/// Number of header bytes that follow the 2-byte base header.
///
/// Used by stream readers: read 2 bytes, call this, then read the rest.
pub fn header_tail_len(byte1: u8) -> usize {
    let ext = match byte1 & HEADER1_LEN_MASK {
        LEN_MARKER_16 => 2,
        LEN_MARKER_64 => 8,
        _ => 0,
    };
    let mask = if byte1 & HEADER1_MASK != 0 { 4 } else { 0 };
    ext + mask
}

/// Appends the encoded header to `out`, choosing the smallest length tier.
pub fn encode_header(header: &FrameHeader, out: &mut Vec<u8>) {
    let mut byte0 = header.opcode as u8;
    if header.fin {
        byte0 |= HEADER0_FIN;
    }
    let mask_bit = if header.mask_key.is_some() {
        HEADER1_MASK
    } else {
        0
    };
    out.push(byte0);

    let len = header.payload_len;
    if len <= MAX_SHORT_LEN {
        out.push(mask_bit | len as u8);
    } else if len <= u16::MAX as u64 {
        out.push(mask_bit | LEN_MARKER_16);
        out.extend_from_slice(&(len as u16).to_be_bytes());
    } else {
        out.push(mask_bit | LEN_MARKER_64);
        out.extend_from_slice(&len.to_be_bytes());
    }

    if let Some(key) = header.mask_key {
        out.extend_from_slice(&key);
    }
}

/// Decodes a complete header from the start of `buf`.
///
/// Returns the header and the number of bytes it occupied. Only structural
/// checks happen here (reserved bits, opcode); masking direction and size
/// limits depend on the connection role and are enforced by the caller.
///
/// # Errors
///
/// - [`FrameError::Io`] with `UnexpectedEof` if `buf` is shorter than the header.
/// - [`FrameError::ReservedBits`] / [`FrameError::UnknownOpcode`] on bad bits.
pub fn decode_header(buf: &[u8]) -> Result<(FrameHeader, usize), FrameError> {
    if buf.len() < 2 {
        return Err(truncated());
    }
    let byte0 = buf[0];
    let byte1 = buf[1];

    if byte0 & HEADER0_RSV != 0 {
        return Err(FrameError::ReservedBits(byte0 & HEADER0_RSV));
    }
    let raw_opcode = byte0 & HEADER0_OPCODE_MASK;
    let opcode = Opcode::try_from(raw_opcode).map_err(|()| FrameError::UnknownOpcode(raw_opcode))?;

    let total = 2 + header_tail_len(byte1);
    if buf.len() < total {
        return Err(truncated());
    }

    let mut pos = 2;
    let payload_len = match byte1 & HEADER1_LEN_MASK {
        LEN_MARKER_16 => {
            let len = u16::from_be_bytes([buf[2], buf[3]]) as u64;
            pos += 2;
            len
        }
        LEN_MARKER_64 => {
            let mut raw = [0u8; 8];
            raw.copy_from_slice(&buf[2..10]);
            pos += 8;
            u64::from_be_bytes(raw)
        }
        short => short as u64,
    };

    let mask_key = if byte1 & HEADER1_MASK != 0 {
        let mut key = [0u8; 4];
        key.copy_from_slice(&buf[pos..pos + 4]);
        Some(key)
    } else {
        None
    };

    Ok((
        FrameHeader {
            fin: byte0 & HEADER0_FIN != 0,
            opcode,
            mask_key,
            payload_len,
        },
        total,
    ))
}

fn truncated() -> FrameError {
    FrameError::Io(io::Error::new(
        io::ErrorKind::UnexpectedEof,
        "truncated frame header",
    ))
}

// ── Masking ───────────────────────────────────────────────────────────────────

/// XORs `buf` in place with the 4-byte masking key.
///
/// Works on whole 4-byte words first, then on the trailing partial word.
/// Masking and unmasking are the same operation. An all-zero key is a no-op.
pub fn apply_mask(buf: &mut [u8], key: [u8; 4]) {
    if key == [0; 4] {
        return;
    }
    let key_word = u32::from_ne_bytes(key);
    let mut chunks = buf.chunks_exact_mut(4);
    for chunk in &mut chunks {
        let word = u32::from_ne_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]) ^ key_word;
        chunk.copy_from_slice(&word.to_ne_bytes());
    }
    for (i, byte) in chunks.into_remainder().iter_mut().enumerate() {
        *byte ^= key[i];
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn encoded(fin: bool, opcode: Opcode, mask_key: Option<[u8; 4]>, len: u64) -> Vec<u8> {
        let mut out = Vec::new();
        encode_header(
            &FrameHeader {
                fin,
                opcode,
                mask_key,
                payload_len: len,
            },
            &mut out,
        );
        out
    }

    #[test]
    fn test_length_tier_boundaries() {
        // 125 is the last literal length, 126 switches to 16-bit,
        // 65536 switches to 64-bit.
        assert_eq!(encoded(true, Opcode::Binary, None, 0).len(), 2);
        assert_eq!(encoded(true, Opcode::Binary, None, 125).len(), 2);
        assert_eq!(encoded(true, Opcode::Binary, None, 126).len(), 4);
        assert_eq!(encoded(true, Opcode::Binary, None, 65535).len(), 4);
        assert_eq!(encoded(true, Opcode::Binary, None, 65536).len(), 10);
    }

    #[test]
    fn test_encode_header_sets_fin_and_opcode_bits() {
        let bytes = encoded(true, Opcode::Text, None, 3);
        assert_eq!(bytes, vec![0x81, 0x03]);

        let bytes = encoded(false, Opcode::Continuation, None, 0);
        assert_eq!(bytes, vec![0x00, 0x00]);
    }

    #[test]
    fn test_encode_header_extended_lengths_are_big_endian() {
        let bytes = encoded(true, Opcode::Binary, None, 0x1234);
        assert_eq!(bytes, vec![0x82, 126, 0x12, 0x34]);

        let bytes = encoded(true, Opcode::Binary, None, 0x0001_0000);
        assert_eq!(bytes, vec![0x82, 127, 0, 0, 0, 0, 0, 1, 0, 0]);
    }

    #[test]
    fn test_decode_header_reads_mask_key_after_extended_length() {
        // Arrange
        let key = [0xDE, 0xAD, 0xBE, 0xEF];
        let bytes = encoded(false, Opcode::Binary, Some(key), 300);

        // Act
        let (header, consumed) = decode_header(&bytes).expect("decode");

        // Assert
        assert_eq!(consumed, 8);
        assert!(!header.fin);
        assert_eq!(header.opcode, Opcode::Binary);
        assert_eq!(header.mask_key, Some(key));
        assert_eq!(header.payload_len, 300);
    }

    #[test]
    fn test_decode_header_rejects_reserved_bits() {
        let result = decode_header(&[0x80 | 0x40 | 0x02, 0x80, 0, 0, 0, 0]);
        assert!(matches!(result, Err(FrameError::ReservedBits(0x40))));
    }

    #[test]
    fn test_decode_header_rejects_unknown_opcode() {
        let result = decode_header(&[0x83, 0x80, 0, 0, 0, 0]);
        assert!(matches!(result, Err(FrameError::UnknownOpcode(0x3))));
    }

    #[test]
    fn test_decode_header_truncated_returns_io_error() {
        let result = decode_header(&[0x82, 0x80 | 126, 0x01]);
        assert!(matches!(result, Err(FrameError::Io(_))));
    }

    #[test]
    fn test_header_tail_len_counts_extended_length_and_mask() {
        assert_eq!(header_tail_len(0x05), 0);
        assert_eq!(header_tail_len(0x80 | 0x05), 4);
        assert_eq!(header_tail_len(126), 2);
        assert_eq!(header_tail_len(0x80 | 127), 12);
    }

    #[test]
    fn test_apply_mask_handles_partial_trailing_word() {
        // Arrange: RFC 6455 section 5.7 example, "Hello" masked with 37 fa 21 3d.
        let key = [0x37, 0xfa, 0x21, 0x3d];
        let mut buf = b"Hello".to_vec();

        // Act
        apply_mask(&mut buf, key);

        // Assert
        assert_eq!(buf, vec![0x7f, 0x9f, 0x4d, 0x51, 0x58]);
        apply_mask(&mut buf, key);
        assert_eq!(buf, b"Hello");
    }

    #[test]
    fn test_apply_mask_zero_key_is_noop() {
        let mut buf = vec![1, 2, 3, 4, 5, 6, 7];
        apply_mask(&mut buf, [0; 4]);
        assert_eq!(buf, vec![1, 2, 3, 4, 5, 6, 7]);
    }

    #[test]
    fn test_opcode_is_control() {
        assert!(Opcode::Close.is_control());
        assert!(Opcode::Ping.is_control());
        assert!(Opcode::Pong.is_control());
        assert!(!Opcode::Continuation.is_control());
        assert!(!Opcode::Text.is_control());
        assert!(!Opcode::Binary.is_control());
    }

    #[test]
    fn test_close_code_for_protocol_violations() {
        assert_eq!(
            FrameError::BadMasking { masked: false }.close_code(),
            Some(CloseCode::ProtocolError)
        );
        assert_eq!(
            FrameError::TooLarge { size: 1, max: 0 }.close_code(),
            Some(CloseCode::TooLarge)
        );
        assert_eq!(FrameError::ReservedBits(0x10).close_code(), Some(CloseCode::ProtocolError));
        assert_eq!(FrameError::NotConnected.close_code(), None);
    }
}
