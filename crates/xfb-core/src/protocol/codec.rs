//! Explicit little-endian encoding of the framebuffer protocol.
//!
//! Every fixed-size message is checked for its exact length before any field is
//! read. The cursor reply is the only variable-size message: its header is
//! checked first, then the exact size is computed from width × height.

use thiserror::Error;

use crate::protocol::messages::*;

/// Errors that can occur while decoding a message.
#[derive(Debug, Error, PartialEq)]
pub enum ProtocolError {
    #[error("empty message")]
    Empty,

    #[error("unknown message type: 0x{0:02X}")]
    UnknownMessageType(u8),

    /// Declared tag does not match the message length.
    #[error("invalid {name} message ({actual} != {expected} bytes)")]
    SizeMismatch {
        name: &'static str,
        expected: usize,
        actual: usize,
    },

    #[error("insufficient data: need at least {needed} bytes, got {available}")]
    InsufficientData { needed: usize, available: usize },
}

// ── Client messages ───────────────────────────────────────────────────────────

/// Decodes one client message.
///
/// # Errors
///
/// [`ProtocolError::Empty`], [`ProtocolError::UnknownMessageType`], or
/// [`ProtocolError::SizeMismatch`] when the length is wrong for the tag.
pub fn decode_client_message(buf: &[u8]) -> Result<ClientMessage, ProtocolError> {
    let tag = *buf.first().ok_or(ProtocolError::Empty)?;
    match tag {
        TAG_SCREEN => {
            require_exact(buf, SCREEN_REQUEST_SIZE, "screen")?;
            Ok(ClientMessage::Screen(ScreenRequest {
                shm: buf[1] & SCREEN_SHM_BIT != 0,
                refresh: buf[1] & SCREEN_REFRESH_BIT != 0,
                width: read_u16(buf, 2),
                height: read_u16(buf, 4),
                address: read_u64(buf, 6),
                signature: read_u64(buf, 14),
            }))
        }
        TAG_CURSOR => {
            require_exact(buf, CURSOR_REQUEST_SIZE, "cursor")?;
            Ok(ClientMessage::Cursor)
        }
        TAG_RESOLUTION => {
            require_exact(buf, RESOLUTION_SIZE, "resolution")?;
            Ok(ClientMessage::Resolution(decode_resolution(buf)))
        }
        TAG_KEY => {
            let key = match buf.len() {
                KEY_SIZE => Key::Keycode(buf[2]),
                KEY_LEGACY_SIZE => Key::Keysym(read_u32(buf, 2)),
                actual => {
                    return Err(ProtocolError::SizeMismatch {
                        name: "key",
                        expected: KEY_SIZE,
                        actual,
                    })
                }
            };
            Ok(ClientMessage::Key(KeyEvent {
                down: buf[1] & DOWN_BIT != 0,
                key,
            }))
        }
        TAG_MOUSE_MOVE => {
            require_exact(buf, MOUSE_MOVE_SIZE, "mousemove")?;
            Ok(ClientMessage::MouseMove(MouseMove {
                x: read_u16(buf, 1),
                y: read_u16(buf, 3),
            }))
        }
        TAG_MOUSE_CLICK => {
            require_exact(buf, MOUSE_CLICK_SIZE, "mouseclick")?;
            Ok(ClientMessage::MouseClick(MouseClick {
                down: buf[1] & DOWN_BIT != 0,
                button: buf[2],
            }))
        }
        TAG_QUIT => {
            require_exact(buf, QUIT_SIZE, "quit")?;
            Ok(ClientMessage::Quit)
        }
        other => Err(ProtocolError::UnknownMessageType(other)),
    }
}

/// Encodes a client message. Used by the probe client and in tests.
pub fn encode_client_message(msg: &ClientMessage) -> Vec<u8> {
    match msg {
        ClientMessage::Screen(req) => {
            let mut buf = Vec::with_capacity(SCREEN_REQUEST_SIZE);
            buf.push(TAG_SCREEN);
            buf.push(flag(req.shm, SCREEN_SHM_BIT) | flag(req.refresh, SCREEN_REFRESH_BIT));
            buf.extend_from_slice(&req.width.to_le_bytes());
            buf.extend_from_slice(&req.height.to_le_bytes());
            buf.extend_from_slice(&req.address.to_le_bytes());
            buf.extend_from_slice(&req.signature.to_le_bytes());
            buf
        }
        ClientMessage::Cursor => vec![TAG_CURSOR],
        ClientMessage::Resolution(res) => encode_resolution(res),
        ClientMessage::Key(ev) => {
            let mut buf = vec![TAG_KEY, flag(ev.down, DOWN_BIT)];
            match ev.key {
                Key::Keycode(code) => buf.push(code),
                Key::Keysym(sym) => buf.extend_from_slice(&sym.to_le_bytes()),
            }
            buf
        }
        ClientMessage::MouseMove(mv) => {
            let mut buf = vec![TAG_MOUSE_MOVE];
            buf.extend_from_slice(&mv.x.to_le_bytes());
            buf.extend_from_slice(&mv.y.to_le_bytes());
            buf
        }
        ClientMessage::MouseClick(click) => {
            vec![TAG_MOUSE_CLICK, flag(click.down, DOWN_BIT), click.button]
        }
        ClientMessage::Quit => vec![TAG_QUIT],
    }
}

// ── Server messages ───────────────────────────────────────────────────────────

/// Encodes a server message.
pub fn encode_server_message(msg: &ServerMessage) -> Vec<u8> {
    match msg {
        ServerMessage::Screen(reply) => {
            let mut buf = Vec::with_capacity(SCREEN_REPLY_SIZE);
            buf.push(TAG_SCREEN);
            buf.push(
                flag(reply.shm, REPLY_SHM_BIT)
                    | flag(reply.shm_failed, REPLY_SHM_FAILED_BIT)
                    | flag(reply.updated, REPLY_UPDATED_BIT)
                    | flag(reply.cursor_updated, REPLY_CURSOR_UPDATED_BIT),
            );
            buf.extend_from_slice(&reply.width.to_le_bytes());
            buf.extend_from_slice(&reply.height.to_le_bytes());
            buf.extend_from_slice(&reply.cursor_serial.to_le_bytes());
            buf
        }
        ServerMessage::Cursor(img) => {
            let mut buf = Vec::with_capacity(CURSOR_REPLY_HEADER_SIZE + 4 * img.pixels.len());
            buf.push(TAG_CURSOR);
            buf.extend_from_slice(&img.width.to_le_bytes());
            buf.extend_from_slice(&img.height.to_le_bytes());
            buf.extend_from_slice(&img.xhot.to_le_bytes());
            buf.extend_from_slice(&img.yhot.to_le_bytes());
            buf.extend_from_slice(&img.serial.to_le_bytes());
            for pixel in &img.pixels {
                buf.extend_from_slice(&pixel.to_le_bytes());
            }
            buf
        }
        ServerMessage::Resolution(res) => encode_resolution(res),
        ServerMessage::Init { freon } => vec![TAG_INIT, u8::from(*freon)],
    }
}

/// Decodes a server message. Used by the probe client and in tests.
pub fn decode_server_message(buf: &[u8]) -> Result<ServerMessage, ProtocolError> {
    let tag = *buf.first().ok_or(ProtocolError::Empty)?;
    match tag {
        TAG_SCREEN => {
            require_exact(buf, SCREEN_REPLY_SIZE, "screen reply")?;
            Ok(ServerMessage::Screen(ScreenReply {
                shm: buf[1] & REPLY_SHM_BIT != 0,
                shm_failed: buf[1] & REPLY_SHM_FAILED_BIT != 0,
                updated: buf[1] & REPLY_UPDATED_BIT != 0,
                cursor_updated: buf[1] & REPLY_CURSOR_UPDATED_BIT != 0,
                width: read_u16(buf, 2),
                height: read_u16(buf, 4),
                cursor_serial: read_u32(buf, 6),
            }))
        }
        TAG_CURSOR => {
            if buf.len() < CURSOR_REPLY_HEADER_SIZE {
                return Err(ProtocolError::InsufficientData {
                    needed: CURSOR_REPLY_HEADER_SIZE,
                    available: buf.len(),
                });
            }
            let width = read_u16(buf, 1);
            let height = read_u16(buf, 3);
            let count = width as usize * height as usize;
            require_exact(buf, CURSOR_REPLY_HEADER_SIZE + 4 * count, "cursor reply")?;
            let pixels = buf[CURSOR_REPLY_HEADER_SIZE..]
                .chunks_exact(4)
                .map(|px| u32::from_le_bytes([px[0], px[1], px[2], px[3]]))
                .collect();
            Ok(ServerMessage::Cursor(CursorImage {
                width,
                height,
                xhot: read_u16(buf, 5),
                yhot: read_u16(buf, 7),
                serial: read_u32(buf, 9),
                pixels,
            }))
        }
        TAG_RESOLUTION => {
            require_exact(buf, RESOLUTION_SIZE, "resolution")?;
            Ok(ServerMessage::Resolution(decode_resolution(buf)))
        }
        TAG_INIT => {
            require_exact(buf, INIT_SIZE, "init")?;
            Ok(ServerMessage::Init { freon: buf[1] != 0 })
        }
        other => Err(ProtocolError::UnknownMessageType(other)),
    }
}

// ── Helpers ───────────────────────────────────────────────────────────────────

fn encode_resolution(res: &Resolution) -> Vec<u8> {
    let mut buf = Vec::with_capacity(RESOLUTION_SIZE);
    buf.push(TAG_RESOLUTION);
    buf.extend_from_slice(&res.width.to_le_bytes());
    buf.extend_from_slice(&res.height.to_le_bytes());
    buf
}

fn decode_resolution(buf: &[u8]) -> Resolution {
    Resolution {
        width: read_u16(buf, 1),
        height: read_u16(buf, 3),
    }
}

fn flag(set: bool, bit: u8) -> u8 {
    if set {
        bit
    } else {
        0
    }
}

fn require_exact(buf: &[u8], expected: usize, name: &'static str) -> Result<(), ProtocolError> {
    if buf.len() == expected {
        Ok(())
    } else {
        Err(ProtocolError::SizeMismatch {
            name,
            expected,
            actual: buf.len(),
        })
    }
}

// Callers have already checked the length.
fn read_u16(buf: &[u8], offset: usize) -> u16 {
    u16::from_le_bytes([buf[offset], buf[offset + 1]])
}

fn read_u32(buf: &[u8], offset: usize) -> u32 {
    let mut raw = [0u8; 4];
    raw.copy_from_slice(&buf[offset..offset + 4]);
    u32::from_le_bytes(raw)
}

fn read_u64(buf: &[u8], offset: usize) -> u64 {
    let mut raw = [0u8; 8];
    raw.copy_from_slice(&buf[offset..offset + 8]);
    u64::from_le_bytes(raw)
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_screen_request_layout() {
        // Arrange
        let bytes = [
            b'S', 0b11, 0x00, 0x04, 0x00, 0x03, // flags, 1024 x 768
            0x08, 0x07, 0x06, 0x05, 0x04, 0x03, 0x02, 0x01, // address
            0xEF, 0xBE, 0xAD, 0xDE, 0x00, 0x00, 0x00, 0x00, // signature
        ];

        // Act
        let msg = decode_client_message(&bytes).expect("decode");

        // Assert
        assert_eq!(
            msg,
            ClientMessage::Screen(ScreenRequest {
                shm: true,
                refresh: true,
                width: 1024,
                height: 768,
                address: 0x0102_0304_0506_0708,
                signature: 0xDEAD_BEEF,
            })
        );
        assert_eq!(encode_client_message(&msg), bytes);
    }

    #[test]
    fn test_screen_reply_layout() {
        let reply = ScreenReply {
            shm: true,
            shm_failed: false,
            updated: true,
            cursor_updated: true,
            width: 800,
            height: 600,
            cursor_serial: 7,
        };

        let bytes = encode_server_message(&ServerMessage::Screen(reply));

        assert_eq!(bytes, vec![b'S', 0b1101, 0x20, 0x03, 0x58, 0x02, 7, 0, 0, 0]);
        assert_eq!(bytes.len(), SCREEN_REPLY_SIZE);
    }

    #[test]
    fn test_key_current_and_legacy_layouts() {
        assert_eq!(
            decode_client_message(&[b'K', 1, 38]),
            Ok(ClientMessage::Key(KeyEvent {
                down: true,
                key: Key::Keycode(38),
            }))
        );
        assert_eq!(
            decode_client_message(&[b'K', 0, 0x61, 0, 0, 0]),
            Ok(ClientMessage::Key(KeyEvent {
                down: false,
                key: Key::Keysym(0x61),
            }))
        );
    }

    #[test]
    fn test_decode_wrong_size_returns_error() {
        let cases: [(&[u8], &str); 6] = [
            (&[b'S', 0, 0], "screen"),
            (&[b'P', 0], "cursor"),
            (&[b'R', 0, 0, 0], "resolution"),
            (&[b'K', 0, 0, 0], "key"),
            (&[b'M', 0, 0, 0, 0, 0], "mousemove"),
            (&[b'Q', 0], "quit"),
        ];
        for (bytes, name) in cases {
            let result = decode_client_message(bytes);
            assert!(
                matches!(result, Err(ProtocolError::SizeMismatch { name: n, .. }) if n == name),
                "{name}: {result:?}"
            );
        }
    }

    #[test]
    fn test_decode_empty_returns_error() {
        assert_eq!(decode_client_message(&[]), Err(ProtocolError::Empty));
    }

    #[test]
    fn test_decode_unknown_tag_returns_error() {
        assert_eq!(
            decode_client_message(&[b'Z']),
            Err(ProtocolError::UnknownMessageType(b'Z'))
        );
    }

    #[test]
    fn test_mouse_messages() {
        assert_eq!(
            decode_client_message(&[b'M', 0x10, 0x00, 0x20, 0x01]),
            Ok(ClientMessage::MouseMove(MouseMove { x: 16, y: 288 }))
        );
        assert_eq!(
            decode_client_message(&[b'C', 1, 3]),
            Ok(ClientMessage::MouseClick(MouseClick {
                down: true,
                button: 3,
            }))
        );
    }

    #[test]
    fn test_cursor_reply_size_follows_dimensions() {
        // Arrange
        let img = CursorImage {
            width: 2,
            height: 3,
            xhot: 1,
            yhot: 2,
            serial: 42,
            pixels: (0..6).map(|i| 0xFF00_0000 | i).collect(),
        };

        // Act
        let bytes = encode_server_message(&ServerMessage::Cursor(img.clone()));

        // Assert
        assert_eq!(bytes.len(), CURSOR_REPLY_HEADER_SIZE + 4 * 6);
        assert_eq!(decode_server_message(&bytes), Ok(ServerMessage::Cursor(img)));
        assert!(matches!(
            decode_server_message(&bytes[..bytes.len() - 1]),
            Err(ProtocolError::SizeMismatch { .. })
        ));
        assert!(matches!(
            decode_server_message(&bytes[..5]),
            Err(ProtocolError::InsufficientData { .. })
        ));
    }

    #[test]
    fn test_init_message() {
        let bytes = encode_server_message(&ServerMessage::Init { freon: true });
        assert_eq!(bytes, vec![b'I', 1]);
        assert_eq!(decode_server_message(&bytes), Ok(ServerMessage::Init { freon: true }));
    }
}
