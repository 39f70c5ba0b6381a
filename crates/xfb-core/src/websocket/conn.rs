//! Blocking WebSocket framer over any `Read + Write` byte stream.
//!
//! All I/O is fully blocking: once called, a read or write loops until the
//! requested number of bytes has been transferred or an error occurs. No
//! partial-frame state survives between calls, so a readiness loop can treat
//! "one call = one complete frame or message".
//!
//! Every error path tears the connection down: a close frame is sent first when
//! the failure was a protocol violation (see [`FrameError::close_code`]), then
//! the stream is dropped. Later calls return [`FrameError::NotConnected`].

use std::io::{Read, Write};
use std::time::{SystemTime, UNIX_EPOCH};

use tracing::{debug, trace, warn};

use crate::websocket::frame::{
    apply_mask, decode_header, encode_header, header_tail_len, CloseCode, FrameError, FrameHeader,
    Opcode, MAX_FRAME_SIZE, MAX_HEADER_SIZE, MAX_SHORT_LEN,
};

/// Which end of the connection we are.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// Writes unmasked frames and requires every received frame to be masked.
    Server,
    /// Writes masked frames and rejects masked frames from the server.
    Client,
}

/// Result of [`WsConnection::read_frame_header`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeaderRead {
    /// A data frame header. Its payload must be read next with
    /// [`WsConnection::read_frame_data`].
    Data {
        fin: bool,
        opcode: Opcode,
        /// All zeros when the frame was not masked (client role).
        mask_key: [u8; 4],
        payload_len: usize,
    },
    /// A control frame was consumed internally. Nothing for the caller to do.
    Retry,
}

/// One WebSocket connection.
pub struct WsConnection<S> {
    stream: Option<S>,
    role: Role,
    mask_state: u32,
}

impl<S: Read + Write> WsConnection<S> {
    pub fn new(stream: S, role: Role) -> Self {
        let seed = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.subsec_nanos())
            .unwrap_or(0x9E37_79B9);
        Self {
            stream: Some(stream),
            role,
            mask_state: seed | 1,
        }
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn is_open(&self) -> bool {
        self.stream.is_some()
    }

    /// Borrow the underlying stream (e.g. to register it with `poll`).
    pub fn get_ref(&self) -> Option<&S> {
        self.stream.as_ref()
    }

    // ── Writing ──────────────────────────────────────────────────────────────

    /// Writes one frame and returns the payload length.
    ///
    /// The smallest length encoding is chosen. Server frames are never masked,
    /// client frames always are. On a write error the connection is torn down.
    pub fn write_frame(&mut self, payload: &[u8], opcode: Opcode, fin: bool) -> Result<usize, FrameError> {
        let mask_key = match self.role {
            Role::Server => None,
            Role::Client => Some(self.next_mask_key()),
        };

        let mut buf = Vec::with_capacity(MAX_HEADER_SIZE + payload.len());
        encode_header(
            &FrameHeader {
                fin,
                opcode,
                mask_key,
                payload_len: payload.len() as u64,
            },
            &mut buf,
        );
        let body_start = buf.len();
        buf.extend_from_slice(payload);
        if let Some(key) = mask_key {
            apply_mask(&mut buf[body_start..], key);
        }

        let stream = self.stream.as_mut().ok_or(FrameError::NotConnected)?;
        let written = stream.write_all(&buf).and_then(|()| stream.flush());
        if let Err(e) = written {
            warn!("frame write failed: {e}");
            self.teardown();
            return Err(FrameError::Io(e));
        }
        trace!(?opcode, fin, len = payload.len(), "frame written");
        Ok(payload.len())
    }

    // ── Reading ──────────────────────────────────────────────────────────────

    /// Reads the next frame header.
    ///
    /// Control frames are handled here and reported as [`HeaderRead::Retry`]:
    /// a ping is answered with a pong carrying the same payload, a pong is
    /// ignored, and a close frame tears the connection down and returns
    /// [`FrameError::ClosedByPeer`].
    pub fn read_frame_header(&mut self) -> Result<HeaderRead, FrameError> {
        match self.read_header_inner() {
            Ok(read) => Ok(read),
            Err(e) => Err(self.fail(e)),
        }
    }

    /// Reads exactly `size` payload bytes and unmasks them with `mask_key`.
    pub fn read_frame_data(&mut self, size: usize, mask_key: [u8; 4]) -> Result<Vec<u8>, FrameError> {
        let mut buf = vec![0u8; size];
        if let Err(e) = self.read_exact(&mut buf) {
            return Err(self.fail(e));
        }
        apply_mask(&mut buf, mask_key);
        Ok(buf)
    }

    /// Reads one complete, possibly fragmented, data message.
    ///
    /// Returns `Ok(None)` when a control frame arrived before any data frame of
    /// a message: the caller should go back to its event loop rather than
    /// block waiting for data that may never come. Control frames between
    /// fragments are handled transparently.
    ///
    /// Fails with [`FrameError::MessageTooLarge`] if the accumulated payload
    /// would exceed `max_size`.
    pub fn read_message(&mut self, max_size: usize) -> Result<Option<Vec<u8>>, FrameError> {
        let mut message = Vec::new();
        let mut started = false;

        loop {
            let (fin, opcode, mask_key, payload_len) = match self.read_frame_header()? {
                HeaderRead::Retry if !started => return Ok(None),
                HeaderRead::Retry => continue,
                HeaderRead::Data {
                    fin,
                    opcode,
                    mask_key,
                    payload_len,
                } => (fin, opcode, mask_key, payload_len),
            };

            let in_sequence = match opcode {
                Opcode::Continuation => started,
                _ => !started,
            };
            if !in_sequence {
                return Err(self.fail(FrameError::UnexpectedOpcode(opcode)));
            }
            if message.len() + payload_len > max_size {
                return Err(self.fail(FrameError::MessageTooLarge {
                    size: message.len() + payload_len,
                    max: max_size,
                }));
            }

            let start = message.len();
            message.resize(start + payload_len, 0);
            if let Err(e) = self.read_exact(&mut message[start..]) {
                return Err(self.fail(e));
            }
            apply_mask(&mut message[start..], mask_key);
            started = true;

            if fin {
                return Ok(Some(message));
            }
        }
    }

    // ── Teardown ─────────────────────────────────────────────────────────────

    /// Closes the connection, first sending a close frame when `code` is set.
    ///
    /// Does not wait for the peer's close reply.
    pub fn close(&mut self, code: Option<CloseCode>) {
        if self.stream.is_none() {
            return;
        }
        if let Some(code) = code {
            if let Err(e) = self.write_frame(&code.to_payload(), Opcode::Close, true) {
                debug!("close frame not delivered: {e}");
            }
        }
        self.teardown();
    }

    fn teardown(&mut self) {
        if self.stream.take().is_some() {
            debug!("connection torn down");
        }
    }

    fn fail(&mut self, err: FrameError) -> FrameError {
        if self.stream.is_some() {
            warn!("closing connection: {err}");
            self.close(err.close_code());
        }
        err
    }

    fn read_header_inner(&mut self) -> Result<HeaderRead, FrameError> {
        let mut raw = [0u8; MAX_HEADER_SIZE];
        self.read_exact(&mut raw[..2])?;
        let total = 2 + header_tail_len(raw[1]);
        self.read_exact(&mut raw[2..total])?;

        let (header, _) = decode_header(&raw[..total])?;
        trace!(
            fin = header.fin,
            opcode = ?header.opcode,
            masked = header.mask_key.is_some(),
            len = header.payload_len,
            "frame header"
        );

        let expect_masked = self.role == Role::Server;
        if header.mask_key.is_some() != expect_masked {
            return Err(FrameError::BadMasking {
                masked: header.mask_key.is_some(),
            });
        }
        if header.payload_len > MAX_FRAME_SIZE {
            return Err(FrameError::TooLarge {
                size: header.payload_len,
                max: MAX_FRAME_SIZE,
            });
        }
        let mask_key = header.mask_key.unwrap_or([0; 4]);
        let payload_len = header.payload_len as usize;

        if !header.opcode.is_control() {
            return Ok(HeaderRead::Data {
                fin: header.fin,
                opcode: header.opcode,
                mask_key,
                payload_len,
            });
        }

        if !header.fin {
            return Err(FrameError::FragmentedControl(header.opcode as u8));
        }
        if header.payload_len > MAX_SHORT_LEN {
            return Err(FrameError::ControlTooLong(header.payload_len));
        }

        let mut payload = vec![0u8; payload_len];
        self.read_exact(&mut payload)?;
        apply_mask(&mut payload, mask_key);

        match header.opcode {
            Opcode::Close => {
                debug!("close frame from peer");
                Err(FrameError::ClosedByPeer)
            }
            Opcode::Ping => {
                self.write_frame(&payload, Opcode::Pong, true)?;
                Ok(HeaderRead::Retry)
            }
            _ => Ok(HeaderRead::Retry),
        }
    }

    fn read_exact(&mut self, buf: &mut [u8]) -> Result<(), FrameError> {
        let stream = self.stream.as_mut().ok_or(FrameError::NotConnected)?;
        stream.read_exact(buf)?;
        Ok(())
    }

    /// xorshift32; masking keys only need to vary, not be secret.
    fn next_mask_key(&mut self) -> [u8; 4] {
        let mut x = self.mask_state;
        x ^= x << 13;
        x ^= x >> 17;
        x ^= x << 5;
        self.mask_state = x;
        x.to_ne_bytes()
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
