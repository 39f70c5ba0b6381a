//! One request/reply exchange between a pipe and the WebSocket client.
//!
//! A request is read from the input pipe until EOF and sent as it arrives:
//! the first chunk as a TEXT frame, later chunks as CONTINUATION frames, all
//! without FIN, then an empty frame with FIN set ends the message. The reply
//! is one possibly fragmented message, streamed frame by frame to the output.

use std::io::{self, Read, Write};

use thiserror::Error;
use tracing::{debug, trace, warn};
use xfb_core::websocket::HeaderRead;
use xfb_core::{FrameError, Opcode, WsConnection};

/// Bytes read from the input pipe per frame.
pub const CHUNK_SIZE: usize = 4096;

/// Written to the output pipe when a request arrives with no client.
pub const NOT_CONNECTED: &str = "EError: not connected.";

/// Written to the output pipe when the request cannot be forwarded.
pub const SOCKET_WRITE_ERROR: &str = "EError: socket write error.";

#[derive(Debug, Error)]
pub enum RelayError {
    #[error("cannot read request: {0}")]
    Input(#[source] io::Error),

    #[error("cannot forward request: {0}")]
    Forward(#[source] FrameError),

    #[error("cannot read reply: {0}")]
    Reply(#[source] FrameError),
}

/// Sends everything readable from `input` as one text message and returns
/// the number of payload bytes sent.
///
/// # Errors
///
/// [`RelayError::Input`] if `input` fails, [`RelayError::Forward`] if a frame
/// cannot be written (the connection is then already torn down).
pub fn forward_request<S, R>(conn: &mut WsConnection<S>, input: &mut R) -> Result<usize, RelayError>
where
    S: Read + Write,
    R: Read + ?Sized,
{
    let mut chunk = vec![0u8; CHUNK_SIZE];
    let mut opcode = Opcode::Text;
    let mut total = 0;

    loop {
        let n = match input.read(&mut chunk) {
            Ok(0) => break,
            Ok(n) => n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(RelayError::Input(e)),
        };
        trace!("forwarding {n} bytes");
        conn.write_frame(&chunk[..n], opcode, false).map_err(RelayError::Forward)?;
        opcode = Opcode::Continuation;
        total += n;
    }

    conn.write_frame(&[], opcode, true).map_err(RelayError::Forward)?;
    debug!("request forwarded ({total} bytes)");
    Ok(total)
}

/// Reads the client's reply message and copies it to `out`, returning the
/// reply length.
///
/// The whole reply is consumed even when `out` is missing or fails, so the
/// connection stays in sync.
///
/// # Errors
///
/// [`RelayError::Reply`] if the connection fails while reading.
pub fn relay_reply<S, W>(conn: &mut WsConnection<S>, mut out: Option<W>) -> Result<usize, RelayError>
where
    S: Read + Write,
    W: Write,
{
    let mut total = 0;
    loop {
        let (fin, mask_key, payload_len) = match conn.read_frame_header().map_err(RelayError::Reply)? {
            HeaderRead::Retry => continue,
            HeaderRead::Data {
                fin,
                mask_key,
                payload_len,
                ..
            } => (fin, mask_key, payload_len),
        };
        let data = conn.read_frame_data(payload_len, mask_key).map_err(RelayError::Reply)?;
        total += data.len();

        if let Some(writer) = out.as_mut() {
            if let Err(e) = writer.write_all(&data).and_then(|()| writer.flush()) {
                warn!("cannot write reply to pipe: {e}");
                out = None;
            }
        }
        if fin {
            debug!("reply relayed ({total} bytes)");
            return Ok(total);
        }
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
