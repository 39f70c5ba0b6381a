//! Protocol client for smoke testing a running server.
//!
//! Connects like the browser extension does, then requests frames paced by
//! [`RefreshScheduler`]: again right away after an updated frame, after
//! `1000 / fps` ms otherwise. A changed cursor serial triggers a cursor fetch.
//! Frames are requested without shared memory, so the probe needs no resolver.

use std::net::TcpStream;
use std::thread;
use std::time::Instant;

use thiserror::Error;
use tracing::{debug, info};
use xfb_core::protocol::{
    decode_server_message, encode_client_message, ClientMessage, Resolution, ScreenReply, ScreenRequest,
};
use xfb_core::websocket::{connect_client, MAX_FRAME_SIZE};
use xfb_core::{
    CloseCode, FrameError, HandshakeError, Opcode, ProtocolError, RefreshScheduler, ServerMessage, WsConnection,
};

#[derive(Debug, Error)]
pub enum ProbeError {
    #[error("connection failed: {0}")]
    Handshake(#[from] HandshakeError),

    #[error("transport error: {0}")]
    Frame(#[from] FrameError),

    #[error("malformed server message: {0}")]
    Protocol(#[from] ProtocolError),

    #[error("expected {expected} message, got {got:?}")]
    Unexpected { expected: &'static str, got: ServerMessage },

    #[error("no screen request pending and no timer armed")]
    Stalled,
}

#[derive(Debug, Clone)]
pub struct ProbeConfig {
    pub port: u16,
    pub fps: u32,
    /// Screen replies to collect before disconnecting.
    pub frames: u64,
    /// Size announced in screen requests.
    pub width: u16,
    pub height: u16,
    /// Resolution to request once before streaming.
    pub resize: Option<Resolution>,
}

impl Default for ProbeConfig {
    fn default() -> Self {
        Self {
            port: xfb_core::protocol::PORT_BASE,
            fps: 30,
            frames: 60,
            width: 0,
            height: 0,
            resize: None,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProbeStats {
    pub version: String,
    pub freon: bool,
    pub applied_resolution: Option<Resolution>,
    pub updated: u64,
    pub not_updated: u64,
    pub cursor_fetches: u64,
    pub last_cursor_serial: Option<u32>,
}

/// Connects, streams `config.frames` screen replies, and disconnects.
///
/// # Errors
///
/// Any connection, transport, or decoding failure, or a reply of the wrong
/// kind.
pub fn run_probe(config: &ProbeConfig) -> Result<ProbeStats, ProbeError> {
    let (mut conn, version) = connect_client(config.port)?;
    info!("connected to port {}, server version {version}", config.port);

    let freon = match read_reply(&mut conn)? {
        ServerMessage::Init { freon } => freon,
        got => return Err(ProbeError::Unexpected { expected: "init", got }),
    };
    let mut stats = ProbeStats {
        version,
        freon,
        ..ProbeStats::default()
    };

    if let Some(size) = config.resize {
        send(&mut conn, &ClientMessage::Resolution(size))?;
        match read_reply(&mut conn)? {
            ServerMessage::Resolution(applied) => stats.applied_resolution = Some(applied),
            got => return Err(ProbeError::Unexpected { expected: "resolution", got }),
        }
    }

    let mut scheduler = RefreshScheduler::new(config.fps);
    let mut pending = Some(scheduler.request_now());
    let mut first = true;
    while stats.updated + stats.not_updated < config.frames {
        let token = match pending.take() {
            Some(token) => token,
            None => {
                let deadline = scheduler.next_deadline().ok_or(ProbeError::Stalled)?;
                let now = Instant::now();
                if deadline > now {
                    thread::sleep(deadline - now);
                }
                match scheduler.poll_timer(Instant::now()) {
                    Some(token) => token,
                    None => continue,
                }
            }
        };

        let reply = request_screen(&mut conn, config, first)?;
        first = false;
        if reply.updated {
            stats.updated += 1;
        } else {
            stats.not_updated += 1;
        }

        if reply.cursor_updated && stats.last_cursor_serial != Some(reply.cursor_serial) {
            send(&mut conn, &ClientMessage::Cursor)?;
            match read_reply(&mut conn)? {
                ServerMessage::Cursor(image) => {
                    debug!("cursor {}x{} serial {}", image.width, image.height, image.serial);
                    stats.cursor_fetches += 1;
                }
                got => return Err(ProbeError::Unexpected { expected: "cursor", got }),
            }
            stats.last_cursor_serial = Some(reply.cursor_serial);
        }

        pending = scheduler.on_reply(token, reply.updated, Instant::now());
    }

    conn.close(Some(CloseCode::Normal));
    Ok(stats)
}

fn request_screen(
    conn: &mut WsConnection<TcpStream>,
    config: &ProbeConfig,
    refresh: bool,
) -> Result<ScreenReply, ProbeError> {
    let request = ScreenRequest {
        shm: false,
        refresh,
        width: config.width,
        height: config.height,
        address: 0,
        signature: 0,
    };
    send(conn, &ClientMessage::Screen(request))?;
    match read_reply(conn)? {
        ServerMessage::Screen(reply) => Ok(reply),
        got => Err(ProbeError::Unexpected { expected: "screen", got }),
    }
}

fn send(conn: &mut WsConnection<TcpStream>, message: &ClientMessage) -> Result<(), ProbeError> {
    conn.write_frame(&encode_client_message(message), Opcode::Binary, true)?;
    Ok(())
}

fn read_reply(conn: &mut WsConnection<TcpStream>) -> Result<ServerMessage, ProbeError> {
    loop {
        if let Some(message) = conn.read_message(MAX_FRAME_SIZE as usize)? {
            return Ok(decode_server_message(&message)?);
        }
    }
}
