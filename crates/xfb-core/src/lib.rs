//! # xfb-core
//!
//! Shared library for the xfb services: a from-scratch WebSocket transport and
//! the framebuffer wire protocol spoken over it.
//!
//! It depends on no display server and no async runtime. Everything here works
//! on blocking `Read + Write` streams, which is what the single-threaded,
//! readiness-driven service loops need.
//!
//! # Architecture overview (for beginners)
//!
//! A browser extension on the same machine connects to `ws://localhost:<port>/`
//! and drives a remote view of an X11 display. The pieces, from the wire up:
//!
//! - **`websocket`** – RFC 6455 on raw sockets. `frame` turns headers into bytes
//!   and back, `conn` reads and writes whole frames and messages, `handshake`
//!   validates the HTTP upgrade request, and `server` accepts exactly one
//!   client at a time and performs the version exchange.
//!
//! - **`protocol`** – The small binary application protocol: screen, cursor,
//!   resolution, key, mouse, quit, and init messages, each identified by a
//!   one-byte ASCII tag.
//!
//! - **`domain`** – State with no I/O at all: which keys/buttons are held
//!   down, and when the next screen request should be sent.
//!
//! - **`signals`** – Graceful shutdown for the `ppoll` loops of both services.

pub mod domain;
pub mod protocol;
pub mod signals;
pub mod websocket;

pub use domain::{InputKind, PressedSet, RefreshScheduler, RequestToken};
pub use protocol::{
    decode_client_message, encode_server_message, ClientMessage, ProtocolError, ServerMessage,
};
pub use websocket::{CloseCode, FrameError, HandshakeError, Opcode, Role, WsConnection, WsServer};
