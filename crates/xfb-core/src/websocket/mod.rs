//! WebSocket transport: frame codec, blocking framer, opening handshake, and the
//! single-client server endpoint.

pub mod conn;
pub mod frame;
pub mod handshake;
pub mod server;

pub use conn::{HeaderRead, Role, WsConnection};
pub use frame::{CloseCode, FrameError, Opcode, MAX_FRAME_SIZE};
pub use handshake::{accept_key, HandshakeError};
pub use server::{connect_client, WsServer};
