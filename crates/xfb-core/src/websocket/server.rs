//! Single-client WebSocket endpoint on the loopback interface.
//!
//! [`WsServer`] owns the listening socket and at most one established client.
//! A client is established only after both steps succeed:
//!
//! 1. the HTTP upgrade handshake ([`crate::websocket::handshake::accept`]);
//! 2. the version exchange: we send our version string as a text frame and the
//!    client must answer with exactly `VOK`.
//!
//! A successful handshake closes any previous client before the version
//! exchange starts, so there is never more than one live connection.

use std::io;
use std::net::{Ipv4Addr, SocketAddr, TcpListener, TcpStream};

use tracing::{debug, info, warn};

use crate::websocket::conn::{Role, WsConnection};
use crate::websocket::frame::{CloseCode, Opcode};
use crate::websocket::handshake::{self, HandshakeError};

/// The acknowledgment a client must send after receiving our version.
pub const VERSION_ACK: &[u8] = b"VOK";

/// Largest version acknowledgment we read.
pub const MAX_VERSION_REPLY: usize = 256;

pub struct WsServer {
    listener: TcpListener,
    port: u16,
    version: String,
    client: Option<WsConnection<TcpStream>>,
    peer: Option<SocketAddr>,
}

impl WsServer {
    /// Binds `127.0.0.1:<port>`. Port 0 picks a free port (handy in tests);
    /// the `Host` check then uses the port actually bound.
    pub fn bind(port: u16, version: impl Into<String>) -> io::Result<Self> {
        let listener = TcpListener::bind((Ipv4Addr::LOCALHOST, port))?;
        let port = listener.local_addr()?.port();
        info!("listening on 127.0.0.1:{port}");
        Ok(Self {
            listener,
            port,
            version: version.into(),
            client: None,
            peer: None,
        })
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn listener(&self) -> &TcpListener {
        &self.listener
    }

    /// The established client, if any.
    pub fn client(&mut self) -> Option<&mut WsConnection<TcpStream>> {
        self.client.as_mut().filter(|c| c.is_open())
    }

    /// The established client's socket, for readiness polling.
    pub fn client_stream(&self) -> Option<&TcpStream> {
        self.client.as_ref().and_then(|c| c.get_ref())
    }

    pub fn has_client(&self) -> bool {
        self.client_stream().is_some()
    }

    pub fn peer(&self) -> Option<SocketAddr> {
        self.peer
    }

    /// Accepts one pending TCP connection and tries to establish it.
    ///
    /// On failure the new socket is dropped and the error returned. The
    /// previous client survives a failed HTTP handshake but not a failed
    /// version exchange (it was already replaced at that point).
    pub fn accept(&mut self) -> Result<(), HandshakeError> {
        let (mut stream, peer) = self.listener.accept()?;
        debug!("client {peer}: TCP connection accepted");

        if let Err(e) = handshake::accept(&mut stream, self.port) {
            warn!("client {peer}: handshake failed: {e}");
            return Err(e);
        }
        info!("client {peer}: handshake complete");

        if self.client.is_some() {
            info!("replacing previous client");
            self.close_client(Some(CloseCode::Normal));
        }

        let mut conn = WsConnection::new(stream, Role::Server);
        exchange_version(&mut conn, &self.version).map_err(|e| {
            warn!("client {peer}: version exchange failed: {e}");
            e
        })?;

        info!("client {peer}: connected");
        self.client = Some(conn);
        self.peer = Some(peer);
        Ok(())
    }

    /// Closes the current client, sending a close frame when `code` is set.
    pub fn close_client(&mut self, code: Option<CloseCode>) {
        if let Some(mut conn) = self.client.take() {
            conn.close(code);
            if let Some(peer) = self.peer.take() {
                info!("client {peer}: disconnected");
            }
        }
    }
}

/// Sends `version` and waits for the `VOK` acknowledgment.
///
/// Any other reply closes the connection with a protocol-error close frame.
pub fn exchange_version<S>(conn: &mut WsConnection<S>, version: &str) -> Result<(), HandshakeError>
where
    S: io::Read + io::Write,
{
    debug!("sending version packet ({version})");
    conn.write_frame(version.as_bytes(), Opcode::Text, true)?;

    let reply = loop {
        if let Some(message) = conn.read_message(MAX_VERSION_REPLY)? {
            break message;
        }
    };
    if reply != VERSION_ACK {
        let printable: String = reply
            .iter()
            .map(|&b| if b.is_ascii_graphic() { b as char } else { '?' })
            .collect();
        conn.close(Some(CloseCode::ProtocolError));
        return Err(HandshakeError::VersionMismatch(printable));
    }
    debug!("received VOK");
    Ok(())
}

/// Client side of [`exchange_version`]: reads the server version and
/// acknowledges it. Returns the version string.
pub fn acknowledge_version<S>(conn: &mut WsConnection<S>) -> Result<String, HandshakeError>
where
    S: io::Read + io::Write,
{
    let version = loop {
        if let Some(message) = conn.read_message(MAX_VERSION_REPLY)? {
            break message;
        }
    };
    conn.write_frame(VERSION_ACK, Opcode::Text, true)?;
    Ok(String::from_utf8_lossy(&version).into_owned())
}

/// Connects to a local server as a client: TCP connect, upgrade handshake,
/// then version acknowledgment.
pub fn connect_client(port: u16) -> Result<(WsConnection<TcpStream>, String), HandshakeError> {
    let mut stream = TcpStream::connect((Ipv4Addr::LOCALHOST, port))?;
    let seed = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_nanos())
        .unwrap_or_default();
    handshake::connect(&mut stream, port, &handshake::client_key(seed))?;
    let mut conn = WsConnection::new(stream, Role::Client);
    let version = acknowledge_version(&mut conn)?;
    Ok((conn, version))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::websocket::conn::tests::{client_frame, Duplex};

    #[test]
    fn test_exchange_version_accepts_vok() {
        // Arrange
        let input = client_frame(Opcode::Text, true, b"VOK");
        let mut conn = WsConnection::new(Duplex::new(input), Role::Server);

        // Act
        let result = exchange_version(&mut conn, "VF3");

        // Assert
        assert!(result.is_ok());
        assert!(conn.is_open());
        assert_eq!(conn.get_ref().map(|d| d.output.clone()), Some(vec![0x81, 3, b'V', b'F', b'3']));
    }

    #[test]
    fn test_exchange_version_rejects_other_reply() {
        let input = client_frame(Opcode::Text, true, b"VNO\x01");
        let mut conn = WsConnection::new(Duplex::new(input), Role::Server);

        let result = exchange_version(&mut conn, "VF3");

        assert!(matches!(result, Err(HandshakeError::VersionMismatch(ref s)) if s == "VNO?"));
        assert!(!conn.is_open());
    }

    #[test]
    fn test_exchange_version_skips_leading_ping() {
        let mut input = client_frame(Opcode::Ping, true, b"");
        input.extend(client_frame(Opcode::Text, true, b"VOK"));
        let mut conn = WsConnection::new(Duplex::new(input), Role::Server);

        assert!(exchange_version(&mut conn, "V1").is_ok());
    }
}
