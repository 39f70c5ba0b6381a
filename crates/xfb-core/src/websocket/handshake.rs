//! Minimal HTTP/1.1 opening handshake (RFC 6455 section 4).
//!
//! Only the single request shape our clients send is accepted:
//! ```text
//! GET / HTTP/1.1
//! Host: localhost:<port>
//! Upgrade: websocket
//! Connection: Upgrade
//! Sec-WebSocket-Key: <24 base64 chars>
//! Sec-WebSocket-Version: 13
//! ```
//! Each satisfied requirement sets one bit in [`Conditions`]; anything short of
//! [`Conditions::ALL`] is answered with one of three canned error responses.

use std::fmt;
use std::io::{self, Read, Write};

use base64::prelude::*;
use sha1::{Digest, Sha1};
use thiserror::Error;
use tracing::{debug, warn};

use crate::websocket::frame::FrameError;

/// RFC 6455 magic GUID appended to the client key before hashing.
pub const WEBSOCKET_GUID: &str = "258EAFA5-E914-47DA-95CA-C5AB0DC85B11";

/// Length of a valid `Sec-WebSocket-Key` (base64 of 16 bytes).
pub const SEC_KEY_LEN: usize = 24;

/// Longest request line or header line we accept.
pub const MAX_LINE_LEN: usize = 4096;

pub const RESPONSE_NOT_FOUND: &str = "HTTP/1.1 404 Not Found\r\n\r\n<h1>404 Not Found</h1>";
pub const RESPONSE_BAD_VERSION: &str =
    "HTTP/1.1 400 Bad Request\r\nSec-WebSocket-Version: 13\r\n\r\n";
pub const RESPONSE_BAD_REQUEST: &str = "HTTP/1.1 400 Bad Request\r\n\r\n<h1>400 Bad Request</h1>";

// ── Conditions ────────────────────────────────────────────────────────────────

/// Bitmask of handshake requirements seen so far.
#[derive(Clone, Copy, PartialEq, Eq, Default)]
pub struct Conditions(u8);

impl Conditions {
    /// `GET <path> HTTP/1.1` request line.
    pub const GET: Self = Self(0x01);
    /// Path is exactly `/`.
    pub const GET_PATH: Self = Self(0x02);
    /// `Upgrade: websocket`
    pub const UPGRADE: Self = Self(0x04);
    /// `Connection: Upgrade`
    pub const CONNECTION: Self = Self(0x08);
    /// A `Sec-WebSocket-Version` header is present.
    pub const SEC_VERSION: Self = Self(0x10);
    /// ...and its value is `13`.
    pub const VERSION: Self = Self(0x20);
    /// `Sec-WebSocket-Key` of exactly 24 bytes.
    pub const SEC_KEY: Self = Self(0x40);
    /// `Host: localhost:<port>`
    pub const HOST: Self = Self(0x80);

    pub const NONE: Self = Self(0x00);
    pub const ALL: Self = Self(0xFF);

    /// Everything that makes a request a WebSocket upgrade attempt.
    pub const WEBSOCKET: Self = Self(0x04 | 0x08 | 0x10 | 0x20 | 0x40);
    /// A WebSocket attempt that only got the version wrong.
    pub const OTHER_VERSION: Self = Self(0x01 | 0x04 | 0x08 | 0x10);

    pub fn bits(self) -> u8 {
        self.0
    }

    pub fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }

    pub fn intersects(self, other: Self) -> bool {
        self.0 & other.0 != 0
    }

    pub fn insert(&mut self, other: Self) {
        self.0 |= other.0;
    }

    pub fn is_complete(self) -> bool {
        self == Self::ALL
    }

    /// Requirements still missing.
    pub fn missing(self) -> Self {
        Self(!self.0)
    }
}

impl fmt::Debug for Conditions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Conditions(0x{:02X})", self.0)
    }
}

/// Picks the canned error response for an incomplete request.
pub fn error_response(ok: Conditions) -> &'static str {
    // A GET for some other path, or for `/` without a single WebSocket header.
    let not_websocket = !ok.contains(Conditions::GET_PATH) || !ok.intersects(Conditions::WEBSOCKET);
    if ok.contains(Conditions::GET) && not_websocket {
        RESPONSE_NOT_FOUND
    } else if ok.contains(Conditions::OTHER_VERSION) && !ok.contains(Conditions::VERSION) {
        RESPONSE_BAD_VERSION
    } else {
        RESPONSE_BAD_REQUEST
    }
}

// ── Errors ────────────────────────────────────────────────────────────────────

#[derive(Debug, Error)]
pub enum HandshakeError {
    #[error("handshake I/O error: {0}")]
    Io(#[from] io::Error),

    /// Request did not satisfy every requirement; an error response was sent.
    #[error("handshake rejected, missing {:?}", .0.missing())]
    Rejected(Conditions),

    #[error("header line longer than {MAX_LINE_LEN} bytes")]
    LineTooLong,

    /// Client answered the version frame with something other than `VOK`.
    #[error("invalid version acknowledgment: {0:?}")]
    VersionMismatch(String),

    #[error("version exchange failed: {0}")]
    Frame(#[from] FrameError),

    #[error("unexpected handshake response: {0:?}")]
    UnexpectedResponse(String),

    #[error("server accept digest mismatch")]
    BadAccept,
}

// ── Digest ────────────────────────────────────────────────────────────────────

/// `base64(sha1(key + GUID))`, the value of `Sec-WebSocket-Accept`.
pub fn accept_key(client_key: &str) -> String {
    let mut sha1 = Sha1::new();
    sha1.update(client_key.as_bytes());
    sha1.update(WEBSOCKET_GUID.as_bytes());
    BASE64_STANDARD.encode(sha1.finalize())
}

pub fn switching_protocols_response(accept: &str) -> String {
    format!(
        "HTTP/1.1 101 Switching Protocols\r\n\
         Upgrade: websocket\r\n\
         Connection: Upgrade\r\n\
         Sec-WebSocket-Accept: {accept}\r\n\r\n"
    )
}

// ── Request parsing ───────────────────────────────────────────────────────────

/// Accumulates [`Conditions`] over the lines of one request.
#[derive(Debug, Default)]
pub struct RequestParser {
    host: String,
    conditions: Conditions,
    key: Option<String>,
    seen_request_line: bool,
}

/// Outcome of feeding one line to [`RequestParser::feed_line`].
#[derive(Debug, PartialEq, Eq)]
pub enum LineOutcome {
    More,
    /// Empty line: the header is complete.
    End,
    /// A header line without `:`. The request is rejected outright.
    Malformed,
}

impl RequestParser {
    pub fn new(port: u16) -> Self {
        Self {
            host: format!("localhost:{port}"),
            ..Self::default()
        }
    }

    pub fn conditions(&self) -> Conditions {
        self.conditions
    }

    /// The client key, once a valid `Sec-WebSocket-Key` was seen.
    pub fn key(&self) -> Option<&str> {
        self.key.as_deref()
    }

    /// Processes one line, already stripped of its CRLF or LF terminator.
    pub fn feed_line(&mut self, line: &str) -> LineOutcome {
        if !self.seen_request_line {
            self.seen_request_line = true;
            if line.is_empty() {
                return LineOutcome::End;
            }
            self.request_line(line);
            return LineOutcome::More;
        }
        if line.is_empty() {
            return LineOutcome::End;
        }

        // "Key: Value". The value starts two bytes after the first colon.
        let Some(colon) = line.find(':') else {
            warn!("invalid HTTP header: {line:?}");
            return LineOutcome::Malformed;
        };
        let key = &line[..colon];
        let value = line.get(colon + 2..).unwrap_or("");
        self.header(key, value);
        LineOutcome::More
    }

    fn request_line(&mut self, line: &str) {
        let mut tokens = line.split(' ').filter(|t| !t.is_empty());

        let method = tokens.next();
        if method != Some("GET") {
            warn!("invalid HTTP method: {method:?}");
            return;
        }
        let path = tokens.next();
        if path == Some("/") {
            self.conditions.insert(Conditions::GET_PATH);
        } else {
            warn!("invalid path: {path:?}");
        }
        let version = tokens.next();
        if version != Some("HTTP/1.1") {
            warn!("invalid HTTP version: {version:?}");
            return;
        }
        self.conditions.insert(Conditions::GET);
    }

    fn header(&mut self, key: &str, value: &str) {
        match key {
            "Upgrade" if value == "websocket" => self.conditions.insert(Conditions::UPGRADE),
            "Connection" if value == "Upgrade" => self.conditions.insert(Conditions::CONNECTION),
            "Sec-WebSocket-Version" => {
                self.conditions.insert(Conditions::SEC_VERSION);
                if value == "13" {
                    self.conditions.insert(Conditions::VERSION);
                } else {
                    warn!("invalid Sec-WebSocket-Version: {value:?}");
                }
            }
            "Sec-WebSocket-Key" => {
                if value.len() == SEC_KEY_LEN {
                    self.key = Some(value.to_owned());
                    self.conditions.insert(Conditions::SEC_KEY);
                } else {
                    warn!("invalid Sec-WebSocket-Key: {value:?}");
                }
            }
            "Host" => {
                if value == self.host {
                    self.conditions.insert(Conditions::HOST);
                } else {
                    warn!("invalid Host field: {value:?}");
                }
            }
            _ => {}
        }
    }
}

/// Reads one line terminated by LF, dropping a preceding CR.
///
/// Reads a byte at a time so nothing past the header is consumed from the
/// stream.
pub fn read_line<R: Read>(reader: &mut R) -> Result<String, HandshakeError> {
    let mut line = Vec::new();
    let mut byte = [0u8; 1];
    loop {
        reader.read_exact(&mut byte)?;
        if byte[0] == b'\n' {
            break;
        }
        if line.len() >= MAX_LINE_LEN {
            return Err(HandshakeError::LineTooLong);
        }
        line.push(byte[0]);
    }
    if line.last() == Some(&b'\r') {
        line.pop();
    }
    Ok(String::from_utf8_lossy(&line).into_owned())
}

// ── Server side ───────────────────────────────────────────────────────────────

/// Runs the server side of the handshake on a freshly accepted stream.
///
/// On success the 101 response has been written. On rejection the matching
/// error response has been written and the caller should drop the stream.
pub fn accept<S: Read + Write>(stream: &mut S, port: u16) -> Result<(), HandshakeError> {
    let mut parser = RequestParser::new(port);
    loop {
        let line = read_line(stream)?;
        match parser.feed_line(&line) {
            LineOutcome::More => continue,
            LineOutcome::End => break,
            LineOutcome::Malformed => return reject(stream, Conditions::NONE),
        }
    }

    let ok = parser.conditions();
    let key = match parser.key() {
        Some(key) if ok.is_complete() => key,
        _ => return reject(stream, ok),
    };
    debug!("handshake header accepted");

    let response = switching_protocols_response(&accept_key(key));
    stream.write_all(response.as_bytes())?;
    stream.flush()?;
    Ok(())
}

fn reject<S: Write>(stream: &mut S, ok: Conditions) -> Result<(), HandshakeError> {
    warn!("some WebSocket headers missing ({:?})", ok.missing());
    stream.write_all(error_response(ok).as_bytes())?;
    stream.flush()?;
    Err(HandshakeError::Rejected(ok))
}

// ── Client side ───────────────────────────────────────────────────────────────

/// Builds the upgrade request a client sends to `localhost:<port>`.
pub fn client_request(port: u16, key: &str) -> String {
    format!(
        "GET / HTTP/1.1\r\n\
         Host: localhost:{port}\r\n\
         Upgrade: websocket\r\n\
         Connection: Upgrade\r\n\
         Sec-WebSocket-Key: {key}\r\n\
         Sec-WebSocket-Version: 13\r\n\r\n"
    )
}

/// Runs the client side of the handshake and checks the accept digest.
pub fn connect<S: Read + Write>(stream: &mut S, port: u16, key: &str) -> Result<(), HandshakeError> {
    stream.write_all(client_request(port, key).as_bytes())?;
    stream.flush()?;

    let status = read_line(stream)?;
    if !status.starts_with("HTTP/1.1 101") {
        return Err(HandshakeError::UnexpectedResponse(status));
    }

    let expected = accept_key(key);
    let mut accepted = false;
    loop {
        let line = read_line(stream)?;
        if line.is_empty() {
            break;
        }
        if let Some(value) = line.strip_prefix("Sec-WebSocket-Accept: ") {
            accepted = value == expected;
        }
    }
    if accepted {
        Ok(())
    } else {
        Err(HandshakeError::BadAccept)
    }
}

/// Fresh `Sec-WebSocket-Key` derived from `seed`.
pub fn client_key(seed: u128) -> String {
    BASE64_STANDARD.encode(seed.to_le_bytes())
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::websocket::conn::tests::Duplex;

    const PORT: u16 = 30010;
    const KEY: &str = "dGhlIHNhbXBsZSBub25jZQ==";

    fn request_without(skip: &str) -> String {
        [
            "GET / HTTP/1.1",
            "Host: localhost:30010",
            "Upgrade: websocket",
            "Connection: Upgrade",
            "Sec-WebSocket-Key: dGhlIHNhbXBsZSBub25jZQ==",
            "Sec-WebSocket-Version: 13",
        ]
        .iter()
        .filter(|line| !line.starts_with(skip) || skip.is_empty())
        .map(|line| format!("{line}\r\n"))
        .collect::<String>()
            + "\r\n"
    }

    fn run_accept(request: &str) -> (Result<(), HandshakeError>, String) {
        let mut stream = Duplex::new(request.as_bytes().to_vec());
        let result = accept(&mut stream, PORT);
        (result, String::from_utf8_lossy(&stream.output).into_owned())
    }

    #[test]
    fn test_accept_key_matches_rfc_example() {
        assert_eq!(accept_key(KEY), "s3pPLMBiTxaQ9kYGzzhZRbK+xOo=");
    }

    #[test]
    fn test_accept_complete_request_sends_101() {
        // Act
        let (result, response) = run_accept(&request_without(""));

        // Assert
        assert!(result.is_ok());
        assert_eq!(
            response,
            "HTTP/1.1 101 Switching Protocols\r\nUpgrade: websocket\r\n\
             Connection: Upgrade\r\nSec-WebSocket-Accept: s3pPLMBiTxaQ9kYGzzhZRbK+xOo=\r\n\r\n"
        );
    }

    #[test]
    fn test_accept_bare_lf_line_endings() {
        let request = request_without("").replace("\r\n", "\n");
        let (result, _) = run_accept(&request);
        assert!(result.is_ok());
    }

    #[test]
    fn test_missing_single_websocket_header_yields_400() {
        for header in ["Upgrade", "Connection", "Sec-WebSocket-Key", "Sec-WebSocket-Version"] {
            let (result, response) = run_accept(&request_without(header));
            assert!(matches!(result, Err(HandshakeError::Rejected(_))), "{header}");
            assert_eq!(response, RESPONSE_BAD_REQUEST, "{header}");
        }
    }

    #[test]
    fn test_plain_http_get_yields_404() {
        let (result, response) = run_accept("GET / HTTP/1.1\r\nHost: localhost:30010\r\n\r\n");
        assert!(matches!(result, Err(HandshakeError::Rejected(_))));
        assert_eq!(response, RESPONSE_NOT_FOUND);
    }

    #[test]
    fn test_missing_host_yields_generic_400() {
        let (result, response) = run_accept(&request_without("Host"));
        assert!(matches!(result, Err(HandshakeError::Rejected(ok)) if ok.bits() == 0x7F));
        assert_eq!(response, RESPONSE_BAD_REQUEST);
    }

    #[test]
    fn test_wrong_host_port_is_rejected() {
        let request = request_without("").replace("localhost:30010", "localhost:30011");
        let (result, response) = run_accept(&request);
        assert!(result.is_err());
        assert_eq!(response, RESPONSE_BAD_REQUEST);
    }

    #[test]
    fn test_wrong_version_yields_version_hint() {
        let request = request_without("").replace("Version: 13", "Version: 8");
        let (_, response) = run_accept(&request);
        assert_eq!(response, RESPONSE_BAD_VERSION);
    }

    #[test]
    fn test_wrong_path_yields_404() {
        let request = request_without("").replace("GET / ", "GET /index.html ");
        let (_, response) = run_accept(&request);
        assert_eq!(response, RESPONSE_NOT_FOUND);
    }

    #[test]
    fn test_header_without_colon_yields_generic_400() {
        let request = request_without("").replace("Upgrade: websocket", "Upgrade websocket");
        let (result, response) = run_accept(&request);
        assert!(matches!(result, Err(HandshakeError::Rejected(Conditions::NONE))));
        assert_eq!(response, RESPONSE_BAD_REQUEST);
    }

    #[test]
    fn test_short_key_is_rejected() {
        let request = request_without("").replace(KEY, "c2hvcnQ=");
        let (result, _) = run_accept(&request);
        assert!(matches!(result, Err(HandshakeError::Rejected(ok)) if !ok.contains(Conditions::SEC_KEY)));
    }

    #[test]
    fn test_non_get_request_yields_generic_400() {
        let request = request_without("").replace("GET /", "POST /");
        let (_, response) = run_accept(&request);
        assert_eq!(response, RESPONSE_BAD_REQUEST);
    }

    #[test]
    fn test_error_response_selection_table() {
        assert_eq!(error_response(Conditions::NONE), RESPONSE_BAD_REQUEST);
        assert_eq!(error_response(Conditions::GET), RESPONSE_NOT_FOUND);
        assert_eq!(error_response(Conditions::OTHER_VERSION), RESPONSE_NOT_FOUND);
        let mut ok = Conditions::UPGRADE;
        ok.insert(Conditions::CONNECTION);
        ok.insert(Conditions::SEC_VERSION);
        assert_eq!(error_response(ok), RESPONSE_BAD_REQUEST);

        ok.insert(Conditions::GET);
        ok.insert(Conditions::GET_PATH);
        assert_eq!(error_response(ok), RESPONSE_BAD_VERSION);
    }

    #[test]
    fn test_line_too_long_is_rejected() {
        let mut stream = Duplex::new(vec![b'a'; MAX_LINE_LEN + 10]);
        assert!(matches!(read_line(&mut stream), Err(HandshakeError::LineTooLong)));
    }

    #[test]
    fn test_client_connect_verifies_accept_digest() {
        // Arrange: server response for the RFC key.
        let response = switching_protocols_response(&accept_key(KEY));
        let mut stream = Duplex::new(response.into_bytes());

        // Act
        let result = connect(&mut stream, PORT, KEY);

        // Assert
        assert!(result.is_ok());
        assert!(String::from_utf8_lossy(&stream.output).starts_with("GET / HTTP/1.1\r\n"));
    }

    #[test]
    fn test_client_connect_rejects_wrong_digest() {
        let response = switching_protocols_response("bogus");
        let mut stream = Duplex::new(response.into_bytes());
        assert!(matches!(connect(&mut stream, PORT, KEY), Err(HandshakeError::BadAccept)));
    }

    #[test]
    fn test_client_key_is_24_bytes() {
        assert_eq!(client_key(0xDEAD_BEEF).len(), SEC_KEY_LEN);
    }
}
