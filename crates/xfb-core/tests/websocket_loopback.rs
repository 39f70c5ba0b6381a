//! Integration tests for the WebSocket transport over real loopback sockets.
//!
//! These tests run [`WsServer`] and a client-role connection on both ends of a
//! TCP connection, exercising handshake, version exchange, framing, masking,
//! and client replacement together.

use std::io::{Read, Write};
use std::net::{Ipv4Addr, TcpStream};
use std::thread;

use xfb_core::websocket::handshake::{self, RESPONSE_BAD_VERSION, RESPONSE_NOT_FOUND};
use xfb_core::websocket::{connect_client, FrameError, HeaderRead, Opcode, WsServer};

/// Starts a server on a free port and establishes one client.
fn connected_pair() -> (WsServer, xfb_core::WsConnection<TcpStream>) {
    let mut server = WsServer::bind(0, "VF3").expect("bind");
    let port = server.port();
    let client = thread::spawn(move || connect_client(port).expect("client connect"));
    server.accept().expect("accept");
    let (conn, version) = client.join().expect("client thread");
    assert_eq!(version, "VF3");
    (server, conn)
}

#[test]
fn test_client_to_server_payload_lengths_round_trip() {
    let (mut server, mut client) = connected_pair();

    for len in [0usize, 1, 125, 126, 65535, 65536, 16 * 1024 * 1024] {
        // Arrange
        let payload: Vec<u8> = (0..len).map(|i| (i % 251) as u8).collect();
        let sent = payload.clone();
        let writer = thread::spawn(move || {
            client.write_frame(&sent, Opcode::Binary, true).expect("client write");
            client
        });

        // Act
        let conn = server.client().expect("client present");
        let header = conn.read_frame_header().expect("header");
        let HeaderRead::Data {
            fin,
            opcode,
            mask_key,
            payload_len,
        } = header
        else {
            panic!("expected a data frame, got {header:?}");
        };
        let data = conn.read_frame_data(payload_len, mask_key).expect("data");
        client = writer.join().expect("writer thread");

        // Assert
        assert!(fin, "len {len}");
        assert_eq!(opcode, Opcode::Binary, "len {len}");
        assert_ne!(mask_key, [0; 4], "client frames are masked");
        assert_eq!(data, payload, "len {len}");
    }
}

#[test]
fn test_server_to_client_message_round_trip() {
    // Arrange
    let (mut server, mut client) = connected_pair();
    let payload = vec![7u8; 70_000];

    // Act
    server
        .client()
        .expect("client")
        .write_frame(&payload, Opcode::Binary, true)
        .expect("server write");
    let received = client.read_message(1 << 20).expect("client read");

    // Assert
    assert_eq!(received, Some(payload));
}

#[test]
fn test_unmasked_client_frame_closes_connection() {
    // Arrange: complete a raw handshake and version exchange by hand so an
    // unmasked frame can be sent.
    let mut server = WsServer::bind(0, "V1").expect("bind");
    let port = server.port();
    let raw = thread::spawn(move || {
        let mut stream = TcpStream::connect((Ipv4Addr::LOCALHOST, port)).expect("connect");
        let key = handshake::client_key(1);
        handshake::connect(&mut stream, port, &key).expect("handshake");
        let mut version = [0u8; 4];
        stream.read_exact(&mut version).expect("version frame");
        // Masked "VOK" with an all-zero key.
        stream.write_all(&[0x81, 0x83, 0, 0, 0, 0, b'V', b'O', b'K']).expect("ack");
        stream
    });
    server.accept().expect("accept");
    let mut stream = raw.join().expect("raw client");

    // Act: unmasked binary frame.
    stream.write_all(&[0x82, 0x01, b'x']).expect("write");
    let result = server.client().expect("client").read_message(4096);

    // Assert
    assert!(matches!(result, Err(FrameError::BadMasking { masked: false })));
    assert!(!server.has_client());
    let mut close = [0u8; 4];
    stream.read_exact(&mut close).expect("close frame");
    assert_eq!(close, [0x88, 0x02, 0x03, 0xEA]); // 1002
}

#[test]
fn test_rejected_handshake_gets_error_response_and_no_client() {
    // Arrange
    let mut server = WsServer::bind(0, "VF3").expect("bind");
    let port = server.port();
    let requester = thread::spawn(move || {
        let mut stream = TcpStream::connect((Ipv4Addr::LOCALHOST, port)).expect("connect");
        let request = handshake::client_request(port, "dGhlIHNhbXBsZSBub25jZQ==")
            .replace("Version: 13", "Version: 7");
        stream.write_all(request.as_bytes()).expect("request");
        let mut response = String::new();
        stream.read_to_string(&mut response).expect("response");
        response
    });

    // Act
    let result = server.accept();
    let response = requester.join().expect("requester");

    // Assert
    assert!(result.is_err());
    assert!(!server.has_client());
    assert_eq!(response, RESPONSE_BAD_VERSION);
}

#[test]
fn test_plain_get_is_404() {
    let mut server = WsServer::bind(0, "VF3").expect("bind");
    let port = server.port();
    let requester = thread::spawn(move || {
        let mut stream = TcpStream::connect((Ipv4Addr::LOCALHOST, port)).expect("connect");
        stream
            .write_all(format!("GET / HTTP/1.1\r\nHost: localhost:{port}\r\n\r\n").as_bytes())
            .expect("request");
        let mut response = String::new();
        stream.read_to_string(&mut response).expect("response");
        response
    });

    assert!(server.accept().is_err());
    assert_eq!(requester.join().expect("requester"), RESPONSE_NOT_FOUND);
}

#[test]
fn test_new_client_replaces_previous_one() {
    // Arrange
    let (mut server, mut first) = connected_pair();
    let port = server.port();

    // Act
    let second = thread::spawn(move || connect_client(port).expect("second connect"));
    server.accept().expect("accept second");
    let (mut second, _) = second.join().expect("second thread");

    // Assert: the first client sees a close frame, the second one is live.
    assert!(matches!(first.read_message(4096), Err(FrameError::ClosedByPeer)));
    second.write_frame(b"hi", Opcode::Binary, true).expect("second write");
    let got = server.client().expect("client").read_message(4096).expect("read");
    assert_eq!(got.as_deref(), Some(&b"hi"[..]));
}
