//! Integration tests for the relay over real FIFOs and loopback sockets.
//!
//! Each test runs [`run_relay`] on a background thread against pipes in a
//! scratch directory, then plays both the local tool (writing `in`, reading
//! `out`) and the browser extension (a client-role WebSocket connection).

use std::fs::{self, OpenOptions};
use std::io::Write;
use std::net::TcpStream;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use xfb_core::websocket::connect_client;
use xfb_core::{Opcode, WsConnection, WsServer};
use xfb_relay::application::relay::NOT_CONNECTED;
use xfb_relay::domain::RelayConfig;
use xfb_relay::infrastructure::event_loop::run_relay;
use xfb_relay::infrastructure::pipes::{prepare_pipes, PipeIn};

struct Harness {
    _dir: tempfile::TempDir,
    config: RelayConfig,
    port: u16,
    stop: Arc<AtomicBool>,
    handle: JoinHandle<anyhow::Result<()>>,
}

impl Harness {
    fn start() -> Self {
        let dir = tempfile::tempdir().expect("tempdir");
        let config = RelayConfig::default().with_pipe_dir(dir.path().join("ext"));
        prepare_pipes(&config.pipe_dir).expect("pipes");
        let mut pipe_in = PipeIn::open(config.pipe_in()).expect("open in");

        let mut server = WsServer::bind(0, config.version.as_str()).expect("bind");
        let port = server.port();
        let stop = Arc::new(AtomicBool::new(false));
        let stop_flag = Arc::clone(&stop);
        let loop_config = config.clone();
        let handle = thread::spawn(move || run_relay(&mut server, &mut pipe_in, &loop_config, &stop_flag, None));
        Self {
            _dir: dir,
            config,
            port,
            stop,
            handle,
        }
    }

    fn connect(&self) -> WsConnection<TcpStream> {
        let (conn, version) = connect_client(self.port).expect("connect");
        assert_eq!(version, "V1");
        conn
    }

    fn stop(self) {
        self.stop.store(true, Ordering::Release);
        self.handle.join().expect("relay thread").expect("relay result");
    }
}

/// Plays a local tool: writes `request` into `in`, then reads `out`.
fn tool_request(pipe_in: PathBuf, pipe_out: PathBuf, request: Vec<u8>) -> JoinHandle<String> {
    thread::spawn(move || {
        let mut writer = OpenOptions::new().write(true).open(&pipe_in).expect("open in");
        writer.write_all(&request).expect("write request");
        drop(writer);
        fs::read_to_string(&pipe_out).expect("read reply")
    })
}

fn read_text(conn: &mut WsConnection<TcpStream>) -> Vec<u8> {
    loop {
        if let Some(message) = conn.read_message(1 << 20).expect("client read") {
            return message;
        }
    }
}

#[test]
fn test_request_without_client_reports_not_connected() {
    // Arrange
    let harness = Harness::start();

    // Act
    let reply = tool_request(harness.config.pipe_in(), harness.config.pipe_out(), b"Uhttp://x".to_vec())
        .join()
        .expect("tool thread");

    // Assert
    assert_eq!(reply, NOT_CONNECTED);
    harness.stop();
}

#[test]
fn test_request_is_forwarded_and_reply_relayed() {
    // Arrange
    let harness = Harness::start();
    let mut client = harness.connect();

    // Act
    let tool = tool_request(harness.config.pipe_in(), harness.config.pipe_out(), b"Uhttp://example/".to_vec());
    let request = read_text(&mut client);
    client
        .write_frame(b"Ok", Opcode::Text, true)
        .expect("client reply");
    let reply = tool.join().expect("tool thread");

    // Assert
    assert_eq!(request, b"Uhttp://example/");
    assert_eq!(reply, "Ok");

    client.close(None);
    harness.stop();
}

#[test]
fn test_large_request_and_fragmented_reply() {
    // Arrange
    let harness = Harness::start();
    let mut client = harness.connect();
    let big: Vec<u8> = (0..20_000).map(|i| b'a' + (i % 26) as u8).collect();

    // Act
    let tool = tool_request(harness.config.pipe_in(), harness.config.pipe_out(), big.clone());
    let request = read_text(&mut client);
    client.write_frame(b"part one, ", Opcode::Text, false).expect("reply 1");
    client.write_frame(b"part two", Opcode::Continuation, true).expect("reply 2");
    let reply = tool.join().expect("tool thread");

    // Assert
    assert_eq!(request, big);
    assert_eq!(reply, "part one, part two");

    client.close(None);
    harness.stop();
}

#[test]
fn test_unsolicited_client_message_closes_client() {
    // Arrange
    let harness = Harness::start();
    let mut client = harness.connect();

    // Act
    client.write_frame(b"hello?", Opcode::Text, true).expect("client write");
    thread::sleep(Duration::from_millis(100));
    let reply = tool_request(harness.config.pipe_in(), harness.config.pipe_out(), b"X".to_vec())
        .join()
        .expect("tool thread");

    // Assert
    assert_eq!(reply, NOT_CONNECTED);
    harness.stop();
}
