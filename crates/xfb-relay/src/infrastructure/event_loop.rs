//! Readiness loop of the relay.
//!
//! Three sources are watched: the WebSocket listener, the input pipe, and
//! the client when there is one. A request from the pipe is handled to
//! completion, including waiting for the client's reply, before the loop
//! waits again. The client never speaks unprompted; data from it outside a
//! request closes it.

use std::os::fd::AsFd;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use anyhow::{Context, Result};
use nix::errno::Errno;
use nix::poll::{ppoll, PollFd, PollFlags};
use nix::sys::signal::SigSet;
use nix::sys::time::TimeSpec;
use tracing::{debug, error, info, warn};
use xfb_core::{CloseCode, FrameError, WsServer};

use crate::application::relay::{forward_request, relay_reply, RelayError, NOT_CONNECTED, SOCKET_WRITE_ERROR};
use crate::domain::RelayConfig;
use crate::infrastructure::pipes::{open_pipe_out, report_error, PipeIn};

/// Largest unsolicited client message read before closing the client.
const BUFFER_SIZE: usize = 4096;

/// Upper bound on one readiness wait, so the stop flag is noticed without a
/// signal.
const POLL_INTERVAL: Duration = Duration::from_millis(200);

#[derive(Debug, Default, Clone, Copy)]
struct Ready {
    listener: bool,
    pipe: bool,
    pipe_hangup: bool,
    client: bool,
}

/// Runs until `stop` is set, then closes the client with a close frame.
///
/// # Errors
///
/// Waiting fails, or the input pipe can no longer be read or reopened.
pub fn run_relay(
    server: &mut WsServer,
    pipe_in: &mut PipeIn,
    config: &RelayConfig,
    stop: &AtomicBool,
    poll_mask: Option<SigSet>,
) -> Result<()> {
    info!("relaying {} on port {}", config.pipe_dir.display(), server.port());

    while !stop.load(Ordering::Acquire) {
        let ready = wait_readable(server, pipe_in, poll_mask)?;
        if ready.listener {
            if let Err(e) = server.accept() {
                debug!("connection attempt rejected: {e}");
            }
        }
        if ready.pipe {
            handle_request(server, pipe_in, config)?;
        } else if ready.pipe_hangup {
            // A writer opened and closed the pipe without sending anything.
            pipe_in.reopen()?;
        }
        if ready.client {
            handle_unsolicited(server);
        }
    }

    info!("shutting down");
    server.close_client(Some(CloseCode::Normal));
    Ok(())
}

fn wait_readable(server: &WsServer, pipe_in: &PipeIn, poll_mask: Option<SigSet>) -> Result<Ready> {
    let mut fds = vec![
        PollFd::new(server.listener().as_fd(), PollFlags::POLLIN),
        PollFd::new(pipe_in.as_fd(), PollFlags::POLLIN),
    ];
    if let Some(stream) = server.client_stream() {
        fds.push(PollFd::new(stream.as_fd(), PollFlags::POLLIN));
    }

    match ppoll(&mut fds, Some(TimeSpec::from(POLL_INTERVAL)), poll_mask) {
        Ok(_) => {}
        Err(Errno::EINTR) => return Ok(Ready::default()),
        Err(e) => return Err(e).context("ppoll failed"),
    }

    let events = |i: usize| fds.get(i).and_then(|fd| fd.revents()).unwrap_or(PollFlags::empty());
    let hangup = PollFlags::POLLHUP | PollFlags::POLLERR;
    Ok(Ready {
        listener: events(0).contains(PollFlags::POLLIN),
        pipe: events(1).contains(PollFlags::POLLIN),
        pipe_hangup: events(1).intersects(hangup),
        client: events(2).intersects(PollFlags::POLLIN | hangup),
    })
}

/// Forwards one pipe request and relays the reply.
fn handle_request(server: &mut WsServer, pipe_in: &mut PipeIn, config: &RelayConfig) -> Result<()> {
    let pipe_out = config.pipe_out();
    let report = |message: &str| report_error(&pipe_out, message, config.pipe_out_timeout, config.pipe_out_retry);

    let Some(conn) = server.client() else {
        info!("request with no client connected");
        pipe_in.reopen()?;
        report(NOT_CONNECTED);
        return Ok(());
    };

    match forward_request(conn, pipe_in.reader()) {
        Ok(_) => {}
        Err(RelayError::Input(e)) => return Err(e).context("reading the input pipe"),
        Err(e) => {
            warn!("{e}");
            server.close_client(None);
            pipe_in.reopen()?;
            report(SOCKET_WRITE_ERROR);
            return Ok(());
        }
    }
    pipe_in.reopen()?;

    let out = match open_pipe_out(&pipe_out, config.pipe_out_timeout, config.pipe_out_retry) {
        Ok(out) => out,
        Err(e) => return Err(e).with_context(|| format!("opening {}", pipe_out.display())),
    };
    let Some(conn) = server.client() else {
        return Ok(());
    };
    if let Err(e) = relay_reply(conn, out) {
        warn!("{e}");
        server.close_client(None);
    }
    Ok(())
}

/// Client data outside a request is a protocol violation.
fn handle_unsolicited(server: &mut WsServer) {
    let Some(conn) = server.client() else {
        return;
    };
    match conn.read_message(BUFFER_SIZE) {
        // Only a control frame was consumed.
        Ok(None) => {}
        Ok(Some(message)) => {
            error!("unexpected {}-byte message from client", message.len());
            server.close_client(None);
        }
        Err(FrameError::ClosedByPeer) => {
            info!("client closed the connection");
            server.close_client(None);
        }
        Err(e) => {
            warn!("client read failed: {e}");
            server.close_client(None);
        }
    }
}
