//! Single-threaded readiness loop of the framebuffer service.
//!
//! Watches the listening socket and, when there is one, the client socket.
//! A ready client is served first: exactly one message is read, handled, and
//! answered before the loop waits again. A ready listener runs the handshake
//! and version exchange for a new client, which replaces the current one.
//!
//! Every way a client can go away ends the session, so held input is
//! released and cached mappings are dropped each time.

use std::os::fd::AsFd;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use anyhow::{Context, Result};
use nix::errno::Errno;
use nix::poll::{ppoll, PollFd, PollFlags};
use nix::sys::signal::SigSet;
use nix::sys::time::TimeSpec;
use tracing::{debug, error, info, warn};
use xfb_core::protocol::ServerMessage;
use xfb_core::{encode_server_message, CloseCode, FrameError, Opcode, WsServer};

use crate::application::replay_input::InputInjector;
use crate::application::serve_framebuffer::{
    DisplayError, FramebufferService, FrameSource, ResolutionChanger, SessionError,
};
use crate::application::shm_cache::MappingResolver;

/// Largest client message accepted.
pub const BUFFER_SIZE: usize = 4096;

/// Upper bound on one readiness wait, so the stop flag is noticed even when
/// no signal interrupts the wait.
const POLL_INTERVAL: Duration = Duration::from_millis(200);

/// Runs until `stop` is set.
///
/// `poll_mask` is the signal mask in effect while waiting; pass the mask from
/// [`xfb_core::signals::ShutdownSignals`] so shutdown signals are only
/// delivered between requests.
///
/// # Errors
///
/// Returns an error if waiting fails or the display connection is lost.
pub fn run_service<D, R, Z>(
    server: &mut WsServer,
    service: &mut FramebufferService<D, R, Z>,
    stop: &AtomicBool,
    poll_mask: Option<SigSet>,
) -> Result<()>
where
    D: FrameSource + InputInjector,
    R: MappingResolver,
    Z: ResolutionChanger,
{
    soft(service.end_session())?;
    info!("framebuffer service listening on port {}", server.port());

    while !stop.load(Ordering::Acquire) {
        let (listener_ready, client_ready) = wait_readable(server, poll_mask)?;
        if client_ready {
            serve_client(server, service)?;
        }
        if listener_ready {
            accept_client(server, service)?;
        }
    }

    info!("shutting down");
    if server.has_client() {
        drop_client(server, service, Some(CloseCode::Normal))?;
    }
    Ok(())
}

/// Waits for the listener or the client to become readable.
fn wait_readable(server: &WsServer, poll_mask: Option<SigSet>) -> Result<(bool, bool)> {
    let mut fds = vec![PollFd::new(server.listener().as_fd(), PollFlags::POLLIN)];
    if let Some(stream) = server.client_stream() {
        fds.push(PollFd::new(stream.as_fd(), PollFlags::POLLIN));
    }

    match ppoll(&mut fds, Some(TimeSpec::from(POLL_INTERVAL)), poll_mask) {
        Ok(_) => {}
        Err(Errno::EINTR) => return Ok((false, false)),
        Err(e) => return Err(e).context("ppoll failed"),
    }

    let ready = |fd: &PollFd| {
        fd.revents()
            .is_some_and(|r| r.intersects(PollFlags::POLLIN | PollFlags::POLLHUP | PollFlags::POLLERR))
    };
    Ok((ready(&fds[0]), fds.get(1).is_some_and(ready)))
}

/// Reads and handles one client message.
fn serve_client<D, R, Z>(server: &mut WsServer, service: &mut FramebufferService<D, R, Z>) -> Result<()>
where
    D: FrameSource + InputInjector,
    R: MappingResolver,
    Z: ResolutionChanger,
{
    let peer = server.peer().map(|p| p.to_string()).unwrap_or_default();
    let Some(conn) = server.client() else {
        return Ok(());
    };

    let message = match conn.read_message(BUFFER_SIZE) {
        Ok(Some(message)) => message,
        // Only a control frame was consumed.
        Ok(None) => return Ok(()),
        Err(FrameError::ClosedByPeer) => {
            info!("client {peer}: closed the connection");
            return drop_client(server, service, None);
        }
        Err(e) => {
            warn!("client {peer}: read failed: {e}");
            return drop_client(server, service, None);
        }
    };

    match service.handle_message(&message) {
        Ok(Some(reply)) => {
            if let Err(e) = send(conn, &reply) {
                warn!("client {peer}: write failed: {e}");
                return drop_client(server, service, None);
            }
            Ok(())
        }
        Ok(None) => Ok(()),
        Err(SessionError::Protocol(e)) => {
            warn!("client {peer}: {e}");
            drop_client(server, service, Some(CloseCode::ProtocolError))
        }
        Err(SessionError::Display(e)) if e.is_connection_lost() => {
            Err(e).context("X display connection lost")
        }
        Err(SessionError::Display(e)) => {
            error!("client {peer}: display failure: {e}");
            drop_client(server, service, Some(CloseCode::Normal))
        }
    }
}

/// Establishes a new client and starts its session.
fn accept_client<D, R, Z>(server: &mut WsServer, service: &mut FramebufferService<D, R, Z>) -> Result<()>
where
    D: FrameSource + InputInjector,
    R: MappingResolver,
    Z: ResolutionChanger,
{
    let had_client = server.has_client();
    let accepted = server.accept();
    if had_client && (accepted.is_ok() || !server.has_client()) {
        // The previous client was replaced.
        soft(service.end_session())?;
    }
    if let Err(e) = accepted {
        debug!("connection attempt rejected: {e}");
        return Ok(());
    }

    let init = match service.start_session() {
        Ok(init) => init,
        Err(e) if e.is_connection_lost() => return Err(e).context("X display connection lost"),
        Err(e) => {
            error!("cannot start session: {e}");
            return drop_client(server, service, Some(CloseCode::Normal));
        }
    };
    if let Some(conn) = server.client() {
        if let Err(e) = send(conn, &init) {
            warn!("cannot send init message: {e}");
            return drop_client(server, service, None);
        }
    }
    Ok(())
}

fn send<S>(conn: &mut xfb_core::WsConnection<S>, message: &ServerMessage) -> Result<usize, FrameError>
where
    S: std::io::Read + std::io::Write,
{
    conn.write_frame(&encode_server_message(message), Opcode::Binary, true)
}

/// Closes the client (if still open) and ends the session.
fn drop_client<D, R, Z>(
    server: &mut WsServer,
    service: &mut FramebufferService<D, R, Z>,
    code: Option<CloseCode>,
) -> Result<()>
where
    D: FrameSource + InputInjector,
    R: MappingResolver,
    Z: ResolutionChanger,
{
    server.close_client(code);
    soft(service.end_session())
}

/// Logs display failures, except a lost connection, which ends the service.
fn soft(result: Result<(), DisplayError>) -> Result<()> {
    match result {
        Err(e) if e.is_connection_lost() => Err(e).context("X display connection lost"),
        Err(e) => {
            warn!("{e}");
            Ok(())
        }
        Ok(()) => Ok(()),
    }
}
