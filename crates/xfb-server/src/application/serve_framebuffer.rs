//! ServeFramebuffer: per-client session state and message dispatch.
//!
//! One [`FramebufferService`] lives for the whole process. The event loop calls
//! [`FramebufferService::start_session`] when a client is established,
//! [`FramebufferService::handle_message`] for every message it reads, and
//! [`FramebufferService::end_session`] when the client goes away for any
//! reason. The service never touches a socket: it returns the reply to send.
//!
//! # Screen requests
//!
//! The client pulls frames one at a time. A frame is only captured when
//! something may have changed since the last one:
//!
//! - the requested size differs from the previous request (the capture buffer
//!   is reallocated),
//! - the client set the refresh flag,
//! - the display reported damage or a newly mapped window.
//!
//! Otherwise the reply says "not updated" and the client backs off. Cursor
//! changes are reported independently through `cursor_updated` and a serial.

use std::io;
use std::path::{Path, PathBuf};

use thiserror::Error;
use tracing::{debug, error, info, warn};
use xfb_core::protocol::{
    ClientMessage, CursorImage, Resolution, ScreenReply, ScreenRequest, ServerMessage,
};
use xfb_core::{decode_client_message, ProtocolError};

use crate::application::replay_input::{InputInjector, ReplayInput};
use crate::application::shm_cache::{MappingResolver, SharedMapping, ShmCache};

/// Errors reported by the display collaborator.
#[derive(Debug, Error)]
pub enum DisplayError {
    #[error("cannot open display {display}: {reason}")]
    Open { display: String, reason: String },

    #[error("display connection lost: {0}")]
    ConnectionLost(String),

    #[error("display request failed: {0}")]
    Request(String),

    #[error("captured {actual} bytes, expected {expected}")]
    BadCapture { expected: usize, actual: usize },
}

impl DisplayError {
    /// The display server is gone; nothing more can be served.
    pub fn is_connection_lost(&self) -> bool {
        matches!(self, DisplayError::ConnectionLost(_))
    }
}

/// Errors reported by the resize helper.
#[derive(Debug, Error)]
pub enum ResizeError {
    #[error("cannot run {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: io::Error,
    },

    #[error("{program} exited with {status}")]
    Failed { program: String, status: String },

    #[error("unparsable resolution {0:?}")]
    Unparsable(String),
}

/// Why a message could not be handled. Either way the client is dropped.
#[derive(Debug, Error)]
pub enum SessionError {
    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    #[error(transparent)]
    Display(#[from] DisplayError),
}

/// What changed on the display since the last poll.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DisplayChanges {
    /// Damage was reported or a new window was mapped.
    pub damaged: bool,
    /// Serial of the most recent cursor change, if the cursor changed.
    pub cursor_serial: Option<u32>,
}

/// The captured display.
pub trait FrameSource {
    /// Drains pending display events.
    fn poll_changes(&mut self) -> Result<DisplayChanges, DisplayError>;

    /// Captures the top-left `width`×`height` area as 32-bit pixels.
    fn capture(&mut self, width: u16, height: u16) -> Result<&[u8], DisplayError>;

    fn cursor_image(&mut self) -> Result<CursorImage, DisplayError>;

    /// Publishes whether a client is connected, for other local tools.
    fn set_connected(&mut self, connected: bool) -> Result<(), DisplayError>;
}

/// Changes the display resolution.
pub trait ResolutionChanger {
    /// Returns the resolution actually applied, which may differ.
    fn change_resolution(&mut self, width: u16, height: u16) -> Result<Resolution, ResizeError>;
}

/// The Serve Framebuffer use case.
pub struct FramebufferService<D, R: MappingResolver, Z> {
    display: D,
    resizer: Z,
    cache: ShmCache<R>,
    input: ReplayInput,
    freon_probe: PathBuf,
    last_size: Option<(u16, u16)>,
}

impl<D, R, Z> FramebufferService<D, R, Z>
where
    D: FrameSource + InputInjector,
    R: MappingResolver,
    Z: ResolutionChanger,
{
    /// `shm_attempts` bounds how often one screen request resolves a buffer;
    /// `freon_probe` is the path whose absence means the display runs without
    /// VTs.
    pub fn new(display: D, resolver: R, resizer: Z, shm_attempts: u32, freon_probe: impl Into<PathBuf>) -> Self {
        Self {
            display,
            resizer,
            cache: ShmCache::new(resolver, shm_attempts),
            input: ReplayInput::new(),
            freon_probe: freon_probe.into(),
            last_size: None,
        }
    }

    pub fn display(&self) -> &D {
        &self.display
    }

    pub fn input(&self) -> &ReplayInput {
        &self.input
    }

    pub fn cache(&self) -> &ShmCache<R> {
        &self.cache
    }

    /// Marks the display as connected and returns the init message.
    pub fn start_session(&mut self) -> Result<ServerMessage, DisplayError> {
        self.last_size = None;
        let freon = is_freon(&self.freon_probe);
        self.display.set_connected(true)?;
        info!("session started (freon: {freon})");
        Ok(ServerMessage::Init { freon })
    }

    /// Releases held input, drops cached mappings, and marks the display as
    /// disconnected. Safe to call more than once.
    pub fn end_session(&mut self) -> Result<(), DisplayError> {
        let released = self.input.release_all(&mut self.display);
        self.cache.clear();
        let cleared = self.display.set_connected(false);
        debug!("session ended");
        released.and(cleared)
    }

    /// Handles one client message and returns the reply, if the message has
    /// one.
    ///
    /// # Errors
    ///
    /// [`SessionError::Protocol`] for a malformed or unknown message, and
    /// [`SessionError::Display`] when the display fails. The caller closes the
    /// connection in both cases.
    pub fn handle_message(&mut self, buf: &[u8]) -> Result<Option<ServerMessage>, SessionError> {
        let message = decode_client_message(buf)?;
        let reply = match message {
            ClientMessage::Screen(request) => Some(ServerMessage::Screen(self.write_image(&request)?)),
            ClientMessage::Cursor => Some(ServerMessage::Cursor(self.display.cursor_image()?)),
            ClientMessage::Resolution(requested) => self.change_resolution(requested),
            ClientMessage::Key(event) => {
                self.input.handle_key(&mut self.display, event)?;
                None
            }
            ClientMessage::MouseMove(motion) => {
                self.input.handle_move(&mut self.display, motion)?;
                None
            }
            ClientMessage::MouseClick(click) => {
                self.input.handle_click(&mut self.display, click)?;
                None
            }
            ClientMessage::Quit => {
                self.input.release_all(&mut self.display)?;
                None
            }
        };
        Ok(reply)
    }

    fn write_image(&mut self, request: &ScreenRequest) -> Result<ScreenReply, DisplayError> {
        let mut reply = ScreenReply {
            width: request.width,
            height: request.height,
            ..Default::default()
        };

        let size = (request.width, request.height);
        let mut refresh = self.last_size != Some(size);
        self.last_size = Some(size);
        if request.refresh {
            debug!("force refresh from client");
            refresh = true;
        }

        let changes = self.display.poll_changes()?;
        refresh |= changes.damaged;
        if let Some(serial) = changes.cursor_serial {
            reply.cursor_updated = true;
            reply.cursor_serial = serial;
        }

        if !refresh {
            return Ok(reply);
        }
        reply.updated = true;

        if !request.shm {
            warn!("screen request without shm, pixels are only sent through shared memory");
            reply.shm_failed = true;
            return Ok(reply);
        }

        let expected = usize::from(request.width) * usize::from(request.height) * 4;
        let pixels = match self.display.capture(request.width, request.height) {
            Ok(pixels) if pixels.len() == expected => pixels,
            Ok(pixels) => {
                let actual = pixels.len();
                self.last_size = None;
                return Ok(capture_failed(reply, DisplayError::BadCapture { expected, actual }));
            }
            Err(e @ DisplayError::BadCapture { .. }) => {
                self.last_size = None;
                return Ok(capture_failed(reply, e));
            }
            Err(e) => return Err(e),
        };
        reply.shm = true;

        match self.cache.lookup(request.address, request.signature, expected) {
            Some(mapping) if mapping.len() == expected => {
                if let Err(e) = mapping.write_frame(pixels) {
                    warn!("cannot write frame to shm: {e}");
                    reply.shm_failed = true;
                }
            }
            Some(mapping) => {
                // The client passed a buffer it has since reallocated.
                error!("invalid shm entry length ({} != {expected})", mapping.len());
                reply.shm_failed = true;
            }
            None => {
                warn!("cannot find shm, moving on");
                reply.shm_failed = true;
            }
        }
        Ok(reply)
    }

    fn change_resolution(&mut self, requested: Resolution) -> Option<ServerMessage> {
        match self.resizer.change_resolution(requested.width, requested.height) {
            Ok(applied) => {
                info!(
                    "resolution {}x{} requested, {}x{} applied",
                    requested.width, requested.height, applied.width, applied.height
                );
                Some(ServerMessage::Resolution(applied))
            }
            Err(e) => {
                warn!("cannot change resolution: {e}");
                None
            }
        }
    }
}

/// Freon sessions have no VT subsystem, so the active-VT file is missing.
fn is_freon(probe: &Path) -> bool {
    match probe.try_exists() {
        Ok(exists) => !exists,
        Err(e) => {
            warn!("cannot determine freon state from {}: {e}", probe.display());
            false
        }
    }
}

/// A frame of the wrong size is not sent; the caller forgets the last size
/// so the next request captures again.
fn capture_failed(reply: ScreenReply, e: DisplayError) -> ScreenReply {
    warn!("{e}, frame not updated");
    ScreenReply {
        updated: false,
        shm: false,
        ..reply
    }
}
