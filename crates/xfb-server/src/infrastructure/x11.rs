//! X11 display adapter built on x11rb.
//!
//! - **Capture**: MIT-SHM `GetImage` of the root window into a memfd shared
//!   with the X server. The segment is reallocated whenever the requested size
//!   changes.
//! - **Change detection**: DAMAGE in raw-rectangle mode on the root and every
//!   top-level window that is not override-redirect. Newly mapped windows are
//!   picked up through SubstructureNotify on the root. Raw-rectangle damage
//!   needs no subtracting, each drawing operation simply produces events.
//! - **Cursor**: XFIXES cursor notifications and cursor images.
//! - **Input**: XTEST fake input.
//! - **Presence**: the 8-bit `CROUTON_CONNECTED` property on the root window.

use std::ffi::CStr;
use std::fs::File;
use std::io;

use nix::sys::memfd::{memfd_create, MemFdCreateFlag};
use tracing::{debug, info, trace};
use x11rb::connection::Connection;
use x11rb::errors::{ConnectionError, ReplyError, ReplyOrIdError};
use x11rb::protocol::damage::{ConnectionExt as _, ReportLevel};
use x11rb::protocol::shm::{self, ConnectionExt as _};
use x11rb::protocol::xfixes::{ConnectionExt as _, CursorNotifyMask};
use x11rb::protocol::xproto::{
    self, Atom, AtomEnum, ChangeWindowAttributesAux, ConnectionExt as _, EventMask, ImageFormat, PropMode, Window,
};
use x11rb::protocol::xtest::ConnectionExt as _;
use x11rb::protocol::Event;
use x11rb::rust_connection::RustConnection;
use x11rb::wrapper::ConnectionExt as _;
use x11rb::CURRENT_TIME;
use xfb_core::protocol::CursorImage;

use crate::application::replay_input::InputInjector;
use crate::application::serve_framebuffer::{DisplayChanges, DisplayError, FrameSource};
use crate::infrastructure::mmap::MappedRegion;

const CONNECTED_PROPERTY: &[u8] = b"CROUTON_CONNECTED";
const CAPTURE_NAME: &[u8] = b"xfb-capture\0";

impl From<ConnectionError> for DisplayError {
    fn from(e: ConnectionError) -> Self {
        DisplayError::ConnectionLost(e.to_string())
    }
}

impl From<ReplyError> for DisplayError {
    fn from(e: ReplyError) -> Self {
        match e {
            ReplyError::ConnectionError(e) => e.into(),
            ReplyError::X11Error(e) => DisplayError::Request(format!("{:?} in request {}", e.error_kind, e.major_opcode)),
        }
    }
}

impl From<ReplyOrIdError> for DisplayError {
    fn from(e: ReplyOrIdError) -> Self {
        match e {
            ReplyOrIdError::ConnectionError(e) => e.into(),
            ReplyOrIdError::X11Error(e) => ReplyError::X11Error(e).into(),
            ReplyOrIdError::IdsExhausted => DisplayError::Request("X11 resource ids exhausted".to_string()),
        }
    }
}

fn capture_error(e: impl std::fmt::Display) -> DisplayError {
    DisplayError::Request(format!("capture buffer: {e}"))
}

/// The MIT-SHM segment frames are captured into.
struct CaptureBuffer {
    seg: shm::Seg,
    region: MappedRegion,
    width: u16,
    height: u16,
}

/// Keycode table for translating keysyms.
struct KeyboardMapping {
    min_keycode: u8,
    keysyms_per_keycode: usize,
    keysyms: Vec<u32>,
}

impl KeyboardMapping {
    fn keycode_for(&self, keysym: u32) -> Option<u8> {
        let index = self.keysyms.iter().position(|&k| k == keysym)?;
        let offset = index / self.keysyms_per_keycode.max(1);
        u8::try_from(usize::from(self.min_keycode) + offset).ok()
    }
}

pub struct X11Display {
    conn: RustConnection,
    root: Window,
    connected_atom: Atom,
    capture: Option<CaptureBuffer>,
    keymap: Option<KeyboardMapping>,
}

impl X11Display {
    /// Connects to `display` (e.g. `:1`) and sets up every extension used.
    ///
    /// # Errors
    ///
    /// [`DisplayError::Open`] if the display cannot be reached or lacks one
    /// of XTEST, DAMAGE, XFIXES or MIT-SHM.
    pub fn open(display: &str) -> Result<Self, DisplayError> {
        let open_error = |reason: String| DisplayError::Open {
            display: display.to_string(),
            reason,
        };
        let (conn, screen_num) = x11rb::connect(Some(display)).map_err(|e| open_error(e.to_string()))?;
        let root = conn
            .setup()
            .roots
            .get(screen_num)
            .map(|screen| screen.root)
            .ok_or_else(|| open_error(format!("no screen {screen_num}")))?;
        Self::init(conn, root).map_err(|e| open_error(e.to_string()))
    }

    fn init(conn: RustConnection, root: Window) -> Result<Self, DisplayError> {
        conn.xtest_get_version(2, 2)?.reply()?;
        conn.damage_query_version(1, 1)?.reply()?;
        conn.xfixes_query_version(5, 0)?.reply()?;
        let shm_version = conn.shm_query_version()?.reply()?;
        debug!("MIT-SHM {}.{}", shm_version.major_version, shm_version.minor_version);

        // Get notified when new windows are mapped.
        conn.change_window_attributes(
            root,
            &ChangeWindowAttributesAux::new().event_mask(EventMask::SUBSTRUCTURE_NOTIFY),
        )?;

        let connected_atom = conn.intern_atom(false, CONNECTED_PROPERTY)?.reply()?.atom;

        let display = Self {
            conn,
            root,
            connected_atom,
            capture: None,
            keymap: None,
        };

        let children = display.conn.query_tree(root)?.reply()?.children;
        display.register_damage(root)?;
        for window in children {
            display.register_damage(window)?;
        }
        display
            .conn
            .xfixes_select_cursor_input(root, CursorNotifyMask::DISPLAY_CURSOR)?;
        display.conn.flush()?;
        info!("X11 display ready (root window {root:#x})");
        Ok(display)
    }

    /// Reports damage on `window` unless it is override-redirect. A window
    /// that disappeared in the meantime is skipped.
    fn register_damage(&self, window: Window) -> Result<(), DisplayError> {
        let attributes = match self.conn.get_window_attributes(window)?.reply() {
            Ok(attributes) => attributes,
            Err(ReplyError::X11Error(e)) => {
                trace!("window {window:#x} vanished: {:?}", e.error_kind);
                return Ok(());
            }
            Err(e) => return Err(e.into()),
        };
        if attributes.override_redirect {
            return Ok(());
        }
        let damage = self.conn.generate_id()?;
        self.conn.damage_create(damage, window, ReportLevel::RAW_RECTANGLES)?;
        trace!("damage registered on window {window:#x}");
        Ok(())
    }

    /// Makes sure the capture segment matches `width`×`height`.
    fn ensure_capture(&mut self, width: u16, height: u16) -> Result<(), DisplayError> {
        if matches!(&self.capture, Some(c) if c.width == width && c.height == height) {
            return Ok(());
        }
        if let Some(old) = self.capture.take() {
            self.conn.shm_detach(old.seg)?;
        }

        let len = usize::from(width) * usize::from(height) * 4;
        let name = CStr::from_bytes_with_nul(CAPTURE_NAME).map_err(capture_error)?;
        let fd = memfd_create(name, MemFdCreateFlag::MFD_CLOEXEC).map_err(capture_error)?;
        nix::unistd::ftruncate(&fd, len as nix::libc::off_t).map_err(capture_error)?;
        let file = File::from(fd);
        let server_fd = file.try_clone().map_err(capture_error)?;
        let region = MappedRegion::map(file, len).map_err(capture_error)?;

        let seg = self.conn.generate_id()?;
        self.conn.shm_attach_fd(seg, server_fd, false)?.check()?;
        debug!("capture buffer reallocated for {width}x{height}");
        self.capture = Some(CaptureBuffer {
            seg,
            region,
            width,
            height,
        });
        Ok(())
    }

    fn keyboard_mapping(&mut self) -> Result<&KeyboardMapping, DisplayError> {
        if self.keymap.is_none() {
            let setup = self.conn.setup();
            let (min, max) = (setup.min_keycode, setup.max_keycode);
            let reply = self
                .conn
                .get_keyboard_mapping(min, max.saturating_sub(min).saturating_add(1))?
                .reply()?;
            self.keymap = Some(KeyboardMapping {
                min_keycode: min,
                keysyms_per_keycode: usize::from(reply.keysyms_per_keycode),
                keysyms: reply.keysyms,
            });
        }
        self.keymap
            .as_ref()
            .ok_or_else(|| DisplayError::Request("keyboard mapping unavailable".to_string()))
    }

    fn fake_input(&self, kind: u8, detail: u8, x: i16, y: i16) -> Result<(), DisplayError> {
        self.conn
            .xtest_fake_input(kind, detail, CURRENT_TIME, self.root, x, y, 0)?;
        self.conn.flush()?;
        Ok(())
    }
}

impl FrameSource for X11Display {
    fn poll_changes(&mut self) -> Result<DisplayChanges, DisplayError> {
        self.conn.flush()?;
        let mut changes = DisplayChanges::default();
        while let Some(event) = self.conn.poll_for_event()? {
            match event {
                Event::MapNotify(ev) => {
                    self.register_damage(ev.window)?;
                    changes.damaged = true;
                }
                Event::DamageNotify(_) => changes.damaged = true,
                Event::XfixesCursorNotify(ev) => {
                    trace!("cursor {} (name atom {})", ev.cursor_serial, ev.name);
                    changes.cursor_serial = Some(ev.cursor_serial);
                }
                Event::Error(e) => debug!("X11 error {:?} in request {}", e.error_kind, e.major_opcode),
                _ => {}
            }
        }
        Ok(changes)
    }

    fn capture(&mut self, width: u16, height: u16) -> Result<&[u8], DisplayError> {
        if width == 0 || height == 0 {
            return Err(DisplayError::Request(format!("empty capture area {width}x{height}")));
        }
        self.ensure_capture(width, height)?;
        let capture = self
            .capture
            .as_ref()
            .ok_or_else(|| DisplayError::Request("no capture buffer".to_string()))?;
        let reply = self
            .conn
            .shm_get_image(
                self.root,
                0,
                0,
                width,
                height,
                !0,
                ImageFormat::Z_PIXMAP.into(),
                capture.seg,
                0,
            )?
            .reply()?;
        let expected = capture.region.len();
        let actual = reply.size as usize;
        if actual != expected {
            return Err(DisplayError::BadCapture { expected, actual });
        }
        Ok(capture.region.as_slice())
    }

    fn cursor_image(&mut self) -> Result<CursorImage, DisplayError> {
        let image = self.conn.xfixes_get_cursor_image()?.reply()?;
        Ok(CursorImage {
            width: image.width,
            height: image.height,
            xhot: image.xhot,
            yhot: image.yhot,
            serial: image.cursor_serial,
            pixels: image.cursor_image,
        })
    }

    fn set_connected(&mut self, connected: bool) -> Result<(), DisplayError> {
        self.conn.change_property8(
            PropMode::REPLACE,
            self.root,
            self.connected_atom,
            AtomEnum::INTEGER,
            &[u8::from(connected)],
        )?;
        self.conn.flush()?;
        debug!("CROUTON_CONNECTED = {}", u8::from(connected));
        Ok(())
    }
}

impl InputInjector for X11Display {
    fn fake_key(&mut self, keycode: u8, down: bool) -> Result<(), DisplayError> {
        let kind = if down { xproto::KEY_PRESS_EVENT } else { xproto::KEY_RELEASE_EVENT };
        self.fake_input(kind, keycode, 0, 0)
    }

    fn fake_button(&mut self, button: u8, down: bool) -> Result<(), DisplayError> {
        let kind = if down { xproto::BUTTON_PRESS_EVENT } else { xproto::BUTTON_RELEASE_EVENT };
        self.fake_input(kind, button, 0, 0)
    }

    fn fake_motion(&mut self, x: u16, y: u16) -> Result<(), DisplayError> {
        let clamp = |v: u16| i16::try_from(v).unwrap_or(i16::MAX);
        self.fake_input(xproto::MOTION_NOTIFY_EVENT, 0, clamp(x), clamp(y))
    }

    fn keysym_to_keycode(&mut self, keysym: u32) -> Result<Option<u8>, DisplayError> {
        Ok(self.keyboard_mapping()?.keycode_for(keysym))
    }
}

impl Drop for X11Display {
    fn drop(&mut self) {
        if let Some(capture) = self.capture.take() {
            let _ = self.conn.shm_detach(capture.seg);
            let _ = self.conn.flush();
        }
    }
}

/// Parses the display number out of `:N` or `:N.S`.
pub fn display_number(display: &str) -> io::Result<u16> {
    let invalid = || io::Error::new(io::ErrorKind::InvalidInput, format!("invalid display: {display:?}"));
    let rest = display.strip_prefix(':').ok_or_else(invalid)?;
    let number = rest.split_once('.').map_or(rest, |(number, _screen)| number);
    number.parse().map_err(|_| invalid())
}
