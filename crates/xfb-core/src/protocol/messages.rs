//! Framebuffer protocol message types.
//!
//! Every message is one WebSocket binary message whose first byte is an ASCII
//! tag. Multi-byte integers are little-endian. Flag bits live in a single byte
//! right after the tag; their positions are the `*_BIT` constants below.

// ── Tags ──────────────────────────────────────────────────────────────────────

pub const TAG_SCREEN: u8 = b'S';
pub const TAG_CURSOR: u8 = b'P';
pub const TAG_RESOLUTION: u8 = b'R';
pub const TAG_KEY: u8 = b'K';
pub const TAG_MOUSE_MOVE: u8 = b'M';
pub const TAG_MOUSE_CLICK: u8 = b'C';
pub const TAG_QUIT: u8 = b'Q';
pub const TAG_INIT: u8 = b'I';

/// Version string sent as a text frame right after the upgrade handshake.
pub const FRAMEBUFFER_VERSION: &str = "VF3";

/// Listening port is `PORT_BASE + display number`.
pub const PORT_BASE: u16 = 30010;

// ── Sizes ─────────────────────────────────────────────────────────────────────

/// `S` + flags + width + height + address + signature.
pub const SCREEN_REQUEST_SIZE: usize = 22;
/// `S` + flags + width + height + cursor serial.
pub const SCREEN_REPLY_SIZE: usize = 10;
pub const CURSOR_REQUEST_SIZE: usize = 1;
/// `P` + width + height + xhot + yhot + serial, followed by the pixels.
pub const CURSOR_REPLY_HEADER_SIZE: usize = 13;
pub const RESOLUTION_SIZE: usize = 5;
/// `K` + down + keycode.
pub const KEY_SIZE: usize = 3;
/// `K` + down + keysym (older clients).
pub const KEY_LEGACY_SIZE: usize = 6;
pub const MOUSE_MOVE_SIZE: usize = 5;
pub const MOUSE_CLICK_SIZE: usize = 3;
pub const QUIT_SIZE: usize = 1;
pub const INIT_SIZE: usize = 2;

// ── Flag bits ─────────────────────────────────────────────────────────────────

/// Screen request: client wants the pixels in its shared-memory buffer.
pub const SCREEN_SHM_BIT: u8 = 1 << 0;
/// Screen request: capture even if no damage was observed.
pub const SCREEN_REFRESH_BIT: u8 = 1 << 1;

/// Screen reply: pixels were transferred through shared memory.
pub const REPLY_SHM_BIT: u8 = 1 << 0;
/// Screen reply: the shared-memory transfer failed.
pub const REPLY_SHM_FAILED_BIT: u8 = 1 << 1;
/// Screen reply: the frame changed since the last request.
pub const REPLY_UPDATED_BIT: u8 = 1 << 2;
/// Screen reply: the cursor image changed; see `cursor_serial`.
pub const REPLY_CURSOR_UPDATED_BIT: u8 = 1 << 3;

/// Down/up flag of key and click messages.
pub const DOWN_BIT: u8 = 1 << 0;

// ── Client → server ───────────────────────────────────────────────────────────

/// Request for the current frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ScreenRequest {
    /// Deliver the pixels through the client's shared-memory buffer.
    pub shm: bool,
    /// Capture even when nothing changed.
    pub refresh: bool,
    pub width: u16,
    pub height: u16,
    /// Opaque client-side handle of the shared buffer.
    pub address: u64,
    /// Value the client wrote in the first 8 bytes of that buffer.
    pub signature: u64,
}

/// Key identifier carried by a key message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Key {
    /// X keycode (current clients).
    Keycode(u8),
    /// X keysym (older clients); must be translated to a keycode.
    Keysym(u32),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KeyEvent {
    pub down: bool,
    pub key: Key,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MouseMove {
    pub x: u16,
    pub y: u16,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MouseClick {
    pub down: bool,
    /// X button number (1 = left, 2 = middle, 3 = right, 4/5 = wheel).
    pub button: u8,
}

/// Requested or applied screen size.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Resolution {
    pub width: u16,
    pub height: u16,
}

/// Messages a client sends.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientMessage {
    Screen(ScreenRequest),
    Cursor,
    Resolution(Resolution),
    Key(KeyEvent),
    MouseMove(MouseMove),
    MouseClick(MouseClick),
    /// Release every pressed key and button.
    Quit,
}

// ── Server → client ───────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ScreenReply {
    pub shm: bool,
    pub shm_failed: bool,
    pub updated: bool,
    pub cursor_updated: bool,
    pub width: u16,
    pub height: u16,
    /// Serial of the current cursor image, meaningful when `cursor_updated`.
    pub cursor_serial: u32,
}

/// Current cursor image, ARGB pixels row by row.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct CursorImage {
    pub width: u16,
    pub height: u16,
    pub xhot: u16,
    pub yhot: u16,
    pub serial: u32,
    pub pixels: Vec<u32>,
}

/// Messages the server sends.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServerMessage {
    Screen(ScreenReply),
    Cursor(CursorImage),
    Resolution(Resolution),
    /// Sent once after the version exchange.
    Init {
        /// The display stack runs without VTs (Freon).
        freon: bool,
    },
}
