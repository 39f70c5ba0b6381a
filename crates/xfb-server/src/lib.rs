//! xfb-server library entry point.
//!
//! Re-exports all public modules so that integration tests in `tests/`
//! and the binaries share the same module tree.
//!
//! # What does xfb-server do? (for beginners)
//!
//! It shows an X11 display inside a browser tab on the same machine. The
//! browser extension connects to `ws://localhost:<30010 + display>/` and then
//! pulls frames one request at a time:
//!
//! 1. The server accepts one WebSocket client and sends the version `VF3`.
//! 2. For each screen request the server checks whether anything was drawn
//!    since the last one (DAMAGE events). If so it captures the root window
//!    with MIT-SHM and copies the pixels straight into a buffer the client
//!    shares with it, found through the resolver daemon.
//! 3. Cursor changes (XFIXES) are flagged in the screen reply; the client then
//!    asks for the cursor image.
//! 4. Key, button, and motion messages are injected with XTEST. Everything
//!    still held down is released when the client goes away.
//!
//! The `probe` module is a small client for the same protocol, used to smoke
//! test a running server.

/// Application layer: use cases and the traits adapters implement.
pub mod application;

/// Infrastructure layer: X11, shared memory, resize helper, config, event loop.
pub mod infrastructure;

/// Protocol client that paces screen requests like the browser does.
pub mod probe;
