//! Infrastructure layer for the framebuffer service.
//!
//! Contains the OS-facing adapters behind the application traits and the loop
//! that drives them.
//!
//! **Dependency rule**: this layer may depend on `application` and `xfb_core`,
//! but MUST NOT be imported by the `application` layer.
//!
//! # Sub-modules
//!
//! - **`x11`** – The X display: MIT-SHM capture into a memfd segment, DAMAGE
//!   and XFIXES change tracking, XTEST input injection.
//!
//! - **`shm_resolver`** – Asks the local resolver daemon for a client's buffer
//!   and maps the descriptor it passes back.
//!
//! - **`mmap`** – Owned shared mappings with bounds-checked access.
//!
//! - **`resize`** – Runs the external resize helper and parses its answer.
//!
//! - **`storage`** – TOML configuration.
//!
//! - **`event_loop`** – `ppoll` over the listener and the client, one message
//!   at a time.

pub mod event_loop;
pub mod mmap;
pub mod resize;
pub mod shm_resolver;
pub mod storage;
pub mod x11;
