//! Application layer use cases for the framebuffer service.
//!
//! # What use cases does the service have?
//!
//! - **`serve_framebuffer`** – Decodes each client message and produces the
//!   reply: captures frames into the client's shared memory, returns cursor
//!   images, and asks for resolution changes. Owns all per-session state.
//!
//! - **`replay_input`** – Injects client key, button, and pointer events and
//!   remembers what is held down, so a disconnect never leaves a stuck key.
//!
//! - **`shm_cache`** – Keeps the two most recently resolved client buffers
//!   mapped and validates them by signature before every use.
//!
//! The display server, the buffer resolver, and the resize helper are reached
//! only through the traits defined here ([`serve_framebuffer::FrameSource`],
//! [`replay_input::InputInjector`], [`shm_cache::MappingResolver`],
//! [`serve_framebuffer::ResolutionChanger`]), implemented in `infrastructure`.

pub mod replay_input;
pub mod serve_framebuffer;
pub mod shm_cache;
