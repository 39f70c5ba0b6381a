//! xfb-relay library crate.
//!
//! Local programs talk to the browser extension through two named pipes. A
//! program writes a request into `<dir>/in`; the relay forwards it as one
//! WebSocket text message, waits for the extension's single reply message,
//! and writes the reply into `<dir>/out`.
//!
//! # Architecture
//!
//! ```text
//! local tool ──> <dir>/in ──┐
//!                           [xfb-relay] <── WebSocket ──> browser extension
//! local tool <── <dir>/out ─┘
//!
//!   ├── domain/           RelayConfig
//!   ├── application/      request forwarding and reply relaying
//!   └── infrastructure/
//!         ├── pipes/      FIFO creation, opening, draining
//!         └── event_loop/ ppoll over listener, input pipe and client
//! ```
//!
//! # Layer rules
//!
//! - `domain` has no I/O at all.
//! - `application` works on any `Read`/`Write`, so it is tested in memory.
//! - `infrastructure` owns file descriptors, FIFOs, and the readiness loop.

/// Domain layer: runtime settings.
pub mod domain;

/// Application layer: moving one request and its reply.
pub mod application;

/// Infrastructure layer: named pipes and the event loop.
pub mod infrastructure;
