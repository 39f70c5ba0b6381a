//! Infrastructure layer for xfb-relay.
//!
//! **Dependency rule**: this layer may depend on `application`, `domain` and
//! `xfb_core`, but MUST NOT be imported by the other layers.
//!
//! # Sub-modules
//!
//! - **`pipes`** – Creates the FIFO directory and pipes, keeps the input pipe
//!   open for reading, and opens the output pipe with a bounded retry.
//!
//! - **`event_loop`** – `ppoll` over the WebSocket listener, the input pipe,
//!   and the client.

pub mod event_loop;
pub mod pipes;
