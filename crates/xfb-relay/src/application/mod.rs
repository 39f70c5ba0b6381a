//! Application layer for xfb-relay.
//!
//! # Responsibilities
//!
//! - Streaming a pipe request to the client as one fragmented text message
//! - Streaming the client's reply message to the output pipe
//! - The error strings local tools receive instead of a reply
//!
//! Opening, draining, and reopening the pipes is left to `infrastructure`.

pub mod relay;
