//! Domain layer for xfb-relay.
//!
//! Nothing here touches a file descriptor, so it is trivially testable.

pub mod config;

pub use config::RelayConfig;
