//! Storage infrastructure: configuration file loading.
//!
//! The `config` sub-module reads the optional TOML file and supplies defaults
//! for everything it does not set.

pub mod config;
