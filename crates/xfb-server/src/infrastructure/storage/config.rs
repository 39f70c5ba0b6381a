//! TOML configuration for the framebuffer service.
//!
//! Every field is optional. A missing file, or a file missing some fields,
//! yields the built-in defaults:
//!
//! ```toml
//! [framebuffer]
//! version = "VF3"
//! freon_probe = "/sys/class/tty/tty0/active"
//!
//! [shm]
//! resolver_socket = "/var/run/crouton-ext/socket"
//! attempts = 2
//!
//! [resize]
//! command = "setres"
//! ```
//!
//! # Serde default values
//!
//! Fields annotated with `#[serde(default = "some_fn")]` use the return value
//! of `some_fn()` when the field is absent, so older files keep working when
//! fields are added.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use xfb_core::protocol::FRAMEBUFFER_VERSION;

/// Where the server looks when no `--config` is given.
pub const DEFAULT_CONFIG_PATH: &str = "/etc/xfb/server.toml";

/// Error type for configuration file operations.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// A file system I/O error occurred.
    #[error("I/O error accessing config at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// The TOML content could not be parsed.
    #[error("failed to parse config TOML: {0}")]
    Parse(#[from] toml::de::Error),

    /// The config could not be serialized to TOML.
    #[error("failed to serialize config: {0}")]
    Serialize(#[from] toml::ser::Error),
}

// ── Config schema types ───────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct ServerConfig {
    #[serde(default)]
    pub framebuffer: FramebufferConfig,
    #[serde(default)]
    pub shm: ShmConfig,
    #[serde(default)]
    pub resize: ResizeConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct FramebufferConfig {
    /// Version string sent to clients right after the handshake.
    #[serde(default = "default_version")]
    pub version: String,
    /// The session runs without VTs (Freon) when this path does not exist.
    #[serde(default = "default_freon_probe")]
    pub freon_probe: PathBuf,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ShmConfig {
    /// Unix socket of the buffer resolver daemon.
    #[serde(default = "default_resolver_socket")]
    pub resolver_socket: PathBuf,
    /// Resolutions per screen request before reporting "shm failed".
    #[serde(default = "default_attempts")]
    pub attempts: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ResizeConfig {
    /// Helper run as `<command> <width> <height>`.
    #[serde(default = "default_resize_command")]
    pub command: String,
}

// ── Default helpers ───────────────────────────────────────────────────────────

fn default_version() -> String {
    FRAMEBUFFER_VERSION.to_string()
}
fn default_freon_probe() -> PathBuf {
    PathBuf::from("/sys/class/tty/tty0/active")
}
fn default_resolver_socket() -> PathBuf {
    PathBuf::from("/var/run/crouton-ext/socket")
}
fn default_attempts() -> u32 {
    2
}
fn default_resize_command() -> String {
    "setres".to_string()
}

impl Default for FramebufferConfig {
    fn default() -> Self {
        Self {
            version: default_version(),
            freon_probe: default_freon_probe(),
        }
    }
}

impl Default for ShmConfig {
    fn default() -> Self {
        Self {
            resolver_socket: default_resolver_socket(),
            attempts: default_attempts(),
        }
    }
}

impl Default for ResizeConfig {
    fn default() -> Self {
        Self {
            command: default_resize_command(),
        }
    }
}

// ── Loading ───────────────────────────────────────────────────────────────────

/// Loads the configuration at `path`, returning the defaults if the file does
/// not exist.
///
/// # Errors
///
/// Returns [`ConfigError::Io`] for file-system errors other than "not found",
/// and [`ConfigError::Parse`] if the TOML is malformed.
pub fn load_config(path: &Path) -> Result<ServerConfig, ConfigError> {
    match std::fs::read_to_string(path) {
        Ok(content) => Ok(toml::from_str(&content)?),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(ServerConfig::default()),
        Err(e) => Err(ConfigError::Io {
            path: path.to_path_buf(),
            source: e,
        }),
    }
}

/// Renders `config` as TOML, e.g. to print the effective configuration.
///
/// # Errors
///
/// Returns [`ConfigError::Serialize`] if serialization fails.
pub fn render_config(config: &ServerConfig) -> Result<String, ConfigError> {
    Ok(toml::to_string_pretty(config)?)
}

// ── Tests ─────────────────────────────────────────────────────────────────────
