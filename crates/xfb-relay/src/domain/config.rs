//! Relay configuration types.
//!
//! [`RelayConfig`] holds every runtime setting. The binary fills it from the
//! command line; tests build it directly.

use std::path::{Path, PathBuf};
use std::time::Duration;

/// Default WebSocket port of the relay.
pub const RELAY_PORT: u16 = 30001;

/// Version string sent to the extension after the handshake.
pub const RELAY_VERSION: &str = "V1";

/// Default directory holding the `in` and `out` pipes.
pub const DEFAULT_PIPE_DIR: &str = "/tmp/crouton-ext";

#[derive(Debug, Clone)]
pub struct RelayConfig {
    /// Port on 127.0.0.1 the WebSocket server binds to.
    pub port: u16,

    pub version: String,

    /// Directory of the request (`in`) and reply (`out`) pipes.
    pub pipe_dir: PathBuf,

    /// How long to wait for a reader on the output pipe.
    ///
    /// Opening a FIFO for writing fails while nobody reads it, so the relay
    /// retries every `pipe_out_retry` until this elapses. A tool that never
    /// reads its answer therefore blocks the relay for at most this long.
    pub pipe_out_timeout: Duration,

    pub pipe_out_retry: Duration,
}

impl RelayConfig {
    pub fn pipe_in(&self) -> PathBuf {
        self.pipe_dir.join("in")
    }

    pub fn pipe_out(&self) -> PathBuf {
        self.pipe_dir.join("out")
    }

    /// Same settings with the pipes in `dir`.
    pub fn with_pipe_dir(mut self, dir: impl AsRef<Path>) -> Self {
        self.pipe_dir = dir.as_ref().to_path_buf();
        self
    }
}

impl Default for RelayConfig {
    /// | Field            | Default            |
    /// |------------------|--------------------|
    /// | port             | `30001`            |
    /// | version          | `V1`               |
    /// | pipe_dir         | `/tmp/crouton-ext` |
    /// | pipe_out_timeout | 3 seconds          |
    /// | pipe_out_retry   | 10 ms              |
    fn default() -> Self {
        Self {
            port: RELAY_PORT,
            version: RELAY_VERSION.to_string(),
            pipe_dir: PathBuf::from(DEFAULT_PIPE_DIR),
            pipe_out_timeout: Duration::from_millis(3000),
            pipe_out_retry: Duration::from_millis(10),
        }
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_port_is_30001() {
        // Arrange / Act
        let cfg = RelayConfig::default();
        // Assert
        assert_eq!(cfg.port, 30001);
        assert_eq!(cfg.version, "V1");
    }

    #[test]
    fn test_default_pipes_live_in_crouton_ext() {
        let cfg = RelayConfig::default();

        assert_eq!(cfg.pipe_in(), PathBuf::from("/tmp/crouton-ext/in"));
        assert_eq!(cfg.pipe_out(), PathBuf::from("/tmp/crouton-ext/out"));
    }

    #[test]
    fn test_default_output_wait_is_3s_in_10ms_steps() {
        let cfg = RelayConfig::default();

        assert_eq!(cfg.pipe_out_timeout, Duration::from_secs(3));
        assert_eq!(cfg.pipe_out_retry, Duration::from_millis(10));
    }

    #[test]
    fn test_with_pipe_dir_moves_both_pipes() {
        let cfg = RelayConfig::default().with_pipe_dir("/run/relay");

        assert_eq!(cfg.pipe_in(), PathBuf::from("/run/relay/in"));
        assert_eq!(cfg.pipe_out(), PathBuf::from("/run/relay/out"));
        assert_eq!(cfg.port, RELAY_PORT);
    }
}
