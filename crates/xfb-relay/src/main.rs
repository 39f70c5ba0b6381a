//! xfb-relay entry point.
//!
//! Creates the pipes, binds the WebSocket server, and relays requests until
//! SIGHUP, SIGINT or SIGTERM.

use std::path::PathBuf;

use anyhow::Context;
use clap::Parser;
use tracing::info;
use tracing_subscriber::EnvFilter;

use xfb_core::signals::ShutdownSignals;
use xfb_core::WsServer;
use xfb_relay::domain::config::{RelayConfig, DEFAULT_PIPE_DIR, RELAY_PORT};
use xfb_relay::infrastructure::event_loop::run_relay;
use xfb_relay::infrastructure::pipes::{prepare_pipes, PipeIn};

/// Relay requests between local FIFO pipes and the browser extension.
#[derive(Debug, Parser)]
#[command(name = "xfb-relay", version)]
struct Cli {
    /// WebSocket port on 127.0.0.1.
    #[arg(long, default_value_t = RELAY_PORT)]
    port: u16,

    /// Directory of the `in` and `out` pipes.
    #[arg(long, env = "XFB_PIPE_DIR", default_value = DEFAULT_PIPE_DIR)]
    pipe_dir: PathBuf,

    /// More output per occurrence (-v info, -vv debug, -vvv trace).
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let level = match cli.verbose {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level)))
        .init();

    let config = RelayConfig {
        port: cli.port,
        ..RelayConfig::default()
    }
    .with_pipe_dir(&cli.pipe_dir);

    let signals = ShutdownSignals::install().context("installing signal handlers")?;

    let mut server =
        WsServer::bind(config.port, config.version.as_str()).with_context(|| format!("binding port {}", config.port))?;
    prepare_pipes(&config.pipe_dir)?;
    let mut pipe_in = PipeIn::open(config.pipe_in())?;
    info!("xfb-relay ready");

    run_relay(&mut server, &mut pipe_in, &config, signals.flag(), Some(signals.poll_mask()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cli_defaults() {
        // Arrange / Act
        let cli = Cli::parse_from(["xfb-relay"]);

        // Assert
        assert_eq!(cli.port, 30001);
        assert_eq!(cli.verbose, 0);
    }

    #[test]
    fn test_cli_overrides() {
        let cli = Cli::parse_from(["xfb-relay", "-vvv", "--port", "40001", "--pipe-dir", "/run/x"]);

        assert_eq!(cli.port, 40001);
        assert_eq!(cli.pipe_dir, PathBuf::from("/run/x"));
        assert_eq!(cli.verbose, 3);
    }
}
