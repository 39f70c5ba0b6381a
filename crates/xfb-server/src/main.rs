//! xfb-server entry point.
//!
//! Loads the configuration, connects to the X display, and serves one
//! WebSocket client at a time on `127.0.0.1:<30010 + display number>` until a
//! shutdown signal arrives.
//!
//! # Architecture
//!
//! ```text
//! main()
//!  └─ ShutdownSignals::install()  -- block SIGHUP/INT/TERM outside ppoll
//!  └─ X11Display::open()          -- XTEST, DAMAGE, XFIXES, MIT-SHM
//!  └─ FramebufferService::new()   -- display + SocketResolver + SetresCommand
//!  └─ WsServer::bind()
//!  └─ run_service()               -- ppoll loop, one message at a time
//! ```

use std::path::PathBuf;

use anyhow::Context;
use clap::Parser;
use tracing::info;
use tracing_subscriber::EnvFilter;

use xfb_core::protocol::PORT_BASE;
use xfb_core::signals::ShutdownSignals;
use xfb_core::WsServer;
use xfb_server::application::serve_framebuffer::FramebufferService;
use xfb_server::infrastructure::event_loop::run_service;
use xfb_server::infrastructure::resize::SetresCommand;
use xfb_server::infrastructure::shm_resolver::SocketResolver;
use xfb_server::infrastructure::storage::config::{load_config, render_config, DEFAULT_CONFIG_PATH};
use xfb_server::infrastructure::x11::{display_number, X11Display};

/// Serve an X11 display to a local browser over WebSocket.
#[derive(Debug, Parser)]
#[command(name = "xfb-server", version)]
struct Cli {
    /// X display to serve, e.g. `:1`.
    #[arg(env = "DISPLAY")]
    display: String,

    /// Configuration file.
    #[arg(long, default_value = DEFAULT_CONFIG_PATH)]
    config: PathBuf,

    /// Print the effective configuration and exit.
    #[arg(long)]
    print_config: bool,

    /// More output per occurrence (-v info, -vv debug, -vvv trace).
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,
}

fn level_for(verbose: u8) -> &'static str {
    match verbose {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    }
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // RUST_LOG wins over -v.
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level_for(cli.verbose))),
        )
        .init();

    let config = load_config(&cli.config).with_context(|| format!("loading {}", cli.config.display()))?;
    if cli.print_config {
        print!("{}", render_config(&config)?);
        return Ok(());
    }

    let number = display_number(&cli.display)?;
    let port = PORT_BASE
        .checked_add(number)
        .with_context(|| format!("display {} is out of range", cli.display))?;

    let signals = ShutdownSignals::install().context("installing signal handlers")?;

    let display = X11Display::open(&cli.display)?;
    let resolver = SocketResolver::new(&config.shm.resolver_socket);
    let resizer = SetresCommand::new(&config.resize.command);
    let mut service = FramebufferService::new(
        display,
        resolver,
        resizer,
        config.shm.attempts,
        &config.framebuffer.freon_probe,
    );

    let mut server = WsServer::bind(port, config.framebuffer.version.as_str())
        .with_context(|| format!("binding port {port}"))?;
    info!("serving display {} on port {port}", cli.display);

    run_service(&mut server, &mut service, signals.flag(), Some(signals.poll_mask()))
}
