//! Smoke test for a running xfb-server: connects, streams frames at the
//! requested rate, and prints what it saw.

use anyhow::Context;
use clap::Parser;
use tracing_subscriber::EnvFilter;

use xfb_core::protocol::{Resolution, PORT_BASE};
use xfb_server::probe::{run_probe, ProbeConfig};

#[derive(Debug, Parser)]
#[command(name = "xfb-probe", version)]
struct Cli {
    /// Server port (30010 + display number).
    #[arg(long, default_value_t = PORT_BASE)]
    port: u16,

    /// Target frame rate when nothing changes.
    #[arg(long, default_value_t = 30)]
    fps: u32,

    /// Screen replies to collect.
    #[arg(long, default_value_t = 60)]
    frames: u64,

    /// Ask for this resolution first, as `WIDTHxHEIGHT`.
    #[arg(long, value_parser = parse_size)]
    resize: Option<Resolution>,

    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,
}

fn parse_size(s: &str) -> Result<Resolution, String> {
    let (w, h) = s.split_once('x').ok_or_else(|| format!("expected WIDTHxHEIGHT, got {s:?}"))?;
    Ok(Resolution {
        width: w.parse().map_err(|e| format!("width: {e}"))?,
        height: h.parse().map_err(|e| format!("height: {e}"))?,
    })
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let level = if cli.verbose > 0 { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level)))
        .init();

    let config = ProbeConfig {
        port: cli.port,
        fps: cli.fps,
        frames: cli.frames,
        resize: cli.resize,
        ..ProbeConfig::default()
    };
    let stats = run_probe(&config).with_context(|| format!("probing port {}", cli.port))?;

    println!("version:      {}", stats.version);
    println!("freon:        {}", stats.freon);
    if let Some(applied) = stats.applied_resolution {
        println!("resolution:   {}x{}", applied.width, applied.height);
    }
    println!("updated:      {}", stats.updated);
    println!("not updated:  {}", stats.not_updated);
    println!("cursor reads: {}", stats.cursor_fetches);
    Ok(())
}
