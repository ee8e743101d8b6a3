//! Tether - chip-to-chip link daemon
//!
//! Provides:
//! - Node configuration loading and validation
//! - A loopback self-test that runs the full export/import/copy path
//!   between two in-process nodes

mod selftest;

use anyhow::{Context, Result};
use clap::Parser;
use libnyx_c2c::load_config;
use std::path::PathBuf;
use tracing::info;

/// Tether - chip-to-chip link daemon
#[derive(Parser, Debug)]
#[command(name = "tetherd", version, about)]
struct Args {
    /// Configuration file
    #[arg(short, long, default_value = "/grimoire/system/tether.toml", env = "TETHER_CONFIG")]
    config: PathBuf,

    /// Copies to run in the self-test
    #[arg(short, long, default_value_t = 64)]
    iterations: u32,

    /// Debug mode
    #[arg(short, long)]
    debug: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let log_level = if args.debug { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(log_level)
        .init();

    info!("Tether v{} starting", env!("CARGO_PKG_VERSION"));

    let config = load_config(&args.config)
        .with_context(|| format!("loading {}", args.config.display()))?;
    info!(
        endpoint = %config.endpoint.name,
        mode = ?config.driver_mode,
        window = format_args!("{:#x}+{:#x}", config.iova.base, config.iova.size),
        "configuration loaded"
    );

    let report = selftest::run(config, args.iterations).await?;
    info!(
        copies = report.copies,
        local_fence = report.local_fence,
        remote_fence = report.remote_fence,
        elapsed = ?report.elapsed,
        "self-test passed"
    );
    Ok(())
}
