use std::path::PathBuf;

use anyhow::Result;
use clap::Parser;
use tracing::{info, Level};

use tsid::bss;
use tsid::config::Config;
use tsid::shepherd;
use tsid::TSI_VERSION;

/// Target system interface daemon: accepts orchestrator connections and
/// forks per-session workers.
#[derive(Parser)]
#[command(version)]
struct Args {
    /// Path to the properties configuration file
    config: PathBuf,
}

fn main() -> Result<()> {
    let level = if cfg!(debug_assertions) {
        Level::DEBUG
    } else {
        Level::INFO
    };
    tracing_subscriber::fmt().with_max_level(level).init();

    let args = Args::parse();
    let mut config = Config::load(&args.config)?;

    let bss = bss::select(&config.batch_variant)?;
    info!("starting TSI {} for {}", TSI_VERSION, bss.variant());
    bss.init(&mut config)?;
    // a broken status command makes every job invisible, refuse to start
    bss.verify_commands(&config)?;

    std::env::set_current_dir(&config.safe_dir)?;
    shepherd::serve(config)?;
    Ok(())
}
