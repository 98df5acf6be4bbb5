use std::io::{stdin, stdout};
use std::path::PathBuf;

use anyhow::Result;
use clap::Parser;
use tracing::{info, Level};

use tsid::bss;
use tsid::config::Config;
use tsid::connector::StreamConnector;
use tsid::dispatch;
use tsid::TSI_VERSION;

/// One-shot runner: processes a single message read from stdin, with data
/// blocks base64-framed on the text streams, then exits.
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
    // keep stdout clean for the reply, logs go to stderr
    tracing_subscriber::fmt()
        .with_max_level(level)
        .with_writer(std::io::stderr)
        .init();

    let args = Args::parse();
    let mut config = Config::load(&args.config)?;
    // identity handling needs the shepherd environment, not a terminal
    config.switch_uid = false;
    config.open_user_sessions = false;

    let bss = bss::select(&config.batch_variant)?;
    info!("starting TSI {} for {}", TSI_VERSION, bss.variant());
    bss.init(&mut config)?;

    let mut connector = StreamConnector::new(stdin().lock(), stdout());
    dispatch::process(&mut connector, config, true)?;
    Ok(())
}
