//! Director entry point: drives the workload on the system under test
//! through ranging and testing and ships the results to a controller.

use anyhow::Result;
use clap::Parser;
use mlperf_power::cli::DirectorArgs;
use mlperf_power::director::Director;
use mlperf_power::logging;
use std::path::PathBuf;
use tracing::{error, info, Level};

#[tokio::main]
async fn main() -> Result<()> {
    let args = DirectorArgs::parse();

    let level = match args.verbose {
        0 => Level::INFO,
        1 => Level::DEBUG,
        _ => Level::TRACE,
    };
    let _log_guard = logging::init(&PathBuf::from("logs"), level, level, false);

    info!(addr = %args.addr, "starting director run");

    if let Err(e) = Director::new(args).run().await {
        error!("director run failed: {e}");
        std::process::exit(1);
    }

    info!("director run completed");
    Ok(())
}
