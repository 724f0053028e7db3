//! Controller entry point: parses `-c/--configurationFile`, wires logging,
//! loads the INI configuration, and serves director connections until a
//! `stop` command or a second SIGINT.

use anyhow::Result;
use clap::Parser;
use mlperf_power::cli::ControllerArgs;
use mlperf_power::{logging, ControllerConfig, ControllerService};
use std::path::PathBuf;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn, Level};

#[tokio::main]
async fn main() -> Result<()> {
    let args = ControllerArgs::parse();

    let level = match args.verbose {
        0 => Level::INFO,
        1 => Level::DEBUG,
        _ => Level::TRACE,
    };
    let _log_guard = logging::init(&args.log_dir, level, level, args.quiet);

    let config = match ControllerConfig::load(&args.configuration_file) {
        Ok(c) => c,
        Err(e) => {
            error!("failed to load configuration: {e}");
            std::process::exit(1);
        }
    };

    let sessions_root = PathBuf::from("sessions");
    if let Err(e) = std::fs::create_dir_all(&sessions_root) {
        error!("failed to create sessions directory: {e}");
        std::process::exit(1);
    }

    let cancel = CancellationToken::new();
    let signal_cancel = cancel.clone();
    tokio::spawn(async move {
        let mut sigint_count = 0;
        loop {
            if tokio::signal::ctrl_c().await.is_err() {
                return;
            }
            sigint_count += 1;
            if sigint_count == 1 {
                info!("SIGINT received; requesting graceful stop");
                signal_cancel.cancel();
            } else {
                warn!("second SIGINT received; exiting immediately");
                std::process::exit(130);
            }
        }
    });

    let service = ControllerService::new(config, sessions_root, cancel);
    if let Err(e) = service.run().await {
        error!("controller exited with error: {e}");
        std::process::exit(1);
    }

    info!("controller shut down cleanly");
    Ok(())
}
