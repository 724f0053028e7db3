//! Audit entry point: independently verifies a completed session directory
//! against a sources snapshot, writing `check.log` next to the session.
//! Refuses to overwrite an existing `check.log`.

use anyhow::{bail, Result};
use clap::Parser;
use mlperf_power::audit;
use mlperf_power::cli::{AuditArgs, AuditCommand};
use tracing::error;

fn main() -> Result<()> {
    tracing_subscriber::fmt().with_writer(std::io::stderr).init();

    let args = AuditArgs::parse();
    let AuditCommand::Check { session_dir, sources_dir } = args.command;

    let check_log = session_dir.join("check.log");
    if check_log.exists() {
        bail!("{} already exists; refusing to overwrite", check_log.display());
    }

    let report = audit::run(&session_dir, &sources_dir)?;
    std::fs::write(&check_log, report.render())?;

    if !report.passed() {
        error!("audit failed; see {}", check_log.display());
        std::process::exit(1);
    }

    Ok(())
}
