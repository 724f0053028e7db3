//! `clap::Parser` argument structs for the three binaries this crate
//! builds. Each arg gets its own doc comment, as this crate's author finds
//! that `--help` output worth the upkeep for anything a new operator would
//! have to guess at.

use clap::Parser;
use clap::builder::styling::{AnsiColor, Styles};
use std::path::PathBuf;

fn styles() -> Styles {
    Styles::styled()
        .header(AnsiColor::Yellow.on_default())
        .usage(AnsiColor::Yellow.on_default())
        .literal(AnsiColor::Green.on_default())
        .placeholder(AnsiColor::Green.on_default())
}

/// The controller listens for a single director connection at a time and
/// drives the PTD supervisors described in its configuration file.
#[derive(Parser, Debug, Clone)]
#[command(author, version, about, long_about = None, styles = styles())]
pub struct ControllerArgs {
    /// Path to the INI configuration file
    ///
    /// See the `[server]`/`[ptd]`/`[analyzerN]` sections documented in the
    /// crate's external interface notes. Unknown keys and sections produce
    /// warnings, not startup failures.
    #[arg(short = 'c', long = "configurationFile")]
    pub configuration_file: PathBuf,

    /// Increase log verbosity (-v, -vv)
    #[arg(short = 'v', action = clap::ArgAction::Count)]
    pub verbose: u8,

    /// Directory the daily-rotating log file is written under
    #[arg(long, default_value = "logs")]
    pub log_dir: PathBuf,

    /// Suppress the colorized stdout summary layer
    #[arg(long)]
    pub quiet: bool,
}

/// The director runs on the system under test: it drives the workload
/// command twice (ranging, then testing) and ships the resulting logs to
/// the controller.
#[derive(Parser, Debug, Clone)]
#[command(author, version, about, long_about = None, styles = styles())]
pub struct DirectorArgs {
    /// Controller address, `host:port`
    #[arg(long)]
    pub addr: String,

    /// Controller TCP port, if not already embedded in `--addr`
    #[arg(long, default_value_t = 4950)]
    pub port: u16,

    /// Shell command that drives the workload under measurement
    ///
    /// Inherits `$ranging` (`1` during the ranging phase, `0` during
    /// testing) and `$out`, the absolute path of the per-phase output
    /// directory, in its environment.
    #[arg(long = "run-workload")]
    pub run_workload: String,

    /// Directory the workload writes its loadgen logs into
    #[arg(long = "loadgen-logs")]
    pub loadgen_logs: PathBuf,

    /// Directory the session's files are assembled under on this host
    #[arg(long)]
    pub output: PathBuf,

    /// NTP server to sync against before each phase
    #[arg(long)]
    pub ntp: String,

    /// Optional label appended to the generated session name
    #[arg(long)]
    pub label: Option<String>,

    /// Zip the loadgen log subtree before uploading it
    #[arg(long = "send-logs")]
    pub send_logs: bool,

    /// Proceed even when a reply the driver expects `OK` for was not `OK`
    #[arg(long)]
    pub force: bool,

    /// Send `stop` to the controller immediately after the handshake, so
    /// it exits even if this driver run later crashes
    #[arg(long = "stop-server")]
    pub stop_server: bool,

    /// Increase log verbosity (-v, -vv)
    #[arg(short = 'v', action = clap::ArgAction::Count)]
    pub verbose: u8,
}

#[derive(clap::Subcommand, Debug, Clone)]
pub enum AuditCommand {
    /// Audit a completed session directory against a sources snapshot
    Check {
        /// Per-session directory produced by a controller/director run
        session_dir: PathBuf,
        /// Directory containing the program's own source files at the
        /// moment of execution, for cross-checking the `sources` digest map
        sources_dir: PathBuf,
    },
}

/// Offline verifier: cross-checks both session descriptors and the result
/// tree, writing `check.log` next to the session directory.
#[derive(Parser, Debug, Clone)]
#[command(author, version, about, long_about = None, styles = styles())]
pub struct AuditArgs {
    #[command(subcommand)]
    pub command: AuditCommand,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn controller_args_parse_minimal() {
        let args = ControllerArgs::parse_from(["controller", "-c", "power.conf"]);
        assert_eq!(args.configuration_file, PathBuf::from("power.conf"));
        assert_eq!(args.verbose, 0);
    }

    #[test]
    fn director_args_parse_required_fields() {
        let args = DirectorArgs::parse_from([
            "director",
            "--addr",
            "10.0.0.5",
            "--run-workload",
            "./run.sh",
            "--loadgen-logs",
            "/tmp/logs",
            "--output",
            "/tmp/out",
            "--ntp",
            "time.example.com",
        ]);
        assert_eq!(args.addr, "10.0.0.5");
        assert_eq!(args.port, 4950);
        assert!(!args.send_logs);
    }

    #[test]
    fn audit_args_parse_check_subcommand() {
        let args = AuditArgs::parse_from(["audit", "check", "/tmp/session", "/tmp/sources"]);
        let AuditCommand::Check { session_dir, sources_dir } = args.command;
        assert_eq!(session_dir, PathBuf::from("/tmp/session"));
        assert_eq!(sources_dir, PathBuf::from("/tmp/sources"));
    }
}
