//! NTP-based time synchronization: setting the local clock against a
//! configured NTP server, and the two-sided skew check used to confirm the
//! director and controller agree closely enough to trust phase checkpoints.
//!
//! The skew check and the host-sync fallback shape follow the reference
//! `time_sync.py` helper exactly: two local reads bracket a single remote
//! query, and the privileged resync is retried once before failing hard.

use anyhow::{bail, Context, Result};
use chrono::{DateTime, Utc};
use std::process::Command;
use std::time::Duration;
use tracing::warn;

/// Sessions consider endpoints out of sync once skew exceeds this bound.
const MAX_SKEW: Duration = Duration::from_millis(1000);

/// Queries `server` for its current time via SNTP. Does not alter the local
/// clock; used both for the skew check and for reporting controller time
/// over the `time` command.
pub fn get_ntp_time(server: &str) -> Result<DateTime<Utc>> {
    let client = rsntp::SntpClient::new();
    let result = client
        .synchronize(server)
        .with_context(|| format!("NTP query to {server} failed"))?;
    let datetime = result
        .datetime()
        .into_chrono_datetime()
        .context("NTP server returned an unrepresentable timestamp")?;
    Ok(datetime)
}

/// Sets the local system clock from `server`. On POSIX this shells out to
/// `ntpdate`, prefixed with `sudo -n` when the process isn't already root,
/// matching the privileged-helper approach the reference implementation
/// uses rather than writing the clock in-process.
pub fn ntp_host_sync(server: &str) -> Result<()> {
    #[cfg(unix)]
    {
        let is_root = unsafe { libc::geteuid() } == 0;
        let mut cmd = if is_root {
            Command::new("ntpdate")
        } else {
            let mut c = Command::new("sudo");
            c.arg("-n");
            c
        };
        if !is_root {
            cmd.arg("ntpdate");
        }
        cmd.args(["-b", "--", server]);
        let status = cmd
            .status()
            .with_context(|| format!("failed to invoke ntpdate against {server}"))?;
        if !status.success() {
            bail!("ntpdate against {server} exited with {status}");
        }
        Ok(())
    }
    #[cfg(not(unix))]
    {
        bail!("host clock sync against {server} is only implemented for POSIX targets");
    }
}

/// Brackets a remote time query with two local reads and fails if the
/// computed two-sided skew exceeds [`MAX_SKEW`], retrying a resync once
/// before giving up. `get_remote_time` and `re_sync` are injected so this
/// can run against either the controller's `time` command or a raw NTP
/// query, and so tests can exercise it without a network peer.
pub fn remote_peer_sync<F, R>(mut get_remote_time: F, mut re_sync: R) -> Result<()>
where
    F: FnMut() -> Result<DateTime<Utc>>,
    R: FnMut() -> Result<()>,
{
    for attempt in 0..2 {
        let before = Utc::now();
        let remote = get_remote_time()?;
        let after = Utc::now();

        let dt1 = (before - remote).num_milliseconds();
        let dt2 = (after - remote).num_milliseconds();
        let skew = dt1.abs().max(dt2.abs());

        if skew as u128 <= MAX_SKEW.as_millis() {
            return Ok(());
        }

        if attempt == 0 {
            warn!(skew_ms = skew, "clock skew exceeds bound; resyncing and retrying once");
            re_sync()?;
        } else {
            bail!("clock skew {skew}ms exceeds {}ms after resync", MAX_SKEW.as_millis());
        }
    }
    unreachable!()
}
