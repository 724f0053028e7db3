//! Parses PTD's per-sample CSV log lines and derives the ranging-phase
//! summary (`maxVolts`, `maxAmps`, `meanWatts`) a single analyzer's log
//! contributes between a `Go` and the matching `Stop`.
//!
//! Values are kept as [`rust_decimal::Decimal`] throughout rather than
//! `f64`: PTD's textual precision must reappear byte-for-byte in any
//! re-serialized maxima, which binary floating point cannot guarantee.

use anyhow::{anyhow, bail, Result};
use rust_decimal::Decimal;
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

/// One parsed sample row: the primary triple plus, for multi-channel logs,
/// the trailing per-channel tuples in the order they appeared.
#[derive(Debug, Clone)]
pub struct SampleRow {
    pub mark: String,
    pub watts: Decimal,
    pub volts: Decimal,
    pub amps: Decimal,
    pub channels: Vec<ChannelTuple>,
}

#[derive(Debug, Clone, Copy)]
pub struct ChannelTuple {
    pub channel: u32,
    pub watts: Decimal,
    pub volts: Decimal,
    pub amps: Decimal,
}

/// Sentinel returned in place of a Watts/Volts/Amps value that a merger or
/// parser deliberately did not compute.
pub const SENTINEL: i64 = -1;

/// Parses one PTD log line. Returns `Ok(None)` for rows whose trailing
/// `Mark` does not equal `mark`; parse failures on a matching row are
/// errors, not skips.
pub fn parse_row(line: &str, mark: &str) -> Result<Option<SampleRow>> {
    let fields: Vec<&str> = line.trim_end().split(',').collect();
    if fields.len() < 12 || fields[0] != "Time" || fields[2] != "Watts" || fields[4] != "Volts" || fields[6] != "Amps" {
        bail!("malformed sample row: {line:?}");
    }

    // Trailing Mark,<m> is the last pair unless per-channel tuples follow it;
    // PTD always appends Mark immediately after the primary PF field.
    if fields[10] != "Mark" {
        bail!("malformed sample row, expected Mark field: {line:?}");
    }
    let row_mark = fields[11];
    if row_mark != mark {
        return Ok(None);
    }

    let watts = parse_decimal(fields[3])?;
    let volts = parse_decimal(fields[5])?;
    let amps = parse_decimal(fields[7])?;

    let mut channels = Vec::new();
    let mut idx = 12;
    while idx < fields.len() {
        if !fields[idx].starts_with("Ch") {
            bail!("malformed trailing channel tuple at field {idx}: {line:?}");
        }
        let channel: u32 = fields[idx][2..]
            .parse()
            .map_err(|_| anyhow!("malformed channel index in {:?}", fields[idx]))?;
        if idx + 9 > fields.len() || fields[idx + 1] != "Watts" || fields[idx + 3] != "Volts" || fields[idx + 5] != "Amps" {
            bail!("malformed channel tuple for Ch{channel}: {line:?}");
        }
        channels.push(ChannelTuple {
            channel,
            watts: parse_decimal(fields[idx + 2])?,
            volts: parse_decimal(fields[idx + 4])?,
            amps: parse_decimal(fields[idx + 6])?,
        });
        idx += 9;
    }

    Ok(Some(SampleRow {
        mark: row_mark.to_string(),
        watts,
        volts,
        amps,
        channels,
    }))
}

fn parse_decimal(s: &str) -> Result<Decimal> {
    Decimal::from_str(s).map_err(|e| anyhow!("not a decimal: {s:?} ({e})"))
}

/// Result of [`derive_ranging_summary`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RangingSummary {
    pub max_volts: Decimal,
    pub max_amps: Decimal,
    /// Mean of included positive Watts values, or `-1` if none were positive.
    pub mean_watts: Decimal,
}

/// Reads `path`, selects rows whose `Mark` equals `mark` exactly, and
/// computes `(maxVolts, maxAmps, meanWatts)` per spec. For single-channel
/// analyzers (`n_chans == 0`) this uses the row's primary triple; for
/// multi-channel analyzers it walks the trailing `Ch<k>` tuples and
/// includes exactly those with `k` in `[start_chan, start_chan + n_chans)`,
/// failing with an "extra channel" error if an expected channel never
/// appears in a matching row.
pub fn derive_ranging_summary(
    path: &Path,
    mark: &str,
    start_chan: u32,
    n_chans: u32,
    elapsed: Duration,
) -> Result<RangingSummary> {
    let content = std::fs::read_to_string(path)?;

    let mut max_volts: Option<Decimal> = None;
    let mut max_amps: Option<Decimal> = None;
    let mut watts_sum = Decimal::ZERO;
    let mut watts_count: u64 = 0;

    for line in content.lines() {
        if line.trim().is_empty() {
            continue;
        }
        let Some(row) = parse_row(line, mark)? else {
            continue;
        };

        if n_chans == 0 {
            update_max(&mut max_volts, row.volts);
            update_max(&mut max_amps, row.amps);
            if row.watts > Decimal::ZERO {
                watts_sum += row.watts;
                watts_count += 1;
            }
            continue;
        }

        let wanted: Vec<u32> = (start_chan..start_chan + n_chans).collect();
        let mut seen = std::collections::HashSet::new();
        for tuple in &row.channels {
            if !wanted.contains(&tuple.channel) {
                continue;
            }
            seen.insert(tuple.channel);
            update_max(&mut max_volts, tuple.volts);
            update_max(&mut max_amps, tuple.amps);
            if tuple.watts > Decimal::ZERO {
                watts_sum += tuple.watts;
                watts_count += 1;
            }
        }
        for k in &wanted {
            if !seen.contains(k) {
                bail!("extra channel error: channel {k} missing from a matching row");
            }
        }
    }

    // Zero rows matched `mark` and "matched but every value was <= 0" are the
    // same sentinel condition: both mean no usable sample was ever produced,
    // and both must go through the same elapsed-based promotion so a workload
    // that exits in well under a second reports MeasurementEndedTooFast
    // instead of a plain range-not-found.
    let no_usable_samples = !matches!(max_volts, Some(v) if v > Decimal::ZERO) || !matches!(max_amps, Some(a) if a > Decimal::ZERO);

    if no_usable_samples {
        if elapsed < Duration::from_secs(1) {
            bail!("MeasurementEndedTooFast: ranging measurement ended too fast ({elapsed:?}) with no usable samples");
        }
        if max_volts.is_none() || max_amps.is_none() {
            bail!("no samples matched mark {mark:?}");
        }
        bail!("range-not-found: maxVolts/maxAmps are non-positive for mark {mark:?}");
    }

    let max_volts = max_volts.unwrap();
    let max_amps = max_amps.unwrap();

    let mean_watts = if watts_count > 0 {
        watts_sum / Decimal::from(watts_count)
    } else {
        Decimal::from(SENTINEL)
    };

    Ok(RangingSummary {
        max_volts,
        max_amps,
        mean_watts,
    })
}

fn update_max(slot: &mut Option<Decimal>, candidate: Decimal) {
    *slot = Some(match *slot {
        Some(current) if current >= candidate => current,
        _ => candidate,
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn write_log(dir: &Path, name: &str, lines: &[&str]) -> std::path::PathBuf {
        let path = dir.join(name);
        std::fs::write(&path, lines.join("\n") + "\n").unwrap();
        path
    }

    #[test]
    fn single_channel_closed_form() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_log(
            dir.path(),
            "ranging.log",
            &[
                "Time,2024-01-01T00:00:00,Watts,10.5,Volts,120.1,Amps,1.1,PF,0.9,Mark,s_ranging",
                "Time,2024-01-01T00:00:01,Watts,20.25,Volts,121.3,Amps,1.4,PF,0.9,Mark,s_ranging",
                "Time,2024-01-01T00:00:02,Watts,0.0,Volts,119.9,Amps,0.1,PF,0.9,Mark,other",
            ],
        );
        let summary = derive_ranging_summary(&path, "s_ranging", 0, 0, Duration::from_secs(5)).unwrap();
        assert_eq!(summary.max_volts, Decimal::from_str("121.3").unwrap());
        assert_eq!(summary.max_amps, Decimal::from_str("1.4").unwrap());
        assert_eq!(summary.mean_watts, Decimal::from_str("15.375").unwrap());
    }

    #[test]
    fn too_fast_promotes_to_measurement_ended_too_fast() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_log(
            dir.path(),
            "ranging.log",
            &["Time,t,Watts,0,Volts,0,Amps,0,PF,0,Mark,s_ranging"],
        );
        let err = derive_ranging_summary(&path, "s_ranging", 0, 0, Duration::from_millis(100))
            .unwrap_err();
        assert!(err.to_string().contains("MeasurementEndedTooFast"));
    }

    #[test]
    fn zero_matching_rows_also_promotes_to_measurement_ended_too_fast() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_log(
            dir.path(),
            "ranging.log",
            &["Time,t,Watts,10,Volts,120,Amps,1,PF,1,Mark,other"],
        );
        let err = derive_ranging_summary(&path, "s_ranging", 0, 0, Duration::from_millis(100))
            .unwrap_err();
        assert!(err.to_string().contains("MeasurementEndedTooFast"));
    }

    #[test]
    fn zero_matching_rows_past_the_too_fast_window_is_no_samples_matched() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_log(
            dir.path(),
            "ranging.log",
            &["Time,t,Watts,10,Volts,120,Amps,1,PF,1,Mark,other"],
        );
        let err = derive_ranging_summary(&path, "s_ranging", 0, 0, Duration::from_secs(5)).unwrap_err();
        assert!(err.to_string().contains("no samples matched"));
    }

    #[test]
    fn multichannel_missing_expected_channel_is_extra_channel_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_log(
            dir.path(),
            "ranging.log",
            &["Time,t,Watts,0,Volts,0,Amps,0,PF,0,Mark,s_ranging,Ch1,Watts,5,Volts,10,Amps,1,PF,1"],
        );
        let err = derive_ranging_summary(&path, "s_ranging", 1, 2, Duration::from_secs(5)).unwrap_err();
        assert!(err.to_string().contains("extra channel"));
    }

    #[test]
    fn decimal_precision_is_preserved() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_log(
            dir.path(),
            "ranging.log",
            &["Time,t,Watts,1.100,Volts,120.00,Amps,0.500,PF,1,Mark,s_ranging"],
        );
        let summary = derive_ranging_summary(&path, "s_ranging", 0, 0, Duration::from_secs(5)).unwrap();
        assert_eq!(summary.max_volts.to_string(), "120.00");
        assert_eq!(summary.max_amps.to_string(), "0.500");
    }
}
