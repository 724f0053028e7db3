//! Folds N per-analyzer sample logs into one aggregate log: the merged row
//! keeps analyzer 1's time and mark, sums Watts across analyzers that
//! report a real value, and sets the primary Volts/Amps/PF to the sentinel
//! since they are no longer meaningful once multiple analyzers are summed.
//! Each analyzer's original Volts/Amps/PF are appended after the sentinel
//! tuple, one `A<k>,Volts,...,Amps,...,PF,...` group per analyzer, so they
//! stay retrievable rather than being discarded outright.

use crate::logparse::SENTINEL;
use anyhow::Result;
use rust_decimal::Decimal;
use std::path::Path;
use tracing::warn;

/// Merges `logs` (one path per analyzer, in analyzer order) into `dest`.
/// With a single analyzer the source file is copied verbatim. Malformed or
/// missing rows at a given line index are skipped with a warning; the
/// number of skipped rows is returned so callers can log a summary.
pub fn merge_logs(logs: &[impl AsRef<Path>], dest: &Path) -> Result<u64> {
    if logs.len() == 1 {
        std::fs::copy(logs[0].as_ref(), dest)?;
        return Ok(0);
    }

    let contents: Vec<Vec<String>> = logs
        .iter()
        .map(|p| -> Result<Vec<String>> {
            Ok(std::fs::read_to_string(p.as_ref())?
                .lines()
                .map(str::to_string)
                .collect())
        })
        .collect::<Result<_>>()?;

    let max_rows = contents.iter().map(Vec::len).max().unwrap_or(0);
    let mut out = String::new();
    let mut skipped = 0u64;

    for i in 0..max_rows {
        let rows: Vec<Option<&str>> = contents.iter().map(|c| c.get(i).map(String::as_str)).collect();
        match merge_row(&rows) {
            Some(merged) => {
                out.push_str(&merged);
                out.push('\n');
            }
            None => {
                skipped += 1;
                warn!(row = i, "skipping malformed or missing row during log merge");
            }
        }
    }

    std::fs::write(dest, out)?;
    Ok(skipped)
}

fn merge_row(rows: &[Option<&str>]) -> Option<String> {
    let primary = rows.first().copied().flatten()?;
    let primary_fields: Vec<&str> = primary.trim_end().split(',').collect();
    if primary_fields.len() < 12 || primary_fields[0] != "Time" || primary_fields[10] != "Mark" {
        return None;
    }
    let time = primary_fields[1];
    let mark = primary_fields[11];

    let mut total_watts = Decimal::ZERO;
    let mut any_contributed = false;
    let mut per_analyzer = Vec::new();

    for row in rows {
        let Some(line) = row else { continue };
        let fields: Vec<&str> = line.trim_end().split(',').collect();
        if fields.len() < 10 || fields[2] != "Watts" || fields[4] != "Volts" || fields[6] != "Amps" || fields[8] != "PF" {
            continue;
        }
        let Ok(watts) = fields[3].parse::<Decimal>() else {
            continue;
        };
        if watts != Decimal::from(SENTINEL) {
            total_watts += watts;
            any_contributed = true;
        }
        per_analyzer.push((fields[5], fields[7], fields[9]));
    }

    if !any_contributed {
        return None;
    }

    let mut out = format!("Time,{time},Watts,{total_watts},Volts,{SENTINEL},Amps,{SENTINEL},PF,{SENTINEL},Mark,{mark}");
    for (idx, (volts, amps, pf)) in per_analyzer.iter().enumerate() {
        out.push_str(&format!(",A{idx},Volts,{volts},Amps,{amps},PF,{pf}"));
    }
    Some(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn single_analyzer_is_copied_verbatim() {
        let dir = tempfile::tempdir().unwrap();
        let src = dir.path().join("a0.log");
        std::fs::write(&src, "Time,t,Watts,1,Volts,2,Amps,3,PF,4,Mark,m\n").unwrap();
        let dest = dir.path().join("merged.log");
        let skipped = merge_logs(&[&src], &dest).unwrap();
        assert_eq!(skipped, 0);
        assert_eq!(std::fs::read_to_string(&src).unwrap(), std::fs::read_to_string(&dest).unwrap());
    }

    #[test]
    fn two_analyzers_sum_watts_and_sentinel_the_rest() {
        let dir = tempfile::tempdir().unwrap();
        let a = dir.path().join("a0.log");
        let b = dir.path().join("a1.log");
        std::fs::write(
            &a,
            "Time,t0,Watts,10,Volts,1,Amps,1,PF,1,Mark,m\n\
             Time,t1,Watts,20,Volts,1,Amps,1,PF,1,Mark,m\n\
             Time,t2,Watts,30,Volts,1,Amps,1,PF,1,Mark,m\n",
        )
        .unwrap();
        std::fs::write(
            &b,
            "Time,t0,Watts,1,Volts,2,Amps,2,PF,2,Mark,m\n\
             Time,t1,Watts,2,Volts,2,Amps,2,PF,2,Mark,m\n\
             Time,t2,Watts,3,Volts,2,Amps,2,PF,2,Mark,m\n",
        )
        .unwrap();
        let dest = dir.path().join("merged.log");
        let skipped = merge_logs(&[&a, &b], &dest).unwrap();
        assert_eq!(skipped, 0);
        let merged = std::fs::read_to_string(&dest).unwrap();
        let lines: Vec<&str> = merged.lines().collect();
        assert_eq!(
            lines[0],
            "Time,t0,Watts,11,Volts,-1,Amps,-1,PF,-1,Mark,m,A0,Volts,1,Amps,1,PF,1,A1,Volts,2,Amps,2,PF,2"
        );
        assert_eq!(
            lines[1],
            "Time,t1,Watts,22,Volts,-1,Amps,-1,PF,-1,Mark,m,A0,Volts,1,Amps,1,PF,1,A1,Volts,2,Amps,2,PF,2"
        );
        assert_eq!(
            lines[2],
            "Time,t2,Watts,33,Volts,-1,Amps,-1,PF,-1,Mark,m,A0,Volts,1,Amps,1,PF,1,A1,Volts,2,Amps,2,PF,2"
        );
    }

    #[test]
    fn mismatched_row_counts_skip_rather_than_fail() {
        let dir = tempfile::tempdir().unwrap();
        let a = dir.path().join("a0.log");
        let b = dir.path().join("a1.log");
        std::fs::write(&a, "Time,t0,Watts,10,Volts,1,Amps,1,PF,1,Mark,m\n").unwrap();
        std::fs::write(
            &b,
            "Time,t0,Watts,1,Volts,2,Amps,2,PF,2,Mark,m\ngarbage\n",
        )
        .unwrap();
        let dest = dir.path().join("merged.log");
        let skipped = merge_logs(&[&a, &b], &dest).unwrap();
        assert_eq!(skipped, 1);
    }
}
