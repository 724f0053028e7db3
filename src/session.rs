//! The session state machine: owns the RANGING/TESTING transitions, derives
//! testing-mode ranges from ranging-mode measurements, and records the
//! four-checkpoint timestamps each phase needs for cross-endpoint audit.
//!
//! Barrier fan-out across analyzers (`Go`, `Stop`, initial-range commands)
//! uses `tokio::sync::Barrier` the same way a fixed set of concurrent tasks
//! is synchronized elsewhere in this codebase's ancestry: one short-lived
//! worker per analyzer, joined at a shared barrier before the coordinator
//! advances state.
//!
//! Cancellation does not poll a process-global signal-handler flag; a
//! `CancellationToken` is threaded in from the controller and checked at
//! every suspension point (sleeps, barrier waits), so a signal simply
//! cancels the token rather than mutating global state.

use crate::config::{AnalyzerConfig, ControllerConfig};
use crate::logparse::derive_ranging_summary;
use crate::merger::merge_logs;
use crate::ptd::PtdSupervisor;
use anyhow::{anyhow, bail, Result};
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Barrier;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

#[cfg(debug_assertions)]
const ANALYZER_SLEEP: Duration = Duration::from_millis(500);
#[cfg(not(debug_assertions))]
const ANALYZER_SLEEP: Duration = Duration::from_secs(10);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Initial,
    Ranging,
    RangingDone,
    Testing,
    TestingDone,
    Done,
}

/// Wall and monotonic time recorded at one of the four per-phase
/// checkpoints: 0 phase begin, 1 Go issued, 2 Stop issued, 3 phase end.
#[derive(Debug, Clone, Copy)]
pub struct Checkpoint {
    pub monotonic: Instant,
    pub wall: DateTime<Utc>,
}

#[derive(Debug, Clone, Default)]
pub struct PhaseCheckpoints {
    pub marks: Vec<Checkpoint>,
}

impl PhaseCheckpoints {
    fn record(&mut self) {
        self.marks.push(Checkpoint {
            monotonic: Instant::now(),
            wall: Utc::now(),
        });
    }
}

pub struct Session {
    pub name: String,
    pub server_uuid: uuid::Uuid,
    pub client_uuid: uuid::Uuid,
    pub state: SessionState,
    pub supervisors: Vec<PtdSupervisor>,
    pub config: ControllerConfig,
    pub session_dir: PathBuf,
    pub ranging_checkpoints: PhaseCheckpoints,
    pub testing_checkpoints: PhaseCheckpoints,
    pub desired_amps: Vec<Decimal>,
    pub max_volts: Vec<Decimal>,
    cancel: CancellationToken,
}

/// Sleeps for `ANALYZER_SLEEP`, returning early with an error if `cancel`
/// fires first; the session transitions to DONE when this happens.
async fn interruptible_sleep(cancel: &CancellationToken) -> Result<()> {
    tokio::select! {
        _ = tokio::time::sleep(ANALYZER_SLEEP) => Ok(()),
        _ = cancel.cancelled() => Err(anyhow!("session cancelled during ANALYZER_SLEEP")),
    }
}

impl Session {
    pub fn new(
        name: String,
        server_uuid: uuid::Uuid,
        client_uuid: uuid::Uuid,
        config: ControllerConfig,
        session_dir: PathBuf,
        cancel: CancellationToken,
    ) -> Self {
        let supervisors = config
            .analyzers
            .iter()
            .cloned()
            .map(|analyzer| {
                let log_path = session_dir.join(format!("ptd_{}.log", analyzer.index));
                PtdSupervisor::new(analyzer, log_path)
            })
            .collect();

        Self {
            name,
            server_uuid,
            client_uuid,
            state: SessionState::Initial,
            supervisors,
            config,
            session_dir,
            ranging_checkpoints: PhaseCheckpoints::default(),
            testing_checkpoints: PhaseCheckpoints::default(),
            desired_amps: Vec::new(),
            max_volts: Vec::new(),
            cancel,
        }
    }

    fn mark_ranging(&self) -> String {
        format!("{}_ranging", self.name)
    }

    fn mark_testing(&self) -> String {
        format!("{}_testing", self.name)
    }

    /// `start,ranging`. Idempotent if already in RANGING.
    pub async fn start_ranging(&mut self) -> Result<()> {
        if self.state == SessionState::Ranging {
            return Ok(());
        }
        if self.state != SessionState::Initial {
            bail!("cannot start ranging from state {:?}", self.state);
        }

        self.ranging_checkpoints.record(); // checkpoint 0

        for sup in &mut self.supervisors {
            sup.start(&self.config.ptd_binary).await?;
        }

        let ranging_mode = self.config.ranging_mode;
        fan_out(&mut self.supervisors, &self.cancel, move |sup| {
            let amps_value = match ranging_mode {
                crate::config::RangingMode::Auto => "Auto".to_string(),
                crate::config::RangingMode::Max => crate::config::max_range_for_device(sup.analyzer.device_type)
                    .map(|v| v.to_string())
                    .unwrap_or_else(|| "Auto".to_string()),
            };
            Box::pin(async move {
                sup.cmd("SR,V,Auto").await?;
                sup.cmd(&format!("SR,A,{amps_value}")).await?;
                Ok(())
            })
        })
        .await?;

        interruptible_sleep(&self.cancel).await.map_err(|e| {
            self.state = SessionState::Done;
            e
        })?;

        self.ranging_checkpoints.record(); // checkpoint 1: Go issued
        let mark = self.mark_ranging();
        fan_out(&mut self.supervisors, &self.cancel, move |sup| {
            let mark = mark.clone();
            Box::pin(async move { sup.cmd(&format!("Go,1000,0,{mark}")).await.map(|_| ()) })
        })
        .await?;

        self.state = SessionState::Ranging;
        Ok(())
    }

    /// `stop,ranging`.
    pub async fn stop_ranging(&mut self) -> Result<()> {
        if self.state == SessionState::RangingDone {
            return Ok(());
        }
        if self.state != SessionState::Ranging {
            bail!("cannot stop ranging from state {:?}", self.state);
        }

        interruptible_sleep(&self.cancel).await?;
        self.ranging_checkpoints.record(); // checkpoint 2: Stop issued

        fan_out(&mut self.supervisors, &self.cancel, |sup| {
            Box::pin(async move { sup.stop().await.map(|_| ()) })
        })
        .await?;

        let mark = self.mark_ranging();
        let elapsed = self
            .ranging_checkpoints
            .marks
            .get(1)
            .map(|c| c.monotonic.elapsed())
            .unwrap_or_default();

        self.desired_amps.clear();
        self.max_volts.clear();
        let mut spl_lines = Vec::new();
        for sup in &mut self.supervisors {
            let rows = sup.grab_power_data().await?;
            let log_path = self.session_dir.join(format!("ptd_{}.log", sup.analyzer.index));
            std::fs::write(&log_path, rows.join("\n"))?;

            let (start_chan, n_chans) = channel_bounds(&sup.analyzer);
            let summary = derive_ranging_summary(&log_path, &mark, start_chan, n_chans, elapsed)?;
            self.max_volts.push(summary.max_volts);
            self.desired_amps.push(summary.max_amps * Decimal::new(11, 1));
            spl_lines.extend(rows);
        }

        std::fs::create_dir_all(self.session_dir.join("ranging"))?;
        std::fs::write(self.session_dir.join("ranging/spl.txt"), spl_lines.join("\n"))?;

        self.ranging_checkpoints.record(); // checkpoint 3: phase end
        self.state = SessionState::RangingDone;
        Ok(())
    }

    /// `start,testing` using ranges derived from RANGING. `client_ranges`
    /// overrides per-analyzer (volts, amps) when the director supplies
    /// pre-computed ranges instead (the `start,testing,<v>,<a>` variant).
    pub async fn start_testing(&mut self, client_ranges: Option<Vec<(Decimal, Decimal)>>) -> Result<()> {
        if self.state == SessionState::Testing {
            return Ok(());
        }
        if !matches!(self.state, SessionState::RangingDone | SessionState::Initial) {
            bail!("cannot start testing from state {:?}", self.state);
        }

        let (volts, amps) = match client_ranges {
            Some(v) => v.into_iter().unzip(),
            None => (self.max_volts.clone(), self.desired_amps.clone()),
        };
        if volts.len() != self.supervisors.len() {
            bail!("range count mismatch: expected {} analyzers", self.supervisors.len());
        }

        self.testing_checkpoints.record(); // checkpoint 0

        for (sup, (v, a)) in self.supervisors.iter_mut().zip(volts.iter().zip(amps.iter())) {
            let reply = sup.cmd(&format!("SR,V,{v}")).await?;
            if reply.starts_with("Error") {
                self.state = SessionState::Done;
                bail!("{reply}");
            }
            let reply = sup.cmd(&format!("SR,A,{a}")).await?;
            if reply.starts_with("Error") {
                self.state = SessionState::Done;
                bail!("{reply}");
            }
        }

        interruptible_sleep(&self.cancel).await?;
        self.testing_checkpoints.record(); // checkpoint 1: Go issued

        let mark = self.mark_testing();
        fan_out(&mut self.supervisors, &self.cancel, move |sup| {
            let mark = mark.clone();
            Box::pin(async move { sup.cmd(&format!("Go,1000,0,{mark}")).await.map(|_| ()) })
        })
        .await?;

        self.state = SessionState::Testing;
        Ok(())
    }

    /// `stop,testing`.
    pub async fn stop_testing(&mut self) -> Result<()> {
        if self.state == SessionState::TestingDone {
            return Ok(());
        }
        if self.state != SessionState::Testing {
            bail!("cannot stop testing from state {:?}", self.state);
        }

        interruptible_sleep(&self.cancel).await?;
        self.testing_checkpoints.record(); // checkpoint 2: Stop issued

        for sup in &mut self.supervisors {
            sup.cmd("Watts").await?;
            sup.cmd("Uncertainty").await?;
        }

        fan_out(&mut self.supervisors, &self.cancel, |sup| {
            Box::pin(async move { sup.stop().await.map(|_| ()) })
        })
        .await?;

        let mut per_analyzer_logs = Vec::new();
        let mut ptd_out = String::new();
        for sup in &mut self.supervisors {
            let rows = sup.grab_power_data().await?;
            let log_path = self.session_dir.join(format!("ptd_{}.log", sup.analyzer.index));
            std::fs::write(&log_path, rows.join("\n"))?;
            ptd_out.push_str(&rows.join("\n"));
            ptd_out.push('\n');
            per_analyzer_logs.push(log_path);
        }

        std::fs::create_dir_all(self.session_dir.join("run_1"))?;
        let skipped = merge_logs(&per_analyzer_logs, &self.session_dir.join("run_1/spl.txt"))?;
        if skipped > 0 {
            warn!(skipped, "merger skipped malformed rows");
        }
        std::fs::write(self.session_dir.join("run_1/ptd_out.txt"), ptd_out)?;

        self.testing_checkpoints.record(); // checkpoint 3: phase end
        self.state = SessionState::TestingDone;
        Ok(())
    }

    /// `done` or client disconnect: terminates every supervisor.
    pub async fn done(&mut self) -> Result<()> {
        for sup in &mut self.supervisors {
            sup.terminate().await?;
        }
        self.state = SessionState::Done;
        Ok(())
    }

    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }
}

fn channel_bounds(analyzer: &AnalyzerConfig) -> (u32, u32) {
    match analyzer.channel {
        crate::config::ChannelSpec::Single(_) => (0, 0),
        crate::config::ChannelSpec::Multi { start, count } => (start, count),
    }
}

type SupervisorTask<'a> = std::pin::Pin<Box<dyn std::future::Future<Output = Result<()>> + Send + 'a>>;

/// Fans `op` out to every supervisor in parallel and waits for all to
/// complete (or cancel) before returning, mirroring the barrier-synchronized
/// Go/Stop fan-out the session state machine needs whenever more than one
/// analyzer is configured.
async fn fan_out<'a, F>(
    supervisors: &'a mut [PtdSupervisor],
    cancel: &CancellationToken,
    mut op: F,
) -> Result<()>
where
    F: FnMut(&'a mut PtdSupervisor) -> SupervisorTask<'a>,
{
    if supervisors.len() == 1 {
        return op(&mut supervisors[0]).await;
    }

    let barrier = Arc::new(Barrier::new(supervisors.len()));
    let mut handles = Vec::with_capacity(supervisors.len());

    for sup in supervisors.iter_mut() {
        let barrier = Arc::clone(&barrier);
        let fut = op(sup);
        handles.push(async move {
            let result = fut.await;
            barrier.wait().await;
            result
        });
    }

    tokio::select! {
        results = futures_join_all(handles) => {
            for r in results {
                r?;
            }
            Ok(())
        }
        _ = cancel.cancelled() => Err(anyhow!("session cancelled during barrier fan-out")),
    }
}

/// Stand-in for `futures::future::join_all` so this module doesn't need the
/// full `futures` crate for one call site. Every pending future is polled on
/// each wake rather than awaited one at a time: `fan_out`'s futures each
/// block on a shared `Barrier`, so awaiting them sequentially would stall
/// the first one forever waiting for parties that never get polled.
async fn futures_join_all<F: std::future::Future>(futs: Vec<F>) -> Vec<F::Output> {
    use std::future::Future;
    use std::task::Poll;

    let mut futs: Vec<_> = futs.into_iter().map(Box::pin).collect();
    let mut results: Vec<Option<F::Output>> = futs.iter().map(|_| None).collect();

    std::future::poll_fn(move |cx| {
        let mut pending = false;
        for (slot, fut) in results.iter_mut().zip(futs.iter_mut()) {
            if slot.is_none() {
                match fut.as_mut().poll(cx) {
                    Poll::Ready(v) => *slot = Some(v),
                    Poll::Pending => pending = true,
                }
            }
        }
        if pending {
            Poll::Pending
        } else {
            Poll::Ready(results.iter_mut().map(|s| s.take().unwrap()).collect())
        }
    })
    .await
}

pub fn parse_client_range(v: &str, a: &str) -> Result<(Decimal, Decimal)> {
    Ok((
        Decimal::from_str(v).map_err(|_| anyhow!("invalid voltage range {v:?}"))?,
        Decimal::from_str(a).map_err(|_| anyhow!("invalid amps range {a:?}"))?,
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn channel_bounds_single_is_zero_zero() {
        let analyzer = AnalyzerConfig {
            index: 0,
            device_type: 49,
            network_port: 8889,
            device_port: "x".into(),
            interface_flag: None,
            dc_flag: false,
            channel: crate::config::ChannelSpec::Single(2),
            gpib_board: None,
        };
        assert_eq!(channel_bounds(&analyzer), (0, 0));
    }

    #[test]
    fn parse_client_range_roundtrips_decimals() {
        let (v, a) = parse_client_range("120.5", "5.00").unwrap();
        assert_eq!(v.to_string(), "120.5");
        assert_eq!(a.to_string(), "5.00");
    }
}
