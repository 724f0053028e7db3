//! PTD supervisor: one instance per configured analyzer. Owns the PTD
//! child process, its control-channel TCP connection, and the tee that
//! drains its combined stdout/stderr to a log file.
//!
//! The subprocess lifecycle (spawn with piped stdio, track the `Child`,
//! drain it on a dedicated task, kill-after-timeout on teardown) follows
//! the same shape as the coordinator's server-process bookkeeping: a
//! tracked child handle plus a concurrent drain task, joined explicitly
//! before the supervisor reports itself terminated.

use crate::config::AnalyzerConfig;
use anyhow::{anyhow, bail, Context, Result};
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::str::FromStr;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::process::{Child, Command};
use tokio::time::sleep;
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PtdState {
    Absent,
    Starting,
    Connected,
    Running,
    Stopped,
    Terminated,
}

/// One `{cmd, reply}` exchange with PTD, stamped with wall time, as
/// recorded into the session descriptor's `ptd_messages`.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct PtdMessage {
    pub cmd: String,
    pub reply: String,
    pub time: DateTime<Utc>,
}

/// The initial voltage/amps ranges captured from PTD's `RR` reply at
/// startup, restored verbatim when the supervisor terminates.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InitialRange {
    Explicit(String),
    Auto,
}

impl std::fmt::Display for InitialRange {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            InitialRange::Explicit(v) => write!(f, "{v}"),
            InitialRange::Auto => write!(f, "Auto"),
        }
    }
}

pub struct PtdSupervisor {
    pub analyzer: AnalyzerConfig,
    pub state: PtdState,
    child: Option<Child>,
    stream: Option<TcpStream>,
    log_path: PathBuf,
    pub trace: Vec<PtdMessage>,
    pub initial_volts: Option<InitialRange>,
    pub initial_amps: Option<InitialRange>,
    pub identify_reply: Option<String>,
    tee_done: Option<tokio::task::JoinHandle<()>>,
}

impl PtdSupervisor {
    pub fn new(analyzer: AnalyzerConfig, log_path: PathBuf) -> Self {
        Self {
            analyzer,
            state: PtdState::Absent,
            child: None,
            stream: None,
            log_path,
            trace: Vec::new(),
            initial_volts: None,
            initial_amps: None,
            identify_reply: None,
            tee_done: None,
        }
    }

    /// Spawns PTD, connects to its control port, and captures initial
    /// ranges. Refuses to start if the control port is already bound.
    pub async fn start(&mut self, ptd_binary: &Path) -> Result<()> {
        if TcpStream::connect(("127.0.0.1", self.analyzer.network_port)).await.is_ok() {
            bail!("PTD control port {} is already bound", self.analyzer.network_port);
        }

        self.state = PtdState::Starting;

        let mut cmd = Command::new(ptd_binary);
        cmd.arg("-t").arg(self.analyzer.device_type.to_string());
        cmd.arg("-p").arg(self.analyzer.network_port.to_string());
        cmd.arg("-d").arg(&self.analyzer.device_port);
        if let Some(flag) = &self.analyzer.interface_flag {
            cmd.arg("-i").arg(flag);
        }
        if self.analyzer.dc_flag {
            cmd.arg("--dc");
        }
        match self.analyzer.channel {
            crate::config::ChannelSpec::Single(a) => {
                cmd.arg("-c").arg(a.to_string());
            }
            crate::config::ChannelSpec::Multi { start, count } => {
                cmd.arg("-c").arg(format!("{start},{count}"));
            }
        }
        if let Some(board) = self.analyzer.gpib_board {
            cmd.arg("-g").arg(board.to_string());
        }
        cmd.arg("-l").arg(&self.log_path);
        cmd.env("TZ", "UTC");
        cmd.stdin(Stdio::null());
        cmd.stdout(Stdio::piped());
        cmd.stderr(Stdio::piped());

        let mut child = cmd
            .spawn()
            .with_context(|| format!("failed to spawn PTD for analyzer {}", self.analyzer.index))?;

        let stdout = child.stdout.take().expect("piped stdout");
        let stderr = child.stderr.take().expect("piped stderr");
        let tee_log = tokio::fs::File::create(&self.log_path).await?;
        self.tee_done = Some(tokio::spawn(tee_task(stdout, stderr, tee_log)));
        self.child = Some(child);

        let mut attempts = 0;
        let stream = loop {
            if let Some(child) = &mut self.child {
                if child.try_wait()?.is_some() {
                    bail!("PTD process for analyzer {} exited before accepting a connection", self.analyzer.index);
                }
            }
            match TcpStream::connect(("127.0.0.1", self.analyzer.network_port)).await {
                Ok(s) => break s,
                Err(_) if attempts < 300 => {
                    attempts += 1;
                    sleep(Duration::from_millis(100)).await;
                }
                Err(e) => {
                    return Err(anyhow!(
                        "failed to connect to PTD control port {} after 300 attempts: {e}",
                        self.analyzer.network_port
                    ))
                }
            }
        };
        self.stream = Some(stream);
        self.state = PtdState::Connected;

        let hello = self.cmd("Hello").await?;
        if hello != "Hello, PTDaemon here!" {
            bail!("unexpected PTD hello reply: {hello:?}");
        }

        let identify = self.cmd("Identify").await?;
        info!(analyzer = self.analyzer.index, %identify, "PTD identified");
        self.identify_reply = Some(identify);

        let rr = self.cmd("RR").await?;
        let (volts, amps) = parse_ranges_reply(&rr)?;
        self.initial_volts = Some(volts);
        self.initial_amps = Some(amps);

        Ok(())
    }

    /// Writes `s` and reads exactly one reply line, appending the exchange
    /// to the PTD message trace. A dead process or missing reply is fatal.
    pub async fn cmd(&mut self, s: &str) -> Result<String> {
        let stream = self
            .stream
            .as_mut()
            .ok_or_else(|| anyhow!("PTD supervisor {} has no control connection", self.analyzer.index))?;

        stream
            .write_all(format!("{s}\r\n").as_bytes())
            .await
            .with_context(|| format!("writing PTD command {s:?}"))?;

        let mut reader = BufReader::new(stream);
        let mut line = String::new();
        let n = reader
            .read_line(&mut line)
            .await
            .with_context(|| format!("reading PTD reply to {s:?}"))?;
        if n == 0 {
            bail!("PTD process for analyzer {} closed the control connection", self.analyzer.index);
        }
        let reply = line.trim_end().to_string();

        self.trace.push(PtdMessage {
            cmd: s.to_string(),
            reply: reply.clone(),
            time: Utc::now(),
        });

        Ok(reply)
    }

    /// Issues `Stop`, tolerating the "no measurement to stop" reply. Does
    /// not disconnect or terminate the process.
    pub async fn stop(&mut self) -> Result<String> {
        self.cmd("Stop").await
    }

    /// `RL,*,*` with the documented fallback probe order, parsing the
    /// "Last N samples" header and reading exactly N CSV lines.
    pub async fn grab_power_data(&mut self) -> Result<Vec<String>> {
        let header = match self.cmd("RL,*,*").await {
            Ok(h) if h.contains("Invalid number of parameters") => self.cmd("RL").await?,
            Ok(h) if h.contains("Unknown command") => self.cmd("DC-RL").await?,
            Ok(h) => h,
            Err(e) => return Err(e),
        };

        let n: usize = header
            .rsplit_once("Last ")
            .and_then(|(_, rest)| rest.split_whitespace().next())
            .and_then(|tok| tok.parse().ok())
            .ok_or_else(|| anyhow!("could not parse sample count from RL header {header:?}"))?;

        let stream = self
            .stream
            .as_mut()
            .ok_or_else(|| anyhow!("PTD supervisor {} has no control connection", self.analyzer.index))?;
        let mut reader = BufReader::new(stream);
        let mut rows = Vec::with_capacity(n);
        for _ in 0..n {
            let mut line = String::new();
            reader.read_line(&mut line).await?;
            rows.push(line.trim_end().to_string());
        }

        self.cmd("Uncertainty").await?;
        self.cmd("Watts").await?;

        Ok(rows)
    }

    /// Restores the initial ranges (volts before amps, never inverted),
    /// closes the socket, terminates the process, waits up to 10s, then
    /// kills. Joins the tee task so the log file isn't truncated.
    pub async fn terminate(&mut self) -> Result<()> {
        if let (Some(volts), Some(amps)) = (self.initial_volts.clone(), self.initial_amps.clone()) {
            let _ = self.cmd(&format!("SR,V,{volts}")).await;
            let _ = self.cmd(&format!("SR,A,{amps}")).await;
        }

        if let Some(mut stream) = self.stream.take() {
            let _ = stream.shutdown().await;
        }

        if let Some(mut child) = self.child.take() {
            let _ = child.start_kill();
            match tokio::time::timeout(Duration::from_secs(10), child.wait()).await {
                Ok(Ok(_)) => {}
                _ => {
                    warn!(analyzer = self.analyzer.index, "PTD did not exit within 10s; killing");
                    let _ = child.kill().await;
                }
            }
        }

        if let Some(handle) = self.tee_done.take() {
            handle.await.ok();
        }

        self.state = PtdState::Terminated;
        Ok(())
    }
}

async fn tee_task(
    stdout: tokio::process::ChildStdout,
    stderr: tokio::process::ChildStderr,
    mut log_file: tokio::fs::File,
) {
    use tokio::io::AsyncReadExt;
    let mut stdout = BufReader::new(stdout);
    let mut stderr_reader = BufReader::new(stderr);
    let mut out_buf = [0u8; 4096];
    let mut err_buf = [0u8; 4096];

    loop {
        tokio::select! {
            n = stdout.read(&mut out_buf) => {
                match n {
                    Ok(0) => break,
                    Ok(n) => {
                        let _ = tokio::io::AsyncWriteExt::write_all(&mut log_file, &out_buf[..n]).await;
                    }
                    Err(e) => {
                        error!("PTD stdout tee error: {e}");
                        break;
                    }
                }
            }
            n = stderr_reader.read(&mut err_buf) => {
                match n {
                    Ok(0) => {}
                    Ok(n) => {
                        let _ = tokio::io::AsyncWriteExt::write_all(&mut log_file, &err_buf[..n]).await;
                        let _ = tokio::io::stderr().write_all(&err_buf[..n]).await;
                    }
                    Err(e) => {
                        error!("PTD stderr tee error: {e}");
                    }
                }
            }
        }
    }
    debug!("PTD tee task finished");
}

pub(crate) fn parse_ranges_reply(reply: &str) -> Result<(InitialRange, InitialRange)> {
    let rest = reply
        .strip_prefix("Ranges,")
        .ok_or_else(|| anyhow!("unexpected RR reply: {reply:?}"))?;
    let parts: Vec<&str> = rest.split(',').collect();
    if parts.len() != 4 {
        bail!("unexpected RR reply shape: {reply:?}");
    }
    let a_auto = parts[0];
    let a_range = parts[1];
    let v_auto = parts[2];
    let v_range = parts[3];

    let amps = resolve_initial_range(a_auto, a_range)?;
    let volts = resolve_initial_range(v_auto, v_range)?;
    Ok((volts, amps))
}

fn resolve_initial_range(auto_flag: &str, range: &str) -> Result<InitialRange> {
    let is_auto = auto_flag != "0";
    if is_auto {
        return Ok(InitialRange::Auto);
    }
    let value = Decimal::from_str(range).map_err(|_| anyhow!("non-decimal range value {range:?}"))?;
    if value <= Decimal::ZERO {
        return Ok(InitialRange::Auto);
    }
    Ok(InitialRange::Explicit(range.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_explicit_ranges() {
        let (volts, amps) = parse_ranges_reply("Ranges,0,5,0,250").unwrap();
        assert_eq!(volts, InitialRange::Explicit("250".to_string()));
        assert_eq!(amps, InitialRange::Explicit("5".to_string()));
    }

    #[test]
    fn auto_flag_or_nonpositive_range_yields_auto() {
        let (volts, amps) = parse_ranges_reply("Ranges,1,5,0,-1").unwrap();
        assert_eq!(amps, InitialRange::Auto);
        assert_eq!(volts, InitialRange::Auto);
    }

    #[test]
    fn rejects_malformed_reply() {
        assert!(parse_ranges_reply("Bogus").is_err());
    }
}
