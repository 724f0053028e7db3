//! The director-side driver: runs on the system under test, drives the
//! workload through ranging and testing, and ships the resulting logs and
//! client-side descriptor to the controller.
//!
//! Follows the same "every non-`OK` is fatal unless told otherwise" shape
//! spec.md assigns the director, mirrored here as `expect_ok()` checked
//! against `--force`.

use crate::cli::DirectorArgs;
use crate::descriptor::{hash_tree, Descriptor, MessageRecord, Phases, Uuids};
use crate::protocol::{check_magic, magic_client, Proto, TcpProto, MAGIC_SERVER_PREFIX};
use crate::time_sync::{ntp_host_sync, remote_peer_sync};
use anyhow::{anyhow, bail, Context, Result};
use chrono::{DateTime, Utc};
use std::io::Write as _;
use std::path::{Path, PathBuf};
use std::time::Instant;
use tracing::{info, warn};

struct Checkpoint {
    monotonic: Instant,
    wall: DateTime<Utc>,
}

fn record() -> Checkpoint {
    Checkpoint {
        monotonic: Instant::now(),
        wall: Utc::now(),
    }
}

fn to_pairs(marks: &[Checkpoint]) -> Vec<(u128, i64)> {
    marks
        .iter()
        .map(|c| (c.monotonic.elapsed().as_nanos(), c.wall.timestamp_millis()))
        .collect()
}

pub struct Director {
    args: DirectorArgs,
    messages: Vec<MessageRecord>,
}

impl Director {
    pub fn new(args: DirectorArgs) -> Self {
        Self { args, messages: Vec::new() }
    }

    /// Runs the full `new → [ranging, testing] → done` sequence against the
    /// controller at `--addr`/`--port`.
    pub async fn run(mut self) -> Result<()> {
        let addr = if self.args.addr.contains(':') {
            self.args.addr.clone()
        } else {
            format!("{}:{}", self.args.addr, self.args.port)
        };

        let stream = tokio::net::TcpStream::connect(&addr)
            .await
            .with_context(|| format!("connecting to controller at {addr}"))?;
        let mut proto = TcpProto::new(stream)?;
        proto.enable_keepalive().ok();

        let client_magic = magic_client();
        proto.send_line(&client_magic).await?;
        let server_magic = proto.recv_line().await?;
        check_magic(&server_magic, MAGIC_SERVER_PREFIX)?;
        self.messages.push(MessageRecord { cmd: client_magic, reply: Some(server_magic) });

        if self.args.stop_server {
            self.exchange(&mut proto, "stop").await?;
        }

        let client_uuid = uuid::Uuid::new_v4();
        let label = self.args.label.clone().unwrap_or_default();
        let new_reply = self
            .exchange(&mut proto, &format!("new,{label},{client_uuid}"))
            .await?;
        let (session_name, server_uuid) = parse_new_reply(&new_reply)?;
        info!(session = %session_name, "session allocated");

        let session_output = self.args.output.join(&session_name);
        std::fs::create_dir_all(&session_output)
            .with_context(|| format!("creating session directory {}", session_output.display()))?;

        let mut ranging_checkpoints = Vec::new();
        let mut testing_checkpoints = Vec::new();

        for mode in ["ranging", "testing"] {
            let checkpoints = if mode == "ranging" {
                &mut ranging_checkpoints
            } else {
                &mut testing_checkpoints
            };

            checkpoints.push(record());

            let ntp_server = self.args.ntp.clone();
            let sync_result = remote_peer_sync(
                || -> Result<DateTime<Utc>> {
                    let secs: i64 = futures_block_on_time_query(&mut proto)?;
                    DateTime::from_timestamp(secs, 0).ok_or_else(|| anyhow!("controller returned an unrepresentable timestamp"))
                },
                || ntp_host_sync(&ntp_server),
            );
            if let Err(e) = sync_result {
                warn!("clock sync before {mode} failed: {e}");
                if !self.args.force {
                    return Err(e);
                }
            }

            self.exchange(&mut proto, &format!("session,{session_name},start,{mode}")).await?;
            checkpoints.push(record());

            let phase_dir = session_output.join(mode);
            std::fs::create_dir_all(&phase_dir)?;
            self.run_workload(mode, &phase_dir)?;
            self.verify_loadgen_output()?;

            checkpoints.push(record());
            self.exchange(&mut proto, &format!("session,{session_name},stop,{mode}")).await?;
            checkpoints.push(record());

            move_loadgen_logs(&self.args.loadgen_logs, &phase_dir)?;

            if self.args.send_logs {
                self.upload_logs(&mut proto, &session_name, mode, &phase_dir).await?;
            }
        }

        let client_log_path = session_output.join("power/client.log");
        std::fs::create_dir_all(session_output.join("power"))?;
        if !client_log_path.exists() {
            std::fs::write(&client_log_path, b"")?;
        }

        let client_json_path = session_output.join("power/client.json");
        let descriptor = Descriptor {
            version: crate::descriptor::DESCRIPTOR_VERSION,
            timezone: crate::utils::local_utc_offset_seconds(),
            modules: Default::default(),
            sources: hash_tree(
                std::env::current_exe()?.parent().unwrap_or(Path::new(".")),
            )
            .unwrap_or_default(),
            messages: self.messages.clone(),
            ptd_messages: None,
            uuid: Uuids { client: client_uuid.to_string(), server: server_uuid.to_string() },
            session_name: session_name.clone(),
            results: hash_tree(&session_output).unwrap_or_default(),
            phases: Phases {
                ranging: to_pairs(&ranging_checkpoints),
                testing: to_pairs(&testing_checkpoints),
            },
            ptd_config: None,
        };
        descriptor.write(&client_json_path)?;

        self.upload_file(&mut proto, &session_name, "client.log", &client_log_path).await?;
        self.upload_file(&mut proto, &session_name, "client.json", &client_json_path).await?;

        self.exchange(&mut proto, &format!("session,{session_name},done")).await?;
        proto.close().await?;

        Ok(())
    }

    async fn exchange(&mut self, proto: &mut TcpProto, cmd: &str) -> Result<String> {
        proto.send_line(cmd).await?;
        let reply = proto.recv_line().await?;
        self.messages.push(MessageRecord {
            cmd: cmd.to_string(),
            reply: if cmd == "time" { None } else { Some(reply.clone()) },
        });
        if !reply.starts_with("OK") && !self.args.force {
            bail!("controller rejected {cmd:?}: {reply}");
        }
        Ok(reply)
    }

    fn run_workload(&self, mode: &str, phase_dir: &Path) -> Result<()> {
        let ranging_flag = if mode == "ranging" { "1" } else { "0" };
        let status = std::process::Command::new("sh")
            .arg("-c")
            .arg(&self.args.run_workload)
            .env("ranging", ranging_flag)
            .env("out", phase_dir)
            .status()
            .with_context(|| format!("failed to launch workload command for {mode}"))?;
        if !status.success() && !self.args.force {
            bail!("workload command exited with {status} during {mode}");
        }
        Ok(())
    }

    fn verify_loadgen_output(&self) -> Result<()> {
        let has_entries = std::fs::read_dir(&self.args.loadgen_logs)
            .with_context(|| format!("reading loadgen log directory {}", self.args.loadgen_logs.display()))?
            .next()
            .is_some();
        if !has_entries && !self.args.force {
            bail!(
                "workload did not write any files into {}",
                self.args.loadgen_logs.display()
            );
        }
        Ok(())
    }

    async fn upload_logs(&mut self, proto: &mut TcpProto, session: &str, mode: &str, phase_dir: &Path) -> Result<()> {
        let zip_path = phase_dir.with_extension("zip");
        zip_dir(&self.args.loadgen_logs, &zip_path)?;
        self.upload_file(proto, session, &format!("{mode}_logs"), &zip_path).await
    }

    /// Unlike other commands, `upload` expects the file frames to follow the
    /// command line immediately; the controller's single `OK` reply only
    /// arrives after the whole file has been received, so this bypasses
    /// [`Self::exchange`]'s send-then-immediately-await-reply shape.
    async fn upload_file(&mut self, proto: &mut TcpProto, session: &str, what: &str, path: &Path) -> Result<()> {
        let cmd = format!("session,{session},upload,{what}");
        proto.send_line(&cmd).await?;
        let data = std::fs::read(path).with_context(|| format!("reading {} for upload", path.display()))?;
        proto.send_file(&data).await?;
        let reply = proto.recv_line().await?;
        self.messages.push(MessageRecord { cmd, reply: Some(reply.clone()) });
        if !reply.starts_with("OK") && !self.args.force {
            bail!("controller rejected upload of {what:?}: {reply}");
        }
        Ok(())
    }
}

fn parse_new_reply(reply: &str) -> Result<(String, uuid::Uuid)> {
    let rest = reply
        .strip_prefix("OK ")
        .ok_or_else(|| anyhow!("unexpected reply to new: {reply:?}"))?;
    let (name, uuid_str) = rest
        .rsplit_once(',')
        .ok_or_else(|| anyhow!("malformed new reply: {reply:?}"))?;
    let uuid = uuid_str.parse().context("controller returned an invalid server uuid")?;
    Ok((name.to_string(), uuid))
}

fn move_loadgen_logs(loadgen_logs: &Path, phase_dir: &Path) -> Result<()> {
    for entry in std::fs::read_dir(loadgen_logs)? {
        let entry = entry?;
        let dest = phase_dir.join(entry.file_name());
        std::fs::rename(entry.path(), dest)?;
    }
    Ok(())
}

fn zip_dir(src: &Path, dest: &Path) -> Result<()> {
    let file = std::fs::File::create(dest)?;
    let mut zip = zip::ZipWriter::new(file);
    let options = zip::write::FileOptions::default().compression_method(zip::CompressionMethod::Deflated);

    for entry in std::fs::read_dir(src)? {
        let entry = entry?;
        if entry.path().is_dir() {
            continue;
        }
        let name = entry.file_name().to_string_lossy().into_owned();
        zip.start_file(name, options)?;
        let data = std::fs::read(entry.path())?;
        zip.write_all(&data)?;
    }
    zip.finish()?;
    Ok(())
}

/// Blocking helper: the `time` command is a single request/reply exchange,
/// but [`remote_peer_sync`] expects a synchronous closure so it can bracket
/// it with two wall-clock reads without an async boundary in between.
fn futures_block_on_time_query(proto: &mut TcpProto) -> Result<i64> {
    tokio::task::block_in_place(|| {
        tokio::runtime::Handle::current().block_on(async {
            proto.send_line("time").await?;
            let reply = proto.recv_line().await?;
            reply.trim().parse::<i64>().context("controller returned a non-numeric time reply")
        })
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_new_reply() {
        let (name, uuid) = parse_new_reply("OK 2024-01-02_03-04-05_lbl,550e8400-e29b-41d4-a716-446655440000").unwrap();
        assert_eq!(name, "2024-01-02_03-04-05_lbl");
        assert_eq!(uuid.to_string(), "550e8400-e29b-41d4-a716-446655440000");
    }

    #[test]
    fn rejects_malformed_new_reply() {
        assert!(parse_new_reply("Error: bad label").is_err());
    }
}
