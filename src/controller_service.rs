//! The controller's long-running listener: accepts one director connection
//! at a time, dispatches protocol commands to the session state machine and
//! PTD supervisors, and writes `server.json` when a connection closes.
//!
//! Shutdown is driven by a `CancellationToken` rather than a process-global
//! signal-handler flag: `tokio::signal::ctrl_c()` is awaited in a loop by
//! the binary's `main`, and the first signal cancels the token; suspension
//! points inside the session state machine poll it directly rather than
//! checking a shared boolean.

use crate::config::ControllerConfig;
use crate::descriptor::{hash_tree, Descriptor, MessageRecord, Phases, PtdMessageRecord, Uuids};
use crate::protocol::{check_magic, magic_server, Proto, MAGIC_CLIENT_PREFIX};
use crate::session::{parse_client_range, Session};
use crate::utils::{is_valid_label, local_utc_offset_seconds, session_name};
use anyhow::{Context, Result};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

pub struct ControllerService {
    config: ControllerConfig,
    sessions_root: PathBuf,
    cancel: CancellationToken,
    stop_after_disconnect: Arc<Mutex<bool>>,
}

impl ControllerService {
    pub fn new(config: ControllerConfig, sessions_root: PathBuf, cancel: CancellationToken) -> Self {
        Self {
            config,
            sessions_root,
            cancel,
            stop_after_disconnect: Arc::new(Mutex::new(false)),
        }
    }

    /// Binds the listening socket and serves connections until the
    /// cancellation token fires or a client sends `stop`.
    pub async fn run(self) -> Result<()> {
        let listener = TcpListener::bind(self.config.listen_addr)
            .await
            .with_context(|| format!("binding controller listener on {}", self.config.listen_addr))?;
        info!(addr = %self.config.listen_addr, "controller listening");

        loop {
            let accept = tokio::select! {
                a = listener.accept() => a,
                _ = self.cancel.cancelled() => {
                    info!("cancellation requested; controller shutting down");
                    return Ok(());
                }
            };

            let (stream, peer) = match accept {
                Ok(v) => v,
                Err(e) => {
                    warn!("accept failed: {e}");
                    continue;
                }
            };
            info!(%peer, "director connected");

            let mut proto = crate::protocol::TcpProto::new(stream)?;
            proto.enable_keepalive().ok();

            match self.handle_connection(&mut proto).await {
                Ok(()) => {}
                Err(e) => error!("connection from {peer} ended with error: {e}"),
            }

            if *self.stop_after_disconnect.lock().await {
                info!("stop flag set; controller exiting after this director disconnected");
                return Ok(());
            }
        }
    }

    async fn handle_connection(&self, proto: &mut dyn Proto) -> Result<()> {
        let client_magic = proto.recv_line().await?;
        check_magic(&client_magic, MAGIC_CLIENT_PREFIX)?;
        proto.send_line(&magic_server()).await?;

        let mut messages: Vec<MessageRecord> = vec![MessageRecord {
            cmd: client_magic.clone(),
            reply: Some(magic_server()),
        }];

        let mut ptd_messages: Vec<PtdMessageRecord> = Vec::new();
        let mut session: Option<Session> = None;
        let mut server_uuid = uuid::Uuid::nil();
        let mut session_dir = self.sessions_root.clone();

        loop {
            let line = match proto.recv_line().await {
                Ok(l) => l,
                Err(_) => break, // disconnect
            };

            let reply = match self.handle_command(proto, &line, &mut session, &mut server_uuid, &mut session_dir).await {
                Ok(reply) => reply,
                Err(e) => {
                    error!("command {line:?} failed: {e}");
                    format!("Error: {e}")
                }
            };

            messages.push(MessageRecord {
                cmd: line.clone(),
                reply: if line == "time" { None } else { Some(reply.clone()) },
            });

            if line == "stop" {
                *self.stop_after_disconnect.lock().await = true;
            }

            proto.send_line(&reply).await?;

            if line.starts_with("session,") && line.ends_with(",done") {
                break;
            }
        }

        if let Some(mut s) = session.take() {
            for sup in &s.supervisors {
                ptd_messages.extend(sup.trace.iter().map(|m| PtdMessageRecord {
                    cmd: m.cmd.clone(),
                    reply: m.reply.clone(),
                }));
            }
            s.done().await.ok();

            let descriptor = Descriptor {
                version: crate::descriptor::DESCRIPTOR_VERSION,
                timezone: local_utc_offset_seconds(),
                modules: Default::default(),
                sources: hash_tree(&std::env::current_exe().unwrap_or_default().parent().unwrap_or(&PathBuf::from(".")))
                    .unwrap_or_default(),
                messages,
                ptd_messages: Some(ptd_messages),
                uuid: Uuids {
                    client: s.client_uuid.to_string(),
                    server: server_uuid.to_string(),
                },
                session_name: s.name.clone(),
                results: hash_tree(&session_dir).unwrap_or_default(),
                phases: checkpoints_to_phases(&s),
                ptd_config: Some(
                    s.config
                        .analyzers
                        .iter()
                        .map(|a| crate::descriptor::PtdConfigEntry {
                            command_line: Vec::new(),
                            device_type: a.device_type,
                            interface_flag: a.interface_flag.clone(),
                            dc_flag: a.dc_flag,
                            device_port: a.device_port.clone(),
                            channel: match a.channel {
                                crate::config::ChannelSpec::Single(c) => c.to_string(),
                                crate::config::ChannelSpec::Multi { start, count } => format!("{start},{count}"),
                            },
                        })
                        .collect(),
                ),
            };

            std::fs::create_dir_all(session_dir.join("power"))?;
            descriptor.write(&session_dir.join("power/server.json"))?;
        }

        Ok(())
    }

    async fn handle_command(
        &self,
        proto: &mut dyn Proto,
        line: &str,
        session: &mut Option<Session>,
        server_uuid: &mut uuid::Uuid,
        session_dir: &mut PathBuf,
    ) -> Result<String> {
        if line == "time" {
            return Ok(chrono::Utc::now().timestamp().to_string());
        }
        if line == "set_ntp" {
            crate::time_sync::ntp_host_sync(&self.config.ntp_server)?;
            return Ok("OK".to_string());
        }
        if line == "stop" {
            return Ok("OK".to_string());
        }
        if let Some(rest) = line.strip_prefix("new,") {
            let parts: Vec<&str> = rest.splitn(2, ',').collect();
            let [label, client_uuid_str] = parts.as_slice() else {
                anyhow::bail!("malformed new command: {line:?}");
            };
            if !is_valid_label(label) {
                anyhow::bail!("label must be alphanumeric or -_: {label:?}");
            }
            let client_uuid: uuid::Uuid = client_uuid_str.parse().context("invalid client uuid")?;
            let name = session_name(Some(label));
            *server_uuid = uuid::Uuid::new_v4();
            *session_dir = self.sessions_root.join(&name);
            std::fs::create_dir_all(&*session_dir)?;

            *session = Some(Session::new(
                name.clone(),
                *server_uuid,
                client_uuid,
                self.config.clone(),
                session_dir.clone(),
                self.cancel.clone(),
            ));

            return Ok(format!("OK {name},{server_uuid}"));
        }

        if let Some(rest) = line.strip_prefix("session,") {
            return self.handle_session_command(proto, rest, session).await;
        }

        anyhow::bail!("unknown command: {line:?}")
    }

    async fn handle_session_command(&self, proto: &mut dyn Proto, rest: &str, session: &mut Option<Session>) -> Result<String> {
        let parts: Vec<&str> = rest.splitn(2, ',').collect();
        let [_name, action] = parts.as_slice() else {
            anyhow::bail!("malformed session command: {rest:?}");
        };
        let session = session
            .as_mut()
            .ok_or_else(|| anyhow::anyhow!("no active session"))?;

        match *action {
            "start,ranging" => {
                session.start_ranging().await?;
                Ok("OK".to_string())
            }
            "stop,ranging" => {
                session.stop_ranging().await?;
                Ok("OK".to_string())
            }
            "start,testing" => {
                session.start_testing(None).await?;
                Ok("OK".to_string())
            }
            "stop,testing" => {
                session.stop_testing().await?;
                Ok("OK".to_string())
            }
            "done" => {
                session.done().await?;
                Ok("OK".to_string())
            }
            other if other.starts_with("start,testing,") => {
                let args: Vec<&str> = other["start,testing,".len()..].split(',').collect();
                let [v, a] = args.as_slice() else {
                    anyhow::bail!("malformed start,testing,<v>,<a>: {other:?}");
                };
                let pair = parse_client_range(v, a)?;
                let ranges = vec![pair; session.supervisors.len()];
                session.start_testing(Some(ranges)).await?;
                Ok("OK".to_string())
            }
            other if other.starts_with("upload,") => {
                let what = &other["upload,".len()..];
                let dest_dir = session.session_dir.join("power");
                std::fs::create_dir_all(&dest_dir)?;
                proto.recv_file(&dest_dir.join(what)).await?;
                Ok("OK".to_string())
            }
            other => anyhow::bail!("unknown session action: {other:?}"),
        }
    }
}

fn checkpoints_to_phases(session: &Session) -> Phases {
    let to_pairs = |p: &crate::session::PhaseCheckpoints| {
        p.marks
            .iter()
            .map(|c| (c.monotonic.elapsed().as_nanos(), c.wall.timestamp_millis()))
            .collect()
    };
    Phases {
        ranging: to_pairs(&session.ranging_checkpoints),
        testing: to_pairs(&session.testing_checkpoints),
    }
}
