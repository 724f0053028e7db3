//! Drives a real `ControllerService` over a live TCP socket end to end:
//! handshake, a session whose PTD never starts (no real analyzer hardware in
//! CI), and the `stop` command's effect on the accept loop.

use mlperf_power::config::{AnalyzerConfig, ChannelSpec, ControllerConfig, RangingMode};
use mlperf_power::descriptor::Descriptor;
use mlperf_power::ControllerService;
use std::net::{SocketAddr, TcpListener as StdTcpListener};
use std::path::PathBuf;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio_util::sync::CancellationToken;

/// Reserves a free port by binding and immediately dropping a std listener;
/// racy in theory, fine for a test run in an otherwise idle process.
fn free_addr() -> SocketAddr {
    let listener = StdTcpListener::bind("127.0.0.1:0").unwrap();
    listener.local_addr().unwrap()
}

fn test_config(listen_addr: SocketAddr) -> ControllerConfig {
    ControllerConfig {
        ntp_server: "127.0.0.1".to_string(),
        listen_addr,
        ranging_mode: RangingMode::Auto,
        ptd_binary: PathBuf::from("/nonexistent/ptd-does-not-exist"),
        analyzers: vec![AnalyzerConfig {
            index: 0,
            device_type: 49,
            network_port: free_addr().port(),
            device_port: "/dev/null".to_string(),
            interface_flag: None,
            dc_flag: false,
            channel: ChannelSpec::Single(1),
            gpib_board: None,
        }],
    }
}

async fn connect_with_retry(addr: SocketAddr) -> TcpStream {
    for _ in 0..50 {
        if let Ok(s) = TcpStream::connect(addr).await {
            return s;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    panic!("controller never accepted a connection on {addr}");
}

#[tokio::test]
async fn session_with_unreachable_ptd_reports_error_and_writes_descriptor() {
    use mlperf_power::protocol::{check_magic, magic_client, Proto, TcpProto, MAGIC_SERVER_PREFIX};

    let sessions_root = tempfile::tempdir().unwrap();
    let listen_addr = free_addr();
    let config = test_config(listen_addr);
    let cancel = CancellationToken::new();

    let service = ControllerService::new(config, sessions_root.path().to_path_buf(), cancel.clone());
    let server_task = tokio::spawn(service.run());

    let stream = connect_with_retry(listen_addr).await;
    let mut proto = TcpProto::new(stream).unwrap();

    proto.send_line(&magic_client()).await.unwrap();
    let server_magic = proto.recv_line().await.unwrap();
    check_magic(&server_magic, MAGIC_SERVER_PREFIX).unwrap();

    proto.send_line("time").await.unwrap();
    let reply = proto.recv_line().await.unwrap();
    let ts: i64 = reply.parse().expect("time reply must be a decimal timestamp");
    assert!(ts > 0);

    let client_uuid = uuid::Uuid::new_v4();
    proto.send_line(&format!("new,demo,{client_uuid}")).await.unwrap();
    let reply = proto.recv_line().await.unwrap();
    assert!(reply.starts_with("OK "), "unexpected new reply: {reply:?}");
    let (session_name, server_uuid) = reply
        .strip_prefix("OK ")
        .unwrap()
        .split_once(',')
        .map(|(n, u)| (n.to_string(), u.to_string()))
        .expect("OK <name>,<uuid>");

    proto
        .send_line(&format!("session,{session_name},start,ranging"))
        .await
        .unwrap();
    let reply = proto.recv_line().await.unwrap();
    assert!(
        reply.starts_with("Error"),
        "expected ranging start to fail without a real PTD binary, got {reply:?}"
    );

    proto.send_line(&format!("session,{session_name},done")).await.unwrap();
    let reply = proto.recv_line().await.unwrap();
    assert_eq!(reply, "OK");

    proto.close().await.unwrap();

    let descriptor_path = sessions_root
        .path()
        .join(&session_name)
        .join("power/server.json");
    // the connection loop writes the descriptor only after it observes EOF
    // on its side, so give the server task a moment to finish.
    for _ in 0..50 {
        if descriptor_path.exists() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    let descriptor = Descriptor::read(&descriptor_path).expect("server.json must be written");
    assert_eq!(descriptor.session_name, session_name);
    assert_eq!(descriptor.uuid.client, client_uuid.to_string());
    assert_eq!(descriptor.uuid.server, server_uuid);
    assert!(descriptor.messages.iter().any(|m| m.cmd.starts_with("session,") && m.cmd.ends_with(",ranging")));

    cancel.cancel();
    let _ = tokio::time::timeout(Duration::from_secs(2), server_task).await;
}

#[tokio::test]
async fn stop_command_ends_the_accept_loop_after_disconnect() {
    use mlperf_power::protocol::{check_magic, magic_client, Proto, TcpProto, MAGIC_SERVER_PREFIX};

    let sessions_root = tempfile::tempdir().unwrap();
    let listen_addr = free_addr();
    let config = test_config(listen_addr);
    let cancel = CancellationToken::new();

    let service = ControllerService::new(config, sessions_root.path().to_path_buf(), cancel.clone());
    let server_task = tokio::spawn(service.run());

    let stream = connect_with_retry(listen_addr).await;
    let mut proto = TcpProto::new(stream).unwrap();
    proto.send_line(&magic_client()).await.unwrap();
    check_magic(&proto.recv_line().await.unwrap(), MAGIC_SERVER_PREFIX).unwrap();

    proto.send_line("stop").await.unwrap();
    let reply = proto.recv_line().await.unwrap();
    assert_eq!(reply, "OK");
    proto.close().await.unwrap();

    let result = tokio::time::timeout(Duration::from_secs(2), server_task)
        .await
        .expect("controller should exit on its own after stop + disconnect");
    assert!(result.unwrap().is_ok());
}

#[tokio::test]
async fn mismatched_handshake_is_rejected() {
    use mlperf_power::protocol::{check_magic, Proto, TcpProto, MAGIC_SERVER_PREFIX};

    let sessions_root = tempfile::tempdir().unwrap();
    let listen_addr = free_addr();
    let config = test_config(listen_addr);
    let cancel = CancellationToken::new();

    let service = ControllerService::new(config, sessions_root.path().to_path_buf(), cancel.clone());
    let _server_task = tokio::spawn(service.run());

    let stream = connect_with_retry(listen_addr).await;
    let mut proto = TcpProto::new(stream).unwrap();
    proto.send_line("NOT_THE_RIGHT_MAGIC,1").await.unwrap();

    // the controller's handshake check fails before it ever replies, so the
    // only observable effect from the client side is the connection closing.
    let result = proto.recv_line().await;
    assert!(result.is_err());

    cancel.cancel();
    let _ = check_magic("MLPERF_POWER_SERVER,1", MAGIC_SERVER_PREFIX); // sanity: helper still usable
}
