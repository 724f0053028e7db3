//! Builds a minimal but internally-consistent session tree (client.json +
//! server.json + a results file + a ptd_logs.txt window) by hand, then
//! checks that the audit verifier passes it and that tampering with a
//! results file afterward is caught by the checksum check.

use mlperf_power::audit;
use mlperf_power::descriptor::{hash_tree, Descriptor, MessageRecord, Phases, PtdConfigEntry, PtdMessageRecord, Uuids};
use std::collections::BTreeMap;
use std::path::Path;

fn write_sources(sources_dir: &Path) {
    std::fs::create_dir_all(sources_dir).unwrap();
    std::fs::write(sources_dir.join("main.rs"), b"fn main() {}\n").unwrap();
}

fn write_ptd_log_window(power_dir: &Path) {
    let log = "\
WARNING:ptd:Uncertainty checking for Yokogawa WT310 is activated
2024-01-02 03:04:05: Go with mark session_testing
WARNING:ptd:Uncertainty checking for Yokogawa WT310 is activated
2024-01-02 03:04:35: Completed test
";
    std::fs::write(power_dir.join("ptd_logs.txt"), log).unwrap();
}

fn ptd_messages() -> Vec<PtdMessageRecord> {
    vec![
        PtdMessageRecord { cmd: "Hello".to_string(), reply: "Hello, PTDaemon here!".to_string() },
        PtdMessageRecord { cmd: "Identify".to_string(), reply: "WT310,version=1.0".to_string() },
        PtdMessageRecord { cmd: "RR".to_string(), reply: "Ranges,1,0,1,0".to_string() },
        PtdMessageRecord { cmd: "SR,A,1".to_string(), reply: "OK".to_string() },
        PtdMessageRecord { cmd: "SR,V,1".to_string(), reply: "OK".to_string() },
        PtdMessageRecord { cmd: "Go,1000,0,mark_ranging".to_string(), reply: "OK".to_string() },
        PtdMessageRecord { cmd: "Stop".to_string(), reply: "Stop".to_string() },
        PtdMessageRecord { cmd: "SR,A,Auto".to_string(), reply: "OK".to_string() },
        PtdMessageRecord { cmd: "SR,V,Auto".to_string(), reply: "OK".to_string() },
        PtdMessageRecord { cmd: "Go,1000,0,mark_testing".to_string(), reply: "OK".to_string() },
        PtdMessageRecord { cmd: "Stop".to_string(), reply: "Error: no measurement to stop".to_string() },
        PtdMessageRecord { cmd: "SR,A,Auto".to_string(), reply: "OK".to_string() },
        PtdMessageRecord { cmd: "SR,V,Auto".to_string(), reply: "OK".to_string() },
    ]
}

fn server_messages() -> Vec<MessageRecord> {
    vec![
        MessageRecord { cmd: "MLPERF_POWER_CLIENT,1".to_string(), reply: Some("MLPERF_POWER_SERVER,1".to_string()) },
        MessageRecord { cmd: "new,demo,c-uuid".to_string(), reply: Some("OK 2024-01-02_03-04-05_demo,s-uuid".to_string()) },
        MessageRecord { cmd: "session,2024-01-02_03-04-05_demo,start,ranging".to_string(), reply: Some("OK".to_string()) },
        MessageRecord { cmd: "session,2024-01-02_03-04-05_demo,stop,ranging".to_string(), reply: Some("OK".to_string()) },
        MessageRecord { cmd: "session,2024-01-02_03-04-05_demo,done".to_string(), reply: Some("OK".to_string()) },
    ]
}

fn client_messages() -> Vec<MessageRecord> {
    // one fewer than the server's trace: the server also records its own
    // reply to the handshake line, which the client never re-records.
    server_messages().into_iter().skip(1).collect()
}

fn phases() -> Phases {
    Phases {
        ranging: vec![(0, 1_000), (1_000_000, 1_050), (2_000_000, 3_050), (3_000_000, 4_050)],
        testing: vec![(0, 5_000), (1_000_000, 5_050), (2_000_000, 7_050), (3_000_000, 8_050)],
    }
}

#[test]
fn well_formed_session_passes_every_check() {
    let root = tempfile::tempdir().unwrap();
    let sources_dir = root.path().join("sources");
    let session_dir = root.path().join("session");
    let power_dir = session_dir.join("power");
    std::fs::create_dir_all(&power_dir).unwrap();
    write_sources(&sources_dir);
    write_ptd_log_window(&power_dir);
    std::fs::write(session_dir.join("run_1_spl.txt"), b"channel,watts\n0,1.23\n").unwrap();

    let sources_digest = hash_tree(&sources_dir).unwrap();
    let results_digest = hash_tree(&session_dir).unwrap();

    let server = Descriptor {
        version: 1,
        timezone: 0,
        modules: BTreeMap::new(),
        sources: sources_digest.clone(),
        messages: server_messages(),
        ptd_messages: Some(ptd_messages()),
        uuid: Uuids { client: "C-UUID".to_string(), server: "s-uuid".to_string() },
        session_name: "2024-01-02_03-04-05_demo".to_string(),
        results: results_digest.clone(),
        phases: phases(),
        ptd_config: Some(vec![PtdConfigEntry {
            command_line: Vec::new(),
            device_type: 49,
            interface_flag: None,
            dc_flag: false,
            device_port: "/dev/ttyUSB0".to_string(),
            channel: "1".to_string(),
        }]),
    };
    let client = Descriptor {
        sources: sources_digest,
        messages: client_messages(),
        ptd_messages: None,
        uuid: Uuids { client: "c-uuid".to_string(), server: "S-UUID".to_string() },
        results: results_digest,
        ptd_config: None,
        ..server.clone()
    };

    server.write(&power_dir.join("server.json")).unwrap();
    client.write(&power_dir.join("client.json")).unwrap();

    let report = audit::run(&session_dir, &sources_dir).unwrap();
    assert!(report.passed(), "expected a clean pass, got:\n{}", report.render());
}

#[test]
fn tampering_with_a_result_file_after_the_fact_is_caught() {
    let root = tempfile::tempdir().unwrap();
    let sources_dir = root.path().join("sources");
    let session_dir = root.path().join("session");
    let power_dir = session_dir.join("power");
    std::fs::create_dir_all(&power_dir).unwrap();
    write_sources(&sources_dir);
    write_ptd_log_window(&power_dir);
    std::fs::write(session_dir.join("run_1_spl.txt"), b"channel,watts\n0,1.23\n").unwrap();

    let sources_digest = hash_tree(&sources_dir).unwrap();
    let results_digest = hash_tree(&session_dir).unwrap();

    let server = Descriptor {
        version: 1,
        timezone: 0,
        modules: BTreeMap::new(),
        sources: sources_digest.clone(),
        messages: server_messages(),
        ptd_messages: Some(ptd_messages()),
        uuid: Uuids { client: "c-uuid".to_string(), server: "s-uuid".to_string() },
        session_name: "2024-01-02_03-04-05_demo".to_string(),
        results: results_digest.clone(),
        phases: phases(),
        ptd_config: Some(vec![PtdConfigEntry {
            command_line: Vec::new(),
            device_type: 49,
            interface_flag: None,
            dc_flag: false,
            device_port: "/dev/ttyUSB0".to_string(),
            channel: "1".to_string(),
        }]),
    };
    let client = Descriptor {
        sources: sources_digest,
        messages: client_messages(),
        ptd_messages: None,
        uuid: Uuids { client: "c-uuid".to_string(), server: "s-uuid".to_string() },
        results: results_digest,
        ptd_config: None,
        ..server.clone()
    };

    server.write(&power_dir.join("server.json")).unwrap();
    client.write(&power_dir.join("client.json")).unwrap();

    // results were hashed before this tamper, so the descriptor's digest map
    // now disagrees with what's on disk.
    std::fs::write(session_dir.join("run_1_spl.txt"), b"channel,watts\n0,9.99\n").unwrap();

    let report = audit::run(&session_dir, &sources_dir).unwrap();
    assert!(!report.passed());
    assert!(report.render().contains("Check results checksum"));
}
