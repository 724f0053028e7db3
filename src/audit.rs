//! Offline audit verifier: loads both session descriptors plus the result
//! tree and independently checks every cross-invariant between them. Each
//! check is a free function so a single failure doesn't abort the rest —
//! the caller collects every outcome into one `[x]`/`[ ]` report.

use crate::config;
use crate::descriptor::{hash_tree, Descriptor};
use anyhow::Result;
use std::path::Path;

pub struct CheckOutcome {
    pub name: &'static str,
    pub result: std::result::Result<(), String>,
}

impl CheckOutcome {
    fn ok(name: &'static str) -> Self {
        Self { name, result: Ok(()) }
    }

    fn fail(name: &'static str, msg: impl Into<String>) -> Self {
        Self {
            name,
            result: Err(msg.into()),
        }
    }
}

pub struct AuditReport {
    pub outcomes: Vec<CheckOutcome>,
}

impl AuditReport {
    pub fn passed(&self) -> bool {
        self.outcomes.iter().all(|o| o.result.is_ok())
    }

    pub fn render(&self) -> String {
        let mut out = String::new();
        for outcome in &self.outcomes {
            match &outcome.result {
                Ok(()) => out.push_str(&format!("[x] {}\n", outcome.name)),
                Err(msg) => out.push_str(&format!("[ ] {}: {}\n", outcome.name, msg)),
            }
        }
        out
    }
}

/// Known-benign PTD uncertainty message prefixes permitted inside the
/// ranging/testing window of `ptd_logs.txt` (check 11).
const BENIGN_LOG_PREFIXES: &[&str] = &[
    "WARNING:ptd:Uncertainty checking for",
    "WARNING:ptd:Uncertainty is not available",
];

const EXPECTED_STOP_REPLY: &str = "Stop";
const EXPECTED_STOP_NO_MEASUREMENT: &str = "Error: no measurement to stop";

pub fn run(session_dir: &Path, sources_dir: &Path) -> Result<AuditReport> {
    let client = Descriptor::read(&session_dir.join("power/client.json"))?;
    let server = Descriptor::read(&session_dir.join("power/server.json"))?;

    let mut outcomes = Vec::new();

    outcomes.push(check_required_fields(&client, &server));
    outcomes.push(check_sources(&client, sources_dir, "client"));
    outcomes.push(check_sources(&server, sources_dir, "server"));
    outcomes.push(check_identify_reply(&server));
    outcomes.push(check_fixed_reply_prefixes(&server));
    outcomes.push(check_initial_range_restoration(&server));
    outcomes.push(check_uuid_equality(&client, &server));
    outcomes.push(check_session_name(&client, &server));
    outcomes.push(check_phase_alignment(&client, &server));
    outcomes.push(check_message_prefix(&client, &server));
    outcomes.push(check_results_checksum(&client, session_dir));
    outcomes.push(check_ptd_log_window(session_dir));
    outcomes.push(check_ptd_config(&server));

    Ok(AuditReport { outcomes })
}

fn check_required_fields(client: &Descriptor, server: &Descriptor) -> CheckOutcome {
    let name = "Both descriptors contain required fields";
    if client.session_name.is_empty() || server.session_name.is_empty() {
        return CheckOutcome::fail(name, "session_name missing");
    }
    if server.ptd_config.is_none() {
        return CheckOutcome::fail(name, "server descriptor missing ptd_config");
    }
    CheckOutcome::ok(name)
}

fn check_sources(descriptor: &Descriptor, sources_dir: &Path, side: &str) -> CheckOutcome {
    let name = if side == "client" {
        "Client sources digest matches sources directory"
    } else {
        "Server sources digest matches sources directory"
    };
    match hash_tree(sources_dir) {
        Ok(actual) if actual == descriptor.sources => CheckOutcome::ok(name),
        Ok(_) => CheckOutcome::fail(name, "sources digest map does not match sources directory"),
        Err(e) => CheckOutcome::fail(name, e.to_string()),
    }
}

fn check_identify_reply(server: &Descriptor) -> CheckOutcome {
    let name = "PTD Identify reply is in the allow-list";
    let Some(ptd_messages) = &server.ptd_messages else {
        return CheckOutcome::fail(name, "server descriptor has no ptd_messages");
    };
    let Some(identify) = ptd_messages.iter().find(|m| m.cmd == "Identify") else {
        return CheckOutcome::fail(name, "no Identify exchange recorded");
    };
    let Some((model, rest)) = identify.reply.split_once(',') else {
        return CheckOutcome::fail(name, format!("malformed Identify reply {:?}", identify.reply));
    };
    let Some(version) = rest.strip_prefix("version=") else {
        return CheckOutcome::fail(name, format!("malformed Identify reply {:?}", identify.reply));
    };
    let known_model = config::SUPPORTED_DEVICE_TYPES
        .iter()
        .filter_map(|code| config::model_name_for_device(*code))
        .any(|m| m == model);
    if !known_model {
        return CheckOutcome::fail(name, format!("model {model:?} is not in the allow-list"));
    }
    if !config::is_supported_ptd_version(version) {
        return CheckOutcome::fail(name, format!("version {version:?} is not in the allow-list"));
    }
    CheckOutcome::ok(name)
}

fn check_fixed_reply_prefixes(server: &Descriptor) -> CheckOutcome {
    let name = "SR/Go/Stop replies match fixed expected strings";
    let Some(ptd_messages) = &server.ptd_messages else {
        return CheckOutcome::fail(name, "server descriptor has no ptd_messages");
    };

    let mut stop_occurrence = 0;
    for msg in ptd_messages {
        let prefix_ok = if msg.cmd.starts_with("SR,A") || msg.cmd.starts_with("SR,V") {
            msg.reply == "OK" || msg.reply.starts_with("Error")
        } else if msg.cmd.starts_with("Go,1000,") {
            msg.reply == "OK"
        } else if msg.cmd == "Stop" {
            stop_occurrence += 1;
            if stop_occurrence == 3 {
                msg.reply == EXPECTED_STOP_NO_MEASUREMENT
            } else {
                msg.reply == EXPECTED_STOP_REPLY || msg.reply == EXPECTED_STOP_NO_MEASUREMENT
            }
        } else {
            true
        };
        if !prefix_ok {
            return CheckOutcome::fail(
                name,
                format!("unexpected reply to {:?}: {:?}", msg.cmd, msg.reply),
            );
        }
    }
    CheckOutcome::ok(name)
}

fn check_initial_range_restoration(server: &Descriptor) -> CheckOutcome {
    let name = "Third SR,A / SR,V restore the initial ranges from the third PTD message";
    let Some(ptd_messages) = &server.ptd_messages else {
        return CheckOutcome::fail(name, "server descriptor has no ptd_messages");
    };
    let Some(rr) = ptd_messages.get(2) else {
        return CheckOutcome::fail(name, "fewer than three PTD messages recorded");
    };
    let (initial_volts, initial_amps) = match crate::ptd::parse_ranges_reply(&rr.reply) {
        Ok(r) => r,
        Err(e) => return CheckOutcome::fail(name, format!("third PTD message is not an RR reply: {e}")),
    };

    let third = |cmd_prefix: &str| ptd_messages.iter().filter(|m| m.cmd.starts_with(cmd_prefix)).nth(2);
    let expected_amps = format!("SR,A,{initial_amps}");
    let expected_volts = format!("SR,V,{initial_volts}");

    match (third("SR,A"), third("SR,V")) {
        (Some(a), Some(v)) if a.cmd == expected_amps && v.cmd == expected_volts => CheckOutcome::ok(name),
        (Some(a), Some(v)) => CheckOutcome::fail(
            name,
            format!("expected {expected_amps:?}/{expected_volts:?}, got {:?}/{:?}", a.cmd, v.cmd),
        ),
        _ => CheckOutcome::fail(name, "fewer than three SR,A or SR,V commands recorded"),
    }
}

fn check_uuid_equality(client: &Descriptor, server: &Descriptor) -> CheckOutcome {
    let name = "client/server UUIDs match";
    let canon = |s: &str| s.trim().to_ascii_lowercase();
    if canon(&client.uuid.client) == canon(&server.uuid.client) && canon(&client.uuid.server) == canon(&server.uuid.server) {
        CheckOutcome::ok(name)
    } else {
        CheckOutcome::fail(name, "uuid.client or uuid.server differ between descriptors")
    }
}

fn check_session_name(client: &Descriptor, server: &Descriptor) -> CheckOutcome {
    let name = "session_name matches";
    if client.session_name == server.session_name {
        CheckOutcome::ok(name)
    } else {
        CheckOutcome::fail(
            name,
            format!("{:?} != {:?}", client.session_name, server.session_name),
        )
    }
}

fn check_phase_alignment(client: &Descriptor, server: &Descriptor) -> CheckOutcome {
    let name = "Phase checkpoints align within 200ms and durations within 5%";

    let check_phase = |c: &[(u128, i64)], s: &[(u128, i64)]| -> std::result::Result<(), String> {
        if c.len() != s.len() {
            return Err(format!("checkpoint count mismatch: {} vs {}", c.len(), s.len()));
        }
        for (i, (cc, sc)) in c.iter().zip(s.iter()).enumerate() {
            let diff = (cc.1 - sc.1).abs();
            if diff >= 200 {
                return Err(format!("checkpoint {i} differs by {diff}ms"));
            }
        }
        if let (Some(first_c), Some(last_c), Some(first_s), Some(last_s)) =
            (c.first(), c.last(), s.first(), s.last())
        {
            let dur_c = (last_c.1 - first_c.1).unsigned_abs();
            let dur_s = (last_s.1 - first_s.1).unsigned_abs();
            let max = dur_c.max(dur_s).max(1);
            let diff = dur_c.abs_diff(dur_s);
            if (diff as f64) / (max as f64) >= 0.05 {
                return Err(format!("duration mismatch: {dur_c}ms vs {dur_s}ms"));
            }
        }
        Ok(())
    };

    if let Err(e) = check_phase(&client.phases.ranging, &server.phases.ranging) {
        return CheckOutcome::fail(name, format!("ranging: {e}"));
    }
    if let Err(e) = check_phase(&client.phases.testing, &server.phases.testing) {
        return CheckOutcome::fail(name, format!("testing: {e}"));
    }
    CheckOutcome::ok(name)
}

fn check_message_prefix(client: &Descriptor, server: &Descriptor) -> CheckOutcome {
    let name = "client.messages is a prefix-minus-one of server.messages";
    if client.messages.len() + 1 != server.messages.len() {
        return CheckOutcome::fail(
            name,
            format!(
                "expected server to have exactly one more message ({} vs {})",
                server.messages.len(),
                client.messages.len()
            ),
        );
    }
    for (i, (c, s)) in client.messages.iter().zip(server.messages.iter().skip(1)).enumerate() {
        if c.cmd != s.cmd {
            return CheckOutcome::fail(name, format!("command mismatch at index {i}: {:?} != {:?}", c.cmd, s.cmd));
        }
        if c.cmd != "time" && c.reply != s.reply {
            return CheckOutcome::fail(name, format!("reply mismatch at index {i}"));
        }
    }
    CheckOutcome::ok(name)
}

fn check_results_checksum(client: &Descriptor, session_dir: &Path) -> CheckOutcome {
    let name = "Check results checksum";
    let actual = match hash_tree(session_dir) {
        Ok(map) => map,
        Err(e) => return CheckOutcome::fail(name, e.to_string()),
    };

    for (path, expected) in &client.results {
        // Accept either the flat layout or a `power/`-prefixed legacy path.
        let resolved = if actual.contains_key(path) {
            Some(path.clone())
        } else {
            let alt = format!("power/{path}");
            actual.contains_key(&alt).then_some(alt)
        };
        match resolved {
            Some(key) => {
                let got = &actual[&key];
                if got != expected {
                    return CheckOutcome::fail(
                        name,
                        format!("{path}: expected {expected}, got {got}"),
                    );
                }
            }
            None => {
                return CheckOutcome::fail(name, format!("{path}: missing from result tree"));
            }
        }
    }
    CheckOutcome::ok(name)
}

fn check_ptd_log_window(session_dir: &Path) -> CheckOutcome {
    let name = "ptd_logs.txt warnings/errors within the measurement window are benign";
    let path = session_dir.join("power/ptd_logs.txt");
    let content = match std::fs::read_to_string(&path) {
        Ok(c) => c,
        Err(e) => return CheckOutcome::fail(name, format!("reading {}: {e}", path.display())),
    };

    let lines: Vec<&str> = content.lines().collect();
    let start = lines.iter().position(|l| l.contains(": Go with mark"));
    let end = lines.iter().position(|l| l.contains(": Completed test"));

    let (Some(start), Some(end)) = (start, end) else {
        return CheckOutcome::fail(name, "could not locate Go/Completed markers in ptd_logs.txt");
    };
    if start >= end {
        return CheckOutcome::fail(name, "Go marker appears after Completed marker");
    }

    let uncertainty_seen_before = lines[..start]
        .iter()
        .any(|l| l.contains("Uncertainty checking for Yokogawa") && l.contains("is activated"));
    if !uncertainty_seen_before {
        return CheckOutcome::fail(name, "missing Yokogawa uncertainty-activation line before ranging start");
    }

    for line in &lines[start..=end] {
        if line.starts_with("WARNING:") || line.starts_with("ERROR:") {
            if !BENIGN_LOG_PREFIXES.iter().any(|p| line.starts_with(p)) {
                return CheckOutcome::fail(name, format!("non-benign log line: {line:?}"));
            }
        }
    }
    CheckOutcome::ok(name)
}

fn check_ptd_config(server: &Descriptor) -> CheckOutcome {
    let name = "ptd_config device types and channel lists are valid";
    let Some(entries) = &server.ptd_config else {
        return CheckOutcome::fail(name, "server descriptor missing ptd_config");
    };
    for entry in entries {
        if !config::is_supported_device_type(entry.device_type) {
            return CheckOutcome::fail(name, format!("unsupported device type {}", entry.device_type));
        }
        if config::is_multichannel(entry.device_type) {
            let channel_count = entry.channel.split(',').count();
            let required = if entry.device_type == config::DEVICE_TYPE_WT500 { 1 } else { 2 };
            if channel_count != required {
                return CheckOutcome::fail(
                    name,
                    format!(
                        "device type {} requires a {}-entry channel list, got {:?}",
                        entry.device_type, required, entry.channel
                    ),
                );
            }
        }
    }
    CheckOutcome::ok(name)
}
