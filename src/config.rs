//! Typed configuration record populated from the controller's INI file,
//! replacing a loosely-typed dict-of-dicts with named fields per analyzer.
//! Unknown keys and sections are logged as warnings, never treated as fatal,
//! preserving the permissive behavior of the original tool.

use anyhow::{anyhow, Context, Result};
use std::path::Path;
use tracing::warn;

/// `rangingMode` from `[server]`: whether ranging leaves the current-range
/// auto-detect on, or pins it to the device's maximum supported range.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RangingMode {
    Auto,
    Max,
}

impl std::str::FromStr for RangingMode {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_uppercase().as_str() {
            "AUTO" => Ok(RangingMode::Auto),
            "MAX" => Ok(RangingMode::Max),
            other => Err(anyhow!("rangingMode must be AUTO or MAX, got {other:?}")),
        }
    }
}

/// One `[analyzerN]` section.
#[derive(Debug, Clone)]
pub struct AnalyzerConfig {
    pub index: usize,
    pub device_type: u32,
    pub network_port: u16,
    pub device_port: String,
    pub interface_flag: Option<String>,
    pub dc_flag: bool,
    /// Parsed from `"a"` (single channel) or `"a,b"` (start, count).
    pub channel: ChannelSpec,
    pub gpib_board: Option<u32>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelSpec {
    Single(u32),
    Multi { start: u32, count: u32 },
}

impl ChannelSpec {
    pub fn parse(s: &str) -> Result<Self> {
        let parts: Vec<&str> = s.split(',').map(str::trim).collect();
        match parts.as_slice() {
            [a] => Ok(ChannelSpec::Single(
                a.parse().with_context(|| format!("invalid channel {s:?}"))?,
            )),
            [a, b] => Ok(ChannelSpec::Multi {
                start: a.parse().with_context(|| format!("invalid channel {s:?}"))?,
                count: b.parse().with_context(|| format!("invalid channel {s:?}"))?,
            }),
            _ => Err(anyhow!("channel must be \"a\" or \"a,b\", got {s:?}")),
        }
    }
}

/// The fully parsed `[server]` + `[ptd]` + `[analyzerN]...` configuration.
#[derive(Debug, Clone)]
pub struct ControllerConfig {
    pub ntp_server: String,
    pub listen_addr: std::net::SocketAddr,
    pub ranging_mode: RangingMode,
    pub ptd_binary: std::path::PathBuf,
    pub analyzers: Vec<AnalyzerConfig>,
}

impl ControllerConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let ini = ini::Ini::load_from_file(path)
            .with_context(|| format!("failed to read configuration file {}", path.display()))?;

        let server = ini
            .section(Some("server"))
            .ok_or_else(|| anyhow!("configuration file missing [server] section"))?;
        let ntp_server = server
            .get("ntpServer")
            .ok_or_else(|| anyhow!("[server] missing ntpServer"))?
            .to_string();
        let listen = server
            .get("listen")
            .ok_or_else(|| anyhow!("[server] missing listen"))?;
        let listen_addr = parse_listen(listen)?;
        let ranging_mode: RangingMode = server
            .get("rangingMode")
            .ok_or_else(|| anyhow!("[server] missing rangingMode"))?
            .parse()?;
        let analyzer_count: usize = server
            .get("analyzerCount")
            .ok_or_else(|| anyhow!("[server] missing analyzerCount"))?
            .parse()
            .context("analyzerCount must be an integer")?;

        let ptd_section = ini
            .section(Some("ptd"))
            .ok_or_else(|| anyhow!("configuration file missing [ptd] section"))?;
        let ptd_binary = ptd_section
            .get("ptd")
            .ok_or_else(|| anyhow!("[ptd] missing ptd"))?
            .into();

        let mut analyzers = Vec::with_capacity(analyzer_count);
        for index in 0..analyzer_count {
            let name = format!("analyzer{index}");
            let section = ini
                .section(Some(name.as_str()))
                .ok_or_else(|| anyhow!("configuration file missing [{name}] section"))?;
            let device_type: u32 = section
                .get("deviceType")
                .ok_or_else(|| anyhow!("[{name}] missing deviceType"))?
                .parse()
                .context("deviceType must be an integer")?;
            let network_port: u16 = section
                .get("networkPort")
                .ok_or_else(|| anyhow!("[{name}] missing networkPort"))?
                .parse()
                .context("networkPort must be a u16")?;
            let device_port = section
                .get("devicePort")
                .ok_or_else(|| anyhow!("[{name}] missing devicePort"))?
                .to_string();
            let interface_flag = section.get("interfaceFlag").map(str::to_string);
            let dc_flag = section
                .get("dcFlag")
                .map(|v| v == "1" || v.eq_ignore_ascii_case("true"))
                .unwrap_or(false);
            let channel = ChannelSpec::parse(
                section
                    .get("channel")
                    .ok_or_else(|| anyhow!("[{name}] missing channel"))?,
            )?;
            let gpib_board = section
                .get("gpibBoard")
                .map(|v| v.parse())
                .transpose()
                .context("gpibBoard must be an integer")?;

            if !is_supported_device_type(device_type) {
                warn!(device_type, analyzer = %name, "unrecognized device type; continuing anyway");
            }
            if is_multichannel(device_type) {
                let ok = match channel {
                    ChannelSpec::Multi { .. } => true,
                    ChannelSpec::Single(_) => device_type != DEVICE_TYPE_WT500,
                };
                if !ok {
                    return Err(anyhow!(
                        "[{name}] device type {device_type} requires a two-entry channel list"
                    ));
                }
            }

            analyzers.push(AnalyzerConfig {
                index,
                device_type,
                network_port,
                device_port,
                interface_flag,
                dc_flag,
                channel,
                gpib_board,
            });
        }

        // Unknown sections/keys are warned about, never fatal.
        for (section_name, props) in ini.iter() {
            let known = matches!(section_name, Some("server") | Some("ptd"))
                || section_name
                    .map(|n| n.starts_with("analyzer"))
                    .unwrap_or(false);
            if !known {
                warn!(section = ?section_name, "unrecognized configuration section; ignoring");
                continue;
            }
            for (key, _) in props.iter() {
                if !is_known_key(section_name, key) {
                    warn!(section = ?section_name, key, "unrecognized configuration key; ignoring");
                }
            }
        }

        Ok(ControllerConfig {
            ntp_server,
            listen_addr,
            ranging_mode,
            ptd_binary,
            analyzers,
        })
    }
}

fn is_known_key(section: Option<&str>, key: &str) -> bool {
    match section {
        Some("server") => matches!(key, "ntpServer" | "listen" | "rangingMode" | "analyzerCount"),
        Some("ptd") => matches!(key, "ptd"),
        Some(s) if s.starts_with("analyzer") => matches!(
            key,
            "deviceType" | "networkPort" | "devicePort" | "interfaceFlag" | "dcFlag" | "channel" | "gpibBoard"
        ),
        _ => false,
    }
}

fn parse_listen(s: &str) -> Result<std::net::SocketAddr> {
    let mut parts = s.split_whitespace();
    let ip = parts.next().ok_or_else(|| anyhow!("listen must be \"IP PORT\""))?;
    let port = parts
        .next()
        .ok_or_else(|| anyhow!("listen must be \"IP PORT\""))?;
    let ip: std::net::IpAddr = ip.parse().context("invalid listen IP")?;
    let port: u16 = port.parse().context("invalid listen port")?;
    Ok(std::net::SocketAddr::new(ip, port))
}

pub const DEVICE_TYPE_WT500: u32 = 48;

pub const SUPPORTED_DEVICE_TYPES: &[u32] = &[8, 49, 52, 77, 35, 48, 47, 66, 508, 549, 586];
pub const MULTICHANNEL_DEVICE_TYPES: &[u32] = &[48, 59, 61, 77];
pub const DC_DEVICE_TYPES: &[u32] = &[508, 549, 586];

pub fn is_supported_device_type(code: u32) -> bool {
    SUPPORTED_DEVICE_TYPES.contains(&code)
}

pub fn is_multichannel(code: u32) -> bool {
    MULTICHANNEL_DEVICE_TYPES.contains(&code)
}

pub fn is_dc(code: u32) -> bool {
    DC_DEVICE_TYPES.contains(&code)
}

/// Maximum supported range (amps) for a device type, used when
/// [`RangingMode::Max`] pins the amps range instead of leaving it on auto.
pub fn max_range_for_device(code: u32) -> Option<u32> {
    Some(match code {
        8 | 49 | 52 | 77 => 20,
        35 => 40,
        48 => 40,
        47 => 50,
        66 => 30,
        508 | 549 => 20,
        586 => 20,
        _ => return None,
    })
}

/// PTD `Identify` model-name allow-list, keyed by device-type code, used by
/// the audit verifier's check 3.
pub fn model_name_for_device(code: u32) -> Option<&'static str> {
    Some(match code {
        8 => "WT210",
        49 => "WT310",
        52 => "WT332",
        77 => "WT330",
        35 => "WT500",
        48 => "WT500",
        47 => "WT1800",
        66 => "PX8000",
        508 => "34401A",
        549 => "34410A",
        586 => "2306",
        _ => return None,
    })
}

/// PTD `Identify` firmware-version allow-list, used alongside
/// [`model_name_for_device`] by the audit verifier's check 3.
pub const SUPPORTED_PTD_VERSIONS: &[&str] = &["1.0", "1.1", "1.2", "2.0"];

pub fn is_supported_ptd_version(version: &str) -> bool {
    SUPPORTED_PTD_VERSIONS.contains(&version)
}
