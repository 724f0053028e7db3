//! The session descriptor: a JSON manifest each side writes at session end,
//! carrying identity, protocol trace, phase checkpoints, and SHA-1 digest
//! maps over the source tree and result tree it produced.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use sha1::{Digest, Sha1};
use std::collections::BTreeMap;
use std::path::Path;

pub const DESCRIPTOR_VERSION: u32 = 1;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessageRecord {
    pub cmd: String,
    /// Elided for both sides' `time` commands per C9.
    pub reply: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Uuids {
    pub client: String,
    pub server: String,
}

/// `(monotonic_ns, wall_epoch_ms)` pair for one checkpoint.
pub type CheckpointPair = (u128, i64);

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Phases {
    pub ranging: Vec<CheckpointPair>,
    pub testing: Vec<CheckpointPair>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PtdConfigEntry {
    pub command_line: Vec<String>,
    pub device_type: u32,
    pub interface_flag: Option<String>,
    pub dc_flag: bool,
    pub device_port: String,
    pub channel: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PtdMessageRecord {
    pub cmd: String,
    pub reply: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Descriptor {
    pub version: u32,
    /// Seconds east of UTC at execution time.
    pub timezone: i32,
    pub modules: BTreeMap<String, String>,
    pub sources: BTreeMap<String, String>,
    pub messages: Vec<MessageRecord>,
    /// Controller-only: ordered `{cmd, reply}` merged across analyzers.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ptd_messages: Option<Vec<PtdMessageRecord>>,
    pub uuid: Uuids,
    pub session_name: String,
    pub results: BTreeMap<String, String>,
    pub phases: Phases,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ptd_config: Option<Vec<PtdConfigEntry>>,
}

impl Descriptor {
    pub fn write(&self, path: &Path) -> Result<()> {
        let json = serde_json::to_string_pretty(self)?;
        std::fs::write(path, json).with_context(|| format!("writing descriptor {}", path.display()))
    }

    pub fn read(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("reading descriptor {}", path.display()))?;
        serde_json::from_str(&content).with_context(|| format!("parsing descriptor {}", path.display()))
    }
}

/// Recursively hashes every regular file under `root`, keyed by its path
/// relative to `root` with forward-slash separators regardless of
/// platform, so digest maps compare equal across OSes.
pub fn hash_tree(root: &Path) -> Result<BTreeMap<String, String>> {
    let mut map = BTreeMap::new();
    if root.is_dir() {
        walk(root, root, &mut map)?;
    }
    Ok(map)
}

fn walk(root: &Path, dir: &Path, map: &mut BTreeMap<String, String>) -> Result<()> {
    for entry in std::fs::read_dir(dir)? {
        let entry = entry?;
        let path = entry.path();
        if path.is_dir() {
            walk(root, &path, map)?;
        } else {
            let rel = path
                .strip_prefix(root)
                .expect("path is under root by construction")
                .to_string_lossy()
                .replace('\\', "/");
            map.insert(rel, hash_file(&path)?);
        }
    }
    Ok(())
}

pub fn hash_file(path: &Path) -> Result<String> {
    let data = std::fs::read(path).with_context(|| format!("hashing {}", path.display()))?;
    let mut hasher = Sha1::new();
    hasher.update(&data);
    Ok(hex::encode(hasher.finalize()))
}

mod hex {
    pub fn encode(bytes: impl AsRef<[u8]>) -> String {
        bytes.as_ref().iter().map(|b| format!("{b:02x}")).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> Descriptor {
        Descriptor {
            version: DESCRIPTOR_VERSION,
            timezone: 0,
            modules: BTreeMap::new(),
            sources: BTreeMap::new(),
            messages: vec![MessageRecord {
                cmd: "new,lbl,uuid".to_string(),
                reply: Some("OK".to_string()),
            }],
            ptd_messages: None,
            uuid: Uuids {
                client: "c".to_string(),
                server: "s".to_string(),
            },
            session_name: "2024-01-02_03-04-05_lbl".to_string(),
            results: BTreeMap::new(),
            phases: Phases::default(),
            ptd_config: None,
        }
    }

    #[test]
    fn json_round_trip_is_stable() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("client.json");
        let original = sample();
        original.write(&path).unwrap();
        let reloaded = Descriptor::read(&path).unwrap();
        assert_eq!(
            serde_json::to_string(&original).unwrap(),
            serde_json::to_string(&reloaded).unwrap()
        );
    }

    #[test]
    fn hash_tree_is_stable_and_path_relative() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("sub")).unwrap();
        std::fs::write(dir.path().join("a.txt"), b"hello").unwrap();
        std::fs::write(dir.path().join("sub/b.txt"), b"world").unwrap();

        let map = hash_tree(dir.path()).unwrap();
        assert_eq!(map.len(), 2);
        assert!(map.contains_key("a.txt"));
        assert!(map.contains_key("sub/b.txt"));
        assert_eq!(map["a.txt"], hash_file(&dir.path().join("a.txt")).unwrap());
    }
}
