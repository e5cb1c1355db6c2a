//! Block device topology as reported by `lsblk`.
//!
//! The reader requests a tree-shaped, byte-exact JSON listing and turns it
//! into [`BlockDeviceRecord`]s. Older `lsblk` releases print booleans and
//! sizes as strings, so the field deserializers accept both forms.

use std::path::PathBuf;
use std::sync::Arc;

use serde::{Deserialize, Deserializer, Serialize};
use tracing::{debug, warn};

use super::error::ExternalToolError;
use super::process::ProcessRunner;

/// Columns requested from `lsblk`, in the order they are listed.
pub const LSBLK_COLUMNS: &str = "name,kname,type,subsystems,ro,rm,hotplug,size,phy-sec,log-sec,label,vendor,model,mountpoint,fstype";

/// Major number of loop devices, excluded from the listing.
const LOOP_MAJOR: &str = "7";

/// Mount point `lsblk` reports for active swap.
pub const SWAP_MARKER: &str = "[SWAP]";

/// One node of the block device tree.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockDeviceRecord {
    #[serde(default, deserialize_with = "lenient_string")]
    pub name: String,
    #[serde(default, deserialize_with = "lenient_string")]
    pub kname: String,
    #[serde(rename = "type", default, deserialize_with = "lenient_string")]
    pub kind: String,
    #[serde(default, deserialize_with = "lenient_string")]
    pub subsystems: String,
    #[serde(default, deserialize_with = "lenient_bool")]
    pub ro: bool,
    #[serde(default, deserialize_with = "lenient_bool")]
    pub rm: bool,
    #[serde(default, deserialize_with = "lenient_bool")]
    pub hotplug: bool,
    #[serde(default, deserialize_with = "lenient_u64")]
    pub size: u64,
    #[serde(rename = "phy-sec", default, deserialize_with = "lenient_u64")]
    pub phy_sec: u64,
    #[serde(rename = "log-sec", default, deserialize_with = "lenient_u64")]
    pub log_sec: u64,
    #[serde(default, deserialize_with = "optional_string")]
    pub label: Option<String>,
    #[serde(default, deserialize_with = "optional_string")]
    pub vendor: Option<String>,
    #[serde(default, deserialize_with = "optional_string")]
    pub model: Option<String>,
    #[serde(default, deserialize_with = "optional_string")]
    pub mountpoint: Option<String>,
    #[serde(default, deserialize_with = "optional_string")]
    pub fstype: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub children: Vec<BlockDeviceRecord>,
}

impl BlockDeviceRecord {
    /// Whether this record looks like an external/removable drive.
    ///
    /// Card readers with no card inserted enumerate with size 0 and are excluded.
    pub fn is_external(&self) -> bool {
        (self.rm || self.hotplug) && self.size > 0
    }

    pub fn is_partition(&self) -> bool {
        self.kind == "part"
    }

    /// Mount point if present and non-empty.
    pub fn mount_point(&self) -> Option<&str> {
        self.mountpoint.as_deref().filter(|m| !m.is_empty())
    }

    /// Find a record by kernel name anywhere in this subtree.
    pub fn find_mut(&mut self, kname: &str) -> Option<&mut BlockDeviceRecord> {
        if self.kname == kname {
            return Some(self);
        }
        self.children.iter_mut().find_map(|child| child.find_mut(kname))
    }
}

#[derive(Debug, Serialize, Deserialize)]
pub struct LsblkOutput {
    #[serde(default)]
    pub blockdevices: Vec<BlockDeviceRecord>,
}

/// Arguments for the enumeration tool invocation.
pub fn lsblk_args() -> Vec<String> {
    [
        "--exclude",
        LOOP_MAJOR,
        "--tree",
        "--paths",
        "--json",
        "--bytes",
        "--output",
        LSBLK_COLUMNS,
    ]
    .iter()
    .map(|s| s.to_string())
    .collect()
}

/// Parse the enumeration tool's JSON output.
pub fn parse_topology(
    program: &std::path::Path,
    stdout: &str,
) -> Result<Vec<BlockDeviceRecord>, ExternalToolError> {
    let parsed: LsblkOutput =
        serde_json::from_str(stdout).map_err(|source| ExternalToolError::Parse {
            program: program.to_path_buf(),
            source,
        })?;
    Ok(parsed.blockdevices)
}

/// Reads the block device topology through the configured runner.
#[derive(Clone)]
pub struct TopologyReader {
    runner: Arc<dyn ProcessRunner>,
    lsblk: PathBuf,
}

impl TopologyReader {
    pub fn new(runner: Arc<dyn ProcessRunner>, lsblk: PathBuf) -> Self {
        Self { runner, lsblk }
    }

    /// Run the enumeration tool and parse its output.
    pub async fn read(&self) -> Result<Vec<BlockDeviceRecord>, ExternalToolError> {
        let output = self
            .runner
            .output(&self.lsblk, &lsblk_args())
            .await
            .map_err(|source| ExternalToolError::Spawn {
                program: self.lsblk.clone(),
                source,
            })?;

        if !output.exit.is_success() {
            return Err(ExternalToolError::Exit {
                program: self.lsblk.clone(),
                code: output.exit.to_string(),
                stderr: output.stderr.trim().to_string(),
            });
        }

        let records = parse_topology(&self.lsblk, &output.stdout)?;
        debug!(count = records.len(), "Read block device topology");
        Ok(records)
    }

    /// Like [`read`](Self::read), but a failure degrades to an empty listing.
    pub async fn read_or_empty(&self) -> Vec<BlockDeviceRecord> {
        match self.read().await {
            Ok(records) => records,
            Err(e) => {
                warn!(error = %e, "Device enumeration failed, treating as no devices");
                Vec::new()
            }
        }
    }
}

#[derive(Deserialize)]
#[serde(untagged)]
enum Loose {
    Bool(bool),
    Number(u64),
    Text(String),
}

fn lenient_bool<'de, D>(deserializer: D) -> Result<bool, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(match Option::<Loose>::deserialize(deserializer)? {
        Some(Loose::Bool(b)) => b,
        Some(Loose::Number(n)) => n != 0,
        Some(Loose::Text(s)) => matches!(s.trim(), "1" | "true"),
        None => false,
    })
}

fn lenient_u64<'de, D>(deserializer: D) -> Result<u64, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(match Option::<Loose>::deserialize(deserializer)? {
        Some(Loose::Number(n)) => n,
        Some(Loose::Text(s)) => s.trim().parse().unwrap_or(0),
        Some(Loose::Bool(_)) | None => 0,
    })
}

fn lenient_string<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(optional_string(deserializer)?.unwrap_or_default())
}

fn optional_string<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Option::<String>::deserialize(deserializer)?;
    Ok(value
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::Path;

    const MODERN: &str = r#"{
        "blockdevices": [
            {"name": "/dev/sda", "kname": "/dev/sda", "type": "disk", "subsystems": "block:scsi:pci",
             "ro": false, "rm": false, "hotplug": false, "size": 512110190592,
             "phy-sec": 512, "log-sec": 512, "label": null, "vendor": "ATA     ",
             "model": "Samsung SSD", "mountpoint": null, "fstype": null,
             "children": [
                {"name": "/dev/sda1", "kname": "/dev/sda1", "type": "part", "subsystems": "block:scsi:pci",
                 "ro": false, "rm": false, "hotplug": false, "size": 512110190592,
                 "phy-sec": 512, "log-sec": 512, "label": null, "vendor": null,
                 "model": null, "mountpoint": "/", "fstype": "ext4"}
             ]},
            {"name": "/dev/sdb", "kname": "/dev/sdb", "type": "disk", "subsystems": "block:scsi:usb:pci",
             "ro": false, "rm": true, "hotplug": true, "size": 15931539456,
             "phy-sec": 512, "log-sec": 512, "label": null, "vendor": "SanDisk ",
             "model": "Cruzer Blade", "mountpoint": null, "fstype": null}
        ]
    }"#;

    #[test]
    fn parses_modern_output() {
        let records = parse_topology(Path::new("lsblk"), MODERN).unwrap();
        assert_eq!(records.len(), 2);

        let sda = &records[0];
        assert_eq!(sda.kname, "/dev/sda");
        assert_eq!(sda.vendor.as_deref(), Some("ATA"));
        assert_eq!(sda.children.len(), 1);
        assert_eq!(sda.children[0].mount_point(), Some("/"));
        assert!(!sda.is_external());

        let sdb = &records[1];
        assert!(sdb.rm);
        assert_eq!(sdb.vendor.as_deref(), Some("SanDisk"));
        assert!(sdb.is_external());
    }

    #[test]
    fn parses_legacy_string_fields() {
        let legacy = r#"{"blockdevices": [
            {"kname": "/dev/sdc", "type": "disk", "ro": "0", "rm": "1", "hotplug": "1",
             "size": "8000000", "phy-sec": "512", "log-sec": "512", "mountpoint": ""}
        ]}"#;
        let records = parse_topology(Path::new("lsblk"), legacy).unwrap();
        let sdc = &records[0];
        assert!(!sdc.ro);
        assert!(sdc.rm);
        assert_eq!(sdc.size, 8_000_000);
        assert_eq!(sdc.phy_sec, 512);
        assert_eq!(sdc.mount_point(), None);
    }

    #[test]
    fn rejects_garbage() {
        let err = parse_topology(Path::new("lsblk"), "not json").unwrap_err();
        assert!(matches!(err, ExternalToolError::Parse { .. }));
    }

    #[test]
    fn empty_reader_slot_is_not_external() {
        let record = BlockDeviceRecord {
            kname: "/dev/sdd".to_string(),
            rm: true,
            size: 0,
            ..Default::default()
        };
        assert!(!record.is_external());
    }

    #[test]
    fn args_exclude_loop_devices() {
        let args = lsblk_args();
        assert_eq!(&args[..2], &["--exclude".to_string(), "7".to_string()]);
        assert!(args.contains(&"--bytes".to_string()));
        assert_eq!(args.last().map(String::as_str), Some(LSBLK_COLUMNS));
    }

    #[test]
    fn find_mut_walks_children() {
        let mut records = parse_topology(Path::new("lsblk"), MODERN).unwrap();
        let part = records[0].find_mut("/dev/sda1").unwrap();
        part.mountpoint = None;
        assert_eq!(records[0].children[0].mount_point(), None);
    }
}
