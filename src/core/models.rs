use std::fmt;

use serde::Serialize;

use super::topology::BlockDeviceRecord;
use super::usage::{UsageProber, used_bytes};

const SIZE_UNITS: [&str; 9] = ["B", "KB", "MB", "GB", "TB", "PB", "EB", "ZB", "YB"];

/// Format a byte count with base-1024 units and two decimals, e.g. `1.00KB`.
pub fn format_size(bytes: u64) -> String {
    let mut value = bytes as f64;
    let mut unit = 0;
    while value >= 1024.0 && unit < SIZE_UNITS.len() - 1 {
        value /= 1024.0;
        unit += 1;
    }
    format!("{:.2}{}", value, SIZE_UNITS[unit])
}

/// What a device is currently busy with.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum DeviceAction {
    #[default]
    Idle,
    Unmounting,
    Cloning,
}

impl DeviceAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Unmounting => "unmounting",
            Self::Cloning => "cloning",
        }
    }
}

impl fmt::Display for DeviceAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Operation-local state. Owned by the device store, never by refresh.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct OperationState {
    pub action: DeviceAction,
    /// 0-100, meaningful while cloning.
    pub progress: u8,
}

impl OperationState {
    pub fn is_idle(&self) -> bool {
        self.action == DeviceAction::Idle
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Partition {
    pub kname: String,
    pub mountpoint: Option<String>,
    pub size: u64,
    pub used: u64,
    pub fstype: Option<String>,
    pub label: Option<String>,
}

impl Partition {
    fn from_record(record: &BlockDeviceRecord, prober: &dyn UsageProber) -> Self {
        Self {
            kname: record.kname.clone(),
            mountpoint: record.mount_point().map(str::to_string),
            size: record.size,
            used: used_bytes(record, prober),
            fstype: record.fstype.clone(),
            label: record.label.clone(),
        }
    }

    pub fn is_mounted(&self) -> bool {
        self.mountpoint.is_some()
    }

    pub fn size_str(&self) -> String {
        format_size(self.size)
    }

    pub fn used_str(&self) -> String {
        format_size(self.used)
    }
}

/// One external drive and its partitions.
#[derive(Debug, Clone, Serialize)]
pub struct Device {
    pub kname: String,
    pub vendor: Option<String>,
    pub model: Option<String>,
    pub name: String,
    /// Position in the eligible-device sequence.
    pub index: usize,
    pub size: u64,
    pub used: u64,
    pub read_only: bool,
    pub partitions: Vec<Partition>,
    #[serde(flatten)]
    pub state: OperationState,
}

impl Device {
    /// Derive a device from a top-level record. Eligibility is checked by [`build`].
    pub fn from_record(record: &BlockDeviceRecord, index: usize, prober: &dyn UsageProber) -> Self {
        let partitions = record
            .children
            .iter()
            .filter(|child| child.is_partition())
            .map(|child| Partition::from_record(child, prober))
            .collect();

        Self {
            kname: record.kname.clone(),
            vendor: record.vendor.clone(),
            model: record.model.clone(),
            name: display_name(record.vendor.as_deref(), record.model.as_deref(), index),
            index,
            size: record.size,
            used: used_bytes(record, prober),
            read_only: record.ro,
            partitions,
            state: OperationState::default(),
        }
    }

    pub fn size_str(&self) -> String {
        format_size(self.size)
    }

    pub fn used_str(&self) -> String {
        format_size(self.used)
    }

    pub fn partition_count(&self) -> usize {
        self.partitions.len()
    }

    pub fn mounted_partitions(&self) -> impl Iterator<Item = &Partition> {
        self.partitions.iter().filter(|p| p.is_mounted())
    }

    pub fn partition(&self, kname: &str) -> Option<&Partition> {
        self.partitions.iter().find(|p| p.kname == kname)
    }

    /// Value equality over topology-derived fields, ignoring action/progress.
    pub fn same_topology(&self, other: &Device) -> bool {
        self.kname == other.kname
            && self.name == other.name
            && self.index == other.index
            && self.size == other.size
            && self.used == other.used
            && self.read_only == other.read_only
            && self.partitions == other.partitions
    }
}

fn is_unknown(value: Option<&str>) -> bool {
    match value {
        None => true,
        Some(v) => v.is_empty() || v.eq_ignore_ascii_case("unknown"),
    }
}

fn display_name(vendor: Option<&str>, model: Option<&str>, index: usize) -> String {
    if is_unknown(vendor) && is_unknown(model) {
        return format!("drive #{}", index + 1);
    }

    [vendor, model]
        .into_iter()
        .flatten()
        .filter(|part| !is_unknown(Some(*part)))
        .collect::<Vec<_>>()
        .join(" ")
}

/// Build the eligible device sequence from a topology snapshot.
///
/// Ineligible records are dropped; `index` counts eligible devices only.
pub fn build(records: &[BlockDeviceRecord], prober: &dyn UsageProber) -> Vec<Device> {
    records
        .iter()
        .filter(|record| record.is_external())
        .enumerate()
        .map(|(index, record)| Device::from_record(record, index, prober))
        .collect()
}

/// Whether two device sequences match by topology.
pub fn same_devices(a: &[Device], b: &[Device]) -> bool {
    a.len() == b.len() && a.iter().zip(b).all(|(x, y)| x.same_topology(y))
}
