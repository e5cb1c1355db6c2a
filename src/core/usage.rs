//! Filesystem usage probing and recursive used-space aggregation.

use std::path::Path;

use tracing::debug;

use super::error::ProbeError;
use super::topology::{BlockDeviceRecord, SWAP_MARKER};

/// Space figures for one mounted filesystem, in bytes.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Usage {
    pub total: u64,
    pub used: u64,
    pub free: u64,
}

/// Queries filesystem usage for a mount point.
///
/// Implementations may block on filesystem statistics; callers run them off
/// the async executor.
pub trait UsageProber: Send + Sync {
    fn probe(&self, mount_point: &Path) -> Result<Usage, ProbeError>;
}

/// Whether a mount point refers to something that can be probed.
///
/// Raw device paths (devtmpfs entries nested under a drive) and the swap
/// marker contribute zero used bytes.
pub fn is_probeable(mount_point: &str) -> bool {
    !mount_point.is_empty() && !mount_point.starts_with("/dev/") && mount_point != SWAP_MARKER
}

/// Used bytes of a record and everything below it.
pub fn used_bytes(record: &BlockDeviceRecord, prober: &dyn UsageProber) -> u64 {
    let own = match record.mount_point() {
        Some(mount) if is_probeable(mount) => match prober.probe(Path::new(mount)) {
            Ok(usage) => usage.used,
            Err(e) => {
                debug!(device = %record.kname, error = %e, "Usage probe failed, counting as unused");
                0
            }
        },
        _ => 0,
    };

    record
        .children
        .iter()
        .fold(own, |acc, child| acc.saturating_add(used_bytes(child, prober)))
}
