#![allow(dead_code)]

use std::sync::Arc;

use extdrive::adapters::simulated::{SimulatedProber, SimulatedRunner, Simulator, disk, partition};
use extdrive::config::AppConfig;
use extdrive::context::AppContext;
use extdrive::core::BlockDeviceRecord;

/// A context over simulated tools with a fast poll interval.
pub fn simulated(topology: Vec<BlockDeviceRecord>) -> (AppContext, Simulator) {
    simulated_with(topology, SimulatedProber::new())
}

pub fn simulated_with(
    topology: Vec<BlockDeviceRecord>,
    prober: SimulatedProber,
) -> (AppContext, Simulator) {
    let (runner, simulator) = SimulatedRunner::new();
    simulator.set_topology(topology);

    let mut config = AppConfig {
        simulation: true,
        ..Default::default()
    };
    config.clone.poll_interval_ms = 5;
    config.refresh_interval_ms = 10;

    let ctx = AppContext::new(config, Arc::new(runner), Arc::new(prober));
    (ctx, simulator)
}

/// A removable stick with three mounted partitions.
pub fn stick() -> BlockDeviceRecord {
    let mut record = disk("/dev/sdb", Some("SanDisk"), Some("Cruzer Blade"), 5000);
    record.children = vec![
        partition("/dev/sdb1", 2000, "vfat", Some("/media/t/BOOT")),
        partition("/dev/sdb2", 2000, "ext4", Some("/media/t/root")),
        partition("/dev/sdb3", 1000, "ext4", Some("/media/t/data")),
    ];
    record
}
