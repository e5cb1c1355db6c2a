mod common;

use std::sync::Arc;

use extdrive::adapters::simulated::{SimulatedProber, SimulatedRunner, disk, partition};
use extdrive::core::{TopologyReader, build, format_size};

#[tokio::test]
async fn test_demo_topology_builds_external_drives_only() {
    let (runner, _sim) = SimulatedRunner::demo();
    let reader = TopologyReader::new(Arc::new(runner), "lsblk".into());
    let records = reader.read().await.unwrap();
    assert_eq!(records.len(), 4);

    let devices = build(&records, &SimulatedProber::demo());
    let knames: Vec<&str> = devices.iter().map(|d| d.kname.as_str()).collect();
    assert_eq!(knames, vec!["/dev/sdb", "/dev/mmcblk0"]);

    let stick = &devices[0];
    assert_eq!(stick.name, "SanDisk Cruzer Blade");
    assert_eq!(stick.index, 0);
    assert_eq!(stick.partition_count(), 2);
    assert_eq!(stick.used, (48 + 3 * 1024) * 1024 * 1024);
    assert_eq!(stick.size_str(), "16.00GB");

    let card = &devices[1];
    assert_eq!(card.name, "drive #2");
    assert_eq!(card.index, 1);
    assert_eq!(card.used, 0);
    assert_eq!(card.mounted_partitions().count(), 0);
}

#[tokio::test]
async fn test_usage_aggregates_over_mounted_partitions() {
    let mut stick = common::stick();
    stick.children.push(partition("/dev/sdb4", 100, "swap", Some("[SWAP]")));
    let prober = SimulatedProber::new()
        .with_usage("/media/t/BOOT", 2000, 100)
        .with_usage("/media/t/root", 2000, 700);
    // /media/t/data is unknown to the prober and counts as zero.
    let (ctx, _sim) = common::simulated_with(vec![stick], prober);
    ctx.refresh_loop().tick().await;

    let device = ctx.store.get("/dev/sdb").await.unwrap();
    assert_eq!(device.used, 800);
    assert_eq!(device.partition("/dev/sdb2").unwrap().used, 700);
    assert_eq!(device.partition("/dev/sdb4").unwrap().used, 0);
    assert_eq!(device.used_str(), format_size(800));
}

#[tokio::test]
async fn test_fixed_and_empty_drives_are_skipped() {
    let mut fixed = disk("/dev/sda", Some("ATA"), Some("Internal"), 1 << 30);
    fixed.rm = false;
    fixed.hotplug = false;
    let empty_reader = disk("/dev/sdc", Some("Generic"), Some("Reader"), 0);

    let (ctx, _sim) = common::simulated(vec![fixed, empty_reader, common::stick()]);
    ctx.refresh_loop().tick().await;

    let devices = ctx.store.snapshot().await;
    assert_eq!(devices.len(), 1);
    assert_eq!(devices[0].kname, "/dev/sdb");
    assert_eq!(devices[0].index, 0);
}

#[tokio::test]
async fn test_device_json_carries_operation_state() {
    let (ctx, _sim) = common::simulated(vec![common::stick()]);
    ctx.refresh_loop().tick().await;

    let devices = ctx.store.snapshot().await;
    let json = serde_json::to_value(&devices[0]).unwrap();
    assert_eq!(json["kname"], "/dev/sdb");
    assert_eq!(json["action"], "idle");
    assert_eq!(json["progress"], 0);
    assert_eq!(json["partitions"].as_array().unwrap().len(), 3);
}
