//! System adapter tests against the real tools.
//!
//! Tests skip themselves when `lsblk` or `dd` is not installed.
//!
//! Run: `cargo test --test linux_adapter`

#![cfg(target_os = "linux")]

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use extdrive::adapters::linux::{StatvfsProber, SystemProcessRunner};
use extdrive::config::{CloneConfig, ToolPaths};
use extdrive::core::{
    BlockDeviceRecord, CloneRequest, CloneStatus, Device, DeviceStore, DriveOps, OperationState,
    TopologyReader,
};
use tokio::time::timeout;

fn find_tool(name: &str) -> Option<PathBuf> {
    which::which(name).ok()
}

#[tokio::test]
async fn test_lsblk_topology_parses() {
    let Some(lsblk) = find_tool("lsblk") else {
        eprintln!("lsblk not installed, skipping");
        return;
    };

    let reader = TopologyReader::new(Arc::new(SystemProcessRunner::default()), lsblk);
    // Containers may hide /sys/block; only a parse failure is a bug.
    match reader.read().await {
        Ok(records) => {
            for record in &records {
                assert!(!record.kname.is_empty());
            }
        }
        Err(e) => assert!(
            !matches!(e, extdrive::core::ExternalToolError::Parse { .. }),
            "lsblk output did not parse: {}",
            e
        ),
    }
}

#[tokio::test]
async fn test_dd_clone_of_a_file() {
    let Some(dd) = find_tool("dd") else {
        eprintln!("dd not installed, skipping");
        return;
    };

    let dir = tempfile::tempdir().unwrap();
    let source = dir.path().join("source.bin");
    let destination = dir.path().join("copy.img");
    let data: Vec<u8> = (0..256 * 1024).map(|i| (i % 251) as u8).collect();
    std::fs::write(&source, &data).unwrap();

    // A regular file stands in for the block device node.
    let record = BlockDeviceRecord {
        kname: source.display().to_string(),
        name: source.display().to_string(),
        kind: "disk".to_string(),
        rm: true,
        size: data.len() as u64,
        ..Default::default()
    };
    let store = DeviceStore::new();
    store
        .replace_if_changed(vec![Device::from_record(&record, 0, &StatvfsProber)])
        .await;

    let tools = ToolPaths {
        dd,
        ..Default::default()
    };
    let ops = DriveOps::new(
        store.clone(),
        Arc::new(SystemProcessRunner::new(Duration::from_secs(2))),
        Arc::new(tools),
        CloneConfig {
            block_size: 16 * 1024,
            poll_interval_ms: 100,
            ..Default::default()
        },
    );

    let request = CloneRequest {
        target: record.kname.clone(),
        destination: destination.clone(),
        block_size: None,
    };
    let mut last = None;
    let summary = timeout(
        Duration::from_secs(30),
        ops.clone_device(request, |s| last = Some(s.clone())),
    )
    .await
    .expect("dd did not finish")
    .expect("dd clone failed");

    assert!(matches!(last, Some(CloneStatus::Completed { .. })));
    assert_eq!(summary.bytes_copied, data.len() as u64);
    assert_eq!(std::fs::read(&destination).unwrap(), data);
    assert_eq!(store.state(&record.kname).await, Some(OperationState::default()));
}

#[tokio::test]
async fn test_dd_failure_is_classified() {
    let Some(dd) = find_tool("dd") else {
        eprintln!("dd not installed, skipping");
        return;
    };

    let dir = tempfile::tempdir().unwrap();
    let missing = dir.path().join("gone.bin");
    let record = BlockDeviceRecord {
        kname: missing.display().to_string(),
        kind: "disk".to_string(),
        hotplug: true,
        size: 4096,
        ..Default::default()
    };
    let store = DeviceStore::new();
    store
        .replace_if_changed(vec![Device::from_record(&record, 0, &StatvfsProber)])
        .await;

    let ops = DriveOps::new(
        store,
        Arc::new(SystemProcessRunner::default()),
        Arc::new(ToolPaths {
            dd,
            ..Default::default()
        }),
        CloneConfig {
            poll_interval_ms: 100,
            ..Default::default()
        },
    );

    let request = CloneRequest {
        target: record.kname.clone(),
        destination: dir.path().join("out.img"),
        block_size: None,
    };
    let err = timeout(Duration::from_secs(30), ops.clone_device(request, |_| {}))
        .await
        .expect("dd did not finish")
        .unwrap_err();

    match err {
        extdrive::core::OperationError::Clone(e) => {
            assert_eq!(e.kind, extdrive::core::CloneFailure::NoSuchDevice);
        }
        other => panic!("expected clone error, got {:?}", other),
    }
}
