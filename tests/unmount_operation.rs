mod common;

use std::time::Duration;

use extdrive::core::{DeviceAction, OperationError, OperationState};
use tokio::time::timeout;

#[tokio::test]
async fn test_unmounts_every_mounted_partition() {
    let mut stick = common::stick();
    stick.children[2].mountpoint = None;
    let (ctx, sim) = common::simulated(vec![stick]);
    ctx.refresh_loop().tick().await;

    let summary = ctx.ops().unmount("/dev/sdb").await.unwrap();
    assert_eq!(summary.device, "/dev/sdb");
    assert_eq!(summary.unmounted, vec!["/dev/sdb1", "/dev/sdb2"]);

    assert_eq!(sim.invocations_of("sync").len(), 1);
    let calls = sim.invocations_of("udisksctl");
    assert_eq!(calls.len(), 2);
    assert_eq!(calls[0].args, vec!["unmount", "-b", "/dev/sdb1"]);
    assert_eq!(ctx.store.state("/dev/sdb").await, Some(OperationState::default()));

    // The next refresh sees the partitions released.
    assert!(ctx.refresh_loop().tick().await);
    let device = ctx.store.get("/dev/sdb").await.unwrap();
    assert_eq!(device.mounted_partitions().count(), 0);
}

#[tokio::test]
async fn test_sync_runs_before_any_unmount() {
    let (ctx, sim) = common::simulated(vec![common::stick()]);
    ctx.refresh_loop().tick().await;

    ctx.ops().unmount("/dev/sdb").await.unwrap();

    let programs: Vec<String> = sim
        .invocations()
        .into_iter()
        .map(|i| i.program)
        .filter(|p| p != "lsblk")
        .collect();
    assert_eq!(programs, vec!["sync", "udisksctl", "udisksctl", "udisksctl"]);
}

#[tokio::test]
async fn test_device_reports_unmounting_while_in_progress() {
    let (ctx, sim) = common::simulated(vec![common::stick()]);
    ctx.refresh_loop().tick().await;
    let gate = sim.hold_unmounts();

    let ops = ctx.ops();
    let task = tokio::spawn(async move { ops.unmount("/dev/sdb").await });

    timeout(Duration::from_secs(5), async {
        while sim.invocations_of("udisksctl").is_empty() {
            tokio::time::sleep(Duration::from_millis(2)).await;
        }
    })
    .await
    .expect("unmount never reached udisksctl");

    let state = ctx.store.state("/dev/sdb").await.unwrap();
    assert_eq!(state.action, DeviceAction::Unmounting);
    assert_eq!(
        ctx.store.get("/dev/sdb").await.unwrap().state.action,
        DeviceAction::Unmounting
    );
    let busy = ctx.ops().unmount("/dev/sdb").await;
    assert!(matches!(
        busy,
        Err(OperationError::DeviceBusy {
            action: DeviceAction::Unmounting,
            ..
        })
    ));

    gate.add_permits(3);
    let summary = timeout(Duration::from_secs(5), task)
        .await
        .expect("unmount timed out")
        .unwrap()
        .unwrap();
    assert_eq!(summary.unmounted.len(), 3);
    assert_eq!(ctx.store.state("/dev/sdb").await, Some(OperationState::default()));
}

#[tokio::test]
async fn test_failure_stops_the_sequence() {
    let (ctx, sim) = common::simulated(vec![common::stick()]);
    ctx.refresh_loop().tick().await;
    sim.fail_unmount("/dev/sdb2", "target is busy");

    let err = ctx.ops().unmount("/dev/sdb").await.unwrap_err();
    match err {
        OperationError::Unmount(e) => {
            assert_eq!(e.partition, "/dev/sdb2");
            assert_eq!(e.unmounted, vec!["/dev/sdb1"]);
            assert!(e.message.contains("target is busy"));
        }
        other => panic!("expected unmount error, got {:?}", other),
    }

    // No retry and nothing after the failing partition.
    assert_eq!(sim.invocations_of("udisksctl").len(), 2);
    assert_eq!(ctx.store.state("/dev/sdb").await, Some(OperationState::default()));

    let topology = sim.topology();
    assert_eq!(topology[0].children[0].mountpoint, None);
    assert!(topology[0].children[1].mountpoint.is_some());
    assert!(topology[0].children[2].mountpoint.is_some());
}

#[tokio::test]
async fn test_nothing_mounted() {
    let mut stick = common::stick();
    for part in &mut stick.children {
        part.mountpoint = None;
    }
    let (ctx, sim) = common::simulated(vec![stick]);
    ctx.refresh_loop().tick().await;

    let summary = ctx.ops().unmount("/dev/sdb").await.unwrap();
    assert!(summary.unmounted.is_empty());
    assert!(sim.invocations_of("udisksctl").is_empty());
}

#[tokio::test]
async fn test_sync_failure_does_not_block_unmount() {
    let mut config = extdrive::config::AppConfig {
        simulation: true,
        ..Default::default()
    };
    config.tools.sync = std::path::PathBuf::from("missing-sync");
    let (runner, sim) = extdrive::adapters::simulated::SimulatedRunner::new();
    sim.set_topology(vec![common::stick()]);
    let ctx = extdrive::context::AppContext::new(
        config,
        std::sync::Arc::new(runner),
        std::sync::Arc::new(extdrive::adapters::simulated::SimulatedProber::new()),
    );
    ctx.refresh_loop().tick().await;

    let summary = ctx.ops().unmount("/dev/sdb").await.unwrap();
    assert_eq!(summary.unmounted.len(), 3);
}

#[tokio::test]
async fn test_unknown_device() {
    let (ctx, _sim) = common::simulated(vec![common::stick()]);
    ctx.refresh_loop().tick().await;

    let result = ctx.ops().unmount("/dev/sdb1").await;
    assert!(matches!(result, Err(OperationError::DeviceNotFound(_))));
}
