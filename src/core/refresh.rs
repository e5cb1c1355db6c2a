//! Periodic topology refresh.
//!
//! Each tick reads the topology, builds the device model on the blocking pool
//! and hands it to the store, which keeps the live devices untouched when
//! nothing changed.

use std::sync::Arc;
use std::time::Duration;

use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::models::build;
use super::store::DeviceStore;
use super::topology::TopologyReader;
use super::usage::UsageProber;

pub struct RefreshLoop {
    reader: TopologyReader,
    prober: Arc<dyn UsageProber>,
    store: DeviceStore,
    interval: Duration,
}

impl RefreshLoop {
    pub fn new(
        reader: TopologyReader,
        prober: Arc<dyn UsageProber>,
        store: DeviceStore,
        interval: Duration,
    ) -> Self {
        Self {
            reader,
            prober,
            store,
            interval,
        }
    }

    /// Run one read-compare-replace cycle. Returns `true` if the live set changed.
    pub async fn tick(&self) -> bool {
        let records = self.reader.read_or_empty().await;
        let prober = self.prober.clone();

        let devices = match tokio::task::spawn_blocking(move || build(&records, prober.as_ref())).await
        {
            Ok(devices) => devices,
            Err(e) => {
                warn!(error = %e, "Device model build panicked, keeping previous devices");
                return false;
            }
        };

        let count = devices.len();
        let changed = self.store.replace_if_changed(devices).await;
        if changed {
            info!(devices = count, "External drive set changed");
        } else {
            debug!("Topology unchanged");
        }
        changed
    }

    /// Tick until cancelled. The first tick runs immediately.
    pub async fn run(self, cancel: CancellationToken) {
        let mut interval = tokio::time::interval(self.interval);
        interval.set_missed_tick_behavior(MissedTickBehavior::Skip);

        info!(interval_ms = self.interval.as_millis() as u64, "Refresh loop started");
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = interval.tick() => {
                    self.tick().await;
                }
            }
        }
        info!("Refresh loop stopped");
    }

    /// Spawn [`run`](Self::run) onto the runtime.
    pub fn spawn(self, cancel: CancellationToken) -> tokio::task::JoinHandle<()> {
        tokio::spawn(self.run(cancel))
    }
}
