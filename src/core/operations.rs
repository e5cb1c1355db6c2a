//! Entry point for user-initiated drive operations.

use std::sync::Arc;
use std::time::Duration;

use crate::config::{CloneConfig, ToolPaths};

use super::process::ProcessRunner;
use super::store::DeviceStore;

/// Runs unmount and clone operations against devices in the store.
///
/// Cheap to clone; each operation runs on its own task.
#[derive(Clone)]
pub struct DriveOps {
    pub(crate) store: DeviceStore,
    pub(crate) runner: Arc<dyn ProcessRunner>,
    pub(crate) tools: Arc<ToolPaths>,
    pub(crate) clone_cfg: CloneConfig,
}

impl DriveOps {
    pub fn new(
        store: DeviceStore,
        runner: Arc<dyn ProcessRunner>,
        tools: Arc<ToolPaths>,
        clone_cfg: CloneConfig,
    ) -> Self {
        Self {
            store,
            runner,
            tools,
            clone_cfg,
        }
    }

    pub fn store(&self) -> &DeviceStore {
        &self.store
    }

    pub(crate) fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.clone_cfg.poll_interval_ms.max(1))
    }
}
