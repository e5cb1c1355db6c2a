//! Live device set shared between the refresh loop, operations and the UI.
//!
//! Every mutation goes through the store's write lock, so a refresh tick can
//! never overwrite action/progress written by an in-flight operation, and an
//! operation never sees a half-replaced device list.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use tokio::sync::RwLock;

use super::error::OperationError;
use super::models::{Device, DeviceAction, OperationState, same_devices};

/// What a clone reads from: a whole device or one of its partitions.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CloneSource {
    /// Kernel name of the owning device (whose state the clone drives).
    pub device: String,
    /// Node the copy tool reads.
    pub node: PathBuf,
    pub size: u64,
}

/// Live devices plus the state of operations running on them.
///
/// Operation state is keyed by kernel name and outlives the device entry, so a
/// device that drops out of one refresh comes back with its operation intact.
#[derive(Default)]
struct Inner {
    devices: Vec<Device>,
    operations: HashMap<String, OperationState>,
}

impl Inner {
    fn device_mut(&mut self, kname: &str) -> Option<&mut Device> {
        self.devices.iter_mut().find(|d| d.kname == kname)
    }

    /// Mirror the operation state of `kname` onto its device entry, if listed.
    fn publish(&mut self, kname: &str) {
        let state = self.operations.get(kname).copied().unwrap_or_default();
        if let Some(device) = self.device_mut(kname) {
            device.state = state;
        }
    }
}

#[derive(Clone, Default)]
pub struct DeviceStore {
    inner: Arc<RwLock<Inner>>,
}

impl DeviceStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Copy of the current device sequence.
    pub async fn snapshot(&self) -> Vec<Device> {
        self.inner.read().await.devices.clone()
    }

    pub async fn get(&self, kname: &str) -> Option<Device> {
        self.inner
            .read()
            .await
            .devices
            .iter()
            .find(|d| d.kname == kname)
            .cloned()
    }

    pub async fn len(&self) -> usize {
        self.inner.read().await.devices.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.inner.read().await.devices.is_empty()
    }

    /// Resolve a device or partition kernel name to a clone source.
    pub async fn resolve_source(&self, kname: &str) -> Option<CloneSource> {
        let inner = self.inner.read().await;
        inner.devices.iter().find_map(|device| {
            if device.kname == kname {
                return Some(CloneSource {
                    device: device.kname.clone(),
                    node: PathBuf::from(&device.kname),
                    size: device.size,
                });
            }
            device.partition(kname).map(|part| CloneSource {
                device: device.kname.clone(),
                node: PathBuf::from(&part.kname),
                size: part.size,
            })
        })
    }

    /// Replace the live sequence unless it matches `fresh` by topology.
    ///
    /// Returns `true` if the sequence was replaced. Every device in `fresh`
    /// takes the state of any operation running on it.
    pub async fn replace_if_changed(&self, mut fresh: Vec<Device>) -> bool {
        let mut inner = self.inner.write().await;
        if same_devices(&inner.devices, &fresh) {
            return false;
        }

        for device in &mut fresh {
            device.state = inner
                .operations
                .get(&device.kname)
                .copied()
                .unwrap_or_default();
        }
        inner.devices = fresh;
        true
    }

    /// Atomically move a listed, idle device into `action` with progress 0.
    pub async fn begin(&self, kname: &str, action: DeviceAction) -> Result<(), OperationError> {
        let mut inner = self.inner.write().await;
        if !inner.devices.iter().any(|d| d.kname == kname) {
            return Err(OperationError::DeviceNotFound(kname.to_string()));
        }

        if let Some(running) = inner.operations.get(kname) {
            return Err(OperationError::DeviceBusy {
                device: kname.to_string(),
                action: running.action,
            });
        }

        inner.operations.insert(
            kname.to_string(),
            OperationState {
                action,
                progress: 0,
            },
        );
        inner.publish(kname);
        Ok(())
    }

    /// Record clone progress. Values never move backwards; ignored unless
    /// the device is cloning.
    pub async fn set_progress(&self, kname: &str, progress: u8) {
        let mut inner = self.inner.write().await;
        let Some(state) = inner.operations.get_mut(kname) else {
            return;
        };
        if state.action != DeviceAction::Cloning {
            return;
        }
        state.progress = state.progress.max(progress.min(100));
        inner.publish(kname);
    }

    /// End the operation on a device, returning it to idle with progress 0.
    pub async fn finish(&self, kname: &str) {
        let mut inner = self.inner.write().await;
        inner.operations.remove(kname);
        inner.publish(kname);
    }

    /// Operation state of a device. Unlisted devices with a running operation
    /// still report it.
    pub async fn state(&self, kname: &str) -> Option<OperationState> {
        let inner = self.inner.read().await;
        if let Some(state) = inner.operations.get(kname) {
            return Some(*state);
        }
        inner
            .devices
            .iter()
            .find(|d| d.kname == kname)
            .map(|d| d.state)
    }
}
