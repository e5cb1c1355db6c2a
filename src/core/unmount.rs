//! Quiesce a device: flush writes, then unmount each mounted partition.

use tracing::{Instrument, info, info_span, warn};

use super::error::{OperationError, UnmountError};
use super::models::DeviceAction;
use super::operations::DriveOps;

/// Partitions released by a successful unmount.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UnmountSummary {
    pub device: String,
    pub unmounted: Vec<String>,
}

impl DriveOps {
    /// Flush pending writes and unmount every mounted partition of `device`.
    ///
    /// Stops at the first partition that fails; partitions unmounted before
    /// it stay unmounted. The device returns to idle either way.
    pub async fn unmount(&self, device: &str) -> Result<UnmountSummary, OperationError> {
        let snapshot = self
            .store
            .get(device)
            .await
            .ok_or_else(|| OperationError::DeviceNotFound(device.to_string()))?;

        if !snapshot.state.is_idle() {
            return Err(OperationError::DeviceBusy {
                device: device.to_string(),
                action: snapshot.state.action,
            });
        }

        let span = info_span!("unmount", device = %device);
        async {
            self.sync().await;

            self.store.begin(device, DeviceAction::Unmounting).await?;

            let targets: Vec<String> = snapshot
                .mounted_partitions()
                .map(|p| p.kname.clone())
                .collect();

            let result = self.unmount_partitions(device, &targets).await;
            self.store.finish(device).await;
            result
        }
        .instrument(span)
        .await
    }

    /// Global sync. A failure is logged; unmounting flushes each filesystem anyway.
    async fn sync(&self) {
        match self.runner.output(&self.tools.sync, &[]).await {
            Ok(out) if out.exit.is_success() => {}
            Ok(out) => warn!(status = %out.exit, stderr = %out.diagnostic(), "sync reported failure"),
            Err(e) => warn!(error = %e, "Failed to run sync"),
        }
    }

    async fn unmount_partitions(
        &self,
        device: &str,
        targets: &[String],
    ) -> Result<UnmountSummary, OperationError> {
        let mut unmounted = Vec::with_capacity(targets.len());

        for partition in targets {
            let args = vec!["unmount".to_string(), "-b".to_string(), partition.clone()];
            let failure = match self.runner.output(&self.tools.udisksctl, &args).await {
                Ok(out) if out.exit.is_success() => None,
                Ok(out) => Some(format!("{}: {}", out.exit, out.diagnostic())),
                Err(e) => Some(format!(
                    "failed to run {}: {}",
                    self.tools.udisksctl.display(),
                    e
                )),
            };

            if let Some(message) = failure {
                warn!(partition = %partition, error = %message, "Unmount failed");
                return Err(UnmountError {
                    partition: partition.clone(),
                    message,
                    unmounted,
                }
                .into());
            }

            info!(partition = %partition, "Unmounted");
            unmounted.push(partition.clone());
        }

        Ok(UnmountSummary {
            device: device.to_string(),
            unmounted,
        })
    }
}
