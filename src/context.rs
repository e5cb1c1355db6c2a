use std::sync::Arc;
use std::time::Duration;

use crate::config::{AppConfig, ToolPaths};
use crate::core::process::ProcessRunner;
use crate::core::usage::UsageProber;
use crate::core::{DeviceStore, DriveOps, RefreshLoop, TopologyReader};

/// Shared state wired together once at startup.
#[derive(Clone)]
pub struct AppContext {
    pub config: Arc<AppConfig>,
    pub store: DeviceStore,
    pub runner: Arc<dyn ProcessRunner>,
    pub prober: Arc<dyn UsageProber>,
    pub tools: Arc<ToolPaths>,
}

impl AppContext {
    pub fn new(
        config: AppConfig,
        runner: Arc<dyn ProcessRunner>,
        prober: Arc<dyn UsageProber>,
    ) -> Self {
        // Simulated runners match tools by name, so only resolve real paths.
        let tools = if config.simulation {
            config.tools.clone()
        } else {
            config.tools.resolve()
        };

        Self {
            config: Arc::new(config),
            store: DeviceStore::new(),
            runner,
            prober,
            tools: Arc::new(tools),
        }
    }

    pub fn topology_reader(&self) -> TopologyReader {
        TopologyReader::new(self.runner.clone(), self.tools.lsblk.clone())
    }

    pub fn refresh_loop(&self) -> RefreshLoop {
        RefreshLoop::new(
            self.topology_reader(),
            self.prober.clone(),
            self.store.clone(),
            Duration::from_millis(self.config.refresh_interval_ms.max(1)),
        )
    }

    pub fn ops(&self) -> DriveOps {
        DriveOps::new(
            self.store.clone(),
            self.runner.clone(),
            self.tools.clone(),
            self.config.clone.clone(),
        )
    }
}
