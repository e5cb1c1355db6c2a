//! Process and filesystem backends: the real system or an in-memory simulation.

use std::sync::Arc;

use tracing::info;

use crate::config::AppConfig;
use crate::core::process::ProcessRunner;
use crate::core::usage::UsageProber;

#[cfg(target_os = "linux")]
pub mod linux;
pub mod simulated;

/// Pick the backends for this run.
pub fn get_backends(config: &AppConfig) -> (Arc<dyn ProcessRunner>, Arc<dyn UsageProber>) {
    if config.simulation {
        info!("Running against simulated drives");
        let (runner, _simulator) = simulated::SimulatedRunner::demo();
        return (Arc::new(runner), Arc::new(simulated::SimulatedProber::demo()));
    }

    #[cfg(target_os = "linux")]
    {
        let grace = std::time::Duration::from_millis(config.clone.terminate_grace_ms);
        (
            Arc::new(linux::SystemProcessRunner::new(grace)),
            Arc::new(linux::StatvfsProber),
        )
    }

    #[cfg(not(target_os = "linux"))]
    {
        tracing::warn!("No system backend for this platform, using simulated drives");
        let (runner, _simulator) = simulated::SimulatedRunner::demo();
        (Arc::new(runner), Arc::new(simulated::SimulatedProber::demo()))
    }
}
