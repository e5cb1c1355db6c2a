//! TUI application state and logic.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::context::AppContext;
use crate::core::{
    CloneRequest, Device, DeviceAction, DriveOps, RefreshLoop, default_destination,
};

/// How long a footer notification stays visible.
const NOTIFICATION_TTL: Duration = Duration::from_secs(8);

/// Entries of the per-device action menu.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MenuItem {
    Back,
    Save,
    Unmount,
    CancelClone,
}

impl MenuItem {
    pub fn label(&self) -> &'static str {
        match self {
            MenuItem::Back => "Back",
            MenuItem::Save => "Save drive",
            MenuItem::Unmount => "Unmount",
            MenuItem::CancelClone => "Cancel clone",
        }
    }
}

/// Current view being displayed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum View {
    /// Drive list.
    Devices,
    /// Actions for one drive.
    ActionMenu { device: String, selected: usize },
    /// Choose the whole drive or one partition to save.
    PartitionPicker { device: String, selected: usize },
    /// Confirm a clone before it starts.
    Confirm {
        target: String,
        destination: PathBuf,
    },
}

/// Actions that can be triggered by user input.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    Quit,
    Up,
    Down,
    Select,
    Back,
    Refresh,
}

#[derive(Debug, Clone)]
pub struct Notification {
    pub message: String,
    pub is_error: bool,
    shown_at: Instant,
}

/// Result of a background operation, reported back to the UI loop.
#[derive(Debug)]
struct Outcome {
    message: String,
    is_error: bool,
    /// Device whose clone ended, releasing its cancel token.
    clone_ended: Option<String>,
}

/// Main TUI application state.
pub struct TuiApp {
    ops: DriveOps,
    refresh: Arc<RefreshLoop>,
    refreshing: Option<JoinHandle<()>>,
    backup_directory: PathBuf,
    pub simulation: bool,
    pub devices: Vec<Device>,
    pub selected: usize,
    pub view: View,
    pub running: bool,
    pub notification: Option<Notification>,
    clones: HashMap<String, CancellationToken>,
    outcome_tx: mpsc::UnboundedSender<Outcome>,
    outcome_rx: mpsc::UnboundedReceiver<Outcome>,
}

impl TuiApp {
    pub fn new(ctx: &AppContext) -> Self {
        let (outcome_tx, outcome_rx) = mpsc::unbounded_channel();
        Self {
            ops: ctx.ops(),
            refresh: Arc::new(ctx.refresh_loop()),
            refreshing: None,
            backup_directory: ctx.config.backup_directory.clone(),
            simulation: ctx.config.simulation,
            devices: Vec::new(),
            selected: 0,
            view: View::Devices,
            running: true,
            notification: None,
            clones: HashMap::new(),
            outcome_tx,
            outcome_rx,
        }
    }

    /// Pull the latest device snapshot and any finished operation results.
    pub async fn sync(&mut self) {
        self.devices = self.ops.store().snapshot().await;
        if self.selected >= self.devices.len() {
            self.selected = self.devices.len().saturating_sub(1);
        }

        while let Ok(outcome) = self.outcome_rx.try_recv() {
            if let Some(kname) = &outcome.clone_ended {
                self.clones.remove(kname);
            }
            self.notify(outcome.message, outcome.is_error);
        }

        if self.refreshing.as_ref().is_some_and(|task| task.is_finished()) {
            self.refreshing = None;
        }

        // A device that disappeared takes its menu with it.
        let open_device = match &self.view {
            View::ActionMenu { device, .. } | View::PartitionPicker { device, .. } => {
                Some(device.clone())
            }
            _ => None,
        };
        if let Some(kname) = open_device {
            if self.device(&kname).is_none() {
                self.view = View::Devices;
            }
        }

        if let Some(n) = &self.notification {
            if n.shown_at.elapsed() > NOTIFICATION_TTL {
                self.notification = None;
            }
        }
    }

    pub fn device(&self, kname: &str) -> Option<&Device> {
        self.devices.iter().find(|d| d.kname == kname)
    }

    pub fn selected_device(&self) -> Option<&Device> {
        self.devices.get(self.selected)
    }

    /// Menu entries for a device in its current state.
    pub fn menu_items(&self, kname: &str) -> Vec<MenuItem> {
        let action = self
            .device(kname)
            .map(|d| d.state.action)
            .unwrap_or_default();
        match action {
            DeviceAction::Idle => vec![MenuItem::Back, MenuItem::Save, MenuItem::Unmount],
            DeviceAction::Cloning if self.clones.contains_key(kname) => {
                vec![MenuItem::Back, MenuItem::CancelClone]
            }
            _ => vec![MenuItem::Back],
        }
    }

    /// Picker entries: `None` for the whole drive, then each partition.
    pub fn picker_targets(&self, kname: &str) -> Vec<(String, Option<String>)> {
        let Some(device) = self.device(kname) else {
            return Vec::new();
        };
        let mut targets = vec![(
            format!("All partitions ({})", device.size_str()),
            None,
        )];
        targets.extend(device.partitions.iter().map(|p| {
            (
                format!("{} ({})", p.kname, p.size_str()),
                Some(p.kname.clone()),
            )
        }));
        targets
    }

    fn notify(&mut self, message: String, is_error: bool) {
        self.notification = Some(Notification {
            message,
            is_error,
            shown_at: Instant::now(),
        });
    }

    /// Handle an action and update state accordingly.
    pub async fn handle_action(&mut self, action: Action) {
        match action {
            Action::Quit => self.quit(),
            Action::Refresh => self.refresh_now(),
            Action::Back => {
                self.view = match &self.view {
                    View::PartitionPicker { device, .. } => View::ActionMenu {
                        device: device.clone(),
                        selected: 0,
                    },
                    _ => View::Devices,
                };
            }
            Action::Up => self.navigate(-1),
            Action::Down => self.navigate(1),
            Action::Select => self.select_item().await,
        }
    }

    /// Run one refresh off the render loop; the next sync shows its result.
    fn refresh_now(&mut self) {
        if self.refreshing.is_some() {
            return;
        }
        let refresh = self.refresh.clone();
        self.refreshing = Some(tokio::spawn(async move {
            refresh.tick().await;
        }));
    }

    fn quit(&mut self) {
        for token in self.clones.values() {
            token.cancel();
        }
        self.running = false;
    }

    fn navigate(&mut self, delta: isize) {
        let len = match &self.view {
            View::Devices => self.devices.len(),
            View::ActionMenu { device, .. } => self.menu_items(device).len(),
            View::PartitionPicker { device, .. } => self.picker_targets(device).len(),
            View::Confirm { .. } => return,
        };
        if len == 0 {
            return;
        }

        let step = |current: usize| current.saturating_add_signed(delta).min(len - 1);
        match &mut self.view {
            View::Devices => self.selected = step(self.selected),
            View::ActionMenu { selected, .. } | View::PartitionPicker { selected, .. } => {
                *selected = step(*selected)
            }
            View::Confirm { .. } => {}
        }
    }

    async fn select_item(&mut self) {
        match self.view.clone() {
            View::Devices => {
                if let Some(device) = self.selected_device().map(|d| d.kname.clone()) {
                    self.view = View::ActionMenu {
                        device,
                        selected: 0,
                    };
                }
            }
            View::ActionMenu { device, selected } => {
                let item = self.menu_items(&device).get(selected).copied();
                match item {
                    Some(MenuItem::Save) => {
                        self.view = View::PartitionPicker {
                            device,
                            selected: 0,
                        }
                    }
                    Some(MenuItem::Unmount) => {
                        self.start_unmount(device);
                        self.view = View::Devices;
                    }
                    Some(MenuItem::CancelClone) => {
                        if let Some(token) = self.clones.get(&device) {
                            token.cancel();
                        }
                        self.view = View::Devices;
                    }
                    Some(MenuItem::Back) | None => self.view = View::Devices,
                }
            }
            View::PartitionPicker { device, selected } => {
                let Some((_, partition)) = self.picker_targets(&device).into_iter().nth(selected)
                else {
                    return;
                };
                let target = partition.unwrap_or(device);
                let destination = default_destination(
                    &self.backup_directory,
                    std::path::Path::new(&target),
                    chrono::Local::now(),
                );
                self.view = View::Confirm {
                    target,
                    destination,
                };
            }
            View::Confirm {
                target,
                destination,
            } => {
                self.view = View::Devices;
                self.start_clone(target, destination).await;
            }
        }
    }

    fn start_unmount(&mut self, device: String) {
        let ops = self.ops.clone();
        let tx = self.outcome_tx.clone();
        tokio::spawn(async move {
            let outcome = match ops.unmount(&device).await {
                Ok(summary) => Outcome {
                    message: format!(
                        "{}: unmounted {} partition(s)",
                        summary.device,
                        summary.unmounted.len()
                    ),
                    is_error: false,
                    clone_ended: None,
                },
                Err(e) => Outcome {
                    message: format!("{}: {}", device, e),
                    is_error: true,
                    clone_ended: None,
                },
            };
            let _ = tx.send(outcome);
        });
    }

    async fn start_clone(&mut self, target: String, destination: PathBuf) {
        let request = CloneRequest {
            target: target.clone(),
            destination,
            block_size: None,
        };

        let mut handle = match self.ops.start_clone(request).await {
            Ok(handle) => handle,
            Err(e) => {
                warn!(target = %target, error = %e, "Clone could not start");
                self.notify(format!("{}: {}", target, e), true);
                return;
            }
        };

        info!(target = %target, device = %handle.device(), "Clone started from TUI");
        self.clones
            .insert(handle.device().to_string(), handle.cancel_token());
        self.notify(format!("Saving {}...", target), false);

        let tx = self.outcome_tx.clone();
        let device = handle.device().to_string();
        tokio::spawn(async move {
            // Progress is read from the store; only the final status matters here.
            while let Some(status) = handle.next_status().await {
                if status.is_terminal() {
                    break;
                }
            }
            let outcome = match handle.wait().await {
                Ok(summary) => Outcome {
                    message: format!(
                        "Saved {} to {}",
                        summary.source.display(),
                        summary.destination.display()
                    ),
                    is_error: false,
                    clone_ended: Some(device.clone()),
                },
                Err(e) if e.is_cancelled() => Outcome {
                    message: format!("{}: clone cancelled", target),
                    is_error: false,
                    clone_ended: Some(device.clone()),
                },
                Err(e) => Outcome {
                    message: format!("{}: {}", target, e),
                    is_error: true,
                    clone_ended: Some(device.clone()),
                },
            };
            let _ = tx.send(outcome);
        });
    }
}

/// Short progress/status text for one device row.
pub fn status_text(device: &Device) -> String {
    match device.state.action {
        DeviceAction::Idle => "idle".to_string(),
        DeviceAction::Unmounting => "unmounting".to_string(),
        DeviceAction::Cloning => format!("cloning {}%", device.state.progress),
    }
}


#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::simulated::{
        CopyScript, SimulatedProber, SimulatedRunner, Simulator, disk, partition,
    };
    use crate::config::AppConfig;
    use tokio::time::timeout;

    fn simulated() -> (AppContext, Simulator) {
        let (runner, sim) = SimulatedRunner::new();
        let mut stick = disk("/dev/sdb", Some("SanDisk"), Some("Cruzer"), 5000);
        stick.children = vec![partition("/dev/sdb1", 5000, "vfat", Some("/media/t/STICK"))];
        sim.set_topology(vec![stick]);

        let mut config = AppConfig {
            simulation: true,
            ..Default::default()
        };
        config.clone.poll_interval_ms = 5;
        let ctx = AppContext::new(config, Arc::new(runner), Arc::new(SimulatedProber::new()));
        (ctx, sim)
    }

    async fn sync_until(app: &mut TuiApp, done: impl Fn(&TuiApp) -> bool) {
        timeout(Duration::from_secs(5), async {
            loop {
                app.sync().await;
                if done(app) {
                    break;
                }
                tokio::time::sleep(Duration::from_millis(2)).await;
            }
        })
        .await
        .expect("condition not reached");
    }

    #[tokio::test]
    async fn test_refresh_runs_in_background_one_at_a_time() {
        let (ctx, sim) = simulated();
        let mut app = TuiApp::new(&ctx);

        app.handle_action(Action::Refresh).await;
        assert!(app.refreshing.is_some());
        app.handle_action(Action::Refresh).await;

        sync_until(&mut app, |app| !app.devices.is_empty() && app.refreshing.is_none()).await;
        assert_eq!(sim.invocations_of("lsblk").len(), 1);
    }

    #[tokio::test]
    async fn test_cancel_survives_device_dropping_out() {
        let (ctx, sim) = simulated();
        let refresh = ctx.refresh_loop();
        refresh.tick().await;
        sim.set_copy_script(CopyScript::Hang);

        let mut app = TuiApp::new(&ctx);
        app.sync().await;
        app.start_clone("/dev/sdb".to_string(), PathBuf::from("/tmp/extdrive-tui.img"))
            .await;
        assert!(app.clones.contains_key("/dev/sdb"));

        sim.fail_enumeration(Some("temporary failure"));
        refresh.tick().await;
        app.sync().await;
        assert!(app.devices.is_empty());
        assert!(app.clones.contains_key("/dev/sdb"));

        sim.fail_enumeration(None);
        refresh.tick().await;
        app.sync().await;
        assert_eq!(
            app.menu_items("/dev/sdb"),
            vec![MenuItem::Back, MenuItem::CancelClone]
        );

        app.handle_action(Action::Quit).await;
        sync_until(&mut app, |app| app.clones.is_empty()).await;
        assert_eq!(sim.terminated_copies(), 1);
    }
}
