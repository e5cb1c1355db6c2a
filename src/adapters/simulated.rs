//! In-memory stand-ins for the external tools.
//!
//! `SimulatedRunner` answers enumeration requests from an editable topology,
//! applies unmounts to it, and serves copies from a [`CopyScript`]. The
//! [`Simulator`] handle edits that state while the runner is in use.

use std::collections::{HashMap, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use tokio::sync::Semaphore;

use crate::core::error::ProbeError;
use crate::core::models::format_size;
use crate::core::process::{ChildProcessHandle, CommandOutput, ExitOutcome, ProcessRunner};
use crate::core::topology::{BlockDeviceRecord, LsblkOutput};
use crate::core::usage::{Usage, UsageProber};

/// How a simulated copy behaves.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CopyScript {
    /// Report evenly spaced byte counts up to the source size, then succeed.
    Ramp { steps: u32 },
    /// Report one byte count per poll, then print `trailer` and exit.
    Scripted {
        byte_counts: Vec<u64>,
        exit_code: i32,
        trailer: Vec<String>,
    },
    /// Report nothing and run until terminated.
    Hang,
}

impl Default for CopyScript {
    fn default() -> Self {
        Self::Ramp { steps: 20 }
    }
}

impl CopyScript {
    pub fn succeed_with(byte_counts: Vec<u64>) -> Self {
        Self::Scripted {
            byte_counts,
            exit_code: 0,
            trailer: Vec::new(),
        }
    }

    pub fn fail_with(message: impl Into<String>) -> Self {
        Self::Scripted {
            byte_counts: Vec::new(),
            exit_code: 1,
            trailer: vec![message.into()],
        }
    }
}

/// A recorded tool invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Invocation {
    pub program: String,
    pub args: Vec<String>,
}

#[derive(Default)]
struct SimState {
    topology: Vec<BlockDeviceRecord>,
    enumeration_failure: Option<String>,
    unmount_failures: HashMap<String, String>,
    copy_script: CopyScript,
    invocations: Vec<Invocation>,
    terminated_copies: usize,
    unmount_gate: Option<Arc<Semaphore>>,
}

fn lock(state: &Mutex<SimState>) -> MutexGuard<'_, SimState> {
    // A panicking test thread must not wedge the others.
    state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Controller for a [`SimulatedRunner`].
#[derive(Clone)]
pub struct Simulator {
    state: Arc<Mutex<SimState>>,
}

impl Simulator {
    pub fn set_topology(&self, topology: Vec<BlockDeviceRecord>) {
        lock(&self.state).topology = topology;
    }

    pub fn topology(&self) -> Vec<BlockDeviceRecord> {
        lock(&self.state).topology.clone()
    }

    pub fn add_device(&self, record: BlockDeviceRecord) {
        lock(&self.state).topology.push(record);
    }

    pub fn remove_device(&self, kname: &str) {
        lock(&self.state).topology.retain(|r| r.kname != kname);
    }

    /// Make enumeration exit non-zero with `message`, or succeed again with `None`.
    pub fn fail_enumeration(&self, message: Option<&str>) {
        lock(&self.state).enumeration_failure = message.map(str::to_string);
    }

    pub fn fail_unmount(&self, partition: &str, message: &str) {
        lock(&self.state)
            .unmount_failures
            .insert(partition.to_string(), message.to_string());
    }

    pub fn set_copy_script(&self, script: CopyScript) {
        lock(&self.state).copy_script = script;
    }

    pub fn invocations(&self) -> Vec<Invocation> {
        lock(&self.state).invocations.clone()
    }

    /// Invocations of one tool, by file name.
    pub fn invocations_of(&self, program: &str) -> Vec<Invocation> {
        self.invocations()
            .into_iter()
            .filter(|i| i.program == program)
            .collect()
    }

    pub fn terminated_copies(&self) -> usize {
        lock(&self.state).terminated_copies
    }

    /// Hold every later unmount until the returned gate is given a permit
    /// per unmount. The invocation is recorded before it blocks.
    pub fn hold_unmounts(&self) -> Arc<Semaphore> {
        let gate = Arc::new(Semaphore::new(0));
        lock(&self.state).unmount_gate = Some(gate.clone());
        gate
    }
}

pub struct SimulatedRunner {
    state: Arc<Mutex<SimState>>,
}

impl SimulatedRunner {
    pub fn new() -> (Self, Simulator) {
        let state = Arc::new(Mutex::new(SimState::default()));
        (
            Self {
                state: state.clone(),
            },
            Simulator { state },
        )
    }

    /// A runner preloaded with a small demo topology.
    pub fn demo() -> (Self, Simulator) {
        let (runner, simulator) = Self::new();
        simulator.set_topology(demo_topology());
        (runner, simulator)
    }
}

fn tool_name(program: &Path) -> String {
    program
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default()
}

fn ok(stdout: String) -> CommandOutput {
    CommandOutput {
        exit: ExitOutcome::success(),
        stdout,
        stderr: String::new(),
    }
}

fn failed(stderr: String) -> CommandOutput {
    CommandOutput {
        exit: ExitOutcome::code(1),
        stdout: String::new(),
        stderr,
    }
}

#[async_trait]
impl ProcessRunner for SimulatedRunner {
    async fn output(&self, program: &Path, args: &[String]) -> std::io::Result<CommandOutput> {
        let name = tool_name(program);
        let gate = {
            let mut state = lock(&self.state);
            state.invocations.push(Invocation {
                program: name.clone(),
                args: args.to_vec(),
            });
            state.unmount_gate.clone().filter(|_| name == "udisksctl")
        };
        if let Some(gate) = gate {
            if let Ok(permit) = gate.acquire().await {
                permit.forget();
            }
        }

        let mut state = lock(&self.state);
        match name.as_str() {
            "lsblk" => {
                if let Some(message) = &state.enumeration_failure {
                    return Ok(failed(format!("lsblk: {}", message)));
                }
                let listing = LsblkOutput {
                    blockdevices: state.topology.clone(),
                };
                let json = serde_json::to_string(&listing).map_err(std::io::Error::other)?;
                Ok(ok(json))
            }
            "sync" => Ok(ok(String::new())),
            "udisksctl" => {
                let node = match args {
                    [cmd, flag, node] if cmd == "unmount" && flag == "-b" => node.clone(),
                    _ => return Ok(failed(format!("udisksctl: unsupported arguments {:?}", args))),
                };
                if let Some(message) = state.unmount_failures.get(&node) {
                    return Ok(failed(format!("Error unmounting {}: {}", node, message)));
                }
                match state.topology.iter_mut().find_map(|r| r.find_mut(&node)) {
                    Some(record) if record.mount_point().is_some() => {
                        record.mountpoint = None;
                        Ok(ok(format!("Unmounted {}.", node)))
                    }
                    Some(_) => Ok(failed(format!("Error unmounting {}: not mounted", node))),
                    None => Ok(failed(format!(
                        "Error looking up object for device {}",
                        node
                    ))),
                }
            }
            _ => Err(std::io::Error::new(
                std::io::ErrorKind::NotFound,
                format!("{}: not available in simulation", name),
            )),
        }
    }

    fn spawn(
        &self,
        program: &Path,
        args: &[String],
    ) -> std::io::Result<Box<dyn ChildProcessHandle>> {
        let name = tool_name(program);
        let mut state = lock(&self.state);
        state.invocations.push(Invocation {
            program: name.clone(),
            args: args.to_vec(),
        });

        if name != "dd" {
            return Err(std::io::Error::new(
                std::io::ErrorKind::NotFound,
                format!("{}: not available in simulation", name),
            ));
        }

        let source = args
            .iter()
            .find_map(|a| a.strip_prefix("if="))
            .unwrap_or_default()
            .to_string();
        let total = state
            .topology
            .iter_mut()
            .find_map(|r| r.find_mut(&source))
            .map(|r| r.size)
            .unwrap_or(0);

        Ok(Box::new(SimulatedCopy::new(
            &state.copy_script,
            total,
            self.state.clone(),
        )))
    }
}

fn progress_line(bytes: u64, tick: usize) -> String {
    format!(
        "{} bytes ({}) copied, {} s, 10.0 MB/s",
        bytes,
        format_size(bytes),
        tick
    )
}

struct SimulatedCopy {
    pending: VecDeque<u64>,
    exit_code: i32,
    trailer: Vec<String>,
    hang: bool,
    exited: Option<ExitOutcome>,
    ticks: usize,
    state: Arc<Mutex<SimState>>,
}

impl SimulatedCopy {
    fn new(script: &CopyScript, total: u64, state: Arc<Mutex<SimState>>) -> Self {
        let (pending, exit_code, trailer, hang) = match script {
            CopyScript::Ramp { steps } => {
                let steps = (*steps).max(1) as u64;
                let counts: VecDeque<u64> = (0..=steps).map(|i| total / steps * i).collect();
                let records = total.div_ceil(4 * 1024 * 1024);
                let trailer = vec![
                    format!("{}+0 records in", records),
                    format!("{}+0 records out", records),
                    progress_line(total, steps as usize),
                ];
                (counts, 0, trailer, false)
            }
            CopyScript::Scripted {
                byte_counts,
                exit_code,
                trailer,
            } => (
                byte_counts.iter().copied().collect(),
                *exit_code,
                trailer.clone(),
                false,
            ),
            CopyScript::Hang => (VecDeque::new(), 0, Vec::new(), true),
        };

        Self {
            pending,
            exit_code,
            trailer,
            hang,
            exited: None,
            ticks: 0,
            state,
        }
    }
}

#[async_trait]
impl ChildProcessHandle for SimulatedCopy {
    fn request_progress(&mut self) -> std::io::Result<()> {
        self.ticks += 1;
        Ok(())
    }

    fn poll_diagnostics(&mut self) -> Vec<String> {
        match self.pending.pop_front() {
            Some(bytes) => vec![progress_line(bytes, self.ticks)],
            None => Vec::new(),
        }
    }

    fn try_wait(&mut self) -> std::io::Result<Option<ExitOutcome>> {
        if self.exited.is_none() && !self.hang && self.pending.is_empty() {
            self.exited = Some(ExitOutcome::code(self.exit_code));
        }
        Ok(self.exited)
    }

    async fn drain_diagnostics(&mut self) -> Vec<String> {
        let mut lines: Vec<String> = self
            .pending
            .drain(..)
            .map(|bytes| progress_line(bytes, self.ticks))
            .collect();
        lines.append(&mut self.trailer);
        lines
    }

    async fn terminate(&mut self) -> std::io::Result<ExitOutcome> {
        if let Some(exit) = self.exited {
            return Ok(exit);
        }
        let exit = ExitOutcome::signalled();
        self.exited = Some(exit);
        lock(&self.state).terminated_copies += 1;
        Ok(exit)
    }
}

/// Fixed usage per mount point. Unknown mount points fail to probe.
#[derive(Default)]
pub struct SimulatedProber {
    usage: Mutex<HashMap<PathBuf, Usage>>,
}

impl SimulatedProber {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_usage(self, mount_point: impl Into<PathBuf>, total: u64, used: u64) -> Self {
        self.set_usage(mount_point, total, used);
        self
    }

    pub fn set_usage(&self, mount_point: impl Into<PathBuf>, total: u64, used: u64) {
        let usage = Usage {
            total,
            used,
            free: total.saturating_sub(used),
        };
        self.usage
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .insert(mount_point.into(), usage);
    }

    pub fn demo() -> Self {
        Self::new()
            .with_usage("/", 500 * GIB, 120 * GIB)
            .with_usage("/media/demo/BOOT", 256 * MIB, 48 * MIB)
            .with_usage("/media/demo/rootfs", 14 * GIB, 3 * GIB)
    }
}

impl UsageProber for SimulatedProber {
    fn probe(&self, mount_point: &Path) -> Result<Usage, ProbeError> {
        self.usage
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .get(mount_point)
            .copied()
            .ok_or_else(|| ProbeError {
                mount_point: mount_point.to_path_buf(),
                source: std::io::Error::from(std::io::ErrorKind::NotFound),
            })
    }
}

const MIB: u64 = 1024 * 1024;
const GIB: u64 = 1024 * MIB;

/// A top-level disk record.
pub fn disk(kname: &str, vendor: Option<&str>, model: Option<&str>, size: u64) -> BlockDeviceRecord {
    BlockDeviceRecord {
        name: kname.to_string(),
        kname: kname.to_string(),
        kind: "disk".to_string(),
        subsystems: "block:scsi:usb:pci".to_string(),
        rm: true,
        hotplug: true,
        size,
        phy_sec: 512,
        log_sec: 512,
        vendor: vendor.map(str::to_string),
        model: model.map(str::to_string),
        ..Default::default()
    }
}

/// A partition record.
pub fn partition(kname: &str, size: u64, fstype: &str, mountpoint: Option<&str>) -> BlockDeviceRecord {
    BlockDeviceRecord {
        name: kname.to_string(),
        kname: kname.to_string(),
        kind: "part".to_string(),
        subsystems: "block:scsi:usb:pci".to_string(),
        size,
        phy_sec: 512,
        log_sec: 512,
        fstype: Some(fstype.to_string()),
        mountpoint: mountpoint.map(str::to_string),
        ..Default::default()
    }
}

fn demo_topology() -> Vec<BlockDeviceRecord> {
    let mut internal = disk("/dev/nvme0n1", None, Some("Samsung SSD 980"), 500 * GIB);
    internal.rm = false;
    internal.hotplug = false;
    internal.subsystems = "block:nvme:pci".to_string();
    internal.children = vec![partition("/dev/nvme0n1p1", 500 * GIB, "ext4", Some("/"))];

    let mut stick = disk("/dev/sdb", Some("SanDisk"), Some("Cruzer Blade"), 16 * GIB);
    stick.children = vec![
        partition("/dev/sdb1", 256 * MIB, "vfat", Some("/media/demo/BOOT")),
        partition("/dev/sdb2", 14 * GIB, "ext4", Some("/media/demo/rootfs")),
    ];

    let empty_slot = disk("/dev/sdc", Some("Generic"), Some("SD Reader"), 0);

    let mut card = disk("/dev/mmcblk0", None, None, 32 * GIB);
    card.rm = false;
    card.subsystems = "block:mmc:mmc_host:platform".to_string();
    card.children = vec![partition("/dev/mmcblk0p1", 32 * GIB, "exfat", None)];

    vec![internal, stick, empty_slot, card]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ramp_reaches_source_size() {
        let (runner, _sim) = SimulatedRunner::new();
        let mut copy = SimulatedCopy::new(&CopyScript::Ramp { steps: 4 }, 4000, runner.state.clone());
        let mut seen = Vec::new();
        while copy.try_wait().unwrap().is_none() {
            seen.extend(copy.poll_diagnostics());
        }
        assert_eq!(seen.len(), 5);
        assert!(seen[4].starts_with("4000 bytes"));
    }

    #[test]
    fn hang_never_exits() {
        let (runner, _sim) = SimulatedRunner::new();
        let mut copy = SimulatedCopy::new(&CopyScript::Hang, 100, runner.state.clone());
        for _ in 0..10 {
            assert!(copy.try_wait().unwrap().is_none());
        }
    }

    #[test]
    fn demo_prober_knows_demo_mounts() {
        let prober = SimulatedProber::demo();
        assert_eq!(prober.probe(Path::new("/media/demo/BOOT")).unwrap().used, 48 * MIB);
        assert!(prober.probe(Path::new("/media/other")).is_err());
    }
}
