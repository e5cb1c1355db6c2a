pub mod cloning;
pub mod error;
pub mod models;
pub mod operations;
pub mod process;
pub mod refresh;
pub mod store;
pub mod topology;
pub mod unmount;
pub mod usage;

pub use cloning::{CloneHandle, CloneRequest, CloneStatus, CloneSummary, default_destination};
pub use error::{CloneError, CloneFailure, ExternalToolError, OperationError, ProbeError, UnmountError};
pub use models::{Device, DeviceAction, OperationState, Partition, build, format_size};
pub use operations::DriveOps;
pub use process::{ChildProcessHandle, CommandOutput, ExitOutcome, ProcessRunner};
pub use refresh::RefreshLoop;
pub use store::{CloneSource, DeviceStore};
pub use topology::{BlockDeviceRecord, TopologyReader};
pub use unmount::UnmountSummary;
pub use usage::{Usage, UsageProber};
