//! Host OS Layer
//!
//! Mount table parsing, filesystem probing, subprocess execution and the
//! Linux mount engine.

pub mod command;
pub mod linux;
pub mod mountinfo;
pub mod probe;

pub use command::{CommandExecutor, CommandExecutorRef, CommandOutput, CommandSpec, HostCommands, Secret};
pub use linux::{DeviceClass, LinuxOsDriver, Mounter, MounterRef, SyscallMounter};
pub use mountinfo::{attachment_status, local_devices, parse_mount_line, parse_mount_table};
pub use probe::probe_fs_type;

use crate::registry::RegistryBuilder;

/// Register the OS drivers
pub fn register(builder: &mut RegistryBuilder) {
    builder.register_os_driver(linux::DRIVER_NAME, || Box::new(LinuxOsDriver::new()));
}
