mod device;
mod probe;

pub use device::{parse_lsblk, LinuxInventory};
pub use probe::{parse_mounts, LinuxProbe, MountEntry};
