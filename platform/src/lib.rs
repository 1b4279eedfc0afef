#[cfg(target_os = "linux")]
pub mod linux;

#[cfg(target_os = "linux")]
pub use linux::LinuxInventory as PlatformInventory;

#[cfg(target_os = "linux")]
pub use linux::LinuxProbe as PlatformProbe;
