//! # Mach Platform Abstraction Layer
//!
//! This crate provides a unified API over the host facilities used to touch
//! kernel memory from user space:
//! - **Mock Mode**: in-memory kernel with a call journal, for unit testing
//! - **Runtime Mode**: real Mach VM and port calls (Apple targets only)
//!
//! ## Usage
//!
//! ```rust,ignore
//! use mach_platform::{MachHost, MockHost};
//!
//! let host = MockHost::new();
//! let kr = host.vm_write(task, 0xffff_fff0_0000_1000, &[0u8; 8]);
//! ```
//!
//! ## Build Modes
//!
//! ```bash
//! # Mock (default)
//! cargo build
//!
//! # Runtime (real Mach calls)
//! cargo build --no-default-features --features runtime
//! ```

pub mod types;

#[cfg(feature = "mock")]
pub mod mock;

#[cfg(all(feature = "runtime", target_vendor = "apple"))]
pub mod apple;

pub use types::*;

#[cfg(feature = "mock")]
pub use mock::{HostCall, HostOp, MockHost};

#[cfg(all(feature = "runtime", target_vendor = "apple"))]
pub use apple::AppleHost;

/// Host facilities needed by the kernel memory layer.
///
/// Every method maps onto exactly one host call. Implementations perform no
/// retries and no logging; policy lives in the caller.
pub trait MachHost {
    /// `mach_port_set_context` on a port in our own task.
    fn port_set_context(&self, port: MachPort, context: u64) -> KernResult<()>;

    /// `pid_for_task`: returns the pid the kernel reads through `port`.
    fn pid_for_task(&self, port: MachPort) -> KernResult<i32>;

    /// `mach_vm_read_overwrite` into `dest`. Returns the number of bytes the
    /// host reports as copied, which may be less than `dest.len()`.
    fn vm_read_overwrite(&self, task: MachPort, address: u64, dest: &mut [u8]) -> KernResult<u64>;

    /// `mach_vm_write` of the whole of `data`.
    fn vm_write(&self, task: MachPort, address: u64, data: &[u8]) -> KernResult<()>;

    /// `mach_vm_allocate`. Returns the address chosen by the host.
    fn vm_allocate(&self, task: MachPort, size: u64, flags: VmAllocateFlags) -> KernResult<u64>;

    /// `mach_vm_deallocate`.
    fn vm_deallocate(&self, task: MachPort, address: u64, size: u64) -> KernResult<()>;

    /// `mach_vm_protect`.
    fn vm_protect(
        &self,
        task: MachPort,
        address: u64,
        size: u64,
        set_maximum: bool,
        protection: VmProt,
    ) -> KernResult<()>;

    /// `mach_vm_wire` using the privileged host port.
    fn vm_wire(
        &self,
        host_priv: MachPort,
        task: MachPort,
        address: u64,
        size: u64,
        protection: VmProt,
    ) -> KernResult<()>;

    /// Privileged host port used for wiring.
    fn host_priv(&self) -> MachPort;

    /// `vm_kernel_page_size` of the running kernel.
    fn kernel_page_size(&self) -> u64;
}

/// Platform configuration and detection
pub mod config {
    /// Detect which host backend is active at compile time
    pub fn platform_mode() -> &'static str {
        if cfg!(all(feature = "runtime", target_vendor = "apple")) {
            "runtime"
        } else if cfg!(feature = "mock") {
            "mock"
        } else {
            "none"
        }
    }

    /// Check if the mock backend is compiled in
    pub const fn is_mock() -> bool {
        cfg!(feature = "mock")
    }

    /// Check if the real Mach backend is compiled in
    pub const fn is_runtime() -> bool {
        cfg!(all(feature = "runtime", target_vendor = "apple"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_platform_detection() {
        let mode = config::platform_mode();
        assert!(mode == "mock" || mode == "runtime" || mode == "none");
    }

    #[test]
    #[cfg(feature = "mock")]
    fn test_mock_mode() {
        assert!(config::is_mock());
    }
}
