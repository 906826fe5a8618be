//! Kernel Memory - capability-driven access to kernel memory
//!
//! # Purpose
//! Gives higher-level tooling a uniform way to read, write, allocate and
//! protect kernel memory, whatever primitive the exploit chain managed to
//! produce.
//!
//! # Integration Points
//! - Depends on: `mach-platform` (host calls, mock or real)
//! - Provides to: anything that patches kernel structures
//! - Capabilities required: a narrow read port and/or a kernel task port
//!
//! # Architecture
//! [`KernelMemory`] owns the [`Capabilities`] registry and the host. Every
//! operation asks the registry for the strongest primitive available:
//!
//! | Operation | Kernel task port | Narrow read port | Nothing |
//! |-----------|------------------|------------------|---------|
//! | `read32`  | `mach_vm_read_overwrite` | context + `pid_for_task` | fatal |
//! | `write32`, buffers, alloc, protect | Mach VM call | recoverable error | recoverable error |
//!
//! Wider operations (`read64`, `write64`, `directional_copy`) are built from
//! these.
//!
//! # Failure tiers
//! Every failure is logged where it happens and followed by a short pause.
//! Fatal failures then exit the process, unless the configuration asks for
//! them to be returned ([`FatalAction::Return`]).
//!
//! # Testing Strategy
//! - Unit tests: per layer, against `mach_platform::MockHost`
//! - Integration tests: full capability lifecycle under `tests/`

mod compose;
mod config;
mod dispatch;
mod error;
mod registry;
mod vm;

pub use compose::{copy_direction, is_kernel_address, CopyDirection};
pub use config::{FatalAction, KmemConfig};
pub use error::{KmemError, Result, Severity};
pub use registry::{Capabilities, CapabilityState, KernelTaskPort, NarrowReadPort};

pub use mach_platform::{KernReturn, MachHost, MachPort, VmProt};

use static_assertions::const_assert;

/// Lowest kernel virtual address. Anything below is a process address.
pub const KERNEL_ADDRESS_SPACE_BASE: u64 = 0xffff_0000_0000_0000;

/// Distance from the context value to the word `pid_for_task` returns
pub const PROC_PID_OFFSET: u64 = 0x10;

/// Alignment `mach_vm_wire` needs (16KiB kernel pages)
pub const WIRE_ALIGNMENT: u64 = 0x4000;

const_assert!(WIRE_ALIGNMENT.is_power_of_two());
const_assert!(KERNEL_ADDRESS_SPACE_BASE > PROC_PID_OFFSET);

/// Kernel memory accessor
///
/// Single-threaded by construction: registration needs `&mut self`, and the
/// host is free to use interior mutability.
pub struct KernelMemory<H: MachHost> {
    host: H,
    caps: Capabilities,
    config: KmemConfig,
}

impl<H: MachHost> KernelMemory<H> {
    /// Create an accessor with no capabilities and the default configuration
    pub fn new(host: H) -> Self {
        Self::with_config(host, KmemConfig::default())
    }

    pub fn with_config(host: H, config: KmemConfig) -> Self {
        Self {
            host,
            caps: Capabilities::None,
            config,
        }
    }

    /// Register the narrow read port produced by the exploit chain
    ///
    /// The null port is ignored: storing it would amount to revoking a
    /// capability.
    pub fn register_narrow_read(&mut self, port: MachPort) {
        match NarrowReadPort::new(port) {
            Some(port) => {
                self.caps.register_narrow_read(port);
                log::debug!("narrow read port {:#x} registered ({:?})", port.raw(), self.caps.state());
            }
            None => log::warn!("ignoring MACH_PORT_NULL passed as narrow read port"),
        }
    }

    /// Register the kernel task port produced by the exploit chain
    pub fn register_full_access(&mut self, port: MachPort) {
        match KernelTaskPort::new(port) {
            Some(task) => {
                self.caps.register_full_access(task);
                log::debug!("kernel task port {:#x} registered ({:?})", task.raw(), self.caps.state());
            }
            None => log::warn!("ignoring MACH_PORT_NULL passed as kernel task port"),
        }
    }

    pub fn has_read_capability(&self) -> bool {
        self.caps.has_read_capability()
    }

    pub fn has_write_capability(&self) -> bool {
        self.caps.has_write_capability()
    }

    pub fn state(&self) -> CapabilityState {
        self.caps.state()
    }

    pub fn capabilities(&self) -> &Capabilities {
        &self.caps
    }

    pub fn host(&self) -> &H {
        &self.host
    }

    pub fn config(&self) -> &KmemConfig {
        &self.config
    }

    /// Round `size` up to the running kernel's page size. `None` on overflow.
    pub fn round_page_kernel(&self, size: u64) -> Option<u64> {
        mach_platform::round_page(size, self.host.kernel_page_size())
    }

    /// The kernel task port, or a logged `FullAccessRequired` for `op`
    fn require_full(&self, op: &'static str) -> Result<KernelTaskPort> {
        match self.caps.task_port() {
            Some(task) => Ok(task),
            None => self.fail(KmemError::FullAccessRequired { op }),
        }
    }

    /// Log `err`, pause, and apply the fatal policy if it is fatal
    fn fail<T>(&self, err: KmemError) -> Result<T> {
        match err.severity() {
            Severity::Fatal => {
                log::error!("{}", err);
                pause(self.config.fatal_pause);
                if self.config.on_fatal == FatalAction::Exit {
                    std::process::exit(1);
                }
            }
            Severity::Recoverable => {
                log::warn!("{}", err);
                pause(self.config.error_pause);
            }
        }
        Err(err)
    }
}

fn pause(duration: std::time::Duration) {
    if !duration.is_zero() {
        std::thread::sleep(duration);
    }
}
