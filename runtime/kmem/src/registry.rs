//! Capability registry
//!
//! Tracks which kernel memory primitives have been handed to us. A primitive
//! is a one-shot exploit artifact: once registered it is assumed valid for
//! the life of the process and is never taken away, so the state only moves
//! forward:
//!
//! ```text
//! None ──narrow──▶ NarrowOnly ──task──▶ Full
//!   └──────────────task─────────────────▲
//! ```

use mach_platform::{MachPort, MACH_PORT_NULL};

/// Port whose context can be pointed at kernel memory and read back one
/// 32-bit word at a time through `pid_for_task`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct NarrowReadPort(MachPort);

/// Forged kernel task port: full read, write, allocate and protect
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct KernelTaskPort(MachPort);

impl NarrowReadPort {
    /// `None` for the null port
    pub fn new(port: MachPort) -> Option<Self> {
        (port != MACH_PORT_NULL).then_some(Self(port))
    }

    pub fn raw(self) -> MachPort {
        self.0
    }
}

impl KernelTaskPort {
    /// `None` for the null port
    pub fn new(port: MachPort) -> Option<Self> {
        (port != MACH_PORT_NULL).then_some(Self(port))
    }

    pub fn raw(self) -> MachPort {
        self.0
    }
}

/// Coarse view of what the registry can do
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CapabilityState {
    NoCapability,
    NarrowOnly,
    FullAccess,
}

/// Registered primitives
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Capabilities {
    #[default]
    None,
    NarrowOnly(NarrowReadPort),
    Full {
        task: KernelTaskPort,
        narrow: Option<NarrowReadPort>,
    },
}

impl Capabilities {
    /// Store the narrow read port, replacing any previous one
    pub fn register_narrow_read(&mut self, port: NarrowReadPort) {
        *self = match *self {
            Capabilities::None | Capabilities::NarrowOnly(_) => Capabilities::NarrowOnly(port),
            Capabilities::Full { task, .. } => Capabilities::Full {
                task,
                narrow: Some(port),
            },
        };
    }

    /// Store the kernel task port, replacing any previous one
    pub fn register_full_access(&mut self, task: KernelTaskPort) {
        *self = match *self {
            Capabilities::None => Capabilities::Full { task, narrow: None },
            Capabilities::NarrowOnly(narrow) => Capabilities::Full {
                task,
                narrow: Some(narrow),
            },
            Capabilities::Full { narrow, .. } => Capabilities::Full { task, narrow },
        };
    }

    pub fn has_read_capability(&self) -> bool {
        !matches!(self, Capabilities::None)
    }

    pub fn has_write_capability(&self) -> bool {
        matches!(self, Capabilities::Full { .. })
    }

    pub fn state(&self) -> CapabilityState {
        match self {
            Capabilities::None => CapabilityState::NoCapability,
            Capabilities::NarrowOnly(_) => CapabilityState::NarrowOnly,
            Capabilities::Full { .. } => CapabilityState::FullAccess,
        }
    }

    pub fn task_port(&self) -> Option<KernelTaskPort> {
        match *self {
            Capabilities::Full { task, .. } => Some(task),
            _ => None,
        }
    }

    pub fn narrow_port(&self) -> Option<NarrowReadPort> {
        match *self {
            Capabilities::NarrowOnly(port) => Some(port),
            Capabilities::Full { narrow, .. } => narrow,
            Capabilities::None => None,
        }
    }
}
