//! Error tiers for kernel memory operations

use mach_platform::KernReturn;
use thiserror::Error;

/// How bad a failure is.
///
/// Fatal failures mean the primitive itself is broken or misused and the
/// kernel may be in an unknown state. Recoverable ones affect a single
/// operation only.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Severity {
    Fatal,
    Recoverable,
}

/// Error types for kernel memory operations
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum KmemError {
    #[error("attempt to read kernel memory but no kernel memory read primitives available")]
    NoReadCapability,

    #[error("error setting context off of dangling port for {addr:#x}: {kr}")]
    SetContext { addr: u64, kr: KernReturn },

    #[error("error calling pid_for_task for {addr:#x}: {kr}")]
    SideChannel { addr: u64, kr: KernReturn },

    #[error("attempt to {op} kernel memory before any kernel memory write primitives available")]
    FullAccessRequired { op: &'static str },

    #[error("kernel task read failed at {addr:#x}: {kr}")]
    Read { addr: u64, kr: KernReturn },

    #[error("kernel task read at {addr:#x} was short (expected {expected:#x}, got {actual:#x})")]
    ShortRead { addr: u64, expected: u64, actual: u64 },

    #[error("kernel task write failed at {addr:#x}: {kr}")]
    Write { addr: u64, kr: KernReturn },

    #[error("unable to allocate {size:#x} bytes of kernel memory: {kr}")]
    Allocate { size: u64, kr: KernReturn },

    #[error("unable to wire {size:#x} bytes of kernel memory at {addr:#x}: {kr}")]
    Wire { addr: u64, size: u64, kr: KernReturn },

    #[error("unable to deallocate {size:#x} bytes of kernel memory at {addr:#x}: {kr}")]
    Deallocate { addr: u64, size: u64, kr: KernReturn },

    #[error("unable to change protection of {size:#x} bytes of kernel memory at {addr:#x}: {kr}")]
    Protect { addr: u64, size: u64, kr: KernReturn },
}

impl KmemError {
    pub fn severity(&self) -> Severity {
        match self {
            KmemError::NoReadCapability
            | KmemError::SetContext { .. }
            | KmemError::SideChannel { .. } => Severity::Fatal,
            _ => Severity::Recoverable,
        }
    }

    pub fn is_fatal(&self) -> bool {
        self.severity() == Severity::Fatal
    }
}

pub type Result<T> = core::result::Result<T, KmemError>;
