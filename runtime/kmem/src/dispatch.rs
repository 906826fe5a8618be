//! Primitive dispatcher: 32-bit reads and writes
//!
//! `read32` picks the strongest primitive registered; everything else in the
//! crate is built on top of these two calls or on the task port directly.

use mach_platform::MachHost;

use crate::registry::{Capabilities, KernelTaskPort, NarrowReadPort};
use crate::{KernelMemory, KmemError, Result, PROC_PID_OFFSET};

impl<H: MachHost> KernelMemory<H> {
    /// Read the 32-bit word at `addr`
    ///
    /// With no primitive registered this is a fatal usage error.
    pub fn read32(&self, addr: u64) -> Result<u32> {
        match self.caps {
            Capabilities::Full { task, .. } => self.read32_via_task(task, addr),
            Capabilities::NarrowOnly(port) => self.read32_via_narrow(port, addr),
            Capabilities::None => self.fail(KmemError::NoReadCapability),
        }
    }

    /// Write the 32-bit word at `addr`. Needs the kernel task port.
    pub fn write32(&self, addr: u64, value: u32) -> Result<()> {
        let task = self.require_full("write to")?;
        log::trace!("wk32 {:#x} <- {:#x}", addr, value);
        self.host
            .vm_write(task.raw(), addr, &value.to_ne_bytes())
            .or_else(|kr| self.fail(KmemError::Write { addr, kr }))
    }

    fn read32_via_task(&self, task: KernelTaskPort, addr: u64) -> Result<u32> {
        let mut word = [0u8; 4];
        let outsize = self
            .host
            .vm_read_overwrite(task.raw(), addr, &mut word)
            .or_else(|kr| self.fail(KmemError::Read { addr, kr }))?;

        if outsize != word.len() as u64 {
            return self.fail(KmemError::ShortRead {
                addr,
                expected: word.len() as u64,
                actual: outsize,
            });
        }
        Ok(u32::from_ne_bytes(word))
    }

    /// Point the port's context at `addr - PROC_PID_OFFSET` and let
    /// `pid_for_task` dereference it. Any failure here is fatal.
    fn read32_via_narrow(&self, port: NarrowReadPort, addr: u64) -> Result<u32> {
        let context = addr.wrapping_sub(PROC_PID_OFFSET);
        self.host
            .port_set_context(port.raw(), context)
            .or_else(|kr| self.fail(KmemError::SetContext { addr, kr }))?;

        let pid = self
            .host
            .pid_for_task(port.raw())
            .or_else(|kr| self.fail(KmemError::SideChannel { addr, kr }))?;

        log::trace!("rk32 via narrow port {:#x}: {:#x} = {:#x}", port.raw(), addr, pid);
        Ok(pid as u32)
    }
}

#[cfg(test)]
mod tests {
    use crate::testing::*;
    use crate::{CapabilityState, KmemError, Severity};
    use mach_platform::{HostCall, HostOp, KernReturn};

    #[test]
    fn test_read32_via_task_port() {
        let kmem = kernel(&[CapabilityState::FullAccess]);
        kmem.host().poke(KBASE + 8, &0xfeed_f00d_u32.to_ne_bytes());

        assert_eq!(kmem.read32(KBASE + 8), Ok(0xfeed_f00d));
        assert_eq!(kmem.host().count(HostOp::Read), 1);
        assert_eq!(kmem.host().count(HostOp::PidForTask), 0);
    }

    #[test]
    fn test_read32_via_narrow_port() {
        let kmem = kernel(&[CapabilityState::NarrowOnly]);
        kmem.host().poke(KBASE + 0x40, &0x1234_5678_u32.to_ne_bytes());

        assert_eq!(kmem.read32(KBASE + 0x40), Ok(0x1234_5678));
        assert_eq!(kmem.host().context_of(NARROW), Some(KBASE + 0x40 - 0x10));
        assert_eq!(
            kmem.host().calls(),
            vec![
                HostCall::SetContext { port: NARROW, context: KBASE + 0x30 },
                HostCall::PidForTask { port: NARROW },
            ]
        );
    }

    #[test]
    fn test_task_port_preferred_over_narrow() {
        let kmem = kernel(&[CapabilityState::NarrowOnly, CapabilityState::FullAccess]);
        kmem.host().poke(KBASE, &7u32.to_ne_bytes());

        assert_eq!(kmem.read32(KBASE), Ok(7));
        assert_eq!(kmem.host().count(HostOp::SetContext), 0);
        assert_eq!(kmem.host().count(HostOp::Read), 1);
    }

    #[test]
    fn test_read32_without_capability_is_fatal() {
        let kmem = kernel(&[]);
        let err = kmem.read32(KBASE).unwrap_err();
        assert_eq!(err, KmemError::NoReadCapability);
        assert_eq!(err.severity(), Severity::Fatal);
        assert!(kmem.host().calls().is_empty());
    }

    #[test]
    fn test_write32_without_capability_is_recoverable() {
        let kmem = kernel(&[CapabilityState::NarrowOnly]);
        let err = kmem.write32(KBASE, 1).unwrap_err();
        assert_eq!(err.severity(), Severity::Recoverable);
        assert_eq!(kmem.host().count(HostOp::Write), 0);
        assert_eq!(kmem.host().peek(KBASE, 4), Some(vec![0; 4]));
    }

    #[test]
    fn test_narrow_failures_are_fatal() {
        let kmem = kernel(&[CapabilityState::NarrowOnly]);

        kmem.host().fail_next(HostOp::SetContext, KernReturn::KERN_INVALID_RIGHT);
        let err = kmem.read32(KBASE).unwrap_err();
        assert_eq!(err, KmemError::SetContext { addr: KBASE, kr: KernReturn::KERN_INVALID_RIGHT });
        assert!(err.is_fatal());

        kmem.host().fail_next(HostOp::PidForTask, KernReturn::KERN_FAILURE);
        let err = kmem.read32(KBASE).unwrap_err();
        assert_eq!(err, KmemError::SideChannel { addr: KBASE, kr: KernReturn::KERN_FAILURE });
        assert!(err.is_fatal());
    }

    #[test]
    fn test_task_read_failure_is_recoverable() {
        let kmem = kernel(&[CapabilityState::FullAccess]);
        let err = kmem.read32(0xffff_ffd0_0000_0000).unwrap_err();
        assert_eq!(
            err,
            KmemError::Read { addr: 0xffff_ffd0_0000_0000, kr: KernReturn::KERN_INVALID_ADDRESS }
        );
        assert!(!err.is_fatal());
        // Callers wanting the old sentinel get zero
        assert_eq!(kmem.read32(0xffff_ffd0_0000_0000).unwrap_or_default(), 0);
    }

    #[test]
    fn test_short_task_read() {
        let kmem = kernel(&[CapabilityState::FullAccess]);
        kmem.host().set_short_read(Some(2));
        assert_eq!(
            kmem.read32(KBASE),
            Err(KmemError::ShortRead { addr: KBASE, expected: 4, actual: 2 })
        );
    }

    #[test]
    fn test_write32_then_read32() {
        let kmem = kernel(&[CapabilityState::FullAccess]);
        kmem.write32(KBASE + 0x100, 0xa5a5_5a5a).unwrap();
        assert_eq!(kmem.read32(KBASE + 0x100), Ok(0xa5a5_5a5a));
    }

    #[test]
    fn test_write32_host_error() {
        let kmem = kernel(&[CapabilityState::FullAccess]);
        kmem.host().fail_next(HostOp::Write, KernReturn::KERN_PROTECTION_FAILURE);
        assert_eq!(
            kmem.write32(KBASE, 1),
            Err(KmemError::Write { addr: KBASE, kr: KernReturn::KERN_PROTECTION_FAILURE })
        );
        assert_eq!(kmem.host().peek(KBASE, 4), Some(vec![0; 4]));
    }
}
