//! Allocation and protection of kernel memory
//!
//! Everything here goes through the kernel task port; the narrow read port
//! cannot allocate or change protections.

use mach_platform::{KernReturn, MachHost, VmAllocateFlags, VmProt};

use crate::{KernelMemory, KmemError, Result, WIRE_ALIGNMENT};

/// Round `addr` up to a multiple of `align` (power of two)
#[inline]
pub(crate) fn align_up(addr: u64, align: u64) -> Option<u64> {
    addr.checked_add(align - 1).map(|end| end & !(align - 1))
}

impl<H: MachHost> KernelMemory<H> {
    /// Allocate `size` bytes (rounded up to the kernel page size) anywhere in
    /// the kernel map
    ///
    /// A size that overflows when rounded is rejected with
    /// `KERN_INVALID_ARGUMENT` before the host is asked.
    pub fn allocate(&self, size: u64) -> Result<u64> {
        let task = self.require_full("allocate")?;
        let ksize = self.allocation_size(size)?;
        let addr = self
            .host
            .vm_allocate(task.raw(), ksize, VmAllocateFlags::ANYWHERE)
            .or_else(|kr| self.fail(KmemError::Allocate { size: ksize, kr }))?;

        log::debug!("allocated {:#x} bytes of kernel memory at {:#x}", ksize, addr);
        Ok(addr)
    }

    /// Allocate and wire `size` bytes
    ///
    /// The allocator does not promise the alignment wiring needs, so one
    /// extra `WIRE_ALIGNMENT` is allocated and the start is rounded up inside
    /// it. The returned address is always `WIRE_ALIGNMENT` aligned.
    pub fn allocate_wired(&self, size: u64) -> Result<u64> {
        let task = self.require_full("allocate")?;
        let ksize = self.allocation_size(size)?;
        log::trace!("vm_kernel_page_size: {:#x}", self.host.kernel_page_size());

        let padded = ksize
            .checked_add(WIRE_ALIGNMENT)
            .ok_or(KmemError::Allocate { size: ksize, kr: KernReturn::KERN_INVALID_ARGUMENT })
            .or_else(|err| self.fail(err))?;
        let raw = self
            .host
            .vm_allocate(task.raw(), padded, VmAllocateFlags::ANYWHERE)
            .or_else(|kr| self.fail(KmemError::Allocate { size: padded, kr }))?;
        log::debug!("allocated address: {:#x}", raw);

        let addr = align_up(raw, WIRE_ALIGNMENT)
            .ok_or(KmemError::Allocate { size: padded, kr: KernReturn::KERN_NO_SPACE })
            .or_else(|err| self.fail(err))?;
        log::debug!("address to wire: {:#x}", addr);

        self.host
            .vm_wire(
                self.host.host_priv(),
                task.raw(),
                addr,
                ksize,
                VmProt::READ | VmProt::WRITE,
            )
            .or_else(|kr| self.fail(KmemError::Wire { addr, size: ksize, kr }))?;
        Ok(addr)
    }

    /// Release kernel memory
    ///
    /// Does nothing unless `KmemConfig::release_on_free` is set: handing
    /// memory obtained this way back to the kernel can panic it.
    pub fn free(&self, addr: u64, size: u64) -> Result<()> {
        if !self.config.release_on_free {
            log::trace!("not freeing {:#x} bytes at {:#x}", size, addr);
            return Ok(());
        }

        let task = self.require_full("deallocate")?;
        let ksize = self
            .round_page_kernel(size)
            .ok_or(KmemError::Deallocate { addr, size, kr: KernReturn::KERN_INVALID_ARGUMENT })
            .or_else(|err| self.fail(err))?;
        self.host
            .vm_deallocate(task.raw(), addr, ksize)
            .or_else(|kr| self.fail(KmemError::Deallocate { addr, size: ksize, kr }))
    }

    fn allocation_size(&self, size: u64) -> Result<u64> {
        self.round_page_kernel(size)
            .ok_or(KmemError::Allocate { size, kr: KernReturn::KERN_INVALID_ARGUMENT })
            .or_else(|err| self.fail(err))
    }

    /// Set the current protection of `[addr, addr + size)`. The maximum
    /// protection is never touched.
    pub fn protect(&self, addr: u64, size: u64, protection: VmProt) -> Result<()> {
        let task = self.require_full("change protection of")?;
        self.host
            .vm_protect(task.raw(), addr, size, false, protection)
            .or_else(|kr| self.fail(KmemError::Protect { addr, size, kr }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::*;
    use crate::{CapabilityState, KmemConfig};
    use mach_platform::mock::MOCK_HOST_PRIV;
    use mach_platform::{HostCall, HostOp, KernReturn, MockHost};

    #[test]
    fn test_align_up() {
        assert_eq!(align_up(0, 0x4000), Some(0));
        assert_eq!(align_up(1, 0x4000), Some(0x4000));
        assert_eq!(align_up(0x4000, 0x4000), Some(0x4000));
        assert_eq!(align_up(0xffff_fff0_1000_1000, 0x4000), Some(0xffff_fff0_1000_4000));
        assert_eq!(align_up(u64::MAX - 0x1000, 0x4000), None);
    }

    #[test]
    fn test_allocate_rounds_to_kernel_page() {
        let kmem = kernel(&[CapabilityState::FullAccess]);
        let addr = kmem.allocate(100).unwrap();
        assert_ne!(addr, 0);
        assert_eq!(
            kmem.host().calls(),
            vec![HostCall::Allocate { task: TASK, size: 0x4000, flags: VmAllocateFlags::ANYWHERE }]
        );
    }

    #[test]
    fn test_allocate_failures_are_recoverable() {
        let kmem = kernel(&[CapabilityState::NarrowOnly]);
        let err = kmem.allocate(0x4000).unwrap_err();
        assert_eq!(err, KmemError::FullAccessRequired { op: "allocate" });
        assert_eq!(kmem.allocate(0x4000).unwrap_or(0), 0);

        let kmem = kernel(&[CapabilityState::FullAccess]);
        kmem.host().fail_next(HostOp::Allocate, KernReturn::KERN_NO_SPACE);
        let err = kmem.allocate(0x4000).unwrap_err();
        assert_eq!(err, KmemError::Allocate { size: 0x4000, kr: KernReturn::KERN_NO_SPACE });
        assert!(!err.is_fatal());
    }

    #[test]
    fn test_allocate_oversized_is_recoverable() {
        let kmem = kernel(&[CapabilityState::FullAccess]);

        let err = kmem.allocate(u64::MAX).unwrap_err();
        assert_eq!(
            err,
            KmemError::Allocate { size: u64::MAX, kr: KernReturn::KERN_INVALID_ARGUMENT }
        );
        assert!(!err.is_fatal());
        assert_eq!(kmem.allocate(u64::MAX).unwrap_or(0), 0);

        // Rounding to the page overflows
        let err = kmem.allocate_wired(u64::MAX - 0x3000).unwrap_err();
        assert_eq!(
            err,
            KmemError::Allocate { size: u64::MAX - 0x3000, kr: KernReturn::KERN_INVALID_ARGUMENT }
        );
        assert!(!err.is_fatal());

        // Rounds cleanly, but the alignment padding overflows
        let err = kmem.allocate_wired(u64::MAX - 0x3fff).unwrap_err();
        assert_eq!(
            err,
            KmemError::Allocate { size: u64::MAX - 0x3fff, kr: KernReturn::KERN_INVALID_ARGUMENT }
        );

        assert_eq!(kmem.host().count(HostOp::Allocate), 0);
        assert_eq!(kmem.host().count(HostOp::Wire), 0);
    }

    #[test]
    fn test_allocate_wired_is_aligned() {
        let kmem = kernel(&[CapabilityState::FullAccess]);
        for size in [1, 0x100, 0x3fff, 0x4000, 0x4001, 0x9000, 0x12345] {
            let addr = kmem.allocate_wired(size).unwrap();
            assert_eq!(addr % WIRE_ALIGNMENT, 0, "size {:#x} gave {:#x}", size, addr);
        }
    }

    #[test]
    fn test_allocate_wired_pads_and_wires_rounded_size() {
        let kmem = kernel(&[CapabilityState::FullAccess]);
        let addr = kmem.allocate_wired(0x5000).unwrap();

        assert_eq!(
            kmem.host().calls(),
            vec![
                HostCall::Allocate {
                    task: TASK,
                    size: 0x8000 + WIRE_ALIGNMENT,
                    flags: VmAllocateFlags::ANYWHERE,
                },
                HostCall::Wire {
                    host_priv: MOCK_HOST_PRIV,
                    task: TASK,
                    address: addr,
                    size: 0x8000,
                    protection: VmProt::READ | VmProt::WRITE,
                },
            ]
        );
        assert_eq!(kmem.host().wired_ranges(), vec![(addr, 0x8000)]);
        // The wired range is writable kernel memory
        kmem.write64(addr + 0x7ff8, 42).unwrap();
        assert_eq!(kmem.read64(addr + 0x7ff8), Ok(42));
    }

    #[test]
    fn test_allocate_wired_already_aligned() {
        let kmem = kernel(&[CapabilityState::FullAccess]);
        kmem.host().set_next_allocation(0xffff_fff0_2000_0000);
        assert_eq!(kmem.allocate_wired(0x4000), Ok(0xffff_fff0_2000_0000));
    }

    #[test]
    fn test_allocate_wired_wire_failure() {
        let kmem = kernel(&[CapabilityState::FullAccess]);
        kmem.host().fail_next(HostOp::Wire, KernReturn::KERN_RESOURCE_SHORTAGE);
        let err = kmem.allocate_wired(0x4000).unwrap_err();
        assert!(matches!(err, KmemError::Wire { size: 0x4000, .. }));
        assert!(!err.is_fatal());
    }

    #[test]
    fn test_free_never_deallocates() {
        let kmem = kernel(&[CapabilityState::FullAccess]);
        let addr = kmem.allocate(0x4000).unwrap();

        for (a, size) in [(addr, 0x4000), (0, 0), (KBASE, 0x10000), (u64::MAX, u64::MAX)] {
            assert_eq!(kmem.free(a, size), Ok(()));
        }
        assert_eq!(kmem.host().count(HostOp::Deallocate), 0);
        assert!(kmem.host().is_mapped(addr));

        // Even with no capability at all
        let kmem = kernel(&[]);
        assert_eq!(kmem.free(KBASE, 0x4000), Ok(()));
        assert!(kmem.host().calls().is_empty());
    }

    #[test]
    fn test_free_with_release_opt_in() {
        init_logging();
        let config = KmemConfig {
            release_on_free: true,
            ..KmemConfig::quiet()
        };
        let mut kmem = crate::KernelMemory::with_config(MockHost::new(), config);
        kmem.register_full_access(TASK);

        let addr = kmem.allocate(0x100).unwrap();
        kmem.free(addr, 0x100).unwrap();
        assert_eq!(kmem.host().count(HostOp::Deallocate), 1);
        assert!(!kmem.host().is_mapped(addr));

        assert!(matches!(
            kmem.free(addr, 0x100),
            Err(KmemError::Deallocate { size: 0x4000, .. })
        ));

        kmem.host().clear_calls();
        assert_eq!(
            kmem.free(addr, u64::MAX),
            Err(KmemError::Deallocate {
                addr,
                size: u64::MAX,
                kr: KernReturn::KERN_INVALID_ARGUMENT,
            })
        );
        assert!(kmem.host().calls().is_empty());
    }

    #[test]
    fn test_protect() {
        let kmem = kernel(&[CapabilityState::FullAccess]);
        kmem.protect(KBASE, 0x10000, VmProt::READ).unwrap();

        assert_eq!(
            kmem.host().calls(),
            vec![HostCall::Protect {
                task: TASK,
                address: KBASE,
                size: 0x10000,
                set_maximum: false,
                protection: VmProt::READ,
            }]
        );
        assert_eq!(kmem.host().protection_at(KBASE), Some(VmProt::READ));
        assert!(matches!(kmem.write32(KBASE, 1), Err(KmemError::Write { .. })));
    }

    #[test]
    fn test_protect_errors_are_recoverable() {
        let kmem = kernel(&[]);
        assert_eq!(
            kmem.protect(KBASE, 0x4000, VmProt::READ),
            Err(KmemError::FullAccessRequired { op: "change protection of" })
        );

        let kmem = kernel(&[CapabilityState::FullAccess]);
        let err = kmem.protect(0x1000, 0x4000, VmProt::READ).unwrap_err();
        assert_eq!(
            err,
            KmemError::Protect { addr: 0x1000, size: 0x4000, kr: KernReturn::KERN_INVALID_ADDRESS }
        );
        assert!(!err.is_fatal());
    }
}
