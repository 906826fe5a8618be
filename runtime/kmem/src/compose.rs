//! Composition layer: 64-bit words, buffers and directional copies
//!
//! 64-bit accesses are two 32-bit accesses, low word first. They are not
//! atomic: a value the kernel changes between the two halves reads torn.

use mach_platform::MachHost;

use crate::{KernelMemory, KmemError, Result, KERNEL_ADDRESS_SPACE_BASE};

/// Which way a `directional_copy` moves bytes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CopyDirection {
    /// Local buffer at `src` into kernel memory at `dest`
    ToKernel,
    /// Kernel memory at `src` into local buffer at `dest`
    FromKernel,
}

pub fn is_kernel_address(addr: u64) -> bool {
    addr >= KERNEL_ADDRESS_SPACE_BASE
}

/// Direction of a copy, decided by `dest` alone
pub fn copy_direction(dest: u64) -> CopyDirection {
    if is_kernel_address(dest) {
        CopyDirection::ToKernel
    } else {
        CopyDirection::FromKernel
    }
}

impl<H: MachHost> KernelMemory<H> {
    /// `read32(addr) | read32(addr + 4) << 32`. A failed low word is
    /// returned without reading the high word.
    pub fn read64(&self, addr: u64) -> Result<u64> {
        let lower = u64::from(self.read32(addr)?);
        let higher = u64::from(self.read32(addr.wrapping_add(4))?);
        Ok((higher << 32) | lower)
    }

    /// Low word at `addr`, then high word at `addr + 4`. Stops at the first
    /// failed half.
    pub fn write64(&self, addr: u64, value: u64) -> Result<()> {
        self.write32(addr, value as u32)?;
        self.write32(addr.wrapping_add(4), (value >> 32) as u32)
    }

    /// Bulk read into `dest`. Needs the kernel task port.
    ///
    /// On a short read the bytes the host did not report as copied are left
    /// as they were.
    pub fn read_buffer(&self, addr: u64, dest: &mut [u8]) -> Result<()> {
        let task = self.require_full("read from")?;
        let outsize = self
            .host
            .vm_read_overwrite(task.raw(), addr, dest)
            .or_else(|kr| self.fail(KmemError::Read { addr, kr }))?;

        if outsize != dest.len() as u64 {
            return self.fail(KmemError::ShortRead {
                addr,
                expected: dest.len() as u64,
                actual: outsize,
            });
        }
        Ok(())
    }

    /// Read `len` bytes into a fresh buffer
    pub fn read_vec(&self, addr: u64, len: usize) -> Result<Vec<u8>> {
        let mut buf = vec![0u8; len];
        self.read_buffer(addr, &mut buf)?;
        Ok(buf)
    }

    /// Bulk write of `data`. Needs the kernel task port.
    pub fn write_buffer(&self, addr: u64, data: &[u8]) -> Result<()> {
        let task = self.require_full("write to")?;
        self.host
            .vm_write(task.raw(), addr, data)
            .or_else(|kr| self.fail(KmemError::Write { addr, kr }))
    }

    /// Copy `len` bytes between kernel memory and this process, the
    /// direction inferred from `dest` (see [`copy_direction`]).
    ///
    /// When both addresses sit on the same side of the kernel base the copy
    /// still follows `dest`, with a warning.
    ///
    /// A zero `len` returns `Ok(())` without touching either pointer or
    /// checking capabilities, so it succeeds even without the task port.
    ///
    /// # Safety
    /// The process-side address (`src` when copying into the kernel, `dest`
    /// otherwise) must be valid for `len` bytes of reads or writes
    /// respectively, and must not alias anything borrowed elsewhere.
    pub unsafe fn directional_copy(&self, dest: u64, src: u64, len: usize) -> Result<()> {
        let direction = copy_direction(dest);
        if is_kernel_address(dest) == is_kernel_address(src) {
            log::warn!(
                "kmemcpy {:#x} <- {:#x}: both addresses on the same side of the kernel base, treating as {:?}",
                dest,
                src,
                direction
            );
        }
        if len == 0 {
            return Ok(());
        }

        match direction {
            CopyDirection::ToKernel => {
                let data = core::slice::from_raw_parts(src as usize as *const u8, len);
                self.write_buffer(dest, data)
            }
            CopyDirection::FromKernel => {
                let buf = core::slice::from_raw_parts_mut(dest as usize as *mut u8, len);
                self.read_buffer(src, buf)
            }
        }
    }
}
