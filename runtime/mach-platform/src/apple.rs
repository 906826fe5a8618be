//! Real Mach backend
//!
//! Thin wrappers over the Mach VM and port calls exported by libSystem.
//! Only built for Apple targets with the `runtime` feature.

use core::ffi::c_int;

use crate::{KernResult, KernReturn, MachHost, MachPort, VmAllocateFlags, VmProt};

type KernReturnT = c_int;
type MachVmAddress = u64;
type MachVmSize = u64;
type VmMap = MachPort;

#[allow(non_upper_case_globals)]
extern "C" {
    static mach_task_self_: MachPort;
    static vm_kernel_page_size: usize;

    fn mach_port_set_context(task: MachPort, name: MachPort, context: u64) -> KernReturnT;
    fn pid_for_task(task: MachPort, pid: *mut c_int) -> KernReturnT;

    fn mach_vm_read_overwrite(
        target_task: VmMap,
        address: MachVmAddress,
        size: MachVmSize,
        data: MachVmAddress,
        outsize: *mut MachVmSize,
    ) -> KernReturnT;

    fn mach_vm_write(
        target_task: VmMap,
        address: MachVmAddress,
        data: usize,
        data_cnt: u32,
    ) -> KernReturnT;

    fn mach_vm_allocate(
        target: VmMap,
        address: *mut MachVmAddress,
        size: MachVmSize,
        flags: c_int,
    ) -> KernReturnT;

    fn mach_vm_deallocate(target: VmMap, address: MachVmAddress, size: MachVmSize) -> KernReturnT;

    fn mach_vm_protect(
        target_task: VmMap,
        address: MachVmAddress,
        size: MachVmSize,
        set_maximum: c_int,
        new_protection: c_int,
    ) -> KernReturnT;

    fn mach_vm_wire(
        host_priv: MachPort,
        task: VmMap,
        address: MachVmAddress,
        size: MachVmSize,
        desired_access: c_int,
    ) -> KernReturnT;
}

/// Host backed by the running kernel.
///
/// The privileged host port is an input: obtaining it is the exploit
/// chain's job, not ours.
#[derive(Debug, Clone, Copy)]
pub struct AppleHost {
    host_priv: MachPort,
}

impl AppleHost {
    pub fn new(host_priv: MachPort) -> Self {
        Self { host_priv }
    }
}

impl MachHost for AppleHost {
    fn port_set_context(&self, port: MachPort, context: u64) -> KernResult<()> {
        KernReturn::check(unsafe { mach_port_set_context(mach_task_self_, port, context) })
    }

    fn pid_for_task(&self, port: MachPort) -> KernResult<i32> {
        let mut pid: c_int = 0;
        KernReturn::check(unsafe { pid_for_task(port, &mut pid) })?;
        Ok(pid)
    }

    fn vm_read_overwrite(&self, task: MachPort, address: u64, dest: &mut [u8]) -> KernResult<u64> {
        let mut outsize: MachVmSize = 0;
        KernReturn::check(unsafe {
            mach_vm_read_overwrite(
                task,
                address,
                dest.len() as MachVmSize,
                dest.as_mut_ptr() as MachVmAddress,
                &mut outsize,
            )
        })?;
        Ok(outsize)
    }

    fn vm_write(&self, task: MachPort, address: u64, data: &[u8]) -> KernResult<()> {
        let len = u32::try_from(data.len()).map_err(|_| KernReturn::KERN_INVALID_ARGUMENT)?;
        KernReturn::check(unsafe { mach_vm_write(task, address, data.as_ptr() as usize, len) })
    }

    fn vm_allocate(&self, task: MachPort, size: u64, flags: VmAllocateFlags) -> KernResult<u64> {
        let mut address: MachVmAddress = 0;
        KernReturn::check(unsafe { mach_vm_allocate(task, &mut address, size, flags.bits()) })?;
        Ok(address)
    }

    fn vm_deallocate(&self, task: MachPort, address: u64, size: u64) -> KernResult<()> {
        KernReturn::check(unsafe { mach_vm_deallocate(task, address, size) })
    }

    fn vm_protect(
        &self,
        task: MachPort,
        address: u64,
        size: u64,
        set_maximum: bool,
        protection: VmProt,
    ) -> KernResult<()> {
        KernReturn::check(unsafe {
            mach_vm_protect(task, address, size, c_int::from(set_maximum), protection.bits())
        })
    }

    fn vm_wire(
        &self,
        host_priv: MachPort,
        task: MachPort,
        address: u64,
        size: u64,
        protection: VmProt,
    ) -> KernResult<()> {
        KernReturn::check(unsafe { mach_vm_wire(host_priv, task, address, size, protection.bits()) })
    }

    fn host_priv(&self) -> MachPort {
        self.host_priv
    }

    fn kernel_page_size(&self) -> u64 {
        unsafe { vm_kernel_page_size as u64 }
    }
}
