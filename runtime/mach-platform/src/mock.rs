//! MOCK Mach host for development and testing
//!
//! # WARNING: This is NOT a real kernel!
//!
//! An in-memory stand-in for the Mach VM and port calls, used to exercise the
//! kernel memory layer without a device or an exploit.
//!
//! ## What it models
//!
//! - Kernel memory as a set of mapped regions with per-region protection
//! - Per-port context values; `pid_for_task` dereferences
//!   `context + PID_FIELD_OFFSET` the way the kernel does for a fake task
//! - A bump allocator that hands out addresses aligned to 4KiB but not to the
//!   16KiB kernel page, so wiring has to realign
//! - Wiring that rejects addresses not aligned to the kernel page
//!
//! ## Test hooks
//!
//! - Every call is appended to a journal (`calls()`), successful or not
//! - `fail_next(op, kr)` makes the next call of that kind fail with `kr`
//! - `set_short_read(Some(n))` caps every read at `n` bytes
//! - `set_journaling(false)` stops recording, for benchmarks

use std::cell::RefCell;
use std::collections::{HashMap, VecDeque};

use crate::{
    KernResult, KernReturn, MachHost, MachPort, VmAllocateFlags, VmProt, MACH_PORT_NULL,
};

/// Offset of the pid field inside the structure the side channel dereferences
pub const PID_FIELD_OFFSET: u64 = 0x10;

/// Kernel page size of the simulated device (arm64, 16KiB)
pub const MOCK_PAGE_SIZE: u64 = 0x4000;

/// Privileged host port the mock accepts for wiring
pub const MOCK_HOST_PRIV: MachPort = 0x1103;

/// First address handed out by the allocator (4KiB aligned, not 16KiB aligned)
pub const MOCK_ALLOC_BASE: u64 = 0xffff_fff0_1000_1000;

/// Kind of host call, used for failure injection and journal queries
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HostOp {
    SetContext,
    PidForTask,
    Read,
    Write,
    Allocate,
    Deallocate,
    Protect,
    Wire,
}

/// One journaled host call
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HostCall {
    SetContext { port: MachPort, context: u64 },
    PidForTask { port: MachPort },
    Read { task: MachPort, address: u64, size: u64 },
    Write { task: MachPort, address: u64, size: u64 },
    Allocate { task: MachPort, size: u64, flags: VmAllocateFlags },
    Deallocate { task: MachPort, address: u64, size: u64 },
    Protect { task: MachPort, address: u64, size: u64, set_maximum: bool, protection: VmProt },
    Wire { host_priv: MachPort, task: MachPort, address: u64, size: u64, protection: VmProt },
}

impl HostCall {
    pub fn op(&self) -> HostOp {
        match self {
            HostCall::SetContext { .. } => HostOp::SetContext,
            HostCall::PidForTask { .. } => HostOp::PidForTask,
            HostCall::Read { .. } => HostOp::Read,
            HostCall::Write { .. } => HostOp::Write,
            HostCall::Allocate { .. } => HostOp::Allocate,
            HostCall::Deallocate { .. } => HostOp::Deallocate,
            HostCall::Protect { .. } => HostOp::Protect,
            HostCall::Wire { .. } => HostOp::Wire,
        }
    }
}

/// Mapped kernel region
#[derive(Debug, Clone)]
struct Region {
    base: u64,
    bytes: Vec<u8>,
    protection: VmProt,
}

impl Region {
    fn end(&self) -> u64 {
        self.base + self.bytes.len() as u64
    }

    fn contains(&self, address: u64, size: u64) -> bool {
        address >= self.base && address.checked_add(size).is_some_and(|end| end <= self.end())
    }
}

#[derive(Debug, Default)]
struct State {
    regions: Vec<Region>,
    contexts: HashMap<MachPort, u64>,
    wired: Vec<(u64, u64)>,
    next_alloc: u64,
    short_read: Option<u64>,
    failures: VecDeque<(HostOp, KernReturn)>,
    journal: Vec<HostCall>,
    journal_off: bool,
}

impl State {
    fn record(&mut self, call: HostCall) -> KernResult<()> {
        let op = call.op();
        if !self.journal_off {
            self.journal.push(call);
        }
        match self.failures.iter().position(|(o, _)| *o == op) {
            Some(idx) => {
                let (_, kr) = self.failures.remove(idx).unwrap_or((op, KernReturn::KERN_FAILURE));
                Err(kr)
            }
            None => Ok(()),
        }
    }

    fn region(&self, address: u64, size: u64) -> KernResult<&Region> {
        self.regions
            .iter()
            .find(|r| r.contains(address, size))
            .ok_or(KernReturn::KERN_INVALID_ADDRESS)
    }

    fn region_mut(&mut self, address: u64, size: u64) -> KernResult<&mut Region> {
        self.regions
            .iter_mut()
            .find(|r| r.contains(address, size))
            .ok_or(KernReturn::KERN_INVALID_ADDRESS)
    }
}

/// In-memory Mach host
#[derive(Debug)]
pub struct MockHost {
    state: RefCell<State>,
    page_size: u64,
    host_priv: MachPort,
}

impl Default for MockHost {
    fn default() -> Self {
        Self::new()
    }
}

impl MockHost {
    /// Create an empty host: no memory mapped, allocator at `MOCK_ALLOC_BASE`
    pub fn new() -> Self {
        Self {
            state: RefCell::new(State {
                next_alloc: MOCK_ALLOC_BASE,
                ..State::default()
            }),
            page_size: MOCK_PAGE_SIZE,
            host_priv: MOCK_HOST_PRIV,
        }
    }

    /// Map `bytes` read/write at `base`
    pub fn map(&self, base: u64, bytes: Vec<u8>) {
        self.state.borrow_mut().regions.push(Region {
            base,
            bytes,
            protection: VmProt::READ | VmProt::WRITE,
        });
    }

    /// Map `size` zero bytes read/write at `base`
    pub fn map_zeroed(&self, base: u64, size: usize) {
        self.map(base, vec![0; size]);
    }

    /// Read kernel memory without going through (or journaling) a host call
    pub fn peek(&self, address: u64, size: usize) -> Option<Vec<u8>> {
        let state = self.state.borrow();
        let region = state.region(address, size as u64).ok()?;
        let start = (address - region.base) as usize;
        Some(region.bytes[start..start + size].to_vec())
    }

    /// Write kernel memory without going through (or journaling) a host call
    pub fn poke(&self, address: u64, data: &[u8]) -> bool {
        let mut state = self.state.borrow_mut();
        match state.region_mut(address, data.len() as u64) {
            Ok(region) => {
                let start = (address - region.base) as usize;
                region.bytes[start..start + data.len()].copy_from_slice(data);
                true
            }
            Err(_) => false,
        }
    }

    /// Protection of the region containing `address`
    pub fn protection_at(&self, address: u64) -> Option<VmProt> {
        self.state.borrow().region(address, 1).ok().map(|r| r.protection)
    }

    /// Context last set on `port`
    pub fn context_of(&self, port: MachPort) -> Option<u64> {
        self.state.borrow().contexts.get(&port).copied()
    }

    /// Ranges wired so far, as `(address, size)`
    pub fn wired_ranges(&self) -> Vec<(u64, u64)> {
        self.state.borrow().wired.clone()
    }

    /// Whether a region still starts at `base`
    pub fn is_mapped(&self, base: u64) -> bool {
        self.state.borrow().regions.iter().any(|r| r.base == base)
    }

    /// Set where the next allocation lands
    pub fn set_next_allocation(&self, address: u64) {
        self.state.borrow_mut().next_alloc = address;
    }

    /// Cap every subsequent read at `limit` bytes (`None` restores full reads)
    pub fn set_short_read(&self, limit: Option<u64>) {
        self.state.borrow_mut().short_read = limit;
    }

    /// Make the next call of kind `op` fail with `kr`
    pub fn fail_next(&self, op: HostOp, kr: KernReturn) {
        self.state.borrow_mut().failures.push_back((op, kr));
    }

    /// All calls made so far, in order
    pub fn calls(&self) -> Vec<HostCall> {
        self.state.borrow().journal.clone()
    }

    /// Number of calls of kind `op` made so far
    pub fn count(&self, op: HostOp) -> usize {
        self.state.borrow().journal.iter().filter(|c| c.op() == op).count()
    }

    pub fn clear_calls(&self) {
        self.state.borrow_mut().journal.clear();
    }

    /// Stop (or resume) recording calls, for long-running benchmarks
    pub fn set_journaling(&self, enabled: bool) {
        self.state.borrow_mut().journal_off = !enabled;
    }
}

fn check_port(port: MachPort) -> KernResult<()> {
    if port == MACH_PORT_NULL {
        Err(KernReturn::KERN_INVALID_ARGUMENT)
    } else {
        Ok(())
    }
}

impl MachHost for MockHost {
    fn port_set_context(&self, port: MachPort, context: u64) -> KernResult<()> {
        let mut state = self.state.borrow_mut();
        state.record(HostCall::SetContext { port, context })?;
        if port == MACH_PORT_NULL {
            return Err(KernReturn::KERN_INVALID_NAME);
        }
        state.contexts.insert(port, context);
        Ok(())
    }

    fn pid_for_task(&self, port: MachPort) -> KernResult<i32> {
        let mut state = self.state.borrow_mut();
        state.record(HostCall::PidForTask { port })?;
        let context = *state.contexts.get(&port).ok_or(KernReturn::KERN_FAILURE)?;
        let address = context.wrapping_add(PID_FIELD_OFFSET);
        let region = state.region(address, 4)?;
        let start = (address - region.base) as usize;
        let mut word = [0u8; 4];
        word.copy_from_slice(&region.bytes[start..start + 4]);
        Ok(i32::from_ne_bytes(word))
    }

    fn vm_read_overwrite(&self, task: MachPort, address: u64, dest: &mut [u8]) -> KernResult<u64> {
        let mut state = self.state.borrow_mut();
        let size = dest.len() as u64;
        state.record(HostCall::Read { task, address, size })?;
        check_port(task)?;
        let copied = state.short_read.map_or(size, |limit| limit.min(size));
        let region = state.region(address, size)?;
        if !region.protection.contains(VmProt::READ) {
            return Err(KernReturn::KERN_PROTECTION_FAILURE);
        }
        let start = (address - region.base) as usize;
        let n = copied as usize;
        dest[..n].copy_from_slice(&region.bytes[start..start + n]);
        Ok(copied)
    }

    fn vm_write(&self, task: MachPort, address: u64, data: &[u8]) -> KernResult<()> {
        let mut state = self.state.borrow_mut();
        state.record(HostCall::Write { task, address, size: data.len() as u64 })?;
        check_port(task)?;
        let region = state.region_mut(address, data.len() as u64)?;
        if !region.protection.contains(VmProt::WRITE) {
            return Err(KernReturn::KERN_PROTECTION_FAILURE);
        }
        let start = (address - region.base) as usize;
        region.bytes[start..start + data.len()].copy_from_slice(data);
        Ok(())
    }

    fn vm_allocate(&self, task: MachPort, size: u64, flags: VmAllocateFlags) -> KernResult<u64> {
        let mut state = self.state.borrow_mut();
        state.record(HostCall::Allocate { task, size, flags })?;
        check_port(task)?;
        if size == 0 || !flags.contains(VmAllocateFlags::ANYWHERE) {
            return Err(KernReturn::KERN_INVALID_ARGUMENT);
        }
        let address = state.next_alloc;
        // Leave a 4KiB gap so consecutive allocations never touch.
        state.next_alloc = address
            .checked_add(size)
            .and_then(|end| crate::round_page(end, 0x1000))
            .and_then(|end| end.checked_add(0x1000))
            .ok_or(KernReturn::KERN_NO_SPACE)?;
        state.regions.push(Region {
            base: address,
            bytes: vec![0; size as usize],
            protection: VmProt::READ | VmProt::WRITE,
        });
        Ok(address)
    }

    fn vm_deallocate(&self, task: MachPort, address: u64, size: u64) -> KernResult<()> {
        let mut state = self.state.borrow_mut();
        state.record(HostCall::Deallocate { task, address, size })?;
        check_port(task)?;
        let idx = state
            .regions
            .iter()
            .position(|r| r.base == address)
            .ok_or(KernReturn::KERN_INVALID_ADDRESS)?;
        state.regions.remove(idx);
        Ok(())
    }

    fn vm_protect(
        &self,
        task: MachPort,
        address: u64,
        size: u64,
        set_maximum: bool,
        protection: VmProt,
    ) -> KernResult<()> {
        let mut state = self.state.borrow_mut();
        state.record(HostCall::Protect { task, address, size, set_maximum, protection })?;
        check_port(task)?;
        // Protection is tracked per region, not per page.
        state.region_mut(address, size)?.protection = protection;
        Ok(())
    }

    fn vm_wire(
        &self,
        host_priv: MachPort,
        task: MachPort,
        address: u64,
        size: u64,
        protection: VmProt,
    ) -> KernResult<()> {
        let mut state = self.state.borrow_mut();
        state.record(HostCall::Wire { host_priv, task, address, size, protection })?;
        check_port(task)?;
        if host_priv != self.host_priv {
            return Err(KernReturn::KERN_INVALID_HOST);
        }
        if address % self.page_size != 0 {
            return Err(KernReturn::KERN_INVALID_ARGUMENT);
        }
        state.region(address, size)?;
        state.wired.push((address, size));
        Ok(())
    }

    fn host_priv(&self) -> MachPort {
        self.host_priv
    }

    fn kernel_page_size(&self) -> u64 {
        self.page_size
    }
}
