//! Mach scalar types and return codes shared by every backend.

use core::fmt;

use bitflags::bitflags;

/// Port name in our own IPC space (`mach_port_t`)
pub type MachPort = u32;

/// The null port. A capability holding it is no capability at all.
pub const MACH_PORT_NULL: MachPort = 0;

/// Raw `kern_return_t` wrapped so it prints as something readable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct KernReturn(pub i32);

pub type KernResult<T> = core::result::Result<T, KernReturn>;

impl KernReturn {
    pub const KERN_SUCCESS: Self = Self(0);
    pub const KERN_INVALID_ADDRESS: Self = Self(1);
    pub const KERN_PROTECTION_FAILURE: Self = Self(2);
    pub const KERN_NO_SPACE: Self = Self(3);
    pub const KERN_INVALID_ARGUMENT: Self = Self(4);
    pub const KERN_FAILURE: Self = Self(5);
    pub const KERN_RESOURCE_SHORTAGE: Self = Self(6);
    pub const KERN_NOT_RECEIVER: Self = Self(7);
    pub const KERN_NO_ACCESS: Self = Self(8);
    pub const KERN_MEMORY_FAILURE: Self = Self(9);
    pub const KERN_MEMORY_ERROR: Self = Self(10);
    pub const KERN_ABORTED: Self = Self(14);
    pub const KERN_INVALID_NAME: Self = Self(15);
    pub const KERN_INVALID_TASK: Self = Self(16);
    pub const KERN_INVALID_RIGHT: Self = Self(17);
    pub const KERN_INVALID_VALUE: Self = Self(18);
    pub const KERN_INVALID_HOST: Self = Self(22);

    /// Convert a raw return code from a host call into a `KernResult`
    #[inline]
    pub fn check(raw: i32) -> KernResult<()> {
        if raw == Self::KERN_SUCCESS.0 {
            Ok(())
        } else {
            Err(Self(raw))
        }
    }

    pub fn is_success(self) -> bool {
        self == Self::KERN_SUCCESS
    }

    /// Symbolic name and description for the standard codes
    pub fn describe(self) -> Option<(&'static str, &'static str)> {
        let entry = match self.0 {
            0 => ("KERN_SUCCESS", "success"),
            1 => ("KERN_INVALID_ADDRESS", "specified address is not currently valid"),
            2 => ("KERN_PROTECTION_FAILURE", "specified memory is valid, but does not permit the required forms of access"),
            3 => ("KERN_NO_SPACE", "the address range specified is already in use, or no address range of the size specified could be found"),
            4 => ("KERN_INVALID_ARGUMENT", "the function requested was not applicable to this type of argument"),
            5 => ("KERN_FAILURE", "the function could not be performed"),
            6 => ("KERN_RESOURCE_SHORTAGE", "a system resource could not be allocated to fulfill this request"),
            7 => ("KERN_NOT_RECEIVER", "the task in question does not hold receive rights for the port argument"),
            8 => ("KERN_NO_ACCESS", "bogus access restriction"),
            9 => ("KERN_MEMORY_FAILURE", "during a page fault, the target address refers to a memory object that has been destroyed"),
            10 => ("KERN_MEMORY_ERROR", "during a page fault, the memory object indicated that the data could not be returned"),
            14 => ("KERN_ABORTED", "the operation was aborted"),
            15 => ("KERN_INVALID_NAME", "the name doesn't denote a right in the task"),
            16 => ("KERN_INVALID_TASK", "target task isn't an active task"),
            17 => ("KERN_INVALID_RIGHT", "the name denotes a right, but not an appropriate right"),
            18 => ("KERN_INVALID_VALUE", "a blatant range error"),
            22 => ("KERN_INVALID_HOST", "target host isn't actually a host"),
            _ => return None,
        };
        Some(entry)
    }
}

impl fmt::Display for KernReturn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.describe() {
            Some((name, text)) => write!(f, "{} ({:#x}): {}", name, self.0, text),
            None => write!(f, "unknown kern_return_t {:#x}", self.0),
        }
    }
}

bitflags! {
    /// `vm_prot_t`
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct VmProt: i32 {
        const READ = 0x1;
        const WRITE = 0x2;
        const EXECUTE = 0x4;
    }
}

bitflags! {
    /// Flags accepted by `mach_vm_allocate`
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct VmAllocateFlags: i32 {
        const ANYWHERE = 0x1;
    }
}

/// Round `size` up to a multiple of `page_size` (power of two).
/// `None` if the rounded size does not fit in 64 bits.
#[inline]
pub fn round_page(size: u64, page_size: u64) -> Option<u64> {
    debug_assert!(page_size.is_power_of_two());
    size.checked_add(page_size - 1).map(|end| end & !(page_size - 1))
}
