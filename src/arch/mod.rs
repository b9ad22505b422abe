//! Architectures known to the relocation engine.
//!
//! The relocation engine dispatches on the machine type recorded in the
//! guest's ELF header rather than on the host's target architecture: a
//! loader built for x86-64 can map an AArch64 guest into an emulated
//! target memory. Each submodule carries the relocation constants of
//! one guest architecture.

pub(crate) mod aarch64;
pub(crate) mod x86_64;

use elf::abi::{EM_AARCH64, EM_X86_64};

/// Machine type of the guest binary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Machine {
    /// `EM_X86_64`
    X86_64,
    /// `EM_AARCH64`
    Aarch64,
    /// Any other `e_machine` value. Such binaries can still be mapped,
    /// but no relocations are applied to them.
    Other(u16),
}

impl Machine {
    pub(crate) fn from_e_machine(value: u16) -> Self {
        match value {
            EM_X86_64 => Machine::X86_64,
            EM_AARCH64 => Machine::Aarch64,
            other => Machine::Other(other),
        }
    }
}

/// Pointer width and byte order of a guest binary.
///
/// Derived from the ELF identification bytes and handed to
/// [`Memory::write_ptr`](crate::Memory::write_ptr) and
/// [`Memory::read_ptr`](crate::Memory::read_ptr) so that pointer-sized
/// writes land in target memory with the guest's layout, whatever the
/// host's own width and endianness are.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ElfArch {
    machine: Machine,
    is_64: bool,
    little_endian: bool,
}

impl ElfArch {
    pub(crate) const fn new(machine: Machine, is_64: bool, little_endian: bool) -> Self {
        ElfArch {
            machine,
            is_64,
            little_endian,
        }
    }

    /// The guest's machine type.
    #[inline]
    pub fn machine(&self) -> Machine {
        self.machine
    }

    /// Size in bytes of a guest pointer (4 or 8).
    #[inline]
    pub fn pointer_size(&self) -> usize {
        if self.is_64 { 8 } else { 4 }
    }

    #[inline]
    pub fn is_little_endian(&self) -> bool {
        self.little_endian
    }

    /// Encode `value` as a guest pointer into `buf`, returning the
    /// number of bytes used.
    pub fn encode_ptr(&self, value: u64, buf: &mut [u8; 8]) -> usize {
        let size = self.pointer_size();
        if self.little_endian {
            buf.copy_from_slice(&value.to_le_bytes());
        } else {
            // Big-endian truncation keeps the low half of the value.
            let shifted = if self.is_64 { value } else { value << 32 };
            buf.copy_from_slice(&shifted.to_be_bytes());
        }
        size
    }

    /// Decode a guest pointer from the first [`pointer_size`](Self::pointer_size)
    /// bytes of `bytes`.
    pub fn decode_ptr(&self, bytes: &[u8]) -> u64 {
        let size = self.pointer_size();
        let mut buf = [0u8; 8];
        if self.little_endian {
            buf[..size].copy_from_slice(&bytes[..size]);
            u64::from_le_bytes(buf)
        } else {
            buf[8 - size..].copy_from_slice(&bytes[..size]);
            u64::from_be_bytes(buf)
        }
    }
}
