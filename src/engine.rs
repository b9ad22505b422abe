//! The host side of the loader: target memory and the symbol oracle.
//!
//! The loader never owns memory and never resolves external symbols on
//! its own. Both concerns belong to the embedding engine, which may be
//! the host process itself, an emulator, or a remote target. These two
//! traits are the complete surface the loader needs from it.

use crate::{arch::ElfArch, binary::ElfBinary, loader::ElfLoader, symbol::Symbol};

/// Target memory of the engine.
///
/// Addresses are host addresses in the engine's world; for an in-process
/// engine they are plain pointers, for an emulator they live in the
/// emulated address space. All methods take `&self`: implementations
/// that mutate state are expected to use interior mutability, which is
/// what lets the lazy-binding trampoline write GOT slots through a
/// shared loader reference.
pub trait Memory {
    /// Reserve `size` bytes of target memory, preferably at `hint`.
    ///
    /// Returns the base address of the reservation, or 0 on failure.
    /// The reserved region must read back as zeroes until written.
    fn mmap(&self, hint: u64, size: u64) -> u64;

    /// Copy `bytes` into target memory at `addr`.
    fn write(&self, addr: u64, bytes: &[u8]);

    /// Write a pointer-sized integer at `addr`, honoring the guest's
    /// pointer width and byte order described by `arch`.
    fn write_ptr(&self, arch: ElfArch, addr: u64, value: u64);

    /// Read back a pointer-sized integer from `addr`. Inverse of
    /// [`write_ptr`](Self::write_ptr).
    fn read_ptr(&self, arch: ElfArch, addr: u64) -> u64;
}

/// The engine a loader runs against.
///
/// Owns the target memory and answers external symbol queries. The
/// engine must outlive every loader created on top of it; loaders hold
/// it behind an `Arc`.
pub trait TargetSystem {
    /// Architectural/ABI compatibility check, consulted before any
    /// memory is touched. A `false` here fails the loader constructor.
    fn supports(&self, binary: &ElfBinary) -> bool;

    /// Suggest a base address for mapping an image whose preferred base
    /// is `imagebase` and whose mapped span is `virtual_size` bytes.
    /// [`Memory::mmap`] is free to ignore the suggestion.
    fn base_address_hint(&self, imagebase: u64, virtual_size: u64) -> u64;

    /// The engine's target memory.
    fn mem(&self) -> &dyn Memory;

    /// External symbol resolution oracle.
    ///
    /// Returns the host address where `symbol` is defined in the
    /// engine's world. The answer is trusted as-is; for `R_*_COPY`
    /// relocations it must additionally be readable by the loader for
    /// `symbol.size()` bytes.
    fn symlink(&self, loader: &ElfLoader, symbol: &Symbol) -> u64;
}
