//! Dynamic and PLT/GOT relocation of the mapped guest.
//!
//! Only the four relocation kinds a dynamic loader must honor are
//! applied per architecture: `RELATIVE`, `JUMP_SLOT`, `GLOB_DAT` and
//! `COPY`. Everything else is logged and skipped; the guest keeps
//! loading (it may well never execute the affected code path).

use crate::{
    arch::{Machine, aarch64, x86_64},
    engine::{Memory, TargetSystem},
    loader::ElfLoader,
    symbol::Symbol,
};
use elf::abi::DT_PLTGOT;

/// The first `.got.plt` entries the ABI reserves for the dynamic
/// segment pointer, the link-map handle and the runtime resolver.
pub(crate) const GOT_RESERVED_ENTRIES: u64 = 3;

/// A dynamic relocation entry of the guest binary.
#[derive(Debug, Clone)]
pub struct Relocation {
    address: u64,
    r_type: u32,
    addend: i64,
    symbol: Symbol,
}

impl Relocation {
    pub(crate) const fn new(address: u64, r_type: u32, addend: i64, symbol: Symbol) -> Self {
        Relocation {
            address,
            r_type,
            addend,
            symbol,
        }
    }

    /// ELF virtual address of the slot being patched.
    #[inline]
    pub fn address(&self) -> u64 {
        self.address
    }

    /// Raw architecture-specific relocation type.
    #[inline]
    pub fn r_type(&self) -> u32 {
        self.r_type
    }

    #[inline]
    pub fn addend(&self) -> i64 {
        self.addend
    }

    /// The symbol the relocation refers to; anonymous for `RELATIVE`.
    #[inline]
    pub fn symbol(&self) -> &Symbol {
        &self.symbol
    }
}

/// Architecture-independent classification of a relocation type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum RelocKind {
    Relative,
    JumpSlot,
    GlobDat,
    Copy,
    Unsupported,
}

impl RelocKind {
    pub(crate) fn classify(machine: Machine, r_type: u32) -> RelocKind {
        match machine {
            Machine::X86_64 => match r_type {
                x86_64::REL_RELATIVE => RelocKind::Relative,
                x86_64::REL_JUMP_SLOT => RelocKind::JumpSlot,
                x86_64::REL_GOT => RelocKind::GlobDat,
                x86_64::REL_COPY => RelocKind::Copy,
                _ => RelocKind::Unsupported,
            },
            Machine::Aarch64 => match r_type {
                aarch64::REL_RELATIVE => RelocKind::Relative,
                aarch64::REL_JUMP_SLOT => RelocKind::JumpSlot,
                aarch64::REL_GOT => RelocKind::GlobDat,
                aarch64::REL_COPY => RelocKind::Copy,
                _ => RelocKind::Unsupported,
            },
            Machine::Other(_) => RelocKind::Unsupported,
        }
    }
}

impl ElfLoader {
    /// Apply one relocation to the mapped image.
    ///
    /// `is_lazy` is true during the dynamic-relocations pass and during
    /// lazy PLT/GOT setup; false when binding eagerly. Internally
    /// defined symbols short-circuit the external oracle in either
    /// mode.
    pub(crate) fn apply_relocation(&self, reloc: &Relocation, is_lazy: bool) {
        let arch = self.arch();
        let mem = self.engine().mem();
        let slot = self.get_address(reloc.address());
        match RelocKind::classify(self.binary().machine(), reloc.r_type()) {
            RelocKind::Relative => {
                mem.write_ptr(
                    arch,
                    slot,
                    self.base_address().wrapping_add_signed(reloc.addend()),
                );
            }
            RelocKind::JumpSlot => {
                let resolved = self.resolve(reloc.symbol());
                if resolved != 0 {
                    mem.write_ptr(arch, slot, resolved.wrapping_add_signed(reloc.addend()));
                } else if is_lazy {
                    // Rebase the PLT stub offset the slot was linked
                    // with, so the stub runs and re-enters the loader
                    // through GOT[2] on first call.
                    let value = mem.read_ptr(arch, slot);
                    mem.write_ptr(arch, slot, self.base_address().wrapping_add(value));
                } else {
                    let addr = self.engine().symlink(self, reloc.symbol());
                    mem.write_ptr(arch, slot, addr.wrapping_add_signed(reloc.addend()));
                }
            }
            RelocKind::GlobDat => {
                let resolved = self.resolve(reloc.symbol());
                let addr = if resolved != 0 {
                    resolved
                } else {
                    self.engine().symlink(self, reloc.symbol())
                };
                mem.write_ptr(arch, slot, addr.wrapping_add_signed(reloc.addend()));
            }
            RelocKind::Copy => {
                let src = self.engine().symlink(self, reloc.symbol());
                let size = reloc.symbol().size() as usize;
                if src == 0 || size == 0 {
                    log::warn!(
                        "cannot copy {} bytes for symbol '{}'",
                        size,
                        reloc.symbol().name()
                    );
                    return;
                }
                // The oracle's answer is a host-readable address per
                // the `TargetSystem::symlink` contract.
                let bytes = unsafe { core::slice::from_raw_parts(src as *const u8, size) };
                mem.write(slot, bytes);
            }
            RelocKind::Unsupported => {
                log::warn!("relocation type {} is not supported", reloc.r_type());
            }
        }
    }
}

/// Lazy-binding entry point, re-entered from the guest's PLT stubs.
///
/// The PLT resolution stub reaches this function through `GOT[2]` with
/// the loader pointer from `GOT[1]` and an architecture-dependent hint:
/// on x86-64 the stub pushes the PLT relocation index, on AArch64 it
/// passes the host address of the GOT slot being resolved. The resolved
/// address is written back into the slot and returned so the stub can
/// tail-jump to it.
///
/// # Safety
/// `loader` must be the pointer a live [`ElfLoader`] published to
/// `GOT[1]` during lazy binding setup.
pub unsafe extern "C" fn dl_resolve(loader: *mut ElfLoader, hint: usize) -> usize {
    let ldr = unsafe { &*loader };
    let arch = ldr.arch();

    let mut plt_sym_idx = hint as u64;
    if ldr.binary().machine() == Machine::Aarch64 {
        let got_base = ldr
            .binary()
            .dynamic_value(DT_PLTGOT)
            .map(|va| ldr.get_address(va))
            .unwrap_or(0);
        plt_sym_idx = plt_sym_idx
            .wrapping_sub(got_base)
            .wrapping_div(arch.pointer_size() as u64)
            .wrapping_sub(GOT_RESERVED_ENTRIES);
    }

    let pltgot = ldr.binary().pltgot_relocations();
    let Some(reloc) = pltgot.get(plt_sym_idx as usize) else {
        log::error!("PLT index out of range: {plt_sym_idx}");
        return 0;
    };

    let sym_addr = ldr.engine().symlink(ldr, reloc.symbol());
    log::info!("address of {}: {sym_addr:#x}", reloc.symbol().name());
    ldr.engine()
        .mem()
        .write_ptr(arch, ldr.get_address(reloc.address()), sym_addr);
    sym_addr as usize
}
