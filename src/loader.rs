//! The loader facade: map, relocate and bind a guest binary.

use crate::{
    Result,
    arch::{ElfArch, Machine},
    binary::ElfBinary,
    engine::{Memory, TargetSystem},
    error::{mmap_error, unsupported_error},
    relocation::dl_resolve,
    symbol::Symbol,
};
use alloc::{
    boxed::Box,
    string::{String, ToString},
    sync::Arc,
};
use elf::abi::DT_PLTGOT;
use hashbrown::HashMap;

pub(crate) const PAGE_SIZE: u64 = 0x1000;
const MASK: u64 = !(PAGE_SIZE - 1);

#[inline]
fn page_align(value: u64) -> u64 {
    (value + PAGE_SIZE - 1) & MASK
}

/// When external symbols are bound.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Binding {
    /// Apply dynamic relocations only; leave every PLT/GOT slot alone.
    NotBind,
    /// Resolve every PLT/GOT slot through the oracle at load time.
    Now,
    /// Defer external resolution until the first call through a PLT
    /// stub.
    Lazy,
    /// Alias for [`Lazy`](Binding::Lazy).
    Default,
}

impl Default for Binding {
    fn default() -> Self {
        Binding::Default
    }
}

/// A guest binary mapped into an engine's target memory.
///
/// Construction runs the whole pipeline: compatibility check, export
/// index build, segment mapping, dynamic relocations and symbol
/// binding. The loader is handed out boxed so the self-pointer it
/// publishes to the guest's `GOT[1]` under lazy binding stays valid for
/// its whole lifetime.
pub struct ElfLoader {
    binary: ElfBinary,
    engine: Arc<dyn TargetSystem>,
    arch: ElfArch,
    base_address: u64,
    exports: HashMap<String, Symbol>,
}

impl ElfLoader {
    /// Load a guest binary from a file on disk.
    #[cfg(feature = "std")]
    pub fn from_file(
        path: impl AsRef<std::path::Path>,
        engine: Arc<dyn TargetSystem>,
        binding: Binding,
    ) -> Result<Box<Self>> {
        log::info!("loading {}", path.as_ref().display());
        let binary = ElfBinary::from_file(path)?;
        Self::from_binary(binary, engine, binding)
    }

    /// Load an already-parsed guest binary.
    pub fn from_binary(
        binary: ElfBinary,
        engine: Arc<dyn TargetSystem>,
        binding: Binding,
    ) -> Result<Box<Self>> {
        if !engine.supports(&binary) {
            return Err(unsupported_error("engine rejected the binary"));
        }

        // Defined dynamic symbols, indexed for self-resolution. A
        // statically linked component can carry PLT/GOT entries for
        // symbols the binary itself defines; those never reach the
        // external oracle. Duplicate names: last write wins.
        let mut exports = HashMap::new();
        for sym in binary.dynamic_symbols() {
            if !sym.is_undefined() {
                exports.insert(sym.name().to_string(), sym.clone());
            }
        }

        let arch = binary.arch();
        let mut loader = Box::new(ElfLoader {
            binary,
            engine,
            arch,
            base_address: 0,
            exports,
        });
        loader.load(binding)?;
        Ok(loader)
    }

    fn load(&mut self, binding: Binding) -> Result<()> {
        let imagebase = self.binary.imagebase();
        let virtual_size = page_align(self.binary.virtual_size() - imagebase);
        log::debug!("virtual size: {virtual_size:#x}");

        let hint = self.engine.base_address_hint(imagebase, virtual_size);
        let base_address = self.engine.mem().mmap(hint, virtual_size);
        if base_address == 0 {
            log::error!("mmap() failed, abandoning load");
            return Err(mmap_error("target memory reservation failed"));
        }
        self.base_address = base_address;

        for segment in self.binary.segments() {
            if !segment.is_load() {
                continue;
            }
            let rva = self.rva(segment.vaddr());
            log::debug!(
                "mapping PT_LOAD at rva {rva:#x} ({} bytes)",
                segment.content().len()
            );
            if !segment.content().is_empty() {
                self.engine
                    .mem()
                    .write(base_address + rva, segment.content());
            }
        }

        if !matches!(self.binary.machine(), Machine::X86_64 | Machine::Aarch64) {
            log::warn!(
                "relocations not supported for machine {:?}",
                self.binary.machine()
            );
            return Ok(());
        }

        for reloc in self.binary.dynamic_relocations() {
            self.apply_relocation(reloc, true);
        }

        match binding {
            Binding::Now => self.bind_now(),
            Binding::Lazy | Binding::Default => self.bind_lazy(),
            Binding::NotBind => {}
        }
        Ok(())
    }

    fn bind_now(&self) {
        for reloc in self.binary.pltgot_relocations() {
            self.apply_relocation(reloc, false);
        }
    }

    fn bind_lazy(&self) {
        // The ABI reserves the first .got.plt entries: GOT[0] points at
        // the dynamic segment, GOT[1] identifies the object for the
        // resolver and GOT[2] is the resolver itself. The last two are
        // ours: GOT[1] carries this loader, GOT[2] the trampoline.
        let Some(got_va) = self.binary.dynamic_value(DT_PLTGOT) else {
            log::warn!("missing DT_PLTGOT, cannot lazy-bind this binary");
            return;
        };
        let got = self.get_address(got_va);
        let ptr_size = self.arch.pointer_size() as u64;
        log::debug!("lazy binding through got at {got:#x}");

        let mem = self.engine.mem();
        mem.write_ptr(self.arch, got + ptr_size, self as *const ElfLoader as u64);
        mem.write_ptr(self.arch, got + 2 * ptr_size, dl_resolve as usize as u64);

        for reloc in self.binary.pltgot_relocations() {
            self.apply_relocation(reloc, true);
        }
    }

    /// Host base address the image was mapped at; nonzero after a
    /// successful load.
    #[inline]
    pub fn base_address(&self) -> u64 {
        self.base_address
    }

    /// The parsed guest binary.
    #[inline]
    pub fn binary(&self) -> &ElfBinary {
        &self.binary
    }

    /// The engine this loader runs against.
    #[inline]
    pub fn engine(&self) -> &dyn TargetSystem {
        &*self.engine
    }

    /// Pointer width and endianness descriptor of the guest.
    #[inline]
    pub fn arch(&self) -> ElfArch {
        self.arch
    }

    #[inline]
    fn rva(&self, va: u64) -> u64 {
        let imagebase = self.binary.imagebase();
        if va >= imagebase { va - imagebase } else { va }
    }

    /// Host address of the ELF virtual address `va`.
    #[inline]
    pub fn get_address(&self, va: u64) -> u64 {
        self.base_address + self.rva(va)
    }

    /// Host address of the named symbol, or 0 when the binary does not
    /// define it.
    pub fn get_symbol_address(&self, name: &str) -> u64 {
        match self.binary.symbol(name) {
            Some(sym) => self.get_address(sym.value()),
            None => 0,
        }
    }

    /// Host address of the guest's entrypoint.
    pub fn entrypoint(&self) -> u64 {
        self.base_address + (self.binary.entrypoint() - self.binary.imagebase())
    }

    /// Resolve a symbol against the export index; 0 on miss.
    pub(crate) fn resolve(&self, symbol: &Symbol) -> u64 {
        match self.exports.get(symbol.name()) {
            Some(found) => self.get_address(found.value()),
            None => 0,
        }
    }
}
