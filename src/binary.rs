//! Parsed view of the guest ELF object.
//!
//! [`ElfBinary`] is built eagerly from the raw file bytes: segments,
//! dynamic entries, symbol tables and relocation tables are copied into
//! owned storage so the loader never has to keep the file around. The
//! heavy lifting of header and table decoding is done by the `elf`
//! crate; this module only walks the dynamic segment the way a runtime
//! loader does, through `DT_*` entries rather than section headers.

use crate::{
    Result,
    arch::{ElfArch, Machine},
    error::{parse_dynamic_error, parse_ehdr_error},
    relocation::Relocation,
    symbol::Symbol,
};
use alloc::{
    string::{String, ToString},
    vec::Vec,
};
use elf::{
    ElfBytes,
    abi::{
        DT_JMPREL, DT_NULL, DT_PLTREL, DT_PLTRELSZ, DT_REL, DT_RELA, DT_RELASZ, DT_RELSZ, PT_LOAD,
    },
    endian::{AnyEndian, EndianParse},
    file::Class,
    relocation::{RelIterator, RelaIterator},
    segment::ProgramHeader,
    string_table::StringTable,
    symbol::SymbolTable,
};

/// A program segment with its file-backed content.
#[derive(Debug, Clone)]
pub struct Segment {
    p_type: u32,
    vaddr: u64,
    content: Vec<u8>,
}

impl Segment {
    /// The `p_type` of the program header (`PT_LOAD`, `PT_DYNAMIC`, ...).
    #[inline]
    pub fn p_type(&self) -> u32 {
        self.p_type
    }

    /// Virtual address the segment wants to live at.
    #[inline]
    pub fn vaddr(&self) -> u64 {
        self.vaddr
    }

    /// The file-backed bytes of the segment. The zero-initialized tail
    /// (`p_memsz` beyond `p_filesz`) is not part of the content.
    #[inline]
    pub fn content(&self) -> &[u8] {
        &self.content
    }

    #[inline]
    pub fn is_load(&self) -> bool {
        self.p_type == PT_LOAD
    }
}

/// The parsed guest binary.
pub struct ElfBinary {
    machine: Machine,
    arch: ElfArch,
    imagebase: u64,
    virtual_size: u64,
    entrypoint: u64,
    segments: Vec<Segment>,
    dynamic: Vec<(i64, u64)>,
    dynamic_symbols: Vec<Symbol>,
    symtab_symbols: Vec<Symbol>,
    dynamic_relocations: Vec<Relocation>,
    pltgot_relocations: Vec<Relocation>,
}

/// A relocation table located through the dynamic segment.
struct RelocTable {
    vaddr: u64,
    size: u64,
    is_rela: bool,
}

impl RelocTable {
    fn entry_size(&self, class: Class) -> u64 {
        match (self.is_rela, class == Class::ELF64) {
            (true, true) => 24,
            (true, false) => 12,
            (false, true) => 16,
            (false, false) => 8,
        }
    }

    fn contains(&self, va: u64) -> bool {
        va >= self.vaddr && va < self.vaddr + self.size
    }
}

impl ElfBinary {
    /// Parse a guest binary from raw file bytes.
    pub fn parse(data: &[u8]) -> Result<Self> {
        if data.len() < 4 || data[..4] != [0x7f, b'E', b'L', b'F'] {
            return Err(parse_ehdr_error("not an ELF file"));
        }
        let bytes = ElfBytes::<AnyEndian>::minimal_parse(data)
            .map_err(|err| parse_ehdr_error(err.to_string()))?;
        let ehdr = &bytes.ehdr;
        let machine = Machine::from_e_machine(ehdr.e_machine);
        let arch = ElfArch::new(
            machine,
            ehdr.class == Class::ELF64,
            matches!(ehdr.endianness, AnyEndian::Little),
        );

        let phdrs: Vec<ProgramHeader> = bytes
            .segments()
            .map(|table| table.iter().collect())
            .unwrap_or_default();

        let mut imagebase = u64::MAX;
        let mut virtual_size = 0;
        for phdr in phdrs.iter().filter(|phdr| phdr.p_type == PT_LOAD) {
            imagebase = imagebase.min(phdr.p_vaddr);
            virtual_size = virtual_size.max(phdr.p_vaddr + phdr.p_memsz);
        }
        if imagebase == u64::MAX {
            imagebase = 0;
        }

        let mut segments = Vec::with_capacity(phdrs.len());
        for phdr in &phdrs {
            segments.push(Segment {
                p_type: phdr.p_type,
                vaddr: phdr.p_vaddr,
                content: file_slice(data, phdr.p_offset, phdr.p_filesz)?.to_vec(),
            });
        }

        let mut dynamic = Vec::new();
        if let Some(table) = bytes
            .dynamic()
            .map_err(|err| parse_dynamic_error(err.to_string()))?
        {
            for entry in table.iter() {
                if entry.d_tag == DT_NULL {
                    break;
                }
                dynamic.push((entry.d_tag, entry.d_val()));
            }
        }

        let dynamic_symbols = match bytes
            .dynamic_symbol_table()
            .map_err(|err| parse_dynamic_error(err.to_string()))?
        {
            Some((symtab, strtab)) => collect_symbols(&symtab, &strtab)?,
            None => Vec::new(),
        };
        let symtab_symbols = match bytes
            .symbol_table()
            .map_err(|err| parse_dynamic_error(err.to_string()))?
        {
            Some((symtab, strtab)) => collect_symbols(&symtab, &strtab)?,
            None => Vec::new(),
        };

        let mut binary = ElfBinary {
            machine,
            arch,
            imagebase,
            virtual_size,
            entrypoint: ehdr.e_entry,
            segments,
            dynamic,
            dynamic_symbols,
            symtab_symbols,
            dynamic_relocations: Vec::new(),
            pltgot_relocations: Vec::new(),
        };
        binary.parse_relocations(data, &phdrs, ehdr.class, ehdr.endianness)?;
        Ok(binary)
    }

    /// Parse a guest binary from a file on disk.
    #[cfg(feature = "std")]
    pub fn from_file(path: impl AsRef<std::path::Path>) -> Result<Self> {
        let data = std::fs::read(path)?;
        Self::parse(&data)
    }

    /// Locate and decode the `DT_RELA`/`DT_REL` and `DT_JMPREL` tables.
    ///
    /// Entries of the dynamic table that fall inside the `DT_JMPREL`
    /// window are left to the PLT/GOT pass alone, so a linker that
    /// folds `.rela.plt` into the `DT_RELA` range does not get its PLT
    /// slots relocated twice.
    fn parse_relocations(
        &mut self,
        data: &[u8],
        phdrs: &[ProgramHeader],
        class: Class,
        endian: AnyEndian,
    ) -> Result<()> {
        let plt_table = self.locate_table(DT_JMPREL, DT_PLTRELSZ, self.plt_is_rela());

        if let Some(table) = self.locate_table(DT_RELA, DT_RELASZ, true) {
            let relocs = self.decode_table(data, phdrs, class, endian, &table, plt_table.as_ref())?;
            self.dynamic_relocations.extend(relocs);
        }
        if let Some(table) = self.locate_table(DT_REL, DT_RELSZ, false) {
            let relocs = self.decode_table(data, phdrs, class, endian, &table, plt_table.as_ref())?;
            self.dynamic_relocations.extend(relocs);
        }
        if let Some(table) = plt_table {
            let relocs = self.decode_table(data, phdrs, class, endian, &table, None)?;
            self.pltgot_relocations = relocs;
        }
        Ok(())
    }

    fn plt_is_rela(&self) -> bool {
        // DT_PLTREL names the entry format of DT_JMPREL; RELA when absent.
        self.dynamic_value(DT_PLTREL)
            .map(|value| value == DT_RELA as u64)
            .unwrap_or(true)
    }

    fn locate_table(&self, off_tag: i64, size_tag: i64, is_rela: bool) -> Option<RelocTable> {
        let vaddr = self.dynamic_value(off_tag)?;
        let size = self.dynamic_value(size_tag)?;
        if vaddr == 0 || size == 0 {
            return None;
        }
        Some(RelocTable {
            vaddr,
            size,
            is_rela,
        })
    }

    fn decode_table(
        &self,
        data: &[u8],
        phdrs: &[ProgramHeader],
        class: Class,
        endian: AnyEndian,
        table: &RelocTable,
        exclude: Option<&RelocTable>,
    ) -> Result<Vec<Relocation>> {
        let offset = va_to_offset(phdrs, table.vaddr)
            .ok_or_else(|| parse_dynamic_error("relocation table outside loadable segments"))?;
        let bytes = file_slice(data, offset, table.size)?;
        let entry_size = table.entry_size(class);

        let raw: Vec<(u64, u32, u32, i64)> = if table.is_rela {
            RelaIterator::new(endian, class, bytes)
                .map(|rela| (rela.r_offset, rela.r_sym, rela.r_type, rela.r_addend))
                .collect()
        } else {
            RelIterator::new(endian, class, bytes)
                .map(|rel| (rel.r_offset, rel.r_sym, rel.r_type, 0))
                .collect()
        };

        let mut relocs = Vec::with_capacity(raw.len());
        for (index, (r_offset, r_sym, r_type, r_addend)) in raw.into_iter().enumerate() {
            let entry_va = table.vaddr + index as u64 * entry_size;
            if exclude.is_some_and(|window| window.contains(entry_va)) {
                continue;
            }
            relocs.push(Relocation::new(
                r_offset,
                r_type,
                r_addend,
                self.symbol_by_index(r_sym),
            ));
        }
        Ok(relocs)
    }

    fn symbol_by_index(&self, r_sym: u32) -> Symbol {
        if r_sym == 0 {
            return Symbol::new(String::new(), 0, 0);
        }
        // The parsed table skips the null symbol at index 0.
        self.dynamic_symbols
            .get(r_sym as usize - 1)
            .cloned()
            .unwrap_or_else(|| Symbol::new(String::new(), 0, 0))
    }

    /// The guest's machine type.
    #[inline]
    pub fn machine(&self) -> Machine {
        self.machine
    }

    /// Pointer width and endianness descriptor of the guest.
    #[inline]
    pub fn arch(&self) -> ElfArch {
        self.arch
    }

    /// Lowest virtual address of any `PT_LOAD` segment.
    #[inline]
    pub fn imagebase(&self) -> u64 {
        self.imagebase
    }

    /// End virtual address of the highest `PT_LOAD` segment.
    #[inline]
    pub fn virtual_size(&self) -> u64 {
        self.virtual_size
    }

    /// `e_entry` as recorded in the header.
    #[inline]
    pub fn entrypoint(&self) -> u64 {
        self.entrypoint
    }

    /// Program segments, in declaration order.
    #[inline]
    pub fn segments(&self) -> &[Segment] {
        &self.segments
    }

    /// Value of the first dynamic entry with tag `tag`.
    pub fn dynamic_value(&self, tag: i64) -> Option<u64> {
        self.dynamic
            .iter()
            .find(|(entry_tag, _)| *entry_tag == tag)
            .map(|(_, value)| *value)
    }

    #[inline]
    pub fn has_dynamic(&self, tag: i64) -> bool {
        self.dynamic_value(tag).is_some()
    }

    /// The `.dynsym` symbols, null entry excluded.
    #[inline]
    pub fn dynamic_symbols(&self) -> &[Symbol] {
        &self.dynamic_symbols
    }

    /// Look up a named symbol, `.dynsym` first, then `.symtab`.
    pub fn symbol(&self, name: &str) -> Option<&Symbol> {
        self.dynamic_symbols
            .iter()
            .chain(self.symtab_symbols.iter())
            .find(|sym| sym.name() == name)
    }

    #[inline]
    pub fn has_symbol(&self, name: &str) -> bool {
        self.symbol(name).is_some()
    }

    /// The dynamic relocation table (`DT_RELA`/`DT_REL`), PLT window
    /// excluded.
    #[inline]
    pub fn dynamic_relocations(&self) -> &[Relocation] {
        &self.dynamic_relocations
    }

    /// The PLT/GOT relocation table (`DT_JMPREL`).
    #[inline]
    pub fn pltgot_relocations(&self) -> &[Relocation] {
        &self.pltgot_relocations
    }
}

fn collect_symbols<E: EndianParse>(
    symtab: &SymbolTable<'_, E>,
    strtab: &StringTable<'_>,
) -> Result<Vec<Symbol>> {
    // The null symbol at index 0 carries no definition.
    let mut symbols = Vec::new();
    for sym in symtab.iter().skip(1) {
        let name = strtab
            .get(sym.st_name as usize)
            .map_err(|err| parse_dynamic_error(err.to_string()))?;
        symbols.push(Symbol::new(name.to_string(), sym.st_value, sym.st_size));
    }
    Ok(symbols)
}

fn va_to_offset(phdrs: &[ProgramHeader], va: u64) -> Option<u64> {
    phdrs
        .iter()
        .filter(|phdr| phdr.p_type == PT_LOAD)
        .find(|phdr| va >= phdr.p_vaddr && va < phdr.p_vaddr + phdr.p_filesz)
        .map(|phdr| phdr.p_offset + (va - phdr.p_vaddr))
}

fn file_slice(data: &[u8], offset: u64, size: u64) -> Result<&[u8]> {
    if size == 0 {
        return Ok(&[]);
    }
    let start = offset as usize;
    let end = start
        .checked_add(size as usize)
        .filter(|end| *end <= data.len())
        .ok_or_else(|| parse_dynamic_error("table or segment extends past end of file"))?;
    Ok(&data[start..end])
}
