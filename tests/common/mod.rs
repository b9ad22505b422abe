#![allow(dead_code)]

use std::cell::{Cell, RefCell};
use std::collections::HashMap;
use std::sync::Arc;

use elf::abi::{
    DT_JMPREL, DT_NULL, DT_PLTGOT, DT_PLTREL, DT_PLTRELSZ, DT_RELA, DT_RELAENT, DT_RELASZ,
    DT_STRSZ, DT_STRTAB, DT_SYMENT, DT_SYMTAB, ET_DYN, ET_EXEC, PT_DYNAMIC, PT_LOAD, SHT_DYNSYM,
    SHT_STRTAB,
};
use guestld::{ElfArch, ElfBinary, ElfLoader, Memory, Symbol, TargetSystem};

pub const MOCK_BASE: u64 = 0x7f80_0000_0000;

/// Fixed layout of the synthetic image, as offsets from the image base.
/// Tests place relocation slots and data from `DATA_OFF` upward.
pub const PHDR_OFF: u64 = 0x40;
pub const DYNSTR_OFF: u64 = 0x100;
pub const DYNSYM_OFF: u64 = 0x200;
pub const RELA_DYN_OFF: u64 = 0x300;
pub const RELA_PLT_OFF: u64 = 0x400;
pub const DYNAMIC_OFF: u64 = 0x600;
pub const SHDR_OFF: u64 = 0x700;
pub const DATA_OFF: u64 = 0x800;

const EHDR_SIZE: u64 = 64;
const PHDR_SIZE: u64 = 56;
const SHDR_SIZE: u64 = 64;
const SYM_SIZE: u64 = 24;
const RELA_SIZE: u64 = 24;
const DYN_SIZE: u64 = 16;

struct RelaSpec {
    offset: u64,
    r_type: u32,
    sym: Option<String>,
    addend: i64,
}

/// Emits a minimal but real little-endian ELF64 image: one `PT_LOAD`
/// covering the whole file, a `PT_DYNAMIC` segment, `.dynstr`/`.dynsym`
/// section headers and the relocation tables the dynamic entries point
/// at. The result parses through the ordinary [`ElfBinary`] path.
pub struct ImageBuilder {
    machine: u16,
    imagebase: u64,
    entry: u64,
    image_size: u64,
    symbols: Vec<(String, u64, u64)>,
    rela_dyn: Vec<RelaSpec>,
    rela_plt: Vec<RelaSpec>,
    pltgot: Option<u64>,
    merge_plt: bool,
    pokes: Vec<(u64, Vec<u8>)>,
}

impl ImageBuilder {
    pub fn new(machine: u16) -> Self {
        ImageBuilder {
            machine,
            imagebase: 0,
            entry: 0,
            image_size: 0x1000,
            symbols: Vec::new(),
            rela_dyn: Vec::new(),
            rela_plt: Vec::new(),
            pltgot: None,
            merge_plt: false,
            pokes: Vec::new(),
        }
    }

    pub fn imagebase(mut self, imagebase: u64) -> Self {
        self.imagebase = imagebase;
        if self.entry < imagebase {
            self.entry = imagebase;
        }
        self
    }

    pub fn image_size(mut self, size: u64) -> Self {
        self.image_size = size;
        self
    }

    pub fn entry(mut self, entry: u64) -> Self {
        self.entry = entry;
        self
    }

    /// Declare a dynamic symbol. `value == 0` makes it an import.
    pub fn symbol(mut self, name: &str, value: u64, size: u64) -> Self {
        self.symbols.push((name.to_string(), value, size));
        self
    }

    pub fn rela_dyn(mut self, offset: u64, r_type: u32, sym: &str, addend: i64) -> Self {
        self.rela_dyn.push(RelaSpec {
            offset,
            r_type,
            sym: (!sym.is_empty()).then(|| sym.to_string()),
            addend,
        });
        self
    }

    pub fn rela_plt(mut self, offset: u64, r_type: u32, sym: &str, addend: i64) -> Self {
        self.rela_plt.push(RelaSpec {
            offset,
            r_type,
            sym: (!sym.is_empty()).then(|| sym.to_string()),
            addend,
        });
        self
    }

    pub fn pltgot(mut self, va: u64) -> Self {
        self.pltgot = Some(va);
        self
    }

    /// Lay the PLT relocations out directly behind the dynamic ones and
    /// cover both with `DT_RELASZ`, the way a linker folds `.rela.plt`
    /// into the `.rela.dyn` range.
    pub fn merge_plt_table(mut self) -> Self {
        self.merge_plt = true;
        self
    }

    /// Preset image bytes at a virtual address, e.g. the initial value
    /// of a GOT slot.
    pub fn poke(mut self, va: u64, bytes: &[u8]) -> Self {
        self.pokes.push((va, bytes.to_vec()));
        self
    }

    fn sym_index(&self, name: &Option<String>) -> u64 {
        match name {
            None => 0,
            Some(name) => {
                self.symbols
                    .iter()
                    .position(|(sym_name, _, _)| sym_name == name)
                    .expect("relocation references an undeclared symbol") as u64
                    + 1
            }
        }
    }

    pub fn build(self) -> Vec<u8> {
        let mut buf = vec![0u8; self.image_size as usize];

        // .dynstr
        let mut strtab = vec![0u8];
        let mut name_offsets = Vec::new();
        for (name, _, _) in &self.symbols {
            name_offsets.push(strtab.len() as u32);
            strtab.extend_from_slice(name.as_bytes());
            strtab.push(0);
        }
        assert!(strtab.len() as u64 <= DYNSYM_OFF - DYNSTR_OFF);
        put(&mut buf, DYNSTR_OFF, &strtab);

        // .dynsym, null entry first
        for (index, (_, value, size)) in self.symbols.iter().enumerate() {
            let off = DYNSYM_OFF + (index as u64 + 1) * SYM_SIZE;
            put_u32(&mut buf, off, name_offsets[index]);
            buf[off as usize + 4] = 0x12; // GLOBAL | FUNC
            put_u16(&mut buf, off + 6, if *value > 0 { 1 } else { 0 });
            put_u64(&mut buf, off + 8, *value);
            put_u64(&mut buf, off + 16, *size);
        }
        let dynsym_size = (self.symbols.len() as u64 + 1) * SYM_SIZE;
        assert!(dynsym_size <= RELA_DYN_OFF - DYNSYM_OFF);

        // relocation tables
        let plt_off = if self.merge_plt {
            RELA_DYN_OFF + self.rela_dyn.len() as u64 * RELA_SIZE
        } else {
            RELA_PLT_OFF
        };
        for (index, rela) in self.rela_dyn.iter().enumerate() {
            self.put_rela(&mut buf, RELA_DYN_OFF + index as u64 * RELA_SIZE, rela);
        }
        for (index, rela) in self.rela_plt.iter().enumerate() {
            self.put_rela(&mut buf, plt_off + index as u64 * RELA_SIZE, rela);
        }
        let rela_dyn_size = if self.merge_plt {
            (self.rela_dyn.len() + self.rela_plt.len()) as u64 * RELA_SIZE
        } else {
            self.rela_dyn.len() as u64 * RELA_SIZE
        };
        let rela_plt_size = self.rela_plt.len() as u64 * RELA_SIZE;

        // .dynamic
        let mut dynamic = Vec::new();
        let mut add = |tag: i64, value: u64| {
            dynamic.extend_from_slice(&tag.to_le_bytes());
            dynamic.extend_from_slice(&value.to_le_bytes());
        };
        add(DT_STRTAB, self.imagebase + DYNSTR_OFF);
        add(DT_STRSZ, strtab.len() as u64);
        add(DT_SYMTAB, self.imagebase + DYNSYM_OFF);
        add(DT_SYMENT, SYM_SIZE);
        if rela_dyn_size > 0 {
            add(DT_RELA, self.imagebase + RELA_DYN_OFF);
            add(DT_RELASZ, rela_dyn_size);
            add(DT_RELAENT, RELA_SIZE);
        }
        if rela_plt_size > 0 {
            add(DT_JMPREL, self.imagebase + plt_off);
            add(DT_PLTRELSZ, rela_plt_size);
            add(DT_PLTREL, DT_RELA as u64);
        }
        if let Some(got) = self.pltgot {
            add(DT_PLTGOT, got);
        }
        add(DT_NULL, 0);
        assert!(dynamic.len() as u64 <= SHDR_OFF - DYNAMIC_OFF);
        let dynamic_len = dynamic.len() as u64;
        put(&mut buf, DYNAMIC_OFF, &dynamic);

        // ehdr
        buf[..4].copy_from_slice(&[0x7f, b'E', b'L', b'F']);
        buf[4] = 2; // ELFCLASS64
        buf[5] = 1; // ELFDATA2LSB
        buf[6] = 1; // EV_CURRENT
        put_u16(&mut buf, 0x10, if self.imagebase > 0 { ET_EXEC } else { ET_DYN });
        put_u16(&mut buf, 0x12, self.machine);
        put_u32(&mut buf, 0x14, 1); // e_version
        put_u64(&mut buf, 0x18, self.entry);
        put_u64(&mut buf, 0x20, PHDR_OFF); // e_phoff
        put_u64(&mut buf, 0x28, SHDR_OFF); // e_shoff
        put_u16(&mut buf, 0x34, EHDR_SIZE as u16);
        put_u16(&mut buf, 0x36, PHDR_SIZE as u16);
        put_u16(&mut buf, 0x38, 2); // e_phnum
        put_u16(&mut buf, 0x3a, SHDR_SIZE as u16);
        put_u16(&mut buf, 0x3c, 3); // e_shnum
        put_u16(&mut buf, 0x3e, 0); // e_shstrndx

        // PT_LOAD over the whole file, then PT_DYNAMIC
        self.put_phdr(&mut buf, PHDR_OFF, PT_LOAD, 0x7, 0, self.image_size, 0x1000);
        self.put_phdr(
            &mut buf,
            PHDR_OFF + PHDR_SIZE,
            PT_DYNAMIC,
            0x6,
            DYNAMIC_OFF,
            dynamic_len,
            8,
        );

        // null shdr, .dynstr, .dynsym
        self.put_shdr(&mut buf, SHDR_OFF, 0, 0, 0, 0, 0, 0);
        self.put_shdr(
            &mut buf,
            SHDR_OFF + SHDR_SIZE,
            SHT_STRTAB,
            DYNSTR_OFF,
            strtab.len() as u64,
            0,
            0,
            1,
        );
        self.put_shdr(
            &mut buf,
            SHDR_OFF + 2 * SHDR_SIZE,
            SHT_DYNSYM,
            DYNSYM_OFF,
            dynsym_size,
            1, // sh_link -> .dynstr
            SYM_SIZE,
            8,
        );

        for (va, bytes) in &self.pokes {
            let off = va
                .checked_sub(self.imagebase)
                .expect("poke below imagebase");
            put(&mut buf, off, bytes);
        }
        buf
    }

    fn put_rela(&self, buf: &mut [u8], off: u64, rela: &RelaSpec) {
        put_u64(buf, off, rela.offset);
        put_u64(buf, off + 8, (self.sym_index(&rela.sym) << 32) | rela.r_type as u64);
        put_u64(buf, off + 16, rela.addend as u64);
    }

    fn put_phdr(
        &self,
        buf: &mut [u8],
        at: u64,
        p_type: u32,
        flags: u32,
        offset: u64,
        size: u64,
        align: u64,
    ) {
        put_u32(buf, at, p_type);
        put_u32(buf, at + 4, flags);
        put_u64(buf, at + 8, offset);
        put_u64(buf, at + 16, self.imagebase + offset); // p_vaddr
        put_u64(buf, at + 24, self.imagebase + offset); // p_paddr
        put_u64(buf, at + 32, size); // p_filesz
        put_u64(buf, at + 40, size); // p_memsz
        put_u64(buf, at + 48, align);
    }

    #[allow(clippy::too_many_arguments)]
    fn put_shdr(
        &self,
        buf: &mut [u8],
        at: u64,
        sh_type: u32,
        offset: u64,
        size: u64,
        link: u32,
        entsize: u64,
        align: u64,
    ) {
        put_u32(buf, at + 4, sh_type);
        put_u64(buf, at + 16, self.imagebase + offset); // sh_addr
        put_u64(buf, at + 24, offset);
        put_u64(buf, at + 32, size);
        put_u32(buf, at + 40, link);
        put_u64(buf, at + 48, align);
        put_u64(buf, at + 56, entsize);
    }
}

fn put(buf: &mut [u8], off: u64, bytes: &[u8]) {
    let off = off as usize;
    buf[off..off + bytes.len()].copy_from_slice(bytes);
}

fn put_u16(buf: &mut [u8], off: u64, value: u16) {
    put(buf, off, &value.to_le_bytes());
}

fn put_u32(buf: &mut [u8], off: u64, value: u32) {
    put(buf, off, &value.to_le_bytes());
}

fn put_u64(buf: &mut [u8], off: u64, value: u64) {
    put(buf, off, &value.to_le_bytes());
}

/// `Vec`-backed target memory mapped at a fixed base.
pub struct MockMemory {
    base: u64,
    buf: RefCell<Vec<u8>>,
    pub fail_mmap: Cell<bool>,
}

impl MockMemory {
    pub fn new(base: u64) -> Self {
        MockMemory {
            base,
            buf: RefCell::new(Vec::new()),
            fail_mmap: Cell::new(false),
        }
    }

    pub fn read_bytes(&self, addr: u64, len: usize) -> Vec<u8> {
        let off = (addr - self.base) as usize;
        self.buf.borrow()[off..off + len].to_vec()
    }

    pub fn snapshot(&self) -> Vec<u8> {
        self.buf.borrow().clone()
    }
}

impl Memory for MockMemory {
    fn mmap(&self, _hint: u64, size: u64) -> u64 {
        if self.fail_mmap.get() {
            return 0;
        }
        self.buf.borrow_mut().resize(size as usize, 0);
        self.base
    }

    fn write(&self, addr: u64, bytes: &[u8]) {
        let off = (addr - self.base) as usize;
        self.buf.borrow_mut()[off..off + bytes.len()].copy_from_slice(bytes);
    }

    fn write_ptr(&self, arch: ElfArch, addr: u64, value: u64) {
        let mut tmp = [0u8; 8];
        let len = arch.encode_ptr(value, &mut tmp);
        self.write(addr, &tmp[..len]);
    }

    fn read_ptr(&self, arch: ElfArch, addr: u64) -> u64 {
        arch.decode_ptr(&self.read_bytes(addr, arch.pointer_size()))
    }
}

/// In-process engine with a programmable symbol environment.
pub struct MockEngine {
    pub memory: MockMemory,
    pub symbols: RefCell<HashMap<String, u64>>,
    pub symlink_log: RefCell<Vec<String>>,
    pub supports: Cell<bool>,
}

impl MockEngine {
    pub fn new() -> Arc<Self> {
        Arc::new(MockEngine {
            memory: MockMemory::new(MOCK_BASE),
            symbols: RefCell::new(HashMap::new()),
            symlink_log: RefCell::new(Vec::new()),
            supports: Cell::new(true),
        })
    }

    pub fn provide(&self, name: &str, addr: u64) {
        self.symbols.borrow_mut().insert(name.to_string(), addr);
    }

    pub fn read_ptr_at(&self, addr: u64, binary: &ElfBinary) -> u64 {
        self.memory.read_ptr(binary.arch(), addr)
    }
}

impl TargetSystem for MockEngine {
    fn supports(&self, _binary: &ElfBinary) -> bool {
        self.supports.get()
    }

    fn base_address_hint(&self, imagebase: u64, _virtual_size: u64) -> u64 {
        imagebase
    }

    fn mem(&self) -> &dyn Memory {
        &self.memory
    }

    fn symlink(&self, _loader: &ElfLoader, symbol: &Symbol) -> u64 {
        self.symlink_log.borrow_mut().push(symbol.name().to_string());
        self.symbols
            .borrow()
            .get(symbol.name())
            .copied()
            .unwrap_or(0)
    }
}
