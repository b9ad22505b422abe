use elf::abi::{R_X86_64_COPY, R_X86_64_GLOB_DAT, R_X86_64_JUMP_SLOT, R_X86_64_RELATIVE};

pub(crate) const REL_RELATIVE: u32 = R_X86_64_RELATIVE;
pub(crate) const REL_JUMP_SLOT: u32 = R_X86_64_JUMP_SLOT;
pub(crate) const REL_GOT: u32 = R_X86_64_GLOB_DAT;
pub(crate) const REL_COPY: u32 = R_X86_64_COPY;
