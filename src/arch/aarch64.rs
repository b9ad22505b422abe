use elf::abi::{R_AARCH64_COPY, R_AARCH64_GLOB_DAT, R_AARCH64_JUMP_SLOT, R_AARCH64_RELATIVE};

pub(crate) const REL_RELATIVE: u32 = R_AARCH64_RELATIVE;
pub(crate) const REL_JUMP_SLOT: u32 = R_AARCH64_JUMP_SLOT;
pub(crate) const REL_GOT: u32 = R_AARCH64_GLOB_DAT;
pub(crate) const REL_COPY: u32 = R_AARCH64_COPY;
