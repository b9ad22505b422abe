//! A userspace ELF loader over host-provided target memory.
//!
//! `guestld` maps an ELF shared object or executable into a virtual
//! memory abstraction supplied by the embedding engine, applies dynamic
//! relocations and wires up symbol binding, either eagerly or lazily
//! through the guest's own PLT machinery. It is a building block for
//! binary instrumentation, sandboxing and dynamic analysis frameworks:
//! the host supplies the memory and the symbol environment, the loader
//! brings the binary to life inside it.
//!
//! The embedding engine implements two traits:
//!
//! * [`Memory`] — reserve, write and read the target address space;
//! * [`TargetSystem`] — compatibility policy, a base-address hint and
//!   the `symlink` oracle that answers external symbol queries.
//!
//! A load then runs the whole pipeline in one call:
//!
//! * [`ElfLoader::from_file`] / [`ElfLoader::from_binary`] parse and
//!   validate the guest, reserve its image, copy `PT_LOAD` segments,
//!   apply dynamic relocations and bind per the requested [`Binding`].
//! * With [`Binding::Lazy`], the reserved `GOT[1]`/`GOT[2]` entries are
//!   repurposed so that the guest's first call through a PLT stub
//!   re-enters the loader at [`dl_resolve`], which resolves the symbol
//!   through the oracle and patches the slot.
//!
//! Once the image is reserved, loading is best-effort: unsupported
//! relocation types or machines are logged and skipped rather than
//! failing the load, which is the useful posture when instrumenting
//! binaries that may never execute the affected code.
//!
//! Relocation support covers x86-64 and AArch64 (`RELATIVE`,
//! `JUMP_SLOT`, `GLOB_DAT` and `COPY`). TLS and IFUNC relocations,
//! init/fini arrays, `DT_NEEDED` dependencies and symbol versioning are
//! out of scope.
#![cfg_attr(not(feature = "std"), no_std)]

extern crate alloc;

pub mod arch;
mod binary;
mod engine;
mod error;
mod loader;
mod relocation;
mod symbol;

pub use arch::{ElfArch, Machine};
pub use binary::{ElfBinary, Segment};
pub use engine::{Memory, TargetSystem};
pub use error::{Error, Result};
pub use loader::{Binding, ElfLoader};
pub use relocation::{Relocation, dl_resolve};
pub use symbol::Symbol;
