use alloc::borrow::Cow;
use core::fmt::Display;

/// Error types used throughout the `guestld` library.
///
/// All of these surface from the loader constructors; once the image has
/// been reserved in target memory the loader only logs and keeps going
/// (see the crate documentation on the best-effort posture).
#[derive(Debug)]
pub enum Error {
    /// An error occurred while opening or reading the guest file.
    #[cfg(feature = "std")]
    Io {
        /// The underlying I/O error.
        err: std::io::Error,
    },

    /// The input is not an ELF file, or its header is malformed.
    ParseEhdr {
        /// A descriptive message about the header parsing error.
        msg: Cow<'static, str>,
    },

    /// The dynamic section or one of the tables it references is malformed.
    ParseDynamic {
        /// A descriptive message about the dynamic section parsing error.
        msg: Cow<'static, str>,
    },

    /// The engine's compatibility check rejected the binary.
    Unsupported {
        /// A descriptive message about the rejection.
        msg: Cow<'static, str>,
    },

    /// The target memory reservation failed.
    Mmap {
        /// A descriptive message about the reservation failure.
        msg: Cow<'static, str>,
    },
}

impl Display for Error {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            #[cfg(feature = "std")]
            Error::Io { err } => write!(f, "I/O error: {err}"),
            Error::ParseEhdr { msg } => write!(f, "ELF header parsing error: {msg}"),
            Error::ParseDynamic { msg } => write!(f, "Dynamic section parsing error: {msg}"),
            Error::Unsupported { msg } => write!(f, "Unsupported binary: {msg}"),
            Error::Mmap { msg } => write!(f, "Memory mapping error: {msg}"),
        }
    }
}

impl core::error::Error for Error {}

#[cfg(feature = "std")]
impl From<std::io::Error> for Error {
    #[cold]
    fn from(err: std::io::Error) -> Self {
        Error::Io { err }
    }
}

#[cold]
#[inline(never)]
pub(crate) fn parse_ehdr_error(msg: impl Into<Cow<'static, str>>) -> Error {
    Error::ParseEhdr { msg: msg.into() }
}

#[cold]
#[inline(never)]
pub(crate) fn parse_dynamic_error(msg: impl Into<Cow<'static, str>>) -> Error {
    Error::ParseDynamic { msg: msg.into() }
}

#[cold]
#[inline(never)]
pub(crate) fn unsupported_error(msg: impl Into<Cow<'static, str>>) -> Error {
    Error::Unsupported { msg: msg.into() }
}

#[cold]
#[inline(never)]
pub(crate) fn mmap_error(msg: impl Into<Cow<'static, str>>) -> Error {
    Error::Mmap { msg: msg.into() }
}

pub type Result<T> = core::result::Result<T, Error>;
