//! Library-wide error and result types.

use std::fmt;
use std::io;

use thiserror::Error;

/// Result alias used throughout nxvault.
pub type Result<T> = std::result::Result<T, Error>;

/// Which kind of key a [`Error::MissingKey`] refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyKind {
    /// A key shared by every console (sources, master keys, key-area keys).
    Common,
    /// A console-unique secret or a key derived from one.
    DeviceUnique,
    /// A per-title key looked up by rights ID.
    TitleKey,
}

impl fmt::Display for KeyKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            KeyKind::Common => write!(f, "common"),
            KeyKind::DeviceUnique => write!(f, "device-unique"),
            KeyKind::TitleKey => write!(f, "title"),
        }
    }
}

/// All errors the library can produce.
///
/// Error messages are kept intentionally terse; callers that need richer
/// context should wrap `Error` in their own type.
#[derive(Debug, Error)]
pub enum Error {
    /// A magic/signature field did not match the expected value.
    #[error("bad magic value")]
    BadMagic,
    /// A fixed field holds a value the format does not allow.
    #[error("invalid format: {0}")]
    InvalidFormat(String),
    /// The stream ended before all expected bytes could be read.
    #[error("unexpected end of file")]
    UnexpectedEof,
    /// A null-terminated string had no null terminator within the buffer.
    #[error("unterminated string")]
    UnterminatedName,
    /// A read would run past the end of a storage.
    #[error("read of {len:#x} bytes at {offset:#x} exceeds storage size {size:#x}")]
    OutOfRange { offset: u64, len: u64, size: u64 },
    /// A required key slot is empty. `name` is the key-file name of the slot
    /// (or the rights ID for title keys).
    #[error("missing {kind} key: {name}")]
    MissingKey { name: String, kind: KeyKind },
    /// A block failed hash verification under `ErrorOnInvalid`.
    #[error("integrity violation in level {level}, block {block}")]
    IntegrityViolation { level: usize, block: u64 },
    /// A combination of crypto/hash/layout fields this library does not handle.
    #[error("unsupported layout: {0}")]
    UnsupportedLayout(String),
    /// RSA key recovery ran out of witnesses.
    #[error("RSA factorization failed")]
    FactorizationFailed,
    /// A patch section was opened without a base container registered.
    #[error("section {section} is a patch and needs a base container")]
    MissingBaseContainer { section: usize },
    /// A cipher or signature primitive rejected its input.
    #[error("crypto error: {0}")]
    Crypto(&'static str),
    /// An underlying I/O operation failed.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

impl Error {
    pub(crate) fn missing_key(name: impl Into<String>, kind: KeyKind) -> Self {
        Error::MissingKey {
            name: name.into(),
            kind,
        }
    }

    pub(crate) fn format(msg: impl Into<String>) -> Self {
        Error::InvalidFormat(msg.into())
    }
}
