//! Error types for cipherfs
//!
//! Every core operation returns [`Result`]; the FUSE bridge turns an
//! [`Error`] into a negative errno with [`Error::errno`].

use libc::c_int;
use thiserror::Error;

/// Result alias used throughout the crate
pub type Result<T> = std::result::Result<T, Error>;

/// Errors produced by the encrypting core and its collaborators
#[derive(Debug, Error)]
pub enum Error {
    /// Resolved path does not fit in the configured path bound
    #[error("path too long")]
    NameTooLong,

    /// Path is malformed (no separator, not absolute, ...)
    #[error("invalid path: {0}")]
    InvalidPath(String),

    /// Open/read/write/seek/stat/unlink failure on either file of a pair
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Passphrase absent or empty
    #[error("invalid key: passphrase must not be empty")]
    InvalidKey,

    /// Key derivation or block cipher engine failure
    #[error("cipher error: {0}")]
    Cipher(String),

    /// Key provider unavailable or denied
    #[error("key unavailable: {0}")]
    KeyUnavailable(String),

    /// Configuration could not be read or written
    #[error("configuration error: {0}")]
    Config(String),

    /// Configuration was read but is not usable
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// File handle is unknown or stale
    #[error("bad file handle: {0:#x}")]
    BadHandle(u64),
}

impl Error {
    /// Positive errno reported to the kernel for this error
    pub fn errno(&self) -> c_int {
        match self {
            Error::NameTooLong => libc::ENAMETOOLONG,
            Error::InvalidPath(_) => libc::EINVAL,
            Error::Io(e) => e.raw_os_error().unwrap_or(libc::EIO),
            Error::InvalidKey | Error::KeyUnavailable(_) => libc::EACCES,
            Error::Cipher(_) => libc::EIO,
            Error::Config(_) | Error::InvalidConfig(_) => libc::EINVAL,
            Error::BadHandle(_) => libc::EBADF,
        }
    }

    /// True if this error carries the given OS error code
    pub fn is_os(&self, code: c_int) -> bool {
        matches!(self, Error::Io(e) if e.raw_os_error() == Some(code))
    }
}

impl From<nix::errno::Errno> for Error {
    fn from(errno: nix::errno::Errno) -> Self {
        Error::Io(std::io::Error::from_raw_os_error(errno as c_int))
    }
}
