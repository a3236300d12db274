//! cipherfs - transparent encrypt-at-rest overlay filesystem
//!
//! Every regular file under the backing directory is stored as an
//! AES-256-CBC ciphertext. While a file is open its plaintext lives in a
//! staging file beside it, and is encrypted back when the file is flushed
//! or closed.

pub mod config;
pub mod crypto;
pub mod error;
pub mod fs;

pub use config::Config;
pub use error::{Error, Result};

/// Re-export commonly used types
pub mod prelude {
    pub use crate::config::{Config, KeySource};
    pub use crate::crypto::{KeyProvider, StaticKeyProvider, StreamCipher};
    pub use crate::error::{Error, Result};
    pub use crate::fs::{CipherFs, CryptCore};
}
