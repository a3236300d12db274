//! Cryptography for cipherfs
//!
//! AES-256-CBC with PKCS#7 padding, key and IV derived from a passphrase
//! by an OpenSSL `EVP_BytesToKey`-compatible KDF.

mod kdf;
mod key;
mod stream;

pub use kdf::{derive_key, DerivedKey};
pub use key::{
    provider_from_source, EnvKeyProvider, FileKeyProvider, KeyProvider, Passphrase,
    StaticKeyProvider,
};
pub use stream::{CipherMode, StreamCipher};

/// AES-256 key size in bytes
pub const KEY_SIZE: usize = 32;

/// CBC IV size in bytes
pub const IV_SIZE: usize = 16;

/// AES block size in bytes
pub const CIPHER_BLOCK: usize = 16;

/// Digest rounds per KDF output block
pub const KDF_ROUNDS: usize = 5;

/// Bytes read from the input per streaming step
pub const DEFAULT_STREAM_BLOCK: usize = 1024;
