//! Streaming AES-256-CBC file codec
//!
//! Transforms a whole input stream into an output stream one fixed-size
//! block at a time, so working memory stays at O(block size) no matter how
//! large the file is. Output is OpenSSL-compatible: raw CBC blocks with
//! PKCS#7 padding and no header.

use crate::crypto::{derive_key, CIPHER_BLOCK, DEFAULT_STREAM_BLOCK};
use crate::error::{Error, Result};
use aes::Aes256;
use cipher::block_padding::Pkcs7;
use cipher::generic_array::GenericArray;
use cipher::{BlockDecryptMut, BlockEncryptMut, KeyIvInit};
use std::io::{ErrorKind, Read, Seek, SeekFrom, Write};
use tracing::trace;

type Aes256CbcEnc = cbc::Encryptor<Aes256>;
type Aes256CbcDec = cbc::Decryptor<Aes256>;

/// What a [`StreamCipher::transform`] call does to the bytes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CipherMode {
    Encrypt,
    Decrypt,
    /// Verbatim block-for-block copy
    CopyThrough,
}

/// Stateful block engine fed by the streaming loop
enum Engine {
    Encrypt(Aes256CbcEnc),
    Decrypt(Aes256CbcDec),
    Copy,
}

/// Incremental cipher state: bytes not yet forming a whole cipher block are
/// held in `pending` until more input or the final call arrives.
struct CipherState {
    engine: Option<Engine>,
    pending: Vec<u8>,
    consumed: u64,
}

impl CipherState {
    fn new(mode: CipherMode, passphrase: Option<&[u8]>) -> Result<Self> {
        let engine = match mode {
            CipherMode::CopyThrough => Engine::Copy,
            CipherMode::Encrypt | CipherMode::Decrypt => {
                let passphrase = passphrase.ok_or(Error::InvalidKey)?;
                let derived = derive_key(passphrase)?;
                if mode == CipherMode::Encrypt {
                    Engine::Encrypt(
                        Aes256CbcEnc::new_from_slices(derived.key(), derived.iv())
                            .map_err(|e| Error::Cipher(format!("cipher init failed: {}", e)))?,
                    )
                } else {
                    Engine::Decrypt(
                        Aes256CbcDec::new_from_slices(derived.key(), derived.iv())
                            .map_err(|e| Error::Cipher(format!("cipher init failed: {}", e)))?,
                    )
                }
            }
        };

        Ok(Self {
            engine: Some(engine),
            pending: Vec::with_capacity(DEFAULT_STREAM_BLOCK + CIPHER_BLOCK),
            consumed: 0,
        })
    }

    /// Feed `input`, appending whatever output is ready to `out`
    fn update(&mut self, input: &[u8], out: &mut Vec<u8>) -> Result<()> {
        self.consumed += input.len() as u64;

        match self.engine.as_mut() {
            Some(Engine::Copy) => out.extend_from_slice(input),
            Some(Engine::Encrypt(enc)) => {
                self.pending.extend_from_slice(input);
                let ready = self.pending.len() / CIPHER_BLOCK * CIPHER_BLOCK;
                for block in self.pending[..ready].chunks_exact_mut(CIPHER_BLOCK) {
                    enc.encrypt_block_mut(GenericArray::from_mut_slice(block));
                }
                out.extend(self.pending.drain(..ready));
            }
            Some(Engine::Decrypt(dec)) => {
                self.pending.extend_from_slice(input);
                // The last whole block may carry padding; hold it for finish()
                let mut ready = self.pending.len() / CIPHER_BLOCK * CIPHER_BLOCK;
                if ready == self.pending.len() {
                    ready = ready.saturating_sub(CIPHER_BLOCK);
                }
                for block in self.pending[..ready].chunks_exact_mut(CIPHER_BLOCK) {
                    dec.decrypt_block_mut(GenericArray::from_mut_slice(block));
                }
                out.extend(self.pending.drain(..ready));
            }
            None => return Err(Error::Cipher("cipher already finalized".to_string())),
        }

        Ok(())
    }

    /// Flush buffered state: add padding on encrypt, strip it on decrypt
    fn finish(&mut self, out: &mut Vec<u8>) -> Result<()> {
        let engine = self
            .engine
            .take()
            .ok_or_else(|| Error::Cipher("cipher already finalized".to_string()))?;

        match engine {
            Engine::Copy => {}
            Engine::Encrypt(enc) => {
                let len = self.pending.len();
                let mut block = [0u8; CIPHER_BLOCK];
                block[..len].copy_from_slice(&self.pending);
                let padded = enc
                    .encrypt_padded_mut::<Pkcs7>(&mut block, len)
                    .map_err(|_| Error::Cipher("padding failed".to_string()))?;
                out.extend_from_slice(padded);
            }
            Engine::Decrypt(dec) => {
                if self.consumed == 0 {
                    return Ok(());
                }
                if self.pending.len() != CIPHER_BLOCK {
                    return Err(Error::Cipher(format!(
                        "wrong final block length: {} bytes",
                        self.pending.len()
                    )));
                }
                let plain = dec
                    .decrypt_padded_mut::<Pkcs7>(&mut self.pending)
                    .map_err(|_| Error::Cipher("bad decrypt: invalid padding".to_string()))?;
                out.extend_from_slice(plain);
            }
        }

        self.pending.clear();
        Ok(())
    }
}

/// Whole-stream codec between two seekable streams
#[derive(Debug, Clone, Copy)]
pub struct StreamCipher {
    block_size: usize,
}

impl StreamCipher {
    /// Create a codec reading `block_size` bytes of input per step
    pub fn new(block_size: usize) -> Self {
        Self {
            block_size: block_size.max(CIPHER_BLOCK),
        }
    }

    /// Bytes of input consumed per step
    pub fn block_size(&self) -> usize {
        self.block_size
    }

    /// Transform all of `input` (from position 0) into `output`
    ///
    /// Both streams are rewound before and after. `output` is written from
    /// position 0 but not truncated; callers writing over an existing file
    /// must truncate it first. On error the output holds a partial result
    /// and must be treated as corrupt. Returns the number of bytes written.
    pub fn transform<R, W>(
        &self,
        input: &mut R,
        output: &mut W,
        mode: CipherMode,
        passphrase: Option<&[u8]>,
    ) -> Result<u64>
    where
        R: Read + Seek,
        W: Write + Seek,
    {
        let mut state = CipherState::new(mode, passphrase)?;

        input.seek(SeekFrom::Start(0))?;
        output.seek(SeekFrom::Start(0))?;

        let mut inbuf = vec![0u8; self.block_size];
        let mut outbuf = Vec::with_capacity(self.block_size + CIPHER_BLOCK);
        let mut written = 0u64;

        loop {
            let n = match input.read(&mut inbuf) {
                Ok(0) => break,
                Ok(n) => n,
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) => return Err(Error::Io(e)),
            };

            outbuf.clear();
            state.update(&inbuf[..n], &mut outbuf)?;
            output.write_all(&outbuf)?;
            written += outbuf.len() as u64;
        }

        outbuf.clear();
        state.finish(&mut outbuf)?;
        output.write_all(&outbuf)?;
        output.flush()?;
        written += outbuf.len() as u64;

        trace!(
            "transform({:?}): {} bytes in, {} bytes out",
            mode,
            state.consumed,
            written
        );

        input.seek(SeekFrom::Start(0))?;
        output.seek(SeekFrom::Start(0))?;

        Ok(written)
    }
}

impl Default for StreamCipher {
    fn default() -> Self {
        Self::new(DEFAULT_STREAM_BLOCK)
    }
}
