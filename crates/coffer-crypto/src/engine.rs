//! Content encryption engines.
//!
//! [`AesCtrEngine`] encrypts content with AES in counter mode. CTR turns the
//! block cipher into a seekable stream cipher: the keystream for block `n`
//! depends only on `IV + n`, so any block-aligned sub-range can be decrypted
//! on its own.

use std::io::{self, Read, Write};

use aes::{Aes128, Aes192, Aes256};
use coffer_store::{
    ContentSink, LazySkipReader, ReadError, ReadResult, UndecryptableError, UnencryptableError,
    WriteError, WriteResult, ZeroPrefixReader,
};
use coffer_types::{AlgorithmId, ContentReference, ResolvedContentRange};
use ctr::cipher::{KeyIvInit, StreamCipher};
use ctr::Ctr128BE;
use rand::rngs::OsRng;
use rand::RngCore;
use tracing::debug;

use crate::dek::EncryptionParameters;
use crate::error::{CryptoResult, KeyError};
use crate::keys::KeyBytes;

/// Algorithm id of [`AesCtrEngine`].
pub const AES_CTR: &str = "aes-ctr";

const AES_BLOCK_SIZE: u64 = 16;
const IV_LEN: usize = 16;

/// Supplies the stream of a backend reader for a ciphertext range.
pub type CiphertextFetch<'a> =
    dyn FnMut(&ResolvedContentRange) -> ReadResult<Box<dyn Read + Send>> + 'a;

/// An algorithm-specific, seekable stream cipher over content.
pub trait ContentEncryptionEngine: Send + Sync {
    fn algorithm(&self) -> AlgorithmId;

    fn supports_algorithm(&self, algorithm: &AlgorithmId) -> bool {
        *algorithm == self.algorithm()
    }

    fn block_size(&self) -> u64;

    /// A fresh random key and IV.
    fn create_parameters(&self) -> CryptoResult<EncryptionParameters>;

    /// Wrap `sink` so that plaintext written to it reaches `sink` encrypted.
    /// `params` are destroyed once the cipher holds the key.
    fn encrypt(
        &self,
        sink: Box<dyn ContentSink>,
        params: EncryptionParameters,
    ) -> WriteResult<Box<dyn ContentSink>>;

    /// Decrypt `range` of the content under `reference`.
    ///
    /// Fetches only the block-aligned ciphertext covering `range` through
    /// `fetch`. The returned stream is anchored at content offset 0: it
    /// starts with zeros up to the aligned start, then yields plaintext.
    /// Bytes between the aligned start and `range.start()` are valid
    /// plaintext the caller skips. `params` are destroyed once the cipher
    /// holds the key.
    fn decrypt(
        &self,
        reference: &ContentReference,
        fetch: &mut CiphertextFetch<'_>,
        params: EncryptionParameters,
        range: &ResolvedContentRange,
    ) -> ReadResult<Box<dyn Read + Send>>;
}

/// Add `blocks` to a big-endian 128-bit counter, wrapping at 2^128.
pub fn adjust_iv(iv: &[u8; IV_LEN], blocks: u64) -> [u8; IV_LEN] {
    u128::from_be_bytes(*iv)
        .wrapping_add(u128::from(blocks))
        .to_be_bytes()
}

fn iv_array(iv: &[u8]) -> CryptoResult<[u8; IV_LEN]> {
    iv.try_into().map_err(|_| KeyError::InvalidIvLength {
        expected: IV_LEN,
        found: iv.len(),
    })
}

/// AES-CTR keyed by the length of the key.
enum AesCtrCipher {
    Aes128(Ctr128BE<Aes128>),
    Aes192(Ctr128BE<Aes192>),
    Aes256(Ctr128BE<Aes256>),
}

impl AesCtrCipher {
    fn new(key: &KeyBytes, iv: &[u8; IV_LEN]) -> CryptoResult<Self> {
        let key = key.expose()?;
        let invalid = |_| KeyError::InvalidKeyLength {
            expected: "16, 24 or 32".to_string(),
            found: key.len(),
        };
        match key.len() {
            16 => Ctr128BE::<Aes128>::new_from_slices(key, iv)
                .map(Self::Aes128)
                .map_err(invalid),
            24 => Ctr128BE::<Aes192>::new_from_slices(key, iv)
                .map(Self::Aes192)
                .map_err(invalid),
            32 => Ctr128BE::<Aes256>::new_from_slices(key, iv)
                .map(Self::Aes256)
                .map_err(invalid),
            found => Err(KeyError::InvalidKeyLength {
                expected: "16, 24 or 32".to_string(),
                found,
            }),
        }
    }

    fn apply(&mut self, buf: &mut [u8]) {
        match self {
            Self::Aes128(c) => c.apply_keystream(buf),
            Self::Aes192(c) => c.apply_keystream(buf),
            Self::Aes256(c) => c.apply_keystream(buf),
        }
    }
}

/// Encrypts everything written through it into the wrapped sink.
struct CipherSink {
    inner: Box<dyn ContentSink>,
    cipher: AesCtrCipher,
    scratch: Vec<u8>,
}

impl Write for CipherSink {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        // The keystream advances here, so the whole buffer must be accepted.
        self.scratch.clear();
        self.scratch.extend_from_slice(buf);
        self.cipher.apply(&mut self.scratch);
        self.inner.write_all(&self.scratch)?;
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}

impl ContentSink for CipherSink {
    fn finish(self: Box<Self>) -> WriteResult<()> {
        self.inner.finish()
    }
}

/// Decrypts everything read through it.
struct CipherReader<R> {
    inner: R,
    cipher: AesCtrCipher,
}

impl<R: Read> Read for CipherReader<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let n = self.inner.read(buf)?;
        self.cipher.apply(&mut buf[..n]);
        Ok(n)
    }
}

/// AES in CTR mode with a 128-bit big-endian counter.
///
/// New content is encrypted with keys of the configured size. Any AES key
/// size is accepted for decryption.
#[derive(Debug, Clone, Copy)]
pub struct AesCtrEngine {
    key_bits: u32,
}

impl AesCtrEngine {
    pub fn new(key_bits: u32) -> CryptoResult<Self> {
        match key_bits {
            128 | 192 | 256 => Ok(Self { key_bits }),
            other => Err(KeyError::UnsupportedKeySize(other)),
        }
    }

    pub fn key_bits(&self) -> u32 {
        self.key_bits
    }
}

impl Default for AesCtrEngine {
    fn default() -> Self {
        Self { key_bits: 256 }
    }
}

impl ContentEncryptionEngine for AesCtrEngine {
    fn algorithm(&self) -> AlgorithmId {
        AlgorithmId::new(AES_CTR)
    }

    fn block_size(&self) -> u64 {
        AES_BLOCK_SIZE
    }

    fn create_parameters(&self) -> CryptoResult<EncryptionParameters> {
        let key = KeyBytes::random(self.key_bits as usize / 8)?;
        let mut iv = vec![0u8; IV_LEN];
        OsRng
            .try_fill_bytes(&mut iv)
            .map_err(|e| KeyError::Rng(e.to_string()))?;
        Ok(EncryptionParameters::new(self.algorithm(), key, iv))
    }

    fn encrypt(
        &self,
        sink: Box<dyn ContentSink>,
        mut params: EncryptionParameters,
    ) -> WriteResult<Box<dyn ContentSink>> {
        let cipher = iv_array(params.iv())
            .and_then(|iv| AesCtrCipher::new(params.key(), &iv))
            .map_err(|e| WriteError::from(UnencryptableError::Cipher(e.to_string())))?;
        params.destroy();
        Ok(Box::new(CipherSink {
            inner: sink,
            cipher,
            scratch: Vec::new(),
        }))
    }

    fn decrypt(
        &self,
        reference: &ContentReference,
        fetch: &mut CiphertextFetch<'_>,
        mut params: EncryptionParameters,
        range: &ResolvedContentRange,
    ) -> ReadResult<Box<dyn Read + Send>> {
        let cipher_err = |e: KeyError| {
            ReadError::from(UndecryptableError::Cipher {
                reference: reference.clone(),
                reason: e.to_string(),
            })
        };

        let block_index = range.start() / AES_BLOCK_SIZE;
        let aligned = range.align_start(AES_BLOCK_SIZE);
        let byte_start = aligned.start();

        let mut iv = iv_array(params.iv()).map_err(cipher_err)?;
        if block_index > 0 {
            iv = adjust_iv(&iv, block_index);
        }

        let ciphertext = fetch(&aligned)?;
        let cipher = AesCtrCipher::new(params.key(), &iv).map_err(cipher_err)?;
        params.destroy();
        debug!(
            reference = %reference,
            requested = %range,
            fetched = %aligned,
            "decrypting aligned ciphertext range"
        );

        let positioned = LazySkipReader::new(ciphertext, byte_start).take(aligned.range_size());
        Ok(Box::new(ZeroPrefixReader::new(
            CipherReader {
                inner: positioned,
                cipher,
            },
            byte_start,
        )))
    }
}
