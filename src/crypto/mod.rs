//! Media key generation and the seam to the external media cipher.
//!
//! The core never interprets key bytes. A key is generated per new call leg
//! and media kind, carried base64 encoded in the session body, and handed to the
//! [`MediaCipher`] of the [`MediaSession`][crate::MediaSession] unmodified.

use std::fmt;
use std::io;

use rand::rngs::OsRng;
use rand::TryRngCore;
use thiserror::Error;

use crate::util::b64;

/// Length of the raw key material: 128 bit master key plus 112 bit salt.
pub const KEY_LEN: usize = 30;

/// Crypto suite named in the session body.
pub const CRYPTO_SUITE: &str = "AES_CM_128_HMAC_SHA1_80";

/// Key used when the key source fails.
///
/// This is a degraded security path. Every use is logged at error level and
/// reported by [`KeyGen::degraded`].
pub const FALLBACK_KEY: &str = "ZGlzcGF0Y2hjb25zb2xlZmFsbGJhY2trZXltYXRl";

/// Errors that can arise handling media keys.
#[derive(Debug, Error)]
pub enum CryptoError {
    /// The key source could not produce random bytes.
    #[error("key source failed: {0}")]
    KeySource(String),

    /// The cipher rejected the negotiated keys.
    #[error("cipher setup failed: {0}")]
    Setup(String),

    /// A payload failed to decrypt.
    #[error("payload failed to decrypt")]
    Decrypt,

    /// Other IO errors.
    #[error("{0}")]
    Io(#[from] io::Error),
}

/// Source of secure random bytes for key generation.
pub trait KeySource: Send + Sync {
    /// Fill `buf` with random bytes.
    fn fill(&self, buf: &mut [u8]) -> Result<(), CryptoError>;
}

/// [`KeySource`] backed by the operating system RNG.
#[derive(Debug, Default, Clone, Copy)]
pub struct OsKeySource;

impl KeySource for OsKeySource {
    fn fill(&self, buf: &mut [u8]) -> Result<(), CryptoError> {
        OsRng
            .try_fill_bytes(buf)
            .map_err(|e| CryptoError::KeySource(e.to_string()))
    }
}

/// Generates media key strings from a [`KeySource`].
pub struct KeyGen {
    source: Box<dyn KeySource>,
    degraded: u64,
}

impl KeyGen {
    /// Create a generator drawing from the given source.
    pub fn new(source: Box<dyn KeySource>) -> Self {
        KeyGen {
            source,
            degraded: 0,
        }
    }

    /// A fresh base64 encoded key.
    ///
    /// Falls back to [`FALLBACK_KEY`] if the source fails.
    pub fn generate(&mut self) -> String {
        let mut buf = [0_u8; KEY_LEN];

        match self.source.fill(&mut buf) {
            Ok(()) => b64::encode(&buf),
            Err(e) => {
                self.degraded += 1;
                error!("Media key generation failed, using fallback key: {}", e);
                FALLBACK_KEY.to_string()
            }
        }
    }

    /// Number of times the fallback key was handed out.
    pub fn degraded(&self) -> u64 {
        self.degraded
    }
}

impl Default for KeyGen {
    fn default() -> Self {
        KeyGen::new(Box::new(OsKeySource))
    }
}

impl fmt::Debug for KeyGen {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KeyGen")
            .field("degraded", &self.degraded)
            .finish()
    }
}

/// The external cipher applied to media payloads.
///
/// An implementation is handed to [`MediaSession::set_cipher`][crate::MediaSession::set_cipher]
/// and receives both negotiated keys through [`MediaCipher::setup`] before the first
/// packet is sent or received.
pub trait MediaCipher: Send {
    /// Install the negotiated keys.
    fn setup(&mut self, local_key: &str, remote_key: &str) -> Result<(), CryptoError>;

    /// Encrypt an outgoing payload in place.
    fn encrypt(&mut self, payload: &mut Vec<u8>);

    /// Decrypt an incoming payload in place.
    fn decrypt(&mut self, payload: &mut Vec<u8>) -> Result<(), CryptoError>;
}

#[cfg(test)]
mod test {
    use super::*;

    struct Broken;

    impl KeySource for Broken {
        fn fill(&self, _: &mut [u8]) -> Result<(), CryptoError> {
            Err(CryptoError::KeySource("no entropy".into()))
        }
    }

    #[test]
    fn generated_keys_are_fresh() {
        let mut keys = KeyGen::default();
        let k1 = keys.generate();
        let k2 = keys.generate();

        assert_ne!(k1, k2);
        assert_eq!(b64::decode(&k1).unwrap().len(), KEY_LEN);
        assert_eq!(keys.degraded(), 0);
    }

    #[test]
    fn fallback_is_observable() {
        let mut keys = KeyGen::new(Box::new(Broken));
        assert_eq!(keys.generate(), FALLBACK_KEY);
        assert_eq!(keys.degraded(), 1);
    }

    #[test]
    fn fallback_key_has_key_length() {
        assert_eq!(b64::decode(FALLBACK_KEY).unwrap().len(), KEY_LEN);
    }
}
