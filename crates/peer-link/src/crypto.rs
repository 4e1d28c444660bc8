//! Asymmetric key material and the per-chunk encryption scheme.
//!
//! Chunks are encrypted directly with RSA-OAEP (SHA-256). The scheme caps
//! the plaintext of a single chunk at `modulus_bytes - 2 * 32 - 2`; callers
//! that produce larger payloads split them before enqueueing.

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64_STANDARD;
use rand::rngs::OsRng;
use rsa::pkcs8::{DecodePublicKey, EncodePublicKey};
use rsa::traits::PublicKeyParts;
use rsa::{Oaep, RsaPrivateKey, RsaPublicKey};
use sha2::Sha256;

use crate::error::CryptoError;

pub const DEFAULT_MODULUS_BITS: usize = 2048;
const OAEP_HASH_LEN: usize = 32;

#[derive(Clone, PartialEq, Eq)]
pub struct PublicKey(RsaPublicKey);

impl PublicKey {
    /// Size of the modulus in bytes.
    pub fn size(&self) -> usize {
        self.0.size()
    }
}

impl fmt::Debug for PublicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PublicKey")
            .field("bits", &(self.0.size() * 8))
            .finish()
    }
}

pub struct PrivateKey(RsaPrivateKey);

impl fmt::Debug for PrivateKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("PrivateKey(..)")
    }
}

#[derive(Debug, Clone)]
pub struct KeyPair {
    pub public: PublicKey,
    pub private: Arc<PrivateKey>,
}

/// Cryptographic capability consumed by the session and the chunk transport.
#[async_trait]
pub trait KeyProvider: Send + Sync {
    async fn generate_key_pair(&self) -> Result<KeyPair, CryptoError>;
    fn export_public_key(&self, key: &PublicKey) -> Result<Vec<u8>, CryptoError>;
    fn import_public_key(&self, der: &[u8]) -> Result<PublicKey, CryptoError>;
    async fn encrypt(&self, key: &PublicKey, plaintext: &[u8]) -> Result<Vec<u8>, CryptoError>;
    async fn decrypt(&self, key: &PrivateKey, ciphertext: &[u8]) -> Result<Vec<u8>, CryptoError>;
    /// Largest plaintext a single `encrypt` call accepts for `key`.
    fn max_plaintext_len(&self, key: &PublicKey) -> usize;
}

#[derive(Debug, Clone, Copy)]
pub struct RsaOaep {
    modulus_bits: usize,
}

impl Default for RsaOaep {
    fn default() -> Self {
        Self::new()
    }
}

impl RsaOaep {
    pub fn new() -> Self {
        Self {
            modulus_bits: DEFAULT_MODULUS_BITS,
        }
    }

    pub fn with_modulus_bits(modulus_bits: usize) -> Self {
        Self { modulus_bits }
    }

    pub fn modulus_bits(&self) -> usize {
        self.modulus_bits
    }
}

#[async_trait]
impl KeyProvider for RsaOaep {
    async fn generate_key_pair(&self) -> Result<KeyPair, CryptoError> {
        let bits = self.modulus_bits;
        let private = tokio::task::spawn_blocking(move || RsaPrivateKey::new(&mut OsRng, bits))
            .await
            .map_err(|err| CryptoError::Unavailable(format!("key generation task failed: {err}")))?
            .map_err(|err| CryptoError::Unavailable(err.to_string()))?;
        let public = RsaPublicKey::from(&private);
        tracing::debug!(target = "peer_link::crypto", bits, "generated session key pair");
        Ok(KeyPair {
            public: PublicKey(public),
            private: Arc::new(PrivateKey(private)),
        })
    }

    fn export_public_key(&self, key: &PublicKey) -> Result<Vec<u8>, CryptoError> {
        key.0
            .to_public_key_der()
            .map(|doc| doc.as_bytes().to_vec())
            .map_err(|err| CryptoError::Unavailable(format!("spki export failed: {err}")))
    }

    fn import_public_key(&self, der: &[u8]) -> Result<PublicKey, CryptoError> {
        RsaPublicKey::from_public_key_der(der)
            .map(PublicKey)
            .map_err(|err| CryptoError::MalformedKey(err.to_string()))
    }

    async fn encrypt(&self, key: &PublicKey, plaintext: &[u8]) -> Result<Vec<u8>, CryptoError> {
        let max = self.max_plaintext_len(key);
        if plaintext.len() > max {
            return Err(CryptoError::ChunkTooLarge {
                len: plaintext.len(),
                max,
            });
        }
        key.0
            .encrypt(&mut OsRng, Oaep::new::<Sha256>(), plaintext)
            .map_err(|err| CryptoError::Encrypt(err.to_string()))
    }

    async fn decrypt(&self, key: &PrivateKey, ciphertext: &[u8]) -> Result<Vec<u8>, CryptoError> {
        key.0
            .decrypt(Oaep::new::<Sha256>(), ciphertext)
            .map_err(|err| CryptoError::Decrypt(err.to_string()))
    }

    fn max_plaintext_len(&self, key: &PublicKey) -> usize {
        key.size().saturating_sub(2 * OAEP_HASH_LEN + 2)
    }
}

/// Text encoding used to carry exported keys over the relay.
pub fn encode_public_key(der: &[u8]) -> String {
    BASE64_STANDARD.encode(der)
}

pub fn decode_public_key(text: &str) -> Result<Vec<u8>, CryptoError> {
    BASE64_STANDARD
        .decode(text.trim())
        .map_err(|err| CryptoError::MalformedKey(format!("invalid base64: {err}")))
}

/// Exports `key` and encodes it for the relay in one step.
pub fn export_encoded(provider: &dyn KeyProvider, key: &PublicKey) -> Result<String, CryptoError> {
    provider.export_public_key(key).map(|der| encode_public_key(&der))
}

/// Decodes and imports a relay-carried public key.
pub fn import_encoded(provider: &dyn KeyProvider, text: &str) -> Result<PublicKey, CryptoError> {
    let der = decode_public_key(text)?;
    provider.import_public_key(&der)
}
