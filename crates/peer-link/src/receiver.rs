use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use tokio::sync::OnceCell;

use crate::crypto::{KeyProvider, PrivateKey};
use crate::error::TransportError;
use crate::session::LocalKey;

/// Decrypts inbound chunks with the session's private key.
pub struct ChunkReceiver {
    keys: Arc<dyn KeyProvider>,
    local_key: LocalKey,
    private: OnceCell<Arc<PrivateKey>>,
    receive_progress: AtomicU64,
}

impl ChunkReceiver {
    pub fn new(keys: Arc<dyn KeyProvider>, local_key: LocalKey) -> Self {
        Self {
            keys,
            local_key,
            private: OnceCell::new(),
            receive_progress: AtomicU64::new(0),
        }
    }

    /// Decrypts one chunk. A failure leaves the receiver usable for the next.
    pub async fn open(&self, ciphertext: &[u8]) -> Result<Bytes, TransportError> {
        let private = self
            .private
            .get_or_try_init(|| self.local_key.wait())
            .await?;
        let plaintext = self
            .keys
            .decrypt(private, ciphertext)
            .await
            .map_err(|err| {
                tracing::warn!(
                    target = "peer_link::transport",
                    len = ciphertext.len(),
                    error = %err,
                    "inbound chunk failed to decrypt"
                );
                TransportError::Decryption(err)
            })?;
        self.receive_progress
            .fetch_add(plaintext.len() as u64, Ordering::Relaxed);
        Ok(Bytes::from(plaintext))
    }

    /// Plaintext bytes received so far.
    pub fn receive_progress(&self) -> u64 {
        self.receive_progress.load(Ordering::Relaxed)
    }
}
