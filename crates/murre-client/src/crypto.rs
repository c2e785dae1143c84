//! Message encryption interfaces.
//!
//! The producer only consumes these traits; concrete cipher implementations
//! live outside this crate. Key ciphers are re-imported periodically so key
//! rotation on the reader side is picked up without a restart.

use bytes::Bytes;
use murre_protocol::{KeyValue, MessageMetadata};

use crate::error::Result;

/// Key material returned by a [`CryptoKeyReader`].
#[derive(Debug, Clone)]
pub struct EncryptionKeyInfo {
    pub key: Vec<u8>,
    pub metadata: Vec<KeyValue>,
}

/// Fetches key material by name, typically from a KMS or the filesystem.
pub trait CryptoKeyReader: Send + Sync {
    fn public_key(&self, key_name: &str) -> Result<EncryptionKeyInfo>;

    fn private_key(&self, key_name: &str, metadata: &[KeyValue]) -> Result<EncryptionKeyInfo>;
}

/// Encrypts message payloads with a rotating data key wrapped by the
/// producer's configured public keys.
pub trait MessageCrypto: Send + Sync {
    /// (Re-)import the cipher for each named public key. Called at producer
    /// creation and again on every data-key refresh tick.
    fn add_public_key_cipher(
        &self,
        key_names: &[String],
        key_reader: &dyn CryptoKeyReader,
    ) -> Result<()>;

    /// Encrypt `payload`, recording the wrapped data key and cipher
    /// parameters in `metadata`.
    fn encrypt(
        &self,
        key_names: &[String],
        key_reader: &dyn CryptoKeyReader,
        metadata: &mut MessageMetadata,
        payload: &Bytes,
    ) -> Result<Bytes>;
}
