//! The on-disk bundle format for a backup: payload plus a sidecar
//! (`spec.md` §4.7 "per-backup metadata sidecar").

use aes_gcm::aead::{Aead, AeadCore, KeyInit, OsRng};
use aes_gcm::{Aes256Gcm, Nonce};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tutor_config::TutorConfig;
use tutor_storage::{ChunkRecord, CollectionKey, IncrementalSnapshot, MetadataSnapshot};
use tutor_types::{Result, TutorError};

/// Whether a backup is a full point-in-time copy or an append-only delta
/// against its `base_id` (`spec.md` §4.7).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BackupKind {
    Full,
    Incremental,
}

/// Everything a full backup carries: every relational table, every vector
/// collection, and the configuration in force when it was captured.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FullBackupData {
    pub metadata: MetadataSnapshot,
    pub vectors: Vec<(CollectionKey, Vec<ChunkRecord>)>,
    pub config: TutorConfig,
}

/// The decompressed, decrypted contents of a backup bundle.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum BackupPayload {
    Full(FullBackupData),
    Incremental(IncrementalSnapshot),
}

/// The sidecar record for one backup: written alongside the bundle so a
/// backup's provenance and integrity can be checked without decompressing
/// it (`spec.md` §4.7).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackupMetadata {
    pub id: String,
    pub kind: BackupKind,
    pub created_at: DateTime<Utc>,
    /// The full backup an incremental is layered on; `None` for full backups.
    pub base_id: Option<String>,
    pub size_bytes: u64,
    /// sha256 of the compressed (and, if enabled, encrypted) bundle bytes.
    pub integrity_hash: String,
    pub encrypted: bool,
}

impl BackupMetadata {
    #[must_use]
    pub fn file_stem(&self) -> String {
        self.id.clone()
    }
}

/// Serializes, compresses, and optionally encrypts a payload into the bytes
/// written to a backup's bundle file.
pub fn seal(payload: &BackupPayload, encryption_key: Option<&[u8; 32]>) -> Result<Vec<u8>> {
    let serialized =
        rmp_serde::to_vec(payload).map_err(|e| TutorError::Storage(format!("backup serialization failed: {e}")))?;
    let compressed = lz4_flex::compress_prepend_size(&serialized);
    match encryption_key {
        Some(key) => encrypt(&compressed, key),
        None => Ok(compressed),
    }
}

/// Reverses [`seal`]: decrypts (if `encryption_key` is given), decompresses,
/// and deserializes a bundle's bytes back into a [`BackupPayload`].
pub fn unseal(bytes: &[u8], encryption_key: Option<&[u8; 32]>) -> Result<BackupPayload> {
    let decrypted = match encryption_key {
        Some(key) => decrypt(bytes, key)?,
        None => bytes.to_vec(),
    };
    let decompressed = lz4_flex::decompress_size_prepended(&decrypted)
        .map_err(|e| TutorError::Storage(format!("backup decompression failed: {e}")))?;
    rmp_serde::from_slice(&decompressed)
        .map_err(|e| TutorError::Storage(format!("backup deserialization failed: {e}")))
}

/// sha256 hex digest, used as the sidecar's integrity hash.
#[must_use]
pub fn integrity_hash(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    format!("{:x}", hasher.finalize())
}

/// Derives a 256-bit AES key from an arbitrary-length passphrase by hashing
/// it; a raw 32-byte key is used verbatim.
#[must_use]
pub fn derive_key(passphrase: &[u8]) -> [u8; 32] {
    if passphrase.len() == 32 {
        let mut key = [0u8; 32];
        key.copy_from_slice(passphrase);
        return key;
    }
    let mut hasher = Sha256::new();
    hasher.update(passphrase);
    hasher.finalize().into()
}

fn encrypt(plaintext: &[u8], key: &[u8; 32]) -> Result<Vec<u8>> {
    let cipher = Aes256Gcm::new(key.into());
    let nonce = Aes256Gcm::generate_nonce(&mut OsRng);
    let ciphertext = cipher
        .encrypt(&nonce, plaintext)
        .map_err(|_| TutorError::Storage("backup encryption failed".into()))?;
    let mut combined = nonce.to_vec();
    combined.extend_from_slice(&ciphertext);
    Ok(combined)
}

fn decrypt(bytes: &[u8], key: &[u8; 32]) -> Result<Vec<u8>> {
    if bytes.len() < 12 {
        return Err(TutorError::Storage("backup ciphertext too short".into()));
    }
    let (nonce_bytes, ciphertext) = bytes.split_at(12);
    let nonce = Nonce::from_slice(nonce_bytes);
    let cipher = Aes256Gcm::new(key.into());
    cipher
        .decrypt(nonce, ciphertext)
        .map_err(|_| TutorError::Storage("backup decryption failed; wrong key or corrupted bundle".into()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn seal_and_unseal_round_trip_without_encryption() {
        let payload = BackupPayload::Incremental(IncrementalSnapshot::default());
        let bytes = seal(&payload, None).unwrap();
        let restored = unseal(&bytes, None).unwrap();
        assert!(matches!(restored, BackupPayload::Incremental(_)));
    }

    #[test]
    fn seal_and_unseal_round_trip_with_encryption() {
        let key = derive_key(b"a strong passphrase");
        let payload = BackupPayload::Incremental(IncrementalSnapshot::default());
        let bytes = seal(&payload, Some(&key)).unwrap();
        let restored = unseal(&bytes, Some(&key)).unwrap();
        assert!(matches!(restored, BackupPayload::Incremental(_)));
    }

    #[test]
    fn unseal_fails_with_the_wrong_key() {
        let key = derive_key(b"correct horse battery staple");
        let wrong_key = derive_key(b"something else entirely");
        let payload = BackupPayload::Incremental(IncrementalSnapshot::default());
        let bytes = seal(&payload, Some(&key)).unwrap();
        assert!(unseal(&bytes, Some(&wrong_key)).is_err());
    }

    #[test]
    fn integrity_hash_is_deterministic_and_sensitive_to_content() {
        let a = integrity_hash(b"hello");
        let b = integrity_hash(b"hello");
        let c = integrity_hash(b"hellx");
        assert_eq!(a, b);
        assert_ne!(a, c);
    }
}
