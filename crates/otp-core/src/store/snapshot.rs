//! Encrypted snapshot persistence for the store.

use super::StoreData;
use crate::config::StorageConfig;
use crate::error::EngineError;
use aes_gcm::{
    aead::{Aead, KeyInit},
    Aes256Gcm, Key, Nonce,
};
use rand::RngCore;
use secrecy::ExposeSecret;
use sha2::{Digest, Sha256};
use std::path::PathBuf;
use tokio::fs;
use tracing::{debug, info, warn};

/// Context mixed into the key derivation.
const KEY_DERIVATION_CONTEXT: &str = "otp-core/entitlement-store";

/// Nonce size for AES-GCM (96 bits = 12 bytes).
const NONCE_SIZE: usize = 12;

/// Persistence backend.
pub enum Snapshot {
    Encrypted(EncryptedFile),
    /// Nothing is written; state lives only in memory.
    Memory,
}

impl Snapshot {
    /// Pick a backend from configuration.
    pub fn from_config(config: &StorageConfig) -> Self {
        if !config.persist {
            info!("Persistence disabled, using in-memory store");
            return Snapshot::Memory;
        }

        match &config.encryption_key {
            Some(passphrase) => Snapshot::Encrypted(EncryptedFile::new(
                config.path.clone(),
                derive_key(passphrase.expose_secret()),
            )),
            None => {
                warn!("No storage encryption key configured, using in-memory store");
                Snapshot::Memory
            }
        }
    }

    pub async fn load(&self) -> Result<Option<StoreData>, EngineError> {
        match self {
            Snapshot::Encrypted(file) => file.load().await,
            Snapshot::Memory => Ok(None),
        }
    }

    pub async fn save(&self, data: &StoreData) -> Result<(), EngineError> {
        match self {
            Snapshot::Encrypted(file) => file.save(data).await,
            Snapshot::Memory => Ok(()),
        }
    }
}

/// Derive a 32-byte key from a passphrase.
pub fn derive_key(passphrase: &str) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(KEY_DERIVATION_CONTEXT.as_bytes());
    hasher.update(passphrase.as_bytes());
    let hash = hasher.finalize();

    let mut key = [0u8; 32];
    key.copy_from_slice(&hash);
    key
}

/// AES-256-GCM encrypted JSON file, nonce-prefixed.
pub struct EncryptedFile {
    path: PathBuf,
    key: [u8; 32],
}

impl EncryptedFile {
    pub fn new(path: PathBuf, key: [u8; 32]) -> Self {
        Self { path, key }
    }

    async fn save(&self, data: &StoreData) -> Result<(), EngineError> {
        let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(&self.key));

        let mut nonce_bytes = [0u8; NONCE_SIZE];
        rand::thread_rng().fill_bytes(&mut nonce_bytes);
        let nonce = Nonce::from_slice(&nonce_bytes);

        let plaintext = serde_json::to_vec(data)?;
        let ciphertext = cipher.encrypt(nonce, plaintext.as_ref())?;

        let mut encrypted = nonce_bytes.to_vec();
        encrypted.extend(ciphertext);

        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent).await?;
        }

        // Atomic write
        let temp_path = self.path.with_extension("tmp");
        fs::write(&temp_path, &encrypted).await?;
        fs::rename(&temp_path, &self.path).await?;

        debug!("Saved store ({} bytes) to {:?}", encrypted.len(), self.path);
        Ok(())
    }

    async fn load(&self) -> Result<Option<StoreData>, EngineError> {
        if !self.path.exists() {
            info!("Store not found at {:?}, starting fresh", self.path);
            return Ok(None);
        }

        let encrypted = fs::read(&self.path).await?;
        if encrypted.len() < NONCE_SIZE {
            warn!("Store file too short, starting fresh");
            return Ok(None);
        }

        let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(&self.key));
        let nonce = Nonce::from_slice(&encrypted[..NONCE_SIZE]);

        let plaintext = cipher
            .decrypt(nonce, &encrypted[NONCE_SIZE..])
            .map_err(|_| {
                EngineError::Encryption(
                    "Failed to decrypt store. Was the encryption key changed?".to_string(),
                )
            })?;

        let data: StoreData = serde_json::from_slice(&plaintext)?;
        info!(
            "Loaded store: {} accounts, {} credentials, {} processed messages",
            data.accounts.len(),
            data.credentials.len(),
            data.processed_messages.len()
        );

        Ok(Some(data))
    }
}
