//! Key material for sealing index rows.
//!
//! The index is encrypted with key material tied to the user's mail keys.
//! Embedders that already hold that material pass it through
//! [`StaticKeyProvider`]; standalone deployments keep it in the platform
//! keyring via [`KeyringKeyProvider`]:
//! - Linux: Secret Service (GNOME Keyring, `KWallet`)
//! - macOS: Keychain
//! - Windows: Credential Manager

use std::collections::HashMap;

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use keyring::Entry;
use ring::rand::{SecureRandom, SystemRandom};
use tracing::{debug, warn};

use crate::UserId;

/// Service name used for keyring entries.
const SERVICE_NAME: &str = "vaultsearch";

/// Bytes of freshly generated key material.
const MATERIAL_LEN: usize = 32;

/// Error type for key material operations.
#[derive(Debug, thiserror::Error)]
pub enum KeyError {
    /// Failed to access keyring.
    #[error("Keyring error: {0}")]
    Keyring(#[from] keyring::Error),

    /// Stored material is not valid base64.
    #[error("Stored key material is corrupt: {0}")]
    Corrupt(#[from] base64::DecodeError),

    /// No key material is known for the user.
    #[error("No key material for user {0}")]
    Missing(UserId),

    /// The system random generator failed.
    #[error("Random number generator failure")]
    Random,

    /// The blocking key lookup task did not finish.
    #[error("Key lookup was interrupted")]
    Interrupted,
}

/// Supplies the key material an index partition is sealed with.
pub trait KeyProvider: Send + Sync {
    /// Returns the key material for `user_id`.
    ///
    /// # Errors
    ///
    /// Returns an error if the material is unavailable.
    fn key_material(&self, user_id: &UserId) -> Result<Vec<u8>, KeyError>;

    /// Forgets the key material for `user_id`, if the provider owns it.
    ///
    /// # Errors
    ///
    /// Returns an error if the backing store refuses the deletion.
    fn forget(&self, _user_id: &UserId) -> Result<(), KeyError> {
        Ok(())
    }
}

/// Key material handed in by the embedding application.
#[derive(Debug, Clone, Default)]
pub struct StaticKeyProvider {
    shared: Option<Vec<u8>>,
    per_user: HashMap<UserId, Vec<u8>>,
}

impl StaticKeyProvider {
    /// Use `material` for every user. Row keys still differ per user.
    #[must_use]
    pub fn shared(material: impl Into<Vec<u8>>) -> Self {
        Self {
            shared: Some(material.into()),
            per_user: HashMap::new(),
        }
    }

    /// Use `material` for `user_id`, overriding any shared material.
    #[must_use]
    pub fn with_user(mut self, user_id: UserId, material: impl Into<Vec<u8>>) -> Self {
        self.per_user.insert(user_id, material.into());
        self
    }
}

impl KeyProvider for StaticKeyProvider {
    fn key_material(&self, user_id: &UserId) -> Result<Vec<u8>, KeyError> {
        self.per_user
            .get(user_id)
            .or(self.shared.as_ref())
            .cloned()
            .ok_or_else(|| KeyError::Missing(user_id.clone()))
    }
}

/// Key material kept in the system keyring, generated on first use.
#[derive(Debug, Default)]
pub struct KeyringKeyProvider;

impl KeyringKeyProvider {
    /// Creates a provider backed by the system keyring.
    #[must_use]
    pub const fn new() -> Self {
        Self
    }

    fn entry(user_id: &UserId) -> Result<Entry, KeyError> {
        let key = format!("{SERVICE_NAME}_index_{user_id}");
        Ok(Entry::new(SERVICE_NAME, &key)?)
    }

    fn generate() -> Result<Vec<u8>, KeyError> {
        let mut material = vec![0u8; MATERIAL_LEN];
        SystemRandom::new()
            .fill(&mut material)
            .map_err(|_| KeyError::Random)?;
        Ok(material)
    }
}

impl KeyProvider for KeyringKeyProvider {
    fn key_material(&self, user_id: &UserId) -> Result<Vec<u8>, KeyError> {
        let entry = Self::entry(user_id)?;
        match entry.get_password() {
            Ok(encoded) => Ok(STANDARD.decode(encoded)?),
            Err(keyring::Error::NoEntry) => {
                let material = Self::generate()?;
                entry.set_password(&STANDARD.encode(&material))?;
                debug!("Generated index key material for user {user_id}");
                Ok(material)
            }
            Err(e) => Err(e.into()),
        }
    }

    fn forget(&self, user_id: &UserId) -> Result<(), KeyError> {
        let entry = Self::entry(user_id)?;
        match entry.delete_credential() {
            Ok(()) => {
                debug!("Deleted index key material for user {user_id}");
                Ok(())
            }
            Err(keyring::Error::NoEntry) => Ok(()),
            Err(e) => {
                warn!("Failed to delete index key material: {e}");
                Err(e.into())
            }
        }
    }
}
