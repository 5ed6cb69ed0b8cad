//! AES-256-GCM sealing of index rows.
//!
//! The row key is derived with HKDF-SHA256 from the user's mail key material,
//! so the index is readable exactly by whoever can read the mail itself.
//! Every sealed row is `nonce || ciphertext || tag`; the user and message
//! identifiers are bound as associated data so rows cannot be swapped
//! between users or messages.

use ring::aead::{AES_256_GCM, Aad, LessSafeKey, MAX_TAG_LEN, NONCE_LEN, Nonce, UnboundKey};
use ring::hkdf;
use ring::rand::{SecureRandom, SystemRandom};

use crate::{Error, MessageId, Result, UserId};

const KEY_SALT: &[u8] = b"vaultsearch/index/v1";

/// Seals and opens index rows for one user.
pub struct IndexCipher {
    key: LessSafeKey,
    rng: SystemRandom,
}

impl std::fmt::Debug for IndexCipher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IndexCipher").finish_non_exhaustive()
    }
}

impl IndexCipher {
    /// Derive the row key for `user_id` from its key material.
    ///
    /// # Errors
    ///
    /// Returns an error if key derivation fails.
    pub fn derive(material: &[u8], user_id: &UserId) -> Result<Self> {
        let salt = hkdf::Salt::new(hkdf::HKDF_SHA256, KEY_SALT);
        let prk = salt.extract(material);
        let info = [user_id.as_str().as_bytes()];
        let okm = prk
            .expand(&info, &AES_256_GCM)
            .map_err(|_| Error::Crypto("key derivation failed".to_string()))?;

        Ok(Self {
            key: LessSafeKey::new(UnboundKey::from(okm)),
            rng: SystemRandom::new(),
        })
    }

    /// Encrypt `plaintext` for the given row.
    ///
    /// # Errors
    ///
    /// Returns an error if no nonce can be generated or sealing fails.
    pub fn seal(&self, user_id: &UserId, message_id: &MessageId, plaintext: &[u8]) -> Result<Vec<u8>> {
        let mut nonce_bytes = [0u8; NONCE_LEN];
        self.rng
            .fill(&mut nonce_bytes)
            .map_err(|_| Error::Crypto("nonce generation failed".to_string()))?;

        let mut in_out = plaintext.to_vec();
        self.key
            .seal_in_place_append_tag(
                Nonce::assume_unique_for_key(nonce_bytes),
                Aad::from(associated_data(user_id, message_id)),
                &mut in_out,
            )
            .map_err(|_| Error::Crypto("sealing failed".to_string()))?;

        let mut sealed = Vec::with_capacity(NONCE_LEN + in_out.len());
        sealed.extend_from_slice(&nonce_bytes);
        sealed.extend_from_slice(&in_out);
        Ok(sealed)
    }

    /// Decrypt a row produced by [`seal`](Self::seal).
    ///
    /// # Errors
    ///
    /// Returns an error if the row is truncated, was sealed for another row,
    /// or was tampered with.
    pub fn open(&self, user_id: &UserId, message_id: &MessageId, sealed: &[u8]) -> Result<Vec<u8>> {
        if sealed.len() < NONCE_LEN + MAX_TAG_LEN {
            return Err(Error::Crypto("sealed row is truncated".to_string()));
        }

        let (nonce_bytes, ciphertext) = sealed.split_at(NONCE_LEN);
        let nonce = Nonce::try_assume_unique_for_key(nonce_bytes)
            .map_err(|_| Error::Crypto("invalid nonce".to_string()))?;

        let mut in_out = ciphertext.to_vec();
        let plaintext = self
            .key
            .open_in_place(nonce, Aad::from(associated_data(user_id, message_id)), &mut in_out)
            .map_err(|_| Error::Crypto("authentication failed".to_string()))?;
        Ok(plaintext.to_vec())
    }
}

fn associated_data(user_id: &UserId, message_id: &MessageId) -> Vec<u8> {
    let mut aad = Vec::with_capacity(user_id.as_str().len() + message_id.as_str().len() + 1);
    aad.extend_from_slice(user_id.as_str().as_bytes());
    aad.push(0);
    aad.extend_from_slice(message_id.as_str().as_bytes());
    aad
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    fn ids() -> (UserId, MessageId) {
        (UserId::new("user-1"), MessageId::new("msg-1"))
    }

    #[test]
    fn test_seal_and_open() {
        let (user, msg) = ids();
        let cipher = IndexCipher::derive(b"mail key material", &user).unwrap();

        let sealed = cipher.seal(&user, &msg, b"hello index").unwrap();
        assert_eq!(sealed.len(), NONCE_LEN + b"hello index".len() + MAX_TAG_LEN);
        assert_ne!(&sealed[NONCE_LEN..NONCE_LEN + 11], b"hello index");

        let opened = cipher.open(&user, &msg, &sealed).unwrap();
        assert_eq!(opened, b"hello index");
    }

    #[test]
    fn test_open_rejects_other_message() {
        let (user, msg) = ids();
        let cipher = IndexCipher::derive(b"mail key material", &user).unwrap();
        let sealed = cipher.seal(&user, &msg, b"secret").unwrap();

        assert!(cipher.open(&user, &MessageId::new("msg-2"), &sealed).is_err());
    }

    #[test]
    fn test_keys_differ_per_user() {
        let (user, msg) = ids();
        let other = UserId::new("user-2");
        let cipher = IndexCipher::derive(b"shared material", &user).unwrap();
        let other_cipher = IndexCipher::derive(b"shared material", &other).unwrap();

        let sealed = cipher.seal(&user, &msg, b"secret").unwrap();
        assert!(other_cipher.open(&user, &msg, &sealed).is_err());
    }

    #[test]
    fn test_open_rejects_truncated() {
        let (user, msg) = ids();
        let cipher = IndexCipher::derive(b"k", &user).unwrap();
        assert!(cipher.open(&user, &msg, &[0u8; 4]).is_err());
    }
}
