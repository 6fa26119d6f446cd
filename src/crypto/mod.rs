//! AES-256-GCM token encryption with a per-record nonce.
//!
//! Stored format: `base64url(iv):base64url(ciphertext+tag)`. Keys are
//! 32-byte values configured as hex and addressed by key id; every stored
//! token records the key id it was sealed with so keys can be rotated
//! without re-encrypting existing rows.

use std::collections::HashMap;

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use ring::aead::{Aad, LessSafeKey, Nonce, UnboundKey, AES_256_GCM, NONCE_LEN};
use ring::rand::{SecureRandom, SystemRandom};

use crate::config::CryptoConfig;
use crate::errors::types::CryptoError;

pub struct TokenCipher {
    keys: HashMap<String, LessSafeKey>,
    active_key_id: String,
    rng: SystemRandom,
}

impl TokenCipher {
    /// Build the cipher from configuration, validating every key up front.
    ///
    /// An unknown or malformed key id is a configuration error and must be
    /// fatal at startup, before any job can observe it.
    pub fn from_config(config: &CryptoConfig) -> Result<Self, CryptoError> {
        let mut keys = HashMap::new();

        for (key_id, key_hex) in &config.keys {
            let key_bytes = hex::decode(key_hex).map_err(|_| CryptoError::InvalidKey {
                key_id: key_id.clone(),
            })?;
            if key_bytes.len() != 32 {
                return Err(CryptoError::InvalidKey {
                    key_id: key_id.clone(),
                });
            }
            let unbound =
                UnboundKey::new(&AES_256_GCM, &key_bytes).map_err(|_| CryptoError::InvalidKey {
                    key_id: key_id.clone(),
                })?;
            keys.insert(key_id.clone(), LessSafeKey::new(unbound));
        }

        if !keys.contains_key(&config.active_key_id) {
            return Err(CryptoError::UnknownKeyId {
                key_id: config.active_key_id.clone(),
            });
        }

        Ok(Self {
            keys,
            active_key_id: config.active_key_id.clone(),
            rng: SystemRandom::new(),
        })
    }

    /// Key id used to seal newly issued tokens.
    pub fn active_key_id(&self) -> &str {
        &self.active_key_id
    }

    /// Encrypt `plaintext` with the key identified by `key_id`, returning
    /// the combined `iv:ciphertext` string.
    pub fn encrypt_to_string(&self, plaintext: &str, key_id: &str) -> Result<String, CryptoError> {
        let key = self.key(key_id)?;

        let mut nonce_bytes = [0u8; NONCE_LEN];
        self.rng
            .fill(&mut nonce_bytes)
            .map_err(|_| CryptoError::EncryptFailed)?;
        let nonce = Nonce::assume_unique_for_key(nonce_bytes);

        let mut in_out = plaintext.as_bytes().to_vec();
        key.seal_in_place_append_tag(nonce, Aad::empty(), &mut in_out)
            .map_err(|_| CryptoError::EncryptFailed)?;

        Ok(format!(
            "{}:{}",
            URL_SAFE_NO_PAD.encode(nonce_bytes),
            URL_SAFE_NO_PAD.encode(&in_out)
        ))
    }

    /// Decrypt a combined `iv:ciphertext` string with the key identified by
    /// `key_id`.
    pub fn decrypt_from_string(
        &self,
        encrypted: &str,
        key_id: &str,
    ) -> Result<String, CryptoError> {
        let key = self.key(key_id)?;

        let (iv_part, ct_part) = encrypted
            .split_once(':')
            .ok_or(CryptoError::MalformedCiphertext)?;

        let nonce_bytes = URL_SAFE_NO_PAD
            .decode(iv_part)
            .map_err(|_| CryptoError::MalformedCiphertext)?;
        let mut in_out = URL_SAFE_NO_PAD
            .decode(ct_part)
            .map_err(|_| CryptoError::MalformedCiphertext)?;

        let nonce = Nonce::try_assume_unique_for_key(&nonce_bytes)
            .map_err(|_| CryptoError::MalformedCiphertext)?;

        let plaintext = key
            .open_in_place(nonce, Aad::empty(), &mut in_out)
            .map_err(|_| CryptoError::DecryptFailed)?;

        String::from_utf8(plaintext.to_vec()).map_err(|_| CryptoError::DecryptFailed)
    }

    fn key(&self, key_id: &str) -> Result<&LessSafeKey, CryptoError> {
        self.keys.get(key_id).ok_or_else(|| CryptoError::UnknownKeyId {
            key_id: key_id.to_string(),
        })
    }
}
