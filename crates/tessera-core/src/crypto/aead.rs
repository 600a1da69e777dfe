//! Authenticated Encryption with Associated Data (AEAD)
//!
//! Implements AES-256-GCM for message encryption. Every call to [`encrypt`]
//! draws a fresh random nonce; the nonce travels next to the ciphertext.

use aes_gcm::{
    aead::{Aead, KeyInit, Payload},
    Aes256Gcm, Nonce,
};
use rand::rngs::OsRng;
use rand::RngCore;
use zeroize::Zeroize;

use crate::error::{Error, Result};

/// Size of the encryption key in bytes
pub const KEY_SIZE: usize = 32;
/// Size of the nonce in bytes
pub const NONCE_SIZE: usize = 12;
/// Size of the authentication tag in bytes
pub const TAG_SIZE: usize = 16;

/// Output of a single AEAD encryption
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Sealed {
    pub nonce: [u8; NONCE_SIZE],
    /// Ciphertext with the 16-byte tag appended
    pub ciphertext: Vec<u8>,
}

/// Encrypt a message using AES-256-GCM with a fresh random nonce
///
/// # Arguments
/// * `key` - 32-byte encryption key
/// * `plaintext` - Message to encrypt
/// * `associated_data` - Additional data to authenticate (not encrypted)
pub fn encrypt(key: &[u8; KEY_SIZE], plaintext: &[u8], associated_data: &[u8]) -> Result<Sealed> {
    let mut nonce = [0u8; NONCE_SIZE];
    OsRng.fill_bytes(&mut nonce);
    encrypt_with_nonce(key, &nonce, plaintext, associated_data)
}

/// Encrypt with a caller-chosen nonce. Reusing a nonce under one key breaks
/// confidentiality, so this stays private to the crate.
pub(crate) fn encrypt_with_nonce(
    key: &[u8; KEY_SIZE],
    nonce: &[u8; NONCE_SIZE],
    plaintext: &[u8],
    associated_data: &[u8],
) -> Result<Sealed> {
    let cipher = Aes256Gcm::new_from_slice(key).map_err(|e| Error::Crypto(e.to_string()))?;

    let ciphertext = cipher
        .encrypt(Nonce::from_slice(nonce), Payload {
            msg: plaintext,
            aad: associated_data,
        })
        .map_err(|_| Error::Crypto("AES-GCM encryption failed".to_string()))?;

    Ok(Sealed {
        nonce: *nonce,
        ciphertext,
    })
}

/// Decrypt a message using AES-256-GCM
///
/// Fails with [`Error::AuthenticationFailure`] on any tag mismatch; no partial
/// plaintext is ever returned.
pub fn decrypt(
    key: &[u8; KEY_SIZE],
    nonce: &[u8],
    ciphertext: &[u8],
    associated_data: &[u8],
) -> Result<Vec<u8>> {
    if nonce.len() != NONCE_SIZE {
        return Err(Error::Crypto(format!(
            "Invalid nonce length: expected {NONCE_SIZE}, got {}",
            nonce.len()
        )));
    }
    if ciphertext.len() < TAG_SIZE {
        return Err(Error::AuthenticationFailure);
    }

    let cipher = Aes256Gcm::new_from_slice(key).map_err(|e| Error::Crypto(e.to_string()))?;

    cipher
        .decrypt(Nonce::from_slice(nonce), Payload {
            msg: ciphertext,
            aad: associated_data,
        })
        .map_err(|_| Error::AuthenticationFailure)
}

/// Securely erase a key from memory
pub fn zeroize_key(key: &mut [u8; KEY_SIZE]) {
    key.zeroize();
}
