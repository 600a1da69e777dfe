//! Key Derivation Functions
//!
//! HKDF-SHA256 and HMAC-SHA256 building blocks for the X3DH handshake and
//! both chains of the Double Ratchet.

use hkdf::Hkdf;
use hmac::{Hmac, Mac};
use sha2::Sha256;

use crate::error::{Error, Result};

type HmacSha256 = Hmac<Sha256>;

/// Size of the root key and chain key in bytes
pub const KEY_SIZE: usize = 32;

/// Info string for the root chain's new root key
const ROOT_KEY_INFO: &[u8] = b"Tessera_v1_root";
/// Info string for the chain key split off the root chain
const CHAIN_KEY_INFO: &[u8] = b"Tessera_v1_chain";

/// Domain separation byte for message keys in the symmetric ratchet
const MESSAGE_KEY_CONSTANT: u8 = 0x01;
/// Domain separation byte for the next chain key in the symmetric ratchet
const CHAIN_KEY_CONSTANT: u8 = 0x02;

/// HKDF-SHA256 with an explicit salt and info string
pub fn hkdf_sha256(salt: &[u8], input_key_material: &[u8], info: &[u8], output: &mut [u8]) -> Result<()> {
    let hkdf = Hkdf::<Sha256>::new(Some(salt), input_key_material);
    hkdf.expand(info, output)
        .map_err(|e| Error::Crypto(format!("HKDF expand failed: {e}")))
}

/// HMAC-SHA256 over `data`
pub fn hmac_sha256(key: &[u8], data: &[u8]) -> Result<[u8; 32]> {
    let mut mac = <HmacSha256 as Mac>::new_from_slice(key)
        .map_err(|e| Error::Crypto(format!("HMAC key rejected: {e}")))?;
    mac.update(data);
    let mut tag = [0u8; 32];
    tag.copy_from_slice(&mac.finalize().into_bytes());
    Ok(tag)
}

/// Verify an HMAC-SHA256 tag in constant time
pub fn hmac_sha256_verify(key: &[u8], data: &[u8], tag: &[u8]) -> Result<()> {
    let mut mac = <HmacSha256 as Mac>::new_from_slice(key)
        .map_err(|e| Error::Crypto(format!("HMAC key rejected: {e}")))?;
    mac.update(data);
    mac.verify_slice(tag).map_err(|_| Error::AuthenticationFailure)
}

/// KDF for the Double Ratchet root chain
///
/// Takes the current root key and DH output, returns new root key and chain key
pub fn kdf_rk(root_key: &[u8; KEY_SIZE], dh_output: &[u8; 32]) -> Result<([u8; KEY_SIZE], [u8; KEY_SIZE])> {
    let mut new_root_key = [0u8; KEY_SIZE];
    let mut chain_key = [0u8; KEY_SIZE];

    hkdf_sha256(root_key, dh_output, ROOT_KEY_INFO, &mut new_root_key)?;
    hkdf_sha256(root_key, dh_output, CHAIN_KEY_INFO, &mut chain_key)?;

    Ok((new_root_key, chain_key))
}

/// KDF for the Double Ratchet message chain
///
/// Takes the current chain key, returns new chain key and message key. The two
/// outputs come from independent HMACs, so a message key never yields its chain key.
pub fn kdf_ck(chain_key: &[u8; KEY_SIZE]) -> Result<([u8; KEY_SIZE], [u8; KEY_SIZE])> {
    let message_key = hmac_sha256(chain_key, &[MESSAGE_KEY_CONSTANT])?;
    let new_chain_key = hmac_sha256(chain_key, &[CHAIN_KEY_CONSTANT])?;
    Ok((new_chain_key, message_key))
}

/// Concatenate multiple byte slices for use in KDF
pub fn concat_keys(keys: &[&[u8]]) -> Vec<u8> {
    let total_len: usize = keys.iter().map(|k| k.len()).sum();
    let mut result = Vec::with_capacity(total_len);
    for key in keys {
        result.extend_from_slice(key);
    }
    result
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hkdf_deterministic() {
        let mut a = [0u8; 32];
        let mut b = [0u8; 32];
        hkdf_sha256(&[0u8; 32], b"input key material", b"info", &mut a).unwrap();
        hkdf_sha256(&[0u8; 32], b"input key material", b"info", &mut b).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn test_hkdf_salt_and_info_separate() {
        let mut base = [0u8; 32];
        let mut other_salt = [0u8; 32];
        let mut other_info = [0u8; 32];
        hkdf_sha256(&[0u8; 32], b"ikm", b"info1", &mut base).unwrap();
        hkdf_sha256(&[1u8; 32], b"ikm", b"info1", &mut other_salt).unwrap();
        hkdf_sha256(&[0u8; 32], b"ikm", b"info2", &mut other_info).unwrap();
        assert_ne!(base, other_salt);
        assert_ne!(base, other_info);
    }

    #[test]
    fn test_hkdf_rejects_oversized_output() {
        // HKDF-SHA256 caps output at 255 * 32 bytes
        let mut out = vec![0u8; 255 * 32 + 1];
        assert!(matches!(
            hkdf_sha256(&[0u8; 32], b"ikm", b"info", &mut out),
            Err(Error::Crypto(_))
        ));
    }

    #[test]
    fn test_hmac_verify() {
        let tag = hmac_sha256(b"key", b"data").unwrap();
        assert!(hmac_sha256_verify(b"key", b"data", &tag).is_ok());

        let mut bad = tag;
        bad[0] ^= 1;
        assert_eq!(
            hmac_sha256_verify(b"key", b"data", &bad),
            Err(Error::AuthenticationFailure)
        );
    }

    #[test]
    fn test_kdf_rk() {
        let root_key = [0u8; 32];
        let dh_output = [1u8; 32];

        let (new_root, chain) = kdf_rk(&root_key, &dh_output).unwrap();

        assert_ne!(new_root, chain);
        assert_ne!(new_root, root_key);
        assert_ne!(chain, dh_output);
    }

    #[test]
    fn test_kdf_ck() {
        let chain_key = [0u8; 32];

        let (new_chain, message) = kdf_ck(&chain_key).unwrap();

        assert_ne!(new_chain, message);
        assert_ne!(new_chain, chain_key);
    }

    #[test]
    fn test_kdf_ck_chain() {
        let mut chain_key = [7u8; 32];
        let mut message_keys = Vec::new();

        for _ in 0..10 {
            let (new_chain, message) = kdf_ck(&chain_key).unwrap();
            message_keys.push(message);
            chain_key = new_chain;
        }

        for (i, key) in message_keys.iter().enumerate() {
            for (j, other) in message_keys.iter().enumerate() {
                if i != j {
                    assert_ne!(key, other);
                }
            }
        }
    }
}
