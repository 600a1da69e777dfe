//! Cryptographic primitives for Tessera
//!
//! This module provides:
//! - `keys`: Identity, signed pre-key and one-time pre-key management
//! - `x3dh`: Extended Triple Diffie-Hellman key exchange
//! - `ratchet`: Double Ratchet protocol for forward secrecy
//! - `aead`: Authenticated encryption (AES-256-GCM)
//! - `kdf`: Key derivation functions (HKDF-SHA256, HMAC-SHA256)

pub mod aead;
pub mod kdf;
pub mod keys;
pub mod ratchet;
pub mod x3dh;

use rand::rngs::OsRng;
use rand::RngCore;
use subtle::ConstantTimeEq;

pub use aead::{decrypt, encrypt, Sealed};
pub use kdf::{hkdf_sha256, hmac_sha256, hmac_sha256_verify, kdf_ck, kdf_rk};
pub use keys::{
    diffie_hellman, IdentityKeyPair, IdentityPublicKey, KeyBundle, OneTimePreKey, PreKeyBundle,
    PreKeyId, SignedPreKey,
};
pub use ratchet::{DoubleRatchet, ExportedRatchetState, RatchetPhase, MAX_SKIP};
pub use x3dh::{X3dhInitialMessage, X3dhInitiator, X3dhResponder, X3dhSharedSecret};

/// Fill an array with bytes from the operating system's CSPRNG
pub fn random_bytes<const N: usize>() -> [u8; N] {
    let mut bytes = [0u8; N];
    OsRng.fill_bytes(&mut bytes);
    bytes
}

/// Compare two byte strings without early exit on the first difference
pub fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    a.ct_eq(b).into()
}
