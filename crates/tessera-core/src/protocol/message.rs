//! Wire format for ratchet messages
//!
//! Layout: `dh_public (32) || pn (u32 BE) || n (u32 BE) || nonce (12) || ciphertext`.
//! The ciphertext carries the 16-byte AEAD tag at its end.

use serde::{Deserialize, Serialize};
use x25519_dalek::PublicKey as X25519PublicKey;

use crate::crypto::aead::{NONCE_SIZE, TAG_SIZE};
use crate::crypto::keys::raw_key;
use crate::error::{Error, Result};

/// Encoded size of a [`MessageHeader`]
pub const HEADER_SIZE: usize = 32 + 4 + 4;

/// Message header containing ratchet state
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct MessageHeader {
    /// Sender's current DH ratchet public key
    #[serde(with = "raw_key")]
    pub dh_public: X25519PublicKey,
    /// Previous chain length (messages sent with the previous DH key)
    pub previous_chain_length: u32,
    /// Message number in current chain
    pub message_number: u32,
}

impl PartialEq for MessageHeader {
    fn eq(&self, other: &Self) -> bool {
        self.dh_public.as_bytes() == other.dh_public.as_bytes()
            && self.previous_chain_length == other.previous_chain_length
            && self.message_number == other.message_number
    }
}

impl Eq for MessageHeader {}

impl MessageHeader {
    /// Encode to the fixed header layout. Also used as AEAD associated data.
    pub fn to_bytes(&self) -> [u8; HEADER_SIZE] {
        let mut out = [0u8; HEADER_SIZE];
        out[..32].copy_from_slice(self.dh_public.as_bytes());
        out[32..36].copy_from_slice(&self.previous_chain_length.to_be_bytes());
        out[36..40].copy_from_slice(&self.message_number.to_be_bytes());
        out
    }

    /// Decode from the fixed header layout
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        if bytes.len() != HEADER_SIZE {
            return Err(Error::InvalidMessageFormat(format!(
                "header must be {HEADER_SIZE} bytes, got {}",
                bytes.len()
            )));
        }

        let mut dh = [0u8; 32];
        dh.copy_from_slice(&bytes[..32]);
        let mut pn = [0u8; 4];
        pn.copy_from_slice(&bytes[32..36]);
        let mut n = [0u8; 4];
        n.copy_from_slice(&bytes[36..40]);

        Ok(Self {
            dh_public: X25519PublicKey::from(dh),
            previous_chain_length: u32::from_be_bytes(pn),
            message_number: u32::from_be_bytes(n),
        })
    }
}

/// Encrypted message with header, ready for transport
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct EncryptedMessage {
    pub header: MessageHeader,
    pub nonce: [u8; NONCE_SIZE],
    /// Ciphertext with appended authentication tag
    pub ciphertext: Vec<u8>,
}

impl EncryptedMessage {
    /// Serialize to the wire layout
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(HEADER_SIZE + NONCE_SIZE + self.ciphertext.len());
        out.extend_from_slice(&self.header.to_bytes());
        out.extend_from_slice(&self.nonce);
        out.extend_from_slice(&self.ciphertext);
        out
    }

    /// Deserialize from the wire layout
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        if bytes.len() < HEADER_SIZE + NONCE_SIZE + TAG_SIZE {
            return Err(Error::InvalidMessageFormat(format!(
                "message too short: {} bytes",
                bytes.len()
            )));
        }

        let header = MessageHeader::from_bytes(&bytes[..HEADER_SIZE])?;
        let mut nonce = [0u8; NONCE_SIZE];
        nonce.copy_from_slice(&bytes[HEADER_SIZE..HEADER_SIZE + NONCE_SIZE]);

        Ok(Self {
            header,
            nonce,
            ciphertext: bytes[HEADER_SIZE + NONCE_SIZE..].to_vec(),
        })
    }
}
