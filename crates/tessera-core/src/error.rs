//! Error types for Tessera Core

use thiserror::Error;

/// Core error type for Tessera cryptographic operations
#[derive(Error, Debug, PartialEq, Eq)]
pub enum Error {
    /// Malformed key material or unsupported parameters
    #[error("Crypto error: {0}")]
    Crypto(String),

    #[error("Invalid key length: expected {expected}, got {actual}")]
    InvalidKeyLength { expected: usize, actual: usize },

    /// AEAD tag mismatch. The message is rejected and no plaintext is produced.
    #[error("Message authentication failed")]
    AuthenticationFailure,

    /// The requested message index is too far ahead of the receiving chain,
    /// or caching the gap would overflow the skipped-key cache.
    ///
    /// The cache bound covers every chain and cached keys never expire, so
    /// each message that stays undelivered narrows the window by one until
    /// it arrives or the session is replaced.
    #[error("Too many skipped messages: {requested} requested, limit {limit}")]
    SkippedTooMany { requested: u32, limit: u32 },

    #[error("Signature verification failed")]
    SignatureVerification,

    #[error("Duplicate message detected")]
    DuplicateMessage,

    #[error("Invalid ratchet state: {0}")]
    InvalidState(String),

    #[error("Unknown prekey: {0}")]
    UnknownPreKey(u32),

    #[error("Invalid message format: {0}")]
    InvalidMessageFormat(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Deserialization error: {0}")]
    Deserialization(String),
}

/// Result type for Tessera Core operations
pub type Result<T> = std::result::Result<T, Error>;
