//! Application error types

use std::time::Duration;

use tessera_core::protocol::ConversationId;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("Not initialized - call initialize() first")]
    NotInitialized,

    #[error("Already initialized")]
    AlreadyInitialized,

    #[error("Session not found: {0}")]
    SessionNotFound(ConversationId),

    /// A restore targeted a handle that is still live
    #[error("Session already exists: {0}")]
    SessionExists(ConversationId),

    #[error("Session closed: {0}")]
    SessionClosed(ConversationId),

    #[error("User not found: {0}")]
    UserNotFound(String),

    /// The identity in an initial message does not match the directory
    #[error("Identity key mismatch for user {0}")]
    IdentityMismatch(String),

    #[error("Directory error: {0}")]
    Directory(String),

    #[error("Directory request timed out after {0:?}")]
    Timeout(Duration),

    #[error("Crypto error: {0}")]
    Crypto(#[from] tessera_core::Error),
}

pub type Result<T> = std::result::Result<T, Error>;
