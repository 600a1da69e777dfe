//! Protocol definitions for Tessera
//!
//! Defines the ratchet wire format and conversation sessions.

pub mod message;
pub mod session;

pub use message::{EncryptedMessage, MessageHeader, HEADER_SIZE};
pub use session::{ConversationId, ConversationSession, ExportedSession, SessionState};
