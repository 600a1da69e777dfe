//! Tessera Application - key management and conversation registry
//!
//! Coordinates key material, the key directory and ratchet sessions.

pub mod config;
pub mod directory;
pub mod error;
pub mod service;

pub use config::KeyManagerConfig;
pub use directory::{Directory, MemoryDirectory};
pub use error::{Error, Result};
pub use service::{ConversationStart, KeyManagementService};
