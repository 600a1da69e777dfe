//! Tessera Core - Cryptographic primitives and protocol implementation
//!
//! This crate provides the core security primitives for Tessera:
//! - Identity key management (Ed25519 + X25519)
//! - X3DH asynchronous key agreement
//! - Double Ratchet for forward secrecy and break-in recovery
//! - AES-256-GCM AEAD encryption

pub mod crypto;
pub mod error;
pub mod protocol;

pub use error::{Error, Result};
