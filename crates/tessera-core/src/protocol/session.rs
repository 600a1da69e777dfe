//! Conversation sessions
//!
//! A session wraps one Double Ratchet together with what the key manager
//! needs to route and expire it: a random handle, the peer it talks to and
//! when it was last used.

use std::fmt;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::crypto::keys::IdentityPublicKey;
use crate::crypto::ratchet::{DoubleRatchet, ExportedRatchetState};
use crate::crypto::x3dh::X3dhInitialMessage;
use crate::error::{Error, Result};
use crate::protocol::message::EncryptedMessage;

/// Opaque conversation handle (random UUID v4)
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ConversationId(Uuid);

impl ConversationId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl Default for ConversationId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ConversationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl From<Uuid> for ConversationId {
    fn from(uuid: Uuid) -> Self {
        Self(uuid)
    }
}

/// Session state enum
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub enum SessionState {
    /// Session is ready for messaging
    Active,
    /// Session has been closed and rejects further traffic
    Closed,
}

/// An encrypted conversation with one peer
pub struct ConversationSession {
    id: ConversationId,
    /// Directory user id of the peer
    pub peer_id: String,
    /// Peer's identity public key, as verified at setup
    pub peer_identity: IdentityPublicKey,
    state: SessionState,
    ratchet: DoubleRatchet,
    /// Handshake message to deliver with the first ciphertext; initiator only
    pub initial_message: Option<X3dhInitialMessage>,
    created_at: DateTime<Utc>,
    last_used_at: DateTime<Utc>,
}

impl ConversationSession {
    /// Session opened by us from the peer's bundle
    pub fn new_initiator(
        peer_id: String,
        peer_identity: IdentityPublicKey,
        ratchet: DoubleRatchet,
        initial_message: X3dhInitialMessage,
    ) -> Self {
        let mut session = Self::new_responder(peer_id, peer_identity, ratchet);
        session.initial_message = Some(initial_message);
        session
    }

    /// Session accepted from the peer's handshake message
    pub fn new_responder(peer_id: String, peer_identity: IdentityPublicKey, ratchet: DoubleRatchet) -> Self {
        let now = Utc::now();
        Self {
            id: ConversationId::new(),
            peer_id,
            peer_identity,
            state: SessionState::Active,
            ratchet,
            initial_message: None,
            created_at: now,
            last_used_at: now,
        }
    }

    /// Rebuild from [`export`](Self::export) output
    pub fn restore(exported: ExportedSession) -> Self {
        let ExportedSession {
            id,
            peer_id,
            peer_identity,
            state,
            created_at,
            last_used_at,
            ratchet_state,
        } = exported;

        Self {
            id,
            peer_id,
            peer_identity,
            state,
            ratchet: DoubleRatchet::from_state(ratchet_state, Vec::new()),
            initial_message: None,
            created_at,
            last_used_at,
        }
    }

    /// Ratchet forward and seal `plaintext`
    pub fn encrypt(&mut self, plaintext: &[u8]) -> Result<EncryptedMessage> {
        self.ensure_active()?;
        let message = self.ratchet.encrypt(plaintext)?;
        self.last_used_at = Utc::now();
        Ok(message)
    }

    /// Open a peer message; failures leave the ratchet untouched
    pub fn decrypt(&mut self, message: &EncryptedMessage) -> Result<Vec<u8>> {
        self.ensure_active()?;
        let plaintext = self.ratchet.decrypt(message)?;
        self.last_used_at = Utc::now();
        Ok(plaintext)
    }

    fn ensure_active(&self) -> Result<()> {
        match self.state {
            SessionState::Active => Ok(()),
            SessionState::Closed => Err(Error::InvalidState("Session is closed".to_string())),
        }
    }

    /// Export session state for persistence. Contains secret key material.
    pub fn export(&self) -> ExportedSession {
        ExportedSession {
            id: self.id,
            peer_id: self.peer_id.clone(),
            peer_identity: self.peer_identity.clone(),
            state: self.state,
            created_at: self.created_at,
            last_used_at: self.last_used_at,
            ratchet_state: self.ratchet.export_state(),
        }
    }

    /// Close the session
    pub fn close(&mut self) {
        self.state = SessionState::Closed;
    }

    pub fn id(&self) -> ConversationId {
        self.id
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn is_active(&self) -> bool {
        self.state == SessionState::Active
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn last_used_at(&self) -> DateTime<Utc> {
        self.last_used_at
    }

    /// Whether the session has been unused for longer than `max_idle` at `now`
    pub fn is_idle(&self, now: DateTime<Utc>, max_idle: Duration) -> bool {
        now.signed_duration_since(self.last_used_at) > max_idle
    }

    /// The underlying ratchet
    pub fn ratchet(&self) -> &DoubleRatchet {
        &self.ratchet
    }

    /// Get the number of messages sent on the current chain
    pub fn messages_sent(&self) -> u32 {
        self.ratchet.send_count()
    }

    /// Get the number of messages received on the current chain
    pub fn messages_received(&self) -> u32 {
        self.ratchet.recv_count()
    }
}

/// Serializable session snapshot
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ExportedSession {
    pub id: ConversationId,
    pub peer_id: String,
    pub peer_identity: IdentityPublicKey,
    pub state: SessionState,
    pub created_at: DateTime<Utc>,
    pub last_used_at: DateTime<Utc>,
    pub ratchet_state: ExportedRatchetState,
}

impl ExportedSession {
    /// Serialize to bytes
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        bincode::serialize(self).map_err(|e| Error::Serialization(e.to_string()))
    }

    /// Deserialize from bytes
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        bincode::deserialize(bytes).map_err(|e| Error::Deserialization(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::keys::{IdentityKeyPair, OneTimePreKey, SignedPreKey};
    use crate::crypto::x3dh::{X3dhInitiator, X3dhResponder};

    fn linked_sessions() -> (ConversationSession, ConversationSession) {
        let alice_identity = IdentityKeyPair::generate();
        let bob_identity = IdentityKeyPair::generate();

        let bob_spk = SignedPreKey::generate(1, &bob_identity);
        let bob_otpks = OneTimePreKey::generate_batch(0, 10);

        let mut responder = X3dhResponder::new(bob_identity.clone(), bob_spk.clone(), bob_otpks);
        let bundle = responder.get_prekey_bundle(Some(0));
        let (sk_a, first) = X3dhInitiator::new(alice_identity.clone()).agree(&bundle).unwrap();
        let sk_b = responder.agree(&first).unwrap();

        let sending =
            DoubleRatchet::init_alice(sk_a.as_bytes(), &bundle.signed_prekey.public, sk_a.associated_data.clone())
                .unwrap();
        let receiving = DoubleRatchet::init_bob(sk_b.as_bytes(), bob_spk.secret().clone(), sk_b.associated_data.clone());

        (
            ConversationSession::new_initiator("bob".to_string(), bob_identity.public_key(), sending, first),
            ConversationSession::new_responder("alice".to_string(), alice_identity.public_key(), receiving),
        )
    }

    #[test]
    fn test_session_creation() {
        let (alice, bob) = linked_sessions();

        assert!(alice.is_active());
        assert!(bob.is_active());
        assert_eq!(alice.initial_message.as_ref().map(|m| m.one_time_prekey_id), Some(Some(0)));
        assert!(bob.initial_message.is_none());
        assert_ne!(alice.id(), bob.id());
    }

    #[test]
    fn test_both_directions() {
        let (mut alice, mut bob) = linked_sessions();

        let ping = alice.encrypt(b"ping").unwrap();
        assert_eq!(bob.decrypt(&ping).unwrap(), b"ping");
        assert_eq!(bob.messages_received(), 1);

        let pong = bob.encrypt(b"pong").unwrap();
        assert_eq!(alice.decrypt(&pong).unwrap(), b"pong");
        assert_eq!(bob.messages_sent(), 1);
    }

    #[test]
    fn test_closed_session_rejects_traffic() {
        let (mut alice, mut bob) = linked_sessions();
        let message = alice.encrypt(b"hello").unwrap();

        bob.close();
        assert_eq!(bob.state(), SessionState::Closed);
        assert!(matches!(bob.decrypt(&message), Err(Error::InvalidState(_))));
        assert!(matches!(bob.encrypt(b"x"), Err(Error::InvalidState(_))));
    }

    #[test]
    fn test_idle_detection() {
        let (alice, _) = linked_sessions();
        let max_idle = Duration::days(7);

        assert!(!alice.is_idle(alice.last_used_at() + Duration::days(6), max_idle));
        assert!(alice.is_idle(alice.last_used_at() + Duration::days(8), max_idle));
    }

    #[test]
    fn test_use_refreshes_last_used() {
        let (mut alice, _) = linked_sessions();
        let before = alice.last_used_at();

        alice.encrypt(b"ping").unwrap();
        assert!(alice.last_used_at() >= before);
        assert_eq!(alice.created_at(), before);
    }

    #[test]
    fn test_session_export_restore() {
        let (mut alice, mut bob) = linked_sessions();

        let enc1 = alice.encrypt(b"before export").unwrap();
        bob.decrypt(&enc1).unwrap();

        let bytes = bob.export().to_bytes().unwrap();
        let mut restored_bob = ConversationSession::restore(ExportedSession::from_bytes(&bytes).unwrap());

        assert_eq!(restored_bob.id(), bob.id());
        assert_eq!(restored_bob.peer_id, "alice");
        assert_eq!(restored_bob.peer_identity, bob.peer_identity);

        let enc2 = alice.encrypt(b"after export").unwrap();
        assert_eq!(restored_bob.decrypt(&enc2).unwrap(), b"after export");

        let reply = restored_bob.encrypt(b"reply").unwrap();
        assert_eq!(alice.decrypt(&reply).unwrap(), b"reply");
    }

    #[test]
    fn test_conversation_id_display_is_uuid() {
        let id = ConversationId::new();
        let parsed = Uuid::parse_str(&id.to_string()).unwrap();
        assert_eq!(ConversationId::from(parsed), id);
    }
}
