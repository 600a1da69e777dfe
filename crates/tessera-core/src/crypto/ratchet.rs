//! Double Ratchet
//!
//! Each message key comes from a symmetric chain step; each change of the
//! peer's ratchet key feeds a fresh X25519 output into the root chain. Old
//! message keys cannot be recomputed from current state, and a compromised
//! state heals once both sides have exchanged new ratchet keys.
//!
//! Decryption works on a staged copy of the state and commits it only on
//! success, so a forged, replayed or out-of-range message leaves the ratchet
//! exactly as it was. Encryption holds its new keys in locals and writes them
//! back once the message is sealed.
//!
//! The DH ratchet runs in two halves. Receiving a new remote key derives the
//! new receiving chain and generates a fresh own key pair at once; the matching
//! sending chain is derived on the first send that follows. The derived keys are
//! the same as with an eager step, and the root keys of both parties agree
//! after every completed round trip.

use std::collections::HashMap;

use rand::rngs::OsRng;
use serde::{Deserialize, Serialize};
use x25519_dalek::{PublicKey as X25519PublicKey, StaticSecret as X25519SecretKey};
use zeroize::{Zeroize, ZeroizeOnDrop, Zeroizing};

use super::aead;
use super::constant_time_eq;
use super::kdf::{kdf_ck, kdf_rk};
use super::keys::diffie_hellman;
use crate::error::{Error, Result};
use crate::protocol::message::{EncryptedMessage, MessageHeader};

/// Maximum number of message keys that may be skipped or cached
pub const MAX_SKIP: u32 = 1000;

/// Size of keys in bytes
pub const KEY_SIZE: usize = 32;

/// (remote ratchet public key, message number)
type SkippedKeyId = ([u8; 32], u32);

/// Lifecycle of a ratchet
///
/// There is no uninitialized phase: a ratchet only exists once one of the
/// `init_*` constructors has run.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum RatchetPhase {
    /// Initiator side; can send, has not yet received
    AliceInitialized,
    /// Responder side; must receive before it can send
    BobInitialized,
    /// At least one inbound message has been decrypted
    Ready,
}

/// Own ratchet key
#[derive(Clone, ZeroizeOnDrop)]
struct DhKeyPair {
    secret: X25519SecretKey,
    #[zeroize(skip)]
    public: X25519PublicKey,
}

impl DhKeyPair {
    fn generate() -> Self {
        Self::from_secret(X25519SecretKey::random_from_rng(OsRng))
    }

    fn from_secret(secret: X25519SecretKey) -> Self {
        let public = X25519PublicKey::from(&secret);
        Self { secret, public }
    }
}

/// Cached message keys for messages that have not arrived yet
#[derive(Clone, Default)]
struct SkippedKeys(HashMap<SkippedKeyId, [u8; KEY_SIZE]>);

impl Zeroize for SkippedKeys {
    fn zeroize(&mut self) {
        for key in self.0.values_mut() {
            key.zeroize();
        }
        self.0.clear();
    }
}

/// Mutable ratchet state, cloned for every staged operation
#[derive(Clone, ZeroizeOnDrop)]
pub struct RatchetState {
    #[zeroize(skip)]
    phase: RatchetPhase,
    /// Current DH key pair (zeroizes itself)
    #[zeroize(skip)]
    dh_self: DhKeyPair,
    /// Peer's latest ratchet key
    #[zeroize(skip)]
    dh_remote: Option<X25519PublicKey>,
    root_key: [u8; KEY_SIZE],
    /// `None` until the sending half of the last DH ratchet step has run
    chain_key_send: Option<[u8; KEY_SIZE]>,
    chain_key_recv: Option<[u8; KEY_SIZE]>,
    /// Ns
    #[zeroize(skip)]
    send_count: u32,
    /// Nr
    #[zeroize(skip)]
    recv_count: u32,
    /// Pn
    #[zeroize(skip)]
    previous_send_count: u32,
    skipped_keys: SkippedKeys,
}

impl RatchetState {
    fn aad(associated_data: &[u8], header: &MessageHeader) -> Vec<u8> {
        let mut aad = Vec::with_capacity(associated_data.len() + 40);
        aad.extend_from_slice(associated_data);
        aad.extend_from_slice(&header.to_bytes());
        aad
    }

    /// Seal one message; nothing is written back unless sealing succeeds
    fn encrypt(&mut self, plaintext: &[u8], associated_data: &[u8]) -> Result<EncryptedMessage> {
        let (root_key, chain_key) = match self.chain_key_send {
            Some(chain_key) => (Zeroizing::new(self.root_key), Zeroizing::new(chain_key)),
            None => self.sending_ratchet_keys()?,
        };
        let next_send_count = self
            .send_count
            .checked_add(1)
            .ok_or_else(|| Error::InvalidState("Sending chain exhausted".to_string()))?;

        let (new_chain_key, mut message_key) = kdf_ck(&chain_key)?;

        let header = MessageHeader {
            dh_public: self.dh_self.public,
            previous_chain_length: self.previous_send_count,
            message_number: self.send_count,
        };

        let sealed = aead::encrypt(&message_key, plaintext, &Self::aad(associated_data, &header));
        aead::zeroize_key(&mut message_key);
        let sealed = sealed?;

        self.root_key = *root_key;
        self.chain_key_send = Some(new_chain_key);
        self.send_count = next_send_count;

        Ok(EncryptedMessage {
            header,
            nonce: sealed.nonce,
            ciphertext: sealed.ciphertext,
        })
    }

    fn decrypt(&mut self, message: &EncryptedMessage, associated_data: &[u8]) -> Result<Vec<u8>> {
        let header = &message.header;
        let aad = Self::aad(associated_data, header);

        let skipped_id = (header.dh_public.to_bytes(), header.message_number);
        if let Some(mut message_key) = self.skipped_keys.0.remove(&skipped_id) {
            let plaintext = aead::decrypt(&message_key, &message.nonce, &message.ciphertext, &aad);
            aead::zeroize_key(&mut message_key);
            return plaintext;
        }

        let is_new_chain = self
            .dh_remote
            .map_or(true, |remote| !constant_time_eq(remote.as_bytes(), header.dh_public.as_bytes()));

        if is_new_chain {
            self.skip_message_keys(header.previous_chain_length)?;
            self.dh_ratchet_receive(&header.dh_public)?;
        } else if header.message_number < self.recv_count {
            return Err(Error::DuplicateMessage);
        }

        self.skip_message_keys(header.message_number)?;

        let chain_key = self
            .chain_key_recv
            .ok_or_else(|| Error::InvalidState("No receiving chain key".to_string()))?;
        let (new_chain_key, mut message_key) = kdf_ck(&chain_key)?;
        self.chain_key_recv = Some(new_chain_key);
        self.recv_count = self
            .recv_count
            .checked_add(1)
            .ok_or_else(|| Error::InvalidState("Receiving chain exhausted".to_string()))?;

        let plaintext = aead::decrypt(&message_key, &message.nonce, &message.ciphertext, &aad);
        aead::zeroize_key(&mut message_key);
        let plaintext = plaintext?;

        self.phase = RatchetPhase::Ready;
        Ok(plaintext)
    }

    /// Receiving half of a DH ratchet step
    fn dh_ratchet_receive(&mut self, their_dh_public: &X25519PublicKey) -> Result<()> {
        tracing::debug!(
            "DH ratchet step: closing sending chain after {} messages",
            self.send_count
        );

        self.previous_send_count = self.send_count;
        self.send_count = 0;
        self.recv_count = 0;
        self.dh_remote = Some(*their_dh_public);

        let dh_output = diffie_hellman(&self.dh_self.secret, their_dh_public)?;
        let (root_key, chain_key_recv) = kdf_rk(&self.root_key, dh_output.as_bytes())?;
        self.root_key = root_key;
        self.chain_key_recv = Some(chain_key_recv);

        self.dh_self = DhKeyPair::generate();
        self.chain_key_send = None;

        Ok(())
    }

    /// Sending half of a DH ratchet step, run on the first send after it.
    /// Returns the new (root key, sending chain key) for the caller to commit.
    fn sending_ratchet_keys(&self) -> Result<(Zeroizing<[u8; KEY_SIZE]>, Zeroizing<[u8; KEY_SIZE]>)> {
        let their_dh_public = self.dh_remote.ok_or_else(|| {
            Error::InvalidState("Cannot send before receiving the peer's first message".to_string())
        })?;

        let dh_output = diffie_hellman(&self.dh_self.secret, &their_dh_public)?;
        let (root_key, chain_key_send) = kdf_rk(&self.root_key, dh_output.as_bytes())?;
        Ok((Zeroizing::new(root_key), Zeroizing::new(chain_key_send)))
    }

    /// Derive and cache the keys of the current receiving chain up to `until`
    fn skip_message_keys(&mut self, until: u32) -> Result<()> {
        if self.recv_count.saturating_add(MAX_SKIP) < until {
            tracing::warn!(
                "Rejecting message {} with receive counter at {}",
                until,
                self.recv_count
            );
            return Err(Error::SkippedTooMany {
                requested: until - self.recv_count,
                limit: MAX_SKIP,
            });
        }

        let Some(mut chain_key) = self.chain_key_recv else {
            return Ok(());
        };
        if self.recv_count >= until {
            return Ok(());
        }

        let needed = until - self.recv_count;
        if self.skipped_keys.0.len() + needed as usize > MAX_SKIP as usize {
            tracing::warn!(
                "Skipped-key cache full: {} cached, {} more requested",
                self.skipped_keys.0.len(),
                needed
            );
            return Err(Error::SkippedTooMany {
                requested: needed,
                limit: MAX_SKIP,
            });
        }

        let dh_bytes = self
            .dh_remote
            .ok_or_else(|| Error::InvalidState("No remote DH key".to_string()))?
            .to_bytes();

        while self.recv_count < until {
            let (new_chain_key, message_key) = kdf_ck(&chain_key)?;
            chain_key = new_chain_key;
            self.skipped_keys
                .0
                .insert((dh_bytes, self.recv_count), message_key);
            self.recv_count += 1;
        }
        self.chain_key_recv = Some(chain_key);

        Ok(())
    }

    /// Export state for persistence. The result holds secret key material.
    pub fn export(&self) -> ExportedRatchetState {
        ExportedRatchetState {
            phase: self.phase,
            dh_secret: self.dh_self.secret.to_bytes(),
            dh_remote: self.dh_remote.map(|pk| pk.to_bytes()),
            root_key: self.root_key,
            chain_key_send: self.chain_key_send,
            chain_key_recv: self.chain_key_recv,
            send_count: self.send_count,
            recv_count: self.recv_count,
            previous_send_count: self.previous_send_count,
            skipped_keys: self.skipped_keys.0.clone(),
            associated_data: Vec::new(),
        }
    }

    /// Inverse of [`export`](Self::export); the snapshot is wiped as it drops
    pub fn import(mut exported: ExportedRatchetState) -> Self {
        Self {
            phase: exported.phase,
            dh_self: DhKeyPair::from_secret(X25519SecretKey::from(exported.dh_secret)),
            dh_remote: exported.dh_remote.map(X25519PublicKey::from),
            root_key: exported.root_key,
            chain_key_send: exported.chain_key_send,
            chain_key_recv: exported.chain_key_recv,
            send_count: exported.send_count,
            recv_count: exported.recv_count,
            previous_send_count: exported.previous_send_count,
            skipped_keys: SkippedKeys(std::mem::take(&mut exported.skipped_keys)),
        }
    }
}

/// Serializable ratchet snapshot
///
/// Contains every secret of the session; store it encrypted.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExportedRatchetState {
    pub phase: RatchetPhase,
    pub dh_secret: [u8; 32],
    pub dh_remote: Option<[u8; 32]>,
    pub root_key: [u8; 32],
    pub chain_key_send: Option<[u8; 32]>,
    pub chain_key_recv: Option<[u8; 32]>,
    pub send_count: u32,
    pub recv_count: u32,
    pub previous_send_count: u32,
    pub skipped_keys: HashMap<([u8; 32], u32), [u8; 32]>,
    /// Associated data for AEAD (identity keys), persisted for session restore
    #[serde(default)]
    pub associated_data: Vec<u8>,
}

impl Drop for ExportedRatchetState {
    fn drop(&mut self) {
        self.dh_secret.zeroize();
        self.root_key.zeroize();
        self.chain_key_send.zeroize();
        self.chain_key_recv.zeroize();
        for key in self.skipped_keys.values_mut() {
            key.zeroize();
        }
    }
}

/// One side of a Double Ratchet conversation
pub struct DoubleRatchet {
    state: RatchetState,
    /// Associated data for AEAD (identity keys from X3DH)
    associated_data: Vec<u8>,
}

impl DoubleRatchet {
    /// Initiator side: the first sending chain is derived immediately from
    /// the agreed secret and the responder's signed prekey.
    pub fn init_alice(
        shared_secret: &[u8; 32],
        remote_dh_public: &X25519PublicKey,
        associated_data: Vec<u8>,
    ) -> Result<Self> {
        let dh_self = DhKeyPair::generate();
        let dh_output = diffie_hellman(&dh_self.secret, remote_dh_public)?;
        let (root_key, chain_key_send) = kdf_rk(shared_secret, dh_output.as_bytes())?;

        let state = RatchetState {
            phase: RatchetPhase::AliceInitialized,
            dh_self,
            dh_remote: Some(*remote_dh_public),
            root_key,
            chain_key_send: Some(chain_key_send),
            chain_key_recv: None,
            send_count: 0,
            recv_count: 0,
            previous_send_count: 0,
            skipped_keys: SkippedKeys::default(),
        };

        Ok(Self {
            state,
            associated_data,
        })
    }

    /// Responder side: the agreed secret becomes the root key and the signed
    /// prekey secret the first ratchet key. Cannot send before it has received.
    pub fn init_bob(
        shared_secret: &[u8; 32],
        dh_secret: X25519SecretKey,
        associated_data: Vec<u8>,
    ) -> Self {
        let state = RatchetState {
            phase: RatchetPhase::BobInitialized,
            dh_self: DhKeyPair::from_secret(dh_secret),
            dh_remote: None,
            root_key: *shared_secret,
            chain_key_send: None,
            chain_key_recv: None,
            send_count: 0,
            recv_count: 0,
            previous_send_count: 0,
            skipped_keys: SkippedKeys::default(),
        };

        Self {
            state,
            associated_data,
        }
    }

    /// Rebuild from a snapshot; an empty `associated_data` keeps the stored one
    pub fn from_state(mut state: ExportedRatchetState, associated_data: Vec<u8>) -> Self {
        // An explicit AD wins over the one stored in the snapshot
        let ad = if associated_data.is_empty() {
            std::mem::take(&mut state.associated_data)
        } else {
            associated_data
        };
        Self {
            state: RatchetState::import(state),
            associated_data: ad,
        }
    }

    /// Snapshot including the associated data
    pub fn export_state(&self) -> ExportedRatchetState {
        let mut exported = self.state.export();
        exported.associated_data = self.associated_data.clone();
        exported
    }

    /// Encrypt a message
    ///
    /// Only the sending chain, Ns and the root key change, and only once the
    /// message is sealed; the skipped-key cache is never copied.
    pub fn encrypt(&mut self, plaintext: &[u8]) -> Result<EncryptedMessage> {
        self.state.encrypt(plaintext, &self.associated_data)
    }

    /// Decrypt a message
    ///
    /// On any error the ratchet state is left untouched.
    pub fn decrypt(&mut self, message: &EncryptedMessage) -> Result<Vec<u8>> {
        let mut staged = self.state.clone();
        let plaintext = staged.decrypt(message, &self.associated_data)?;
        self.state = staged;
        Ok(plaintext)
    }

    /// Current lifecycle phase
    pub fn phase(&self) -> RatchetPhase {
        self.state.phase
    }

    /// Our current ratchet public key
    pub fn dh_public(&self) -> X25519PublicKey {
        self.state.dh_self.public
    }

    /// Associated data bound into every message
    pub fn associated_data(&self) -> &[u8] {
        &self.associated_data
    }

    /// Messages sent on the current sending chain (Ns)
    pub fn send_count(&self) -> u32 {
        self.state.send_count
    }

    /// Messages received on the current receiving chain (Nr)
    pub fn recv_count(&self) -> u32 {
        self.state.recv_count
    }

    /// Length of the previous sending chain (Pn)
    pub fn previous_chain_length(&self) -> u32 {
        self.state.previous_send_count
    }

    /// Cached keys of messages not yet delivered
    pub fn skipped_keys_count(&self) -> usize {
        self.state.skipped_keys.0.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::keys::{IdentityKeyPair, OneTimePreKey, SignedPreKey};
    use crate::crypto::x3dh::{X3dhInitiator, X3dhResponder};

    fn conversation() -> (DoubleRatchet, DoubleRatchet) {
        let alice_identity = IdentityKeyPair::generate();
        let bob_identity = IdentityKeyPair::generate();

        let bob_spk = SignedPreKey::generate(1, &bob_identity);
        let bob_otpks = OneTimePreKey::generate_batch(0, 10);

        let mut responder = X3dhResponder::new(bob_identity, bob_spk.clone(), bob_otpks);
        let bundle = responder.get_prekey_bundle(Some(0));
        let (sk_a, initial) = X3dhInitiator::new(alice_identity).agree(&bundle).unwrap();
        let sk_b = responder.agree(&initial).unwrap();

        (
            DoubleRatchet::init_alice(sk_a.as_bytes(), &bundle.signed_prekey.public, sk_a.associated_data.clone())
                .unwrap(),
            DoubleRatchet::init_bob(sk_b.as_bytes(), bob_spk.secret().clone(), sk_b.associated_data.clone()),
        )
    }

    #[test]
    fn test_first_message_reaches_responder() {
        let (mut alice, mut bob) = conversation();

        let first = alice.encrypt(b"opening line").unwrap();
        assert_eq!(bob.decrypt(&first).unwrap(), b"opening line");
        assert_eq!(bob.phase(), RatchetPhase::Ready);
    }

    #[test]
    fn test_phases() {
        let (mut alice, mut bob) = conversation();
        assert_eq!(alice.phase(), RatchetPhase::AliceInitialized);
        assert_eq!(bob.phase(), RatchetPhase::BobInitialized);

        let m1 = alice.encrypt(b"1").unwrap();
        assert_eq!(alice.phase(), RatchetPhase::AliceInitialized);
        bob.decrypt(&m1).unwrap();

        let m2 = bob.encrypt(b"2").unwrap();
        alice.decrypt(&m2).unwrap();
        assert_eq!(alice.phase(), RatchetPhase::Ready);
    }

    #[test]
    fn test_bob_cannot_send_first() {
        let (_, mut bob) = conversation();

        assert!(matches!(bob.encrypt(b"too early"), Err(Error::InvalidState(_))));
        assert_eq!(bob.send_count(), 0);
    }

    #[test]
    fn test_message_numbers_follow_chain() {
        let (mut alice, mut bob) = conversation();

        for i in 0..10u32 {
            let body = i.to_be_bytes();
            let sent = alice.encrypt(&body).unwrap();
            assert_eq!(sent.header.message_number, i);
            assert_eq!(bob.decrypt(&sent).unwrap(), body);
        }
    }

    #[test]
    fn test_alternating_turns() {
        let (mut alice, mut bob) = conversation();

        for turn in 0..4u8 {
            let (from, to) = if turn % 2 == 0 { (&mut alice, &mut bob) } else { (&mut bob, &mut alice) };
            let sent = from.encrypt(&[turn; 3]).unwrap();
            assert_eq!(to.decrypt(&sent).unwrap(), [turn; 3]);
        }
    }

    #[test]
    fn test_counters_reset_on_dh_ratchet() {
        let (mut alice, mut bob) = conversation();

        for _ in 0..3 {
            let m = alice.encrypt(b"a").unwrap();
            bob.decrypt(&m).unwrap();
        }
        assert_eq!(alice.send_count(), 3);
        assert_eq!(bob.recv_count(), 3);

        let reply = bob.encrypt(b"b").unwrap();
        alice.decrypt(&reply).unwrap();

        // Alice's DH ratchet closed her 3-message sending chain
        assert_eq!(alice.send_count(), 0);
        assert_eq!(alice.recv_count(), 1);
        assert_eq!(alice.previous_chain_length(), 3);

        let next = alice.encrypt(b"c").unwrap();
        assert_eq!(next.header.previous_chain_length, 3);
        assert_eq!(next.header.message_number, 0);
        assert_ne!(next.header.dh_public.as_bytes(), reply.header.dh_public.as_bytes());
    }

    #[test]
    fn test_root_keys_match_after_round_trip() {
        let (mut alice, mut bob) = conversation();

        let hello = alice.encrypt(b"hello").unwrap();
        assert_eq!(bob.decrypt(&hello).unwrap(), b"hello");

        let hi = bob.encrypt(b"hi").unwrap();
        assert_eq!(alice.decrypt(&hi).unwrap(), b"hi");

        assert_eq!(alice.export_state().root_key, bob.export_state().root_key);
    }

    #[test]
    fn test_reordered_delivery_uses_cache() {
        let (mut alice, mut bob) = conversation();

        let sent: Vec<_> = [b"m0", b"m1", b"m2"].iter().map(|p| alice.encrypt(*p).unwrap()).collect();

        assert_eq!(bob.decrypt(&sent[2]).unwrap(), b"m2");
        assert_eq!(bob.skipped_keys_count(), 2);
        assert_eq!(bob.decrypt(&sent[0]).unwrap(), b"m0");
        assert_eq!(bob.decrypt(&sent[1]).unwrap(), b"m1");
        assert_eq!(bob.skipped_keys_count(), 0);
    }

    #[test]
    fn test_late_message_from_previous_chain() {
        let (mut alice, mut bob) = conversation();

        let early = alice.encrypt(b"early").unwrap();
        let late = alice.encrypt(b"late").unwrap();
        bob.decrypt(&early).unwrap();

        let reply = bob.encrypt(b"reply").unwrap();
        alice.decrypt(&reply).unwrap();

        // Alice's new chain announces Pn = 2, so Bob caches "late"
        let fresh = alice.encrypt(b"fresh").unwrap();
        assert_eq!(bob.decrypt(&fresh).unwrap(), b"fresh");
        assert_eq!(bob.skipped_keys_count(), 1);

        assert_eq!(bob.decrypt(&late).unwrap(), b"late");
        assert_eq!(bob.skipped_keys_count(), 0);
    }

    #[test]
    fn test_replay_rejected() {
        let (mut alice, mut bob) = conversation();

        let msg1 = alice.encrypt(b"once").unwrap();
        let msg2 = alice.encrypt(b"twice").unwrap();
        bob.decrypt(&msg1).unwrap();
        bob.decrypt(&msg2).unwrap();

        assert_eq!(bob.decrypt(&msg1), Err(Error::DuplicateMessage));
        assert_eq!(bob.decrypt(&msg2), Err(Error::DuplicateMessage));
    }

    #[test]
    fn test_replay_of_cached_key_rejected() {
        let (mut alice, mut bob) = conversation();

        let msg1 = alice.encrypt(b"first").unwrap();
        let msg2 = alice.encrypt(b"second").unwrap();

        bob.decrypt(&msg2).unwrap();
        bob.decrypt(&msg1).unwrap();

        // The cached key was consumed on first use
        assert_eq!(bob.decrypt(&msg1), Err(Error::DuplicateMessage));
    }

    #[test]
    fn test_skip_boundary_succeeds() {
        let (mut alice, mut bob) = conversation();

        let mut last = None;
        for _ in 0..=MAX_SKIP {
            last = Some(alice.encrypt(b"x").unwrap());
        }
        let last = last.unwrap();
        assert_eq!(last.header.message_number, MAX_SKIP);

        assert_eq!(bob.decrypt(&last).unwrap(), b"x");
        assert_eq!(bob.skipped_keys_count(), MAX_SKIP as usize);
    }

    #[test]
    fn test_skip_boundary_exceeded() {
        let (mut alice, mut bob) = conversation();

        let mut last = None;
        for _ in 0..=MAX_SKIP + 1 {
            last = Some(alice.encrypt(b"x").unwrap());
        }
        let last = last.unwrap();
        assert_eq!(last.header.message_number, MAX_SKIP + 1);

        let before = bob.export_state();
        assert_eq!(
            bob.decrypt(&last),
            Err(Error::SkippedTooMany {
                requested: MAX_SKIP + 1,
                limit: MAX_SKIP
            })
        );
        assert_eq!(bob.export_state(), before);
    }

    #[test]
    fn test_skipped_cache_is_bounded_across_chains() {
        let (mut alice, mut bob) = conversation();

        // Bob caches 600 keys of Alice's first chain
        let mut last = None;
        for _ in 0..601 {
            last = Some(alice.encrypt(b"a").unwrap());
        }
        bob.decrypt(&last.unwrap()).unwrap();
        assert_eq!(bob.skipped_keys_count(), 600);

        let reply = bob.encrypt(b"b").unwrap();
        alice.decrypt(&reply).unwrap();

        // A 500-message gap on the next chain would push the cache past the bound
        let mut last = None;
        for _ in 0..501 {
            last = Some(alice.encrypt(b"c").unwrap());
        }
        assert!(matches!(
            bob.decrypt(&last.unwrap()),
            Err(Error::SkippedTooMany { requested: 500, .. })
        ));
        assert_eq!(bob.skipped_keys_count(), 600);
    }

    #[test]
    fn test_cached_keys_narrow_skip_window() {
        let (mut alice, mut bob) = conversation();

        let messages: Vec<_> = (0..=MAX_SKIP + 2).map(|_| alice.encrypt(b"m").unwrap()).collect();

        // Message 0 stays cached while Nr moves to 2
        bob.decrypt(&messages[1]).unwrap();
        assert_eq!(bob.recv_count(), 2);
        assert_eq!(bob.skipped_keys_count(), 1);

        // Nr + MAX_SKIP is in range but the cache has no room left for the gap
        let far = &messages[(MAX_SKIP + 2) as usize];
        let before = bob.export_state();
        assert_eq!(
            bob.decrypt(far),
            Err(Error::SkippedTooMany {
                requested: MAX_SKIP,
                limit: MAX_SKIP
            })
        );
        assert_eq!(bob.export_state(), before);

        // Draining the cached key frees the slot
        bob.decrypt(&messages[0]).unwrap();
        assert_eq!(bob.decrypt(far).unwrap(), b"m");
        assert_eq!(bob.skipped_keys_count(), MAX_SKIP as usize);
    }

    #[test]
    fn test_failed_send_leaves_state_unchanged() {
        let (_, mut bob) = conversation();

        let before = bob.export_state();
        assert!(bob.encrypt(b"too early").is_err());
        assert_eq!(bob.export_state(), before);
    }

    #[test]
    fn test_tampered_message_leaves_state_unchanged() {
        let (mut alice, mut bob) = conversation();

        let first = alice.encrypt(b"first").unwrap();
        bob.decrypt(&first).unwrap();

        let genuine = alice.encrypt(b"Original").unwrap();
        let mut forged = genuine.clone();
        forged.ciphertext[0] ^= 0x01;

        let before = bob.export_state();
        assert_eq!(bob.decrypt(&forged), Err(Error::AuthenticationFailure));
        assert_eq!(bob.export_state(), before);

        assert_eq!(bob.decrypt(&genuine).unwrap(), b"Original");
    }

    #[test]
    fn test_tampered_first_message_does_not_ratchet() {
        let (mut alice, mut bob) = conversation();

        let genuine = alice.encrypt(b"hello").unwrap();
        let mut forged = genuine.clone();
        let last = forged.ciphertext.len() - 1;
        forged.ciphertext[last] ^= 0x80;

        let before = bob.export_state();
        assert_eq!(bob.decrypt(&forged), Err(Error::AuthenticationFailure));
        assert_eq!(bob.export_state(), before);
        assert_eq!(bob.phase(), RatchetPhase::BobInitialized);

        assert_eq!(bob.decrypt(&genuine).unwrap(), b"hello");
    }

    #[test]
    fn test_tampered_header_fails() {
        let (mut alice, mut bob) = conversation();

        let first = alice.encrypt(b"first").unwrap();
        bob.decrypt(&first).unwrap();

        let mut message = alice.encrypt(b"second").unwrap();
        message.header.previous_chain_length += 1;

        assert_eq!(bob.decrypt(&message), Err(Error::AuthenticationFailure));
    }

    #[test]
    fn test_stale_state_cannot_follow_ratchet() {
        let (mut alice, mut bob) = conversation();

        let m1 = alice.encrypt(b"m1").unwrap();
        bob.decrypt(&m1).unwrap();

        let stale = alice.export_state();

        let m2 = bob.encrypt(b"m2").unwrap();
        alice.decrypt(&m2).unwrap();
        let m3 = alice.encrypt(b"m3").unwrap();
        bob.decrypt(&m3).unwrap();
        let m4 = bob.encrypt(b"m4").unwrap();

        let mut old_alice = DoubleRatchet::from_state(stale, Vec::new());
        assert_eq!(old_alice.decrypt(&m4), Err(Error::AuthenticationFailure));

        assert_eq!(alice.decrypt(&m4).unwrap(), b"m4");
    }

    #[test]
    fn test_message_wire_round_trip() {
        let (mut alice, mut bob) = conversation();

        let message = alice.encrypt(b"Test message").unwrap();
        let restored = EncryptedMessage::from_bytes(&message.to_bytes()).unwrap();

        assert_eq!(bob.decrypt(&restored).unwrap(), b"Test message");
    }

    #[test]
    fn test_snapshot_survives_bincode() {
        let (mut alice, mut bob) = conversation();

        bob.decrypt(&alice.encrypt(b"before").unwrap()).unwrap();

        let exported = alice.export_state();
        let bytes = bincode::serialize(&exported).unwrap();
        let decoded: ExportedRatchetState = bincode::deserialize(&bytes).unwrap();
        assert_eq!(decoded, exported);

        let mut restored = DoubleRatchet::from_state(decoded, Vec::new());
        assert_eq!(restored.associated_data(), alice.associated_data());
        assert_eq!(bob.decrypt(&restored.encrypt(b"after").unwrap()).unwrap(), b"after");
    }

    #[test]
    fn test_repeated_plaintext_encrypts_differently() {
        let (mut alice, _) = conversation();

        let a = alice.encrypt(b"same").unwrap();
        let b = alice.encrypt(b"same").unwrap();
        assert_ne!(a.ciphertext, b.ciphertext);
    }
}
