//! X3DH handshake
//!
//! Lets an initiator derive a session secret from a responder's published
//! prekey bundle while the responder is offline. The responder derives the
//! same secret later from the initiator's first message.
//!
//! Both roles are driven by [`DH_PAIRINGS`]: each entry names which key of the
//! initiator meets which key of the responder. The initiator uses the table
//! as-is; the responder reads each row mirrored. Because the rows are visited in
//! the same order on both sides, the concatenated DH outputs are byte-identical.

use serde::{Deserialize, Serialize};
use x25519_dalek::{PublicKey as X25519PublicKey, StaticSecret as X25519SecretKey};
use zeroize::{Zeroizing, ZeroizeOnDrop};

use super::kdf::{concat_keys, hkdf_sha256};
use super::keys::{
    diffie_hellman, raw_key, EphemeralKeyPair, IdentityKeyPair, IdentityPublicKey,
    OneTimePreKey, PreKeyBundle, PreKeyId, SignedPreKey,
};
use crate::error::{Error, Result};

/// Length of the agreed secret
pub const SHARED_SECRET_SIZE: usize = 32;

/// X3DH protocol info string
const X3DH_INFO: &[u8] = b"Tessera_X3DH_v1";

/// HKDF salt for the handshake
const X3DH_SALT: [u8; 32] = [0u8; 32];

/// Side of the handshake
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Role {
    /// Starts the conversation from a fetched bundle
    Initiator,
    /// Owner of the published bundle
    Responder,
}

/// A key taking part in one DH operation
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum KeySlot {
    Identity,
    Ephemeral,
    SignedPreKey,
    OneTimePreKey,
}

/// One DH operation: the initiator's key paired with the responder's key
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct DhPairing {
    pub initiator: KeySlot,
    pub responder: KeySlot,
}

impl DhPairing {
    /// (own slot, peer slot) as seen from `role`
    pub fn slots_for(&self, role: Role) -> (KeySlot, KeySlot) {
        match role {
            Role::Initiator => (self.initiator, self.responder),
            Role::Responder => (self.responder, self.initiator),
        }
    }

    fn uses_one_time_prekey(&self) -> bool {
        self.initiator == KeySlot::OneTimePreKey || self.responder == KeySlot::OneTimePreKey
    }
}

/// DH1..DH4 in concatenation order
pub const DH_PAIRINGS: [DhPairing; 4] = [
    // DH1 = DH(IK_A, SPK_B)
    DhPairing {
        initiator: KeySlot::Identity,
        responder: KeySlot::SignedPreKey,
    },
    // DH2 = DH(EK_A, IK_B)
    DhPairing {
        initiator: KeySlot::Ephemeral,
        responder: KeySlot::Identity,
    },
    // DH3 = DH(EK_A, SPK_B)
    DhPairing {
        initiator: KeySlot::Ephemeral,
        responder: KeySlot::SignedPreKey,
    },
    // DH4 = DH(EK_A, OPK_B), only when a one-time pre-key is in play
    DhPairing {
        initiator: KeySlot::Ephemeral,
        responder: KeySlot::OneTimePreKey,
    },
];

/// Secret keys one party contributes to the handshake
#[derive(Default)]
pub struct LocalKeys<'a> {
    pub identity: Option<&'a X25519SecretKey>,
    pub ephemeral: Option<&'a X25519SecretKey>,
    pub signed_prekey: Option<&'a X25519SecretKey>,
    pub one_time_prekey: Option<&'a X25519SecretKey>,
}

impl LocalKeys<'_> {
    fn get(&self, slot: KeySlot) -> Option<&X25519SecretKey> {
        match slot {
            KeySlot::Identity => self.identity,
            KeySlot::Ephemeral => self.ephemeral,
            KeySlot::SignedPreKey => self.signed_prekey,
            KeySlot::OneTimePreKey => self.one_time_prekey,
        }
    }
}

/// Public keys of the other party
#[derive(Default)]
pub struct RemoteKeys<'a> {
    pub identity: Option<&'a X25519PublicKey>,
    pub ephemeral: Option<&'a X25519PublicKey>,
    pub signed_prekey: Option<&'a X25519PublicKey>,
    pub one_time_prekey: Option<&'a X25519PublicKey>,
}

impl RemoteKeys<'_> {
    fn get(&self, slot: KeySlot) -> Option<&X25519PublicKey> {
        match slot {
            KeySlot::Identity => self.identity,
            KeySlot::Ephemeral => self.ephemeral,
            KeySlot::SignedPreKey => self.signed_prekey,
            KeySlot::OneTimePreKey => self.one_time_prekey,
        }
    }
}

/// Run every pairing of [`DH_PAIRINGS`] for `role` and derive the shared secret
///
/// The one-time pre-key row is skipped when neither side holds a one-time
/// pre-key; any other missing key is an error.
pub fn agree_with_table(
    role: Role,
    local: &LocalKeys<'_>,
    remote: &RemoteKeys<'_>,
) -> Result<[u8; SHARED_SECRET_SIZE]> {
    let one_time_in_play = local.one_time_prekey.is_some() || remote.one_time_prekey.is_some();
    let mut dh_outputs = Zeroizing::new(Vec::with_capacity(32 * DH_PAIRINGS.len()));

    for pairing in DH_PAIRINGS {
        if pairing.uses_one_time_prekey() && !one_time_in_play {
            continue;
        }

        let (own_slot, peer_slot) = pairing.slots_for(role);
        let secret = local
            .get(own_slot)
            .ok_or_else(|| Error::Crypto(format!("Missing local {own_slot:?} key for X3DH")))?;
        let public = remote
            .get(peer_slot)
            .ok_or_else(|| Error::Crypto(format!("Missing remote {peer_slot:?} key for X3DH")))?;

        let shared = diffie_hellman(secret, public)?;
        dh_outputs.extend_from_slice(shared.as_bytes());
    }

    let mut secret = [0u8; SHARED_SECRET_SIZE];
    hkdf_sha256(&X3DH_SALT, &dh_outputs, X3DH_INFO, &mut secret)?;
    Ok(secret)
}

/// Agreed secret plus the associated data both ratchets bind into every message
#[derive(ZeroizeOnDrop)]
pub struct X3dhSharedSecret {
    secret: [u8; SHARED_SECRET_SIZE],
    /// Associated data for the session: IK_A || IK_B (DH public keys)
    #[zeroize(skip)]
    pub associated_data: Vec<u8>,
}

impl X3dhSharedSecret {
    pub fn as_bytes(&self) -> &[u8; SHARED_SECRET_SIZE] {
        &self.secret
    }
}

/// First message of a conversation, sent alongside the first ciphertext
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct X3dhInitialMessage {
    /// Who is starting the conversation
    pub identity_key: IdentityPublicKey,
    /// Fresh key for this handshake only
    #[serde(with = "raw_key")]
    pub ephemeral_key: X25519PublicKey,
    /// Which signed prekey of the responder was used
    pub signed_prekey_id: PreKeyId,
    /// Which one-time prekey was used; `None` for a three-DH handshake
    pub one_time_prekey_id: Option<PreKeyId>,
}

impl X3dhInitialMessage {
    /// Serialize to bytes
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        bincode::serialize(self).map_err(|e| Error::Serialization(e.to_string()))
    }

    /// Deserialize from bytes
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        bincode::deserialize(bytes).map_err(|e| Error::Deserialization(e.to_string()))
    }
}

/// Starts conversations from fetched bundles
pub struct X3dhInitiator {
    identity: IdentityKeyPair,
}

impl X3dhInitiator {
    pub fn new(identity: IdentityKeyPair) -> Self {
        Self { identity }
    }

    /// Verify `peer_bundle` and run the initiator half of the handshake
    ///
    /// The ephemeral private key is dropped (and zeroized) before returning.
    pub fn agree(&self, peer_bundle: &PreKeyBundle) -> Result<(X3dhSharedSecret, X3dhInitialMessage)> {
        peer_bundle.verify()?;

        let ephemeral = EphemeralKeyPair::generate();

        let local = LocalKeys {
            identity: Some(self.identity.dh_secret()),
            ephemeral: Some(ephemeral.secret()),
            ..LocalKeys::default()
        };
        let remote = RemoteKeys {
            identity: Some(peer_bundle.identity.dh_public()),
            signed_prekey: Some(&peer_bundle.signed_prekey.public),
            one_time_prekey: peer_bundle.one_time_prekey.as_ref().map(|k| &k.public),
            ..RemoteKeys::default()
        };

        let secret = agree_with_table(Role::Initiator, &local, &remote)?;

        let own_identity = self.identity.public_key();
        let associated_data = concat_keys(&[
            own_identity.dh_public().as_bytes(),
            peer_bundle.identity.dh_public().as_bytes(),
        ]);

        let initial_message = X3dhInitialMessage {
            identity_key: own_identity,
            ephemeral_key: ephemeral.public_key(),
            signed_prekey_id: peer_bundle.signed_prekey.id,
            one_time_prekey_id: peer_bundle.one_time_prekey.as_ref().map(|k| k.id),
        };

        Ok((
            X3dhSharedSecret {
                secret,
                associated_data,
            },
            initial_message,
        ))
    }
}

/// Holds the secrets behind one published bundle
pub struct X3dhResponder {
    identity: IdentityKeyPair,
    signed_prekey: SignedPreKey,
    one_time_prekeys: Vec<OneTimePreKey>,
}

impl X3dhResponder {
    pub fn new(
        identity: IdentityKeyPair,
        signed_prekey: SignedPreKey,
        one_time_prekeys: Vec<OneTimePreKey>,
    ) -> Self {
        Self {
            identity,
            signed_prekey,
            one_time_prekeys,
        }
    }

    /// Process an initial message and derive the shared secret
    ///
    /// If a one-time pre-key was used, it is removed from this responder and
    /// cannot be used again.
    pub fn agree(&mut self, initial_message: &X3dhInitialMessage) -> Result<X3dhSharedSecret> {
        if initial_message.signed_prekey_id != self.signed_prekey.id {
            return Err(Error::UnknownPreKey(initial_message.signed_prekey_id));
        }

        let one_time_prekey = match initial_message.one_time_prekey_id {
            Some(id) => {
                let idx = self
                    .one_time_prekeys
                    .iter()
                    .position(|k| k.id == id)
                    .ok_or(Error::UnknownPreKey(id))?;
                Some(self.one_time_prekeys.remove(idx))
            }
            None => None,
        };

        let local = LocalKeys {
            identity: Some(self.identity.dh_secret()),
            signed_prekey: Some(self.signed_prekey.secret()),
            one_time_prekey: one_time_prekey.as_ref().map(OneTimePreKey::secret),
            ..LocalKeys::default()
        };
        let remote = RemoteKeys {
            identity: Some(initial_message.identity_key.dh_public()),
            ephemeral: Some(&initial_message.ephemeral_key),
            ..RemoteKeys::default()
        };

        let secret = agree_with_table(Role::Responder, &local, &remote)?;

        let associated_data = concat_keys(&[
            initial_message.identity_key.dh_public().as_bytes(),
            self.identity.public_key().dh_public().as_bytes(),
        ]);

        Ok(X3dhSharedSecret {
            secret,
            associated_data,
        })
    }

    /// Public bundle offering the one-time prekey at `one_time_prekey_idx`
    pub fn get_prekey_bundle(&self, one_time_prekey_idx: Option<usize>) -> PreKeyBundle {
        let one_time_prekey = one_time_prekey_idx
            .and_then(|idx| self.one_time_prekeys.get(idx))
            .map(OneTimePreKey::public_key);

        PreKeyBundle {
            identity: self.identity.public_key(),
            signed_prekey: self.signed_prekey.public_key(),
            one_time_prekey,
        }
    }

    /// One-time prekeys not yet consumed
    pub fn remaining_one_time_prekeys(&self) -> usize {
        self.one_time_prekeys.len()
    }
}
