//! Key hierarchy
//!
//! - Identity: long-term Ed25519 signing key plus X25519 agreement key
//! - Signed prekey: medium-term X25519 key, signed by the identity
//! - One-time prekeys: single-use X25519 keys, consumed by the first handshake
//!
//! Also holds the bundle types exchanged with the key directory.

use blake2::{Blake2s256, Digest};
use chrono::Utc;
use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use rand::rngs::OsRng;
use serde::{Deserialize, Serialize};
use x25519_dalek::{PublicKey as X25519PublicKey, SharedSecret, StaticSecret as X25519SecretKey};
use zeroize::{ZeroizeOnDrop, Zeroizing};

use super::constant_time_eq;
use crate::error::{Error, Result};

/// Identifier of a signed or one-time prekey
pub type PreKeyId = u32;

/// Length of an encoded identity, public or secret: Ed25519 half, then X25519 half
pub const IDENTITY_ENCODED_SIZE: usize = 64;

/// Domain separator of the signed prekey signature
const SIGNED_PREKEY_CONTEXT: &[u8] = b"Tessera_SPK_v1";

/// X25519 Diffie-Hellman that rejects non-contributory results
///
/// A low-order remote point makes the output all zeros regardless of our
/// secret, so such keys are treated as malformed.
pub fn diffie_hellman(secret: &X25519SecretKey, public: &X25519PublicKey) -> Result<SharedSecret> {
    let shared = secret.diffie_hellman(public);
    if !shared.was_contributory() {
        return Err(Error::Crypto("Non-contributory X25519 public key".to_string()));
    }
    Ok(shared)
}

fn fresh_secret() -> X25519SecretKey {
    X25519SecretKey::random_from_rng(OsRng)
}

/// Split a 64-byte identity encoding into its two 32-byte halves
fn split_identity(bytes: &[u8]) -> Result<([u8; 32], [u8; 32])> {
    if bytes.len() != IDENTITY_ENCODED_SIZE {
        return Err(Error::InvalidKeyLength {
            expected: IDENTITY_ENCODED_SIZE,
            actual: bytes.len(),
        });
    }
    let mut signing = [0u8; 32];
    let mut agreement = [0u8; 32];
    signing.copy_from_slice(&bytes[..32]);
    agreement.copy_from_slice(&bytes[32..]);
    Ok((signing, agreement))
}

/// Long-term identity key pair (both halves zeroize on drop)
#[derive(Clone)]
pub struct IdentityKeyPair {
    signing: SigningKey,
    agreement: X25519SecretKey,
}

impl IdentityKeyPair {
    pub fn generate() -> Self {
        Self {
            signing: SigningKey::generate(&mut OsRng),
            agreement: fresh_secret(),
        }
    }

    /// Restore from [`to_secret_bytes`](Self::to_secret_bytes) output
    pub fn from_secret_bytes(bytes: &[u8]) -> Result<Self> {
        let (signing, agreement) = split_identity(bytes)?;
        let signing = Zeroizing::new(signing);
        let agreement = Zeroizing::new(agreement);
        Ok(Self {
            signing: SigningKey::from_bytes(&signing),
            agreement: X25519SecretKey::from(*agreement),
        })
    }

    /// Secret encoding for external secure storage
    pub fn to_secret_bytes(&self) -> Zeroizing<[u8; IDENTITY_ENCODED_SIZE]> {
        let mut out = Zeroizing::new([0u8; IDENTITY_ENCODED_SIZE]);
        out[..32].copy_from_slice(self.signing.as_bytes());
        out[32..].copy_from_slice(self.agreement.as_bytes());
        out
    }

    pub fn public_key(&self) -> IdentityPublicKey {
        IdentityPublicKey {
            verifying: self.signing.verifying_key(),
            agreement: X25519PublicKey::from(&self.agreement),
        }
    }

    pub fn sign(&self, message: &[u8]) -> Signature {
        self.signing.sign(message)
    }

    /// X25519 half, used in the X3DH identity pairings
    pub fn dh_secret(&self) -> &X25519SecretKey {
        &self.agreement
    }
}

/// Public half of an identity
///
/// Equality is evaluated in constant time.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct IdentityPublicKey {
    #[serde(with = "raw_key")]
    verifying: VerifyingKey,
    #[serde(with = "raw_key")]
    agreement: X25519PublicKey,
}

impl PartialEq for IdentityPublicKey {
    fn eq(&self, other: &Self) -> bool {
        constant_time_eq(&self.to_bytes(), &other.to_bytes())
    }
}

impl Eq for IdentityPublicKey {}

impl IdentityPublicKey {
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        let (verifying, agreement) = split_identity(bytes)?;
        Ok(Self {
            verifying: VerifyingKey::from_bytes(&verifying).map_err(|e| Error::Crypto(e.to_string()))?,
            agreement: X25519PublicKey::from(agreement),
        })
    }

    pub fn to_bytes(&self) -> [u8; IDENTITY_ENCODED_SIZE] {
        let mut out = [0u8; IDENTITY_ENCODED_SIZE];
        out[..32].copy_from_slice(self.verifying.as_bytes());
        out[32..].copy_from_slice(self.agreement.as_bytes());
        out
    }

    pub fn verify(&self, message: &[u8], signature: &Signature) -> Result<()> {
        self.verifying
            .verify(message, signature)
            .map_err(|_| Error::SignatureVerification)
    }

    pub fn dh_public(&self) -> &X25519PublicKey {
        &self.agreement
    }

    pub fn verifying_key(&self) -> &VerifyingKey {
        &self.verifying
    }

    /// Short hex digest for out-of-band comparison (BLAKE2s, 16 bytes)
    pub fn fingerprint(&self) -> String {
        let digest = Blake2s256::digest(self.to_bytes());
        hex::encode(&digest[..16])
    }
}

/// Medium-term prekey, signed by the identity and rotated periodically
#[derive(Clone, ZeroizeOnDrop)]
pub struct SignedPreKey {
    #[zeroize(skip)]
    pub id: PreKeyId,
    secret: X25519SecretKey,
    #[zeroize(skip)]
    signature: Signature,
    /// Creation time, Unix seconds
    #[zeroize(skip)]
    pub created_at: i64,
}

impl SignedPreKey {
    pub fn generate(id: PreKeyId, identity: &IdentityKeyPair) -> Self {
        let secret = fresh_secret();
        let signature = identity.sign(&signed_prekey_message(id, &X25519PublicKey::from(&secret)));
        Self {
            id,
            secret,
            signature,
            created_at: Utc::now().timestamp(),
        }
    }

    pub fn public_key(&self) -> SignedPreKeyPublic {
        SignedPreKeyPublic {
            id: self.id,
            public: X25519PublicKey::from(&self.secret),
            signature: self.signature,
        }
    }

    pub fn secret(&self) -> &X25519SecretKey {
        &self.secret
    }

    /// Whether this key is older than `max_age_secs` at `now` (Unix seconds)
    pub fn is_expired(&self, now: i64, max_age_secs: i64) -> bool {
        now.saturating_sub(self.created_at) > max_age_secs
    }
}

/// `context || id (BE) || public key`; binding the id stops a key being
/// replayed under another id
fn signed_prekey_message(id: PreKeyId, public: &X25519PublicKey) -> Vec<u8> {
    [SIGNED_PREKEY_CONTEXT, &id.to_be_bytes()[..], &public.as_bytes()[..]].concat()
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SignedPreKeyPublic {
    pub id: PreKeyId,
    #[serde(with = "raw_key")]
    pub public: X25519PublicKey,
    #[serde(with = "raw_key")]
    pub signature: Signature,
}

impl SignedPreKeyPublic {
    /// Check the signature against the claimed owner
    pub fn verify(&self, owner: &IdentityPublicKey) -> Result<()> {
        owner.verify(&signed_prekey_message(self.id, &self.public), &self.signature)
    }
}

/// Single-use prekey; the owner deletes it after the first handshake
#[derive(Clone, ZeroizeOnDrop)]
pub struct OneTimePreKey {
    #[zeroize(skip)]
    pub id: PreKeyId,
    secret: X25519SecretKey,
}

impl OneTimePreKey {
    pub fn generate(id: PreKeyId) -> Self {
        Self {
            id,
            secret: fresh_secret(),
        }
    }

    /// `count` keys with consecutive ids starting at `first_id`
    pub fn generate_batch(first_id: PreKeyId, count: u32) -> Vec<Self> {
        (0..count)
            .map(|offset| Self::generate(first_id.wrapping_add(offset)))
            .collect()
    }

    pub fn public_key(&self) -> OneTimePreKeyPublic {
        OneTimePreKeyPublic {
            id: self.id,
            public: X25519PublicKey::from(&self.secret),
        }
    }

    pub fn secret(&self) -> &X25519SecretKey {
        &self.secret
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct OneTimePreKeyPublic {
    pub id: PreKeyId,
    #[serde(with = "raw_key")]
    pub public: X25519PublicKey,
}

/// Per-handshake key; zeroized when the handshake function returns
#[derive(ZeroizeOnDrop)]
pub struct EphemeralKeyPair(X25519SecretKey);

impl EphemeralKeyPair {
    pub fn generate() -> Self {
        Self(fresh_secret())
    }

    pub fn public_key(&self) -> X25519PublicKey {
        X25519PublicKey::from(&self.0)
    }

    pub fn secret(&self) -> &X25519SecretKey {
        &self.0
    }
}

/// Everything a user uploads to the directory
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct KeyBundle {
    pub identity: IdentityPublicKey,
    pub signed_prekey: SignedPreKeyPublic,
    pub one_time_prekeys: Vec<OneTimePreKeyPublic>,
}

impl KeyBundle {
    /// Collect the public halves of local key material
    pub fn new(identity: &IdentityKeyPair, signed_prekey: &SignedPreKey, one_time_prekeys: &[OneTimePreKey]) -> Self {
        Self {
            identity: identity.public_key(),
            signed_prekey: signed_prekey.public_key(),
            one_time_prekeys: one_time_prekeys.iter().map(OneTimePreKey::public_key).collect(),
        }
    }

    pub fn verify(&self) -> Result<()> {
        self.signed_prekey.verify(&self.identity)
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        bincode::serialize(self).map_err(|e| Error::Serialization(e.to_string()))
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        bincode::deserialize(bytes).map_err(|e| Error::Deserialization(e.to_string()))
    }
}

/// What an initiator receives: at most one one-time prekey
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PreKeyBundle {
    pub identity: IdentityPublicKey,
    pub signed_prekey: SignedPreKeyPublic,
    /// `None` once the owner's pool is exhausted
    pub one_time_prekey: Option<OneTimePreKeyPublic>,
}

impl PreKeyBundle {
    pub fn verify(&self) -> Result<()> {
        self.signed_prekey.verify(&self.identity)
    }
}

/// Serde adapter that stores dalek keys and signatures as raw bytes
pub(crate) mod raw_key {
    use serde::de::Error as _;
    use serde::{Deserialize, Deserializer, Serializer};

    pub trait RawKey: Sized {
        fn raw(&self) -> Vec<u8>;
        fn from_raw(raw: &[u8]) -> Option<Self>;
    }

    impl RawKey for x25519_dalek::PublicKey {
        fn raw(&self) -> Vec<u8> {
            self.as_bytes().to_vec()
        }

        fn from_raw(raw: &[u8]) -> Option<Self> {
            <[u8; 32]>::try_from(raw).ok().map(Self::from)
        }
    }

    impl RawKey for ed25519_dalek::VerifyingKey {
        fn raw(&self) -> Vec<u8> {
            self.as_bytes().to_vec()
        }

        fn from_raw(raw: &[u8]) -> Option<Self> {
            let bytes = <[u8; 32]>::try_from(raw).ok()?;
            Self::from_bytes(&bytes).ok()
        }
    }

    impl RawKey for ed25519_dalek::Signature {
        fn raw(&self) -> Vec<u8> {
            self.to_bytes().to_vec()
        }

        fn from_raw(raw: &[u8]) -> Option<Self> {
            Self::from_slice(raw).ok()
        }
    }

    pub fn serialize<K: RawKey, S: Serializer>(key: &K, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_bytes(&key.raw())
    }

    pub fn deserialize<'de, K: RawKey, D: Deserializer<'de>>(deserializer: D) -> Result<K, D::Error> {
        let raw = Vec::<u8>::deserialize(deserializer)?;
        K::from_raw(&raw).ok_or_else(|| D::Error::custom(format!("invalid {}-byte key encoding", raw.len())))
    }
}
