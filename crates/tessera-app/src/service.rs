//! Key management service - owns a user's key material and conversations

use std::collections::hash_map::Entry;
use std::collections::{BTreeMap, HashMap};
use std::future::Future;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio::sync::{Mutex, RwLock};

use tessera_core::crypto::{
    keys::{IdentityKeyPair, IdentityPublicKey, KeyBundle, OneTimePreKey, PreKeyId, SignedPreKey},
    ratchet::DoubleRatchet,
    x3dh::{X3dhInitialMessage, X3dhInitiator, X3dhResponder},
};
use tessera_core::protocol::{ConversationId, ConversationSession, EncryptedMessage, ExportedSession};

use crate::config::KeyManagerConfig;
use crate::directory::Directory;
use crate::error::{Error, Result};

type SessionHandle = Arc<Mutex<ConversationSession>>;

/// Long-lived key material, present once initialized
struct KeyMaterial {
    identity: IdentityKeyPair,
    signed_prekey: SignedPreKey,
    /// Kept after rotation so handshakes already in flight still complete
    previous_signed_prekey: Option<SignedPreKey>,
}

impl KeyMaterial {
    fn signed_prekey(&self, id: PreKeyId) -> Option<&SignedPreKey> {
        if self.signed_prekey.id == id {
            return Some(&self.signed_prekey);
        }
        self.previous_signed_prekey.as_ref().filter(|spk| spk.id == id)
    }
}

/// Local one-time prekey pool
#[derive(Default)]
struct PreKeyPool {
    keys: BTreeMap<PreKeyId, OneTimePreKey>,
    next_id: PreKeyId,
}

impl PreKeyPool {
    /// Generate `count` fresh keys, insert them and return their publics
    fn generate(&mut self, count: u32) -> Vec<OneTimePreKey> {
        let batch = OneTimePreKey::generate_batch(self.next_id, count);
        self.next_id = self.next_id.wrapping_add(count);
        for key in &batch {
            self.keys.insert(key.id, key.clone());
        }
        batch
    }
}

/// What the initiator needs after starting a conversation
#[derive(Clone, Debug)]
pub struct ConversationStart {
    pub conversation_id: ConversationId,
    /// Must reach the peer together with (or before) the first message
    pub initial_message: X3dhInitialMessage,
}

/// Manages one user's identity, prekeys and conversation sessions
pub struct KeyManagementService {
    user_id: String,
    directory: Arc<dyn Directory>,
    config: KeyManagerConfig,
    keys: RwLock<Option<KeyMaterial>>,
    one_time_prekeys: Mutex<PreKeyPool>,
    sessions: RwLock<HashMap<ConversationId, SessionHandle>>,
}

impl KeyManagementService {
    pub fn new(user_id: impl Into<String>, directory: Arc<dyn Directory>, config: KeyManagerConfig) -> Self {
        Self {
            user_id: user_id.into(),
            directory,
            config,
            keys: RwLock::new(None),
            one_time_prekeys: Mutex::new(PreKeyPool::default()),
            sessions: RwLock::new(HashMap::new()),
        }
    }

    pub fn user_id(&self) -> &str {
        &self.user_id
    }

    pub fn config(&self) -> &KeyManagerConfig {
        &self.config
    }

    /// Run a directory call under the configured timeout
    async fn directory_call<T>(&self, call: impl Future<Output = Result<T>>) -> Result<T> {
        let limit = self.config.directory_timeout;
        tokio::time::timeout(limit, call)
            .await
            .map_err(|_| Error::Timeout(limit))?
    }

    /// Generate identity and prekeys and publish them
    ///
    /// Returns the identity fingerprint.
    pub async fn initialize(&self) -> Result<String> {
        let mut keys = self.keys.write().await;
        if keys.is_some() {
            return Err(Error::AlreadyInitialized);
        }

        let identity = IdentityKeyPair::generate();
        let signed_prekey = SignedPreKey::generate(1, &identity);

        let mut pool = self.one_time_prekeys.lock().await;
        let mut staged = PreKeyPool {
            keys: BTreeMap::new(),
            next_id: 1,
        };
        let batch = staged.generate(self.config.one_time_prekey_count);

        let bundle = KeyBundle::new(&identity, &signed_prekey, &batch);
        self.directory_call(self.directory.publish(&self.user_id, bundle))
            .await?;

        let fingerprint = identity.public_key().fingerprint();
        *pool = staged;
        *keys = Some(KeyMaterial {
            identity,
            signed_prekey,
            previous_signed_prekey: None,
        });

        tracing::info!(
            "Initialized {} ({}) with {} one-time prekeys",
            self.user_id,
            fingerprint,
            self.config.one_time_prekey_count
        );
        Ok(fingerprint)
    }

    pub async fn is_initialized(&self) -> bool {
        self.keys.read().await.is_some()
    }

    /// Our identity public key
    pub async fn identity_public_key(&self) -> Result<IdentityPublicKey> {
        let keys = self.keys.read().await;
        let keys = keys.as_ref().ok_or(Error::NotInitialized)?;
        Ok(keys.identity.public_key())
    }

    /// Get our identity fingerprint
    pub async fn fingerprint(&self) -> Result<String> {
        Ok(self.identity_public_key().await?.fingerprint())
    }

    /// Start a conversation with `peer_id` as the initiator
    pub async fn start_conversation(&self, peer_id: &str) -> Result<ConversationStart> {
        let identity = {
            let keys = self.keys.read().await;
            keys.as_ref().ok_or(Error::NotInitialized)?.identity.clone()
        };

        let bundle = self
            .directory_call(self.directory.fetch_bundle(peer_id))
            .await?;
        if bundle.one_time_prekey.is_none() {
            tracing::warn!("No one-time prekey available for {}, using 3-DH handshake", peer_id);
        }

        let (shared_secret, initial_message) = X3dhInitiator::new(identity).agree(&bundle)?;
        let ratchet = DoubleRatchet::init_alice(
            shared_secret.as_bytes(),
            &bundle.signed_prekey.public,
            shared_secret.associated_data.clone(),
        )?;

        let session = ConversationSession::new_initiator(
            peer_id.to_string(),
            bundle.identity,
            ratchet,
            initial_message.clone(),
        );
        let conversation_id = self.register(session).await;

        tracing::info!("Started conversation {} with {}", conversation_id, peer_id);
        Ok(ConversationStart {
            conversation_id,
            initial_message,
        })
    }

    /// Accept a conversation started by `sender_id`
    pub async fn accept_conversation(
        &self,
        sender_id: &str,
        initial_message: &X3dhInitialMessage,
    ) -> Result<ConversationId> {
        if !self.is_initialized().await {
            return Err(Error::NotInitialized);
        }

        let known_identity = self
            .directory_call(self.directory.fetch_identity(sender_id))
            .await?;
        if known_identity != initial_message.identity_key {
            tracing::warn!("Initial message from {} carries an unexpected identity key", sender_id);
            return Err(Error::IdentityMismatch(sender_id.to_string()));
        }

        let (identity, signed_prekey) = {
            let keys = self.keys.read().await;
            let keys = keys.as_ref().ok_or(Error::NotInitialized)?;
            let signed_prekey = keys
                .signed_prekey(initial_message.signed_prekey_id)
                .ok_or(tessera_core::Error::UnknownPreKey(initial_message.signed_prekey_id))?;
            (keys.identity.clone(), signed_prekey.clone())
        };

        let one_time_prekeys = match initial_message.one_time_prekey_id {
            Some(id) => {
                // Removal happens under one lock acquisition, so a key is consumed at most once
                let key = self
                    .one_time_prekeys
                    .lock()
                    .await
                    .keys
                    .remove(&id)
                    .ok_or(tessera_core::Error::UnknownPreKey(id))?;
                vec![key]
            }
            None => Vec::new(),
        };

        let ratchet_secret = signed_prekey.secret().clone();
        let mut responder = X3dhResponder::new(identity, signed_prekey, one_time_prekeys);
        let shared_secret = responder.agree(initial_message)?;
        let ratchet = DoubleRatchet::init_bob(
            shared_secret.as_bytes(),
            ratchet_secret,
            shared_secret.associated_data.clone(),
        );

        let session = ConversationSession::new_responder(
            sender_id.to_string(),
            initial_message.identity_key.clone(),
            ratchet,
        );
        let conversation_id = self.register(session).await;

        tracing::info!("Accepted conversation {} from {}", conversation_id, sender_id);
        Ok(conversation_id)
    }

    async fn register(&self, session: ConversationSession) -> ConversationId {
        let id = session.id();
        self.sessions
            .write()
            .await
            .insert(id, Arc::new(Mutex::new(session)));
        id
    }

    async fn session(&self, id: ConversationId) -> Result<SessionHandle> {
        self.sessions
            .read()
            .await
            .get(&id)
            .cloned()
            .ok_or(Error::SessionNotFound(id))
    }

    /// Encrypt a message in a conversation
    pub async fn encrypt_message(&self, id: ConversationId, plaintext: &[u8]) -> Result<EncryptedMessage> {
        let session = self.session(id).await?;
        let mut session = session.lock().await;
        if !session.is_active() {
            return Err(Error::SessionClosed(id));
        }

        let message = session.encrypt(plaintext)?;
        tracing::debug!(
            "Encrypted message {} in conversation {}",
            message.header.message_number,
            id
        );
        Ok(message)
    }

    /// Decrypt a message in a conversation
    pub async fn decrypt_message(&self, id: ConversationId, message: &EncryptedMessage) -> Result<Vec<u8>> {
        let session = self.session(id).await?;
        let mut session = session.lock().await;
        if !session.is_active() {
            return Err(Error::SessionClosed(id));
        }

        match session.decrypt(message) {
            Ok(plaintext) => Ok(plaintext),
            Err(e) => {
                tracing::warn!("Rejected message in conversation {}: {}", id, e);
                Err(e.into())
            }
        }
    }

    /// Close a conversation; it is evicted on the next cleanup
    pub async fn close_conversation(&self, id: ConversationId) -> Result<()> {
        let session = self.session(id).await?;
        session.lock().await.close();
        tracing::info!("Closed conversation {}", id);
        Ok(())
    }

    pub async fn has_session(&self, id: ConversationId) -> bool {
        self.sessions.read().await.contains_key(&id)
    }

    pub async fn session_count(&self) -> usize {
        self.sessions.read().await.len()
    }

    /// Evict closed sessions and sessions idle for longer than the configured limit
    pub async fn cleanup_old_sessions(&self) -> usize {
        self.cleanup_old_sessions_at(Utc::now()).await
    }

    /// [`cleanup_old_sessions`](Self::cleanup_old_sessions) with an explicit clock
    pub async fn cleanup_old_sessions_at(&self, now: DateTime<Utc>) -> usize {
        let max_idle = self.config.session_max_idle_delta();
        let mut sessions = self.sessions.write().await;

        let mut stale = Vec::new();
        for (id, session) in sessions.iter() {
            let session = session.lock().await;
            if !session.is_active() || session.is_idle(now, max_idle) {
                stale.push(*id);
            }
        }

        for id in &stale {
            sessions.remove(id);
        }
        if !stale.is_empty() {
            tracing::info!("Evicted {} stale sessions", stale.len());
        }
        stale.len()
    }

    /// Export a session for persistence. Contains secret key material.
    pub async fn export_session(&self, id: ConversationId) -> Result<ExportedSession> {
        let session = self.session(id).await?;
        let exported = session.lock().await.export();
        Ok(exported)
    }

    /// Register a previously exported session under its original handle
    ///
    /// A handle that is still registered is never replaced: an older snapshot
    /// would bring back message keys the live session has already used.
    pub async fn restore_session(&self, exported: ExportedSession) -> Result<ConversationId> {
        let id = exported.id;
        match self.sessions.write().await.entry(id) {
            Entry::Occupied(_) => {
                tracing::warn!("Refusing to restore over live conversation {}", id);
                Err(Error::SessionExists(id))
            }
            Entry::Vacant(slot) => {
                slot.insert(Arc::new(Mutex::new(ConversationSession::restore(exported))));
                tracing::debug!("Restored conversation {}", id);
                Ok(id)
            }
        }
    }

    /// Number of unused one-time prekeys held locally
    pub async fn one_time_prekey_count(&self) -> usize {
        self.one_time_prekeys.lock().await.keys.len()
    }

    /// Top the one-time prekey pool back up once it falls below the refill threshold
    ///
    /// Returns the number of keys published.
    pub async fn replenish_one_time_prekeys(&self) -> Result<u32> {
        let keys = self.keys.read().await;
        let keys = keys.as_ref().ok_or(Error::NotInitialized)?;

        let mut pool = self.one_time_prekeys.lock().await;
        let available = u32::try_from(pool.keys.len()).unwrap_or(u32::MAX);
        if available >= self.config.prekey_refill_threshold {
            return Ok(0);
        }

        let count = self.config.one_time_prekey_count.saturating_sub(available);
        let mut staged = PreKeyPool {
            keys: BTreeMap::new(),
            next_id: pool.next_id,
        };
        let batch = staged.generate(count);

        let bundle = KeyBundle::new(&keys.identity, &keys.signed_prekey, &batch);
        self.directory_call(self.directory.publish(&self.user_id, bundle))
            .await?;

        pool.next_id = staged.next_id;
        pool.keys.append(&mut staged.keys);

        tracing::info!("Published {} new one-time prekeys for {}", count, self.user_id);
        Ok(count)
    }

    /// Whether the current signed prekey is older than the configured lifetime
    pub async fn signed_prekey_needs_rotation(&self, now: DateTime<Utc>) -> Result<bool> {
        let keys = self.keys.read().await;
        let keys = keys.as_ref().ok_or(Error::NotInitialized)?;
        Ok(keys
            .signed_prekey
            .is_expired(now.timestamp(), self.config.signed_prekey_max_age_secs()))
    }

    /// Replace the signed prekey and publish it
    ///
    /// The replaced key stays usable for handshakes that reference it until
    /// the next rotation. Returns the new key id.
    pub async fn rotate_signed_prekey(&self) -> Result<PreKeyId> {
        let mut keys = self.keys.write().await;
        let keys = keys.as_mut().ok_or(Error::NotInitialized)?;

        let id = keys.signed_prekey.id.wrapping_add(1);
        let signed_prekey = SignedPreKey::generate(id, &keys.identity);

        let bundle = KeyBundle::new(&keys.identity, &signed_prekey, &[]);
        self.directory_call(self.directory.publish(&self.user_id, bundle))
            .await?;

        let previous = std::mem::replace(&mut keys.signed_prekey, signed_prekey);
        keys.previous_signed_prekey = Some(previous);

        tracing::info!("Rotated signed prekey for {} to id {}", self.user_id, id);
        Ok(id)
    }
}
