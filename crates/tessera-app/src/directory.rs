//! Key directory collaborator
//!
//! The directory stores each user's published key material and hands out
//! prekey bundles to initiators. Remote implementations live outside this
//! crate; [`MemoryDirectory`] serves tests and the CLI demo.

use std::collections::hash_map::Entry;
use std::collections::{HashMap, VecDeque};

use async_trait::async_trait;
use tessera_core::crypto::keys::{
    IdentityPublicKey, KeyBundle, OneTimePreKeyPublic, PreKeyBundle, SignedPreKeyPublic,
};
use tokio::sync::Mutex;

use crate::error::{Error, Result};

#[async_trait]
pub trait Directory: Send + Sync {
    /// Publish or update a user's key material
    async fn publish(&self, user_id: &str, bundle: KeyBundle) -> Result<()>;

    /// Fetch a bundle for starting a conversation, consuming one one-time prekey
    async fn fetch_bundle(&self, user_id: &str) -> Result<PreKeyBundle>;

    /// Fetch a user's identity public key
    async fn fetch_identity(&self, user_id: &str) -> Result<IdentityPublicKey>;
}

struct PublishedKeys {
    identity: IdentityPublicKey,
    signed_prekey: SignedPreKeyPublic,
    one_time_prekeys: VecDeque<OneTimePreKeyPublic>,
}

/// In-process directory
#[derive(Default)]
pub struct MemoryDirectory {
    users: Mutex<HashMap<String, PublishedKeys>>,
}

impl MemoryDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of one-time prekeys still available for `user_id`
    pub async fn one_time_prekeys_available(&self, user_id: &str) -> usize {
        self.users
            .lock()
            .await
            .get(user_id)
            .map_or(0, |keys| keys.one_time_prekeys.len())
    }
}

#[async_trait]
impl Directory for MemoryDirectory {
    async fn publish(&self, user_id: &str, bundle: KeyBundle) -> Result<()> {
        bundle.verify()?;

        let mut users = self.users.lock().await;
        match users.entry(user_id.to_string()) {
            Entry::Occupied(mut entry) => {
                let keys = entry.get_mut();
                // Prekeys of a replaced identity can no longer be answered
                if keys.identity != bundle.identity {
                    tracing::info!("Identity for {} replaced, dropping old prekeys", user_id);
                    keys.one_time_prekeys.clear();
                }
                keys.identity = bundle.identity;
                keys.signed_prekey = bundle.signed_prekey;
                keys.one_time_prekeys.extend(bundle.one_time_prekeys);
            }
            Entry::Vacant(entry) => {
                entry.insert(PublishedKeys {
                    identity: bundle.identity,
                    signed_prekey: bundle.signed_prekey,
                    one_time_prekeys: bundle.one_time_prekeys.into(),
                });
            }
        }

        Ok(())
    }

    async fn fetch_bundle(&self, user_id: &str) -> Result<PreKeyBundle> {
        let mut users = self.users.lock().await;
        let keys = users
            .get_mut(user_id)
            .ok_or_else(|| Error::UserNotFound(user_id.to_string()))?;

        let one_time_prekey = keys.one_time_prekeys.pop_front();
        if one_time_prekey.is_none() {
            tracing::warn!("One-time prekey pool for {} is exhausted", user_id);
        }

        Ok(PreKeyBundle {
            identity: keys.identity.clone(),
            signed_prekey: keys.signed_prekey.clone(),
            one_time_prekey,
        })
    }

    async fn fetch_identity(&self, user_id: &str) -> Result<IdentityPublicKey> {
        self.users
            .lock()
            .await
            .get(user_id)
            .map(|keys| keys.identity.clone())
            .ok_or_else(|| Error::UserNotFound(user_id.to_string()))
    }
}
