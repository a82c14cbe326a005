//! CryptoService - High-level encryption API
//!
//! Owns the local key bundle and every live ratchet for one account, and
//! writes their encrypted stores through a caller-supplied [`BlobStore`]
//! after each mutating call. There is no process-wide state: a binding
//! layer keeps one service per account.
//!
//! Mutations run on a copy of the bundle or ratchet. The copy replaces the
//! live value only once its store has been written, so a failed call leaves
//! memory and storage as they were.
//!
//! Lock order is `ratchets` before `bundle`, then a single ratchet.
//!
//! ## Example
//!
//! ```rust,ignore
//! use lidx_core::{CryptoConfig, CryptoService, MemoryBlobStore};
//!
//! let service =
//!     CryptoService::initialize(MemoryBlobStore::new(), b"1234", CryptoConfig::default())?;
//! service.generate_internal_key_bundle().await?;
//!
//! // Publish our bundle, start a session against a peer's bundle
//! let ours = service.populate_external_key_bundle().await?;
//! let handshake = service.init_ratchet_from_internal(&peer_bundle_json).await?;
//!
//! // Encrypt a message
//! let dto = service.send_message(&handshake.ratchet_id, false, "Hello!").await?;
//!
//! // Decrypt a message
//! let payload = service.receive_message(&incoming_json).await?;
//! ```

use std::collections::HashMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex, RwLock};

use crate::config::CryptoConfig;
use crate::crypto::encoding;
use crate::crypto::errors::{CryptoError, CryptoResult};
use crate::crypto::message::{Message, MessageDto, PlainPayload};
use crate::crypto::prekeys::{InternalKeyBundle, InternalKeyBundleStore, PreKeyStatus};
use crate::crypto::ratchet::{Ratchet, RatchetStore, SessionStats};
use crate::crypto::sessions::{BlobStore, SessionStore};
use crate::crypto::x3dh::{ExternalKeyBundle, ExternalKeyBundleDto, SessionHandshake};

/// Shared secret for a call, derived like a chat session's root key
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VoipSession {
    /// base64url root key
    pub session_common_secret_key: String,
    /// Initiator's ephemeral public key (initiator side only)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ephemeral_key: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub one_time_key_id: Option<String>,
}

/// High-level encryption service
///
/// Each ratchet sits behind its own lock, so distinct sessions proceed
/// concurrently while calls on one session are serialized.
pub struct CryptoService<B: BlobStore> {
    /// The local key bundle, absent until generated or loaded
    bundle: RwLock<Option<InternalKeyBundle>>,
    /// Live ratchets (session id -> ratchet)
    ratchets: RwLock<HashMap<String, Arc<Mutex<Ratchet>>>>,
    store: SessionStore<B>,
    config: CryptoConfig,
}

impl<B: BlobStore> CryptoService<B> {
    /// Initialize the crypto service
    ///
    /// Loads the stored key bundle and every stored ratchet, if any.
    pub fn initialize(blobs: B, passphrase: &[u8], config: CryptoConfig) -> CryptoResult<Self> {
        config.validate()?;
        let store = SessionStore::new(blobs, passphrase);

        let bundle = store.load_account(config.prekeys.clone())?;
        match bundle {
            Some(ref bundle) => {
                tracing::info!("Loaded existing key bundle {}", bundle.fingerprint()?)
            }
            None => tracing::info!("No stored key bundle"),
        }

        let mut ratchets = HashMap::new();
        for id in store.list_ratchets()? {
            if let Some(ratchet) = store.load_ratchet(&id, config.ratchet.clone())? {
                ratchets.insert(id, Arc::new(Mutex::new(ratchet)));
            }
        }
        tracing::debug!("Loaded {} stored ratchets", ratchets.len());

        Ok(Self {
            bundle: RwLock::new(bundle),
            ratchets: RwLock::new(ratchets),
            store,
            config,
        })
    }

    pub fn config(&self) -> &CryptoConfig {
        &self.config
    }

    /// Create and persist a fresh key bundle, replacing any existing one
    ///
    /// Returns the identity fingerprint.
    pub async fn generate_internal_key_bundle(&self) -> CryptoResult<String> {
        let bundle = InternalKeyBundle::with_config(self.config.prekeys.clone());
        let fingerprint = bundle.fingerprint()?;
        self.store.save_account(&bundle)?;

        *self.bundle.write().await = Some(bundle);
        tracing::info!("Generated key bundle {}", fingerprint);
        Ok(fingerprint)
    }

    /// Replace the key bundle with one from a JSON store
    pub async fn load_internal_key(&self, store_json: &str) -> CryptoResult<String> {
        let store = InternalKeyBundleStore::from_json(store_json)?;
        let bundle = InternalKeyBundle::load_with_config(
            &store,
            self.store.passphrase(),
            self.config.prekeys.clone(),
        )?;
        let fingerprint = bundle.fingerprint()?;
        self.store.save_account(&bundle)?;

        *self.bundle.write().await = Some(bundle);
        tracing::info!("Loaded key bundle {}", fingerprint);
        Ok(fingerprint)
    }

    /// Export the key bundle as its encrypted store
    pub async fn save_internal_key(&self) -> CryptoResult<InternalKeyBundleStore> {
        let guard = self.bundle.read().await;
        let bundle = guard.as_ref().ok_or_else(no_bundle)?;
        bundle.save(self.store.passphrase())
    }

    /// Rotate the prekey and return the bundle to republish
    pub async fn regenerate_pre_key(&self) -> CryptoResult<ExternalKeyBundleDto> {
        let mut guard = self.bundle.write().await;
        let mut next = guard.as_ref().ok_or_else(no_bundle)?.clone();

        next.generate_pre_key();
        let dto = next.generate_external_key()?.to_dto()?;
        self.store.save_account(&next)?;

        *guard = Some(next);
        Ok(dto)
    }

    /// Produce a signed bundle to publish
    ///
    /// Any one-time key included is marked issued and never handed out again.
    pub async fn populate_external_key_bundle(&self) -> CryptoResult<ExternalKeyBundleDto> {
        let mut guard = self.bundle.write().await;
        let mut next = guard.as_ref().ok_or_else(no_bundle)?.clone();

        if next.needs_replenishment() {
            next.replenish();
        }
        let dto = next.generate_external_key()?.to_dto()?;
        self.store.save_account(&next)?;

        *guard = Some(next);
        Ok(dto)
    }

    pub async fn prekey_status(&self) -> CryptoResult<PreKeyStatus> {
        let guard = self.bundle.read().await;
        guard.as_ref().ok_or_else(no_bundle)?.status()
    }

    pub async fn fingerprint(&self) -> CryptoResult<String> {
        let guard = self.bundle.read().await;
        guard.as_ref().ok_or_else(no_bundle)?.fingerprint()
    }

    /// Start a chat session against a peer's published bundle
    ///
    /// A fresh ephemeral key is generated for the session. The returned
    /// handshake must reach the peer.
    pub async fn init_ratchet_from_internal(
        &self,
        peer_bundle_json: &str,
    ) -> CryptoResult<SessionHandshake> {
        let peer = ExternalKeyBundle::from_json(peer_bundle_json)?;

        let (ratchet, handshake) = {
            let mut guard = self.bundle.write().await;
            let bundle = guard.as_mut().ok_or_else(no_bundle)?;
            bundle.generate_ephemeral_key();
            Ratchet::from_internal(bundle, &peer, self.config.ratchet.clone())?
        };

        self.insert_ratchet(ratchet).await?;
        Ok(handshake)
    }

    /// Accept a chat session started by a peer
    ///
    /// Returns the session id.
    pub async fn init_ratchet_from_external(
        &self,
        peer_bundle_json: &str,
        handshake: &SessionHandshake,
    ) -> CryptoResult<String> {
        let peer = ExternalKeyBundle::from_json(peer_bundle_json)?;

        let mut ratchets = self.ratchets.write().await;
        if ratchets.contains_key(&handshake.ratchet_id) {
            return Err(CryptoError::InvalidState(format!(
                "Ratchet {} already exists",
                handshake.ratchet_id
            )));
        }

        let mut guard = self.bundle.write().await;
        let mut next = guard.as_ref().ok_or_else(no_bundle)?.clone();
        let ratchet =
            Ratchet::from_external(&mut next, &peer, handshake, self.config.ratchet.clone())?;

        self.store.save_ratchet(&ratchet)?;
        if handshake.one_time_key_id.is_some() {
            if let Err(e) = self.store.save_account(&next) {
                if let Err(cleanup) = self.store.delete_ratchet(ratchet.id()) {
                    tracing::error!("Could not roll back ratchet {}: {}", ratchet.id(), cleanup);
                }
                return Err(e);
            }
            *guard = Some(next);
        }
        drop(guard);

        let id = ratchet.id().to_string();
        ratchets.insert(id.clone(), Arc::new(Mutex::new(ratchet)));
        Ok(id)
    }

    /// Derive a call secret against a peer's bundle; no ratchet is kept
    pub async fn init_voip_session_from_internal(
        &self,
        peer_bundle_json: &str,
    ) -> CryptoResult<VoipSession> {
        let peer = ExternalKeyBundle::from_json(peer_bundle_json)?;

        let mut guard = self.bundle.write().await;
        let bundle = guard.as_mut().ok_or_else(no_bundle)?;
        bundle.generate_ephemeral_key();
        let (ratchet, handshake) =
            Ratchet::from_internal(bundle, &peer, self.config.ratchet.clone())?;

        Ok(VoipSession {
            session_common_secret_key: export_root_key(&ratchet)?,
            ephemeral_key: Some(handshake.ephemeral_key),
            one_time_key_id: handshake.one_time_key_id,
        })
    }

    /// Derive the call secret for a peer's call handshake
    pub async fn init_voip_session_from_external(
        &self,
        peer_bundle_json: &str,
        ephemeral_key: &str,
        one_time_key_id: Option<&str>,
    ) -> CryptoResult<VoipSession> {
        let peer = ExternalKeyBundle::from_json(peer_bundle_json)?;
        let handshake = SessionHandshake {
            ratchet_id: uuid::Uuid::new_v4().to_string(),
            ephemeral_key: ephemeral_key.to_string(),
            one_time_key_id: one_time_key_id.map(str::to_string),
        };

        let mut guard = self.bundle.write().await;
        let mut next = guard.as_ref().ok_or_else(no_bundle)?.clone();
        let ratchet =
            Ratchet::from_external(&mut next, &peer, &handshake, self.config.ratchet.clone())?;
        if one_time_key_id.is_some() {
            self.store.save_account(&next)?;
            *guard = Some(next);
        }

        Ok(VoipSession {
            session_common_secret_key: export_root_key(&ratchet)?,
            ephemeral_key: None,
            one_time_key_id: handshake.one_time_key_id.clone(),
        })
    }

    /// Export a ratchet as its encrypted store
    pub async fn save_ratchet(&self, id: &str) -> CryptoResult<RatchetStore> {
        let ratchet = self.ratchet(id).await?;
        let ratchet = ratchet.lock().await;
        ratchet.save(self.store.passphrase())
    }

    /// Import a ratchet from a JSON store, replacing a live one with the same id
    pub async fn load_ratchet(&self, store_json: &str) -> CryptoResult<String> {
        let store = RatchetStore::from_json(store_json)?;
        let ratchet = Ratchet::load_with_config(
            &store,
            self.store.passphrase(),
            self.config.ratchet.clone(),
        )?;
        let id = ratchet.id().to_string();
        self.insert_ratchet(ratchet).await?;
        Ok(id)
    }

    pub async fn has_ratchet(&self, id: &str) -> bool {
        self.ratchets.read().await.contains_key(id)
    }

    /// Drop a ratchet from memory and storage
    pub async fn remove_ratchet(&self, id: &str) -> CryptoResult<()> {
        let mut ratchets = self.ratchets.write().await;
        self.store.delete_ratchet(id)?;
        ratchets.remove(id);
        tracing::info!("Removed ratchet {}", id);
        Ok(())
    }

    /// Encrypt content for a session
    ///
    /// Binary content is passed in as base64url.
    pub async fn send_message(
        &self,
        ratchet_id: &str,
        is_binary: bool,
        content: &str,
    ) -> CryptoResult<MessageDto> {
        let payload = PlainPayload::from_content(is_binary, content)?;

        let handle = self.ratchet(ratchet_id).await?;
        let mut ratchet = handle.lock().await;

        let mut next = ratchet.clone();
        let mut message = next.populate_message(payload.as_bytes().to_vec(), payload.is_binary());
        next.on_send(&mut message)?;
        self.persist_ratchet(&handle, &next).await?;
        *ratchet = next;

        tracing::debug!("Sent message {} on ratchet {}", message.index, ratchet_id);
        Ok(message.to_dto())
    }

    /// Decrypt a message DTO; the session id inside picks the ratchet
    pub async fn receive_message(&self, message_json: &str) -> CryptoResult<PlainPayload> {
        let mut message = Message::from_json(message_json)?;

        let handle = self.ratchet(&message.session_id).await?;
        let mut ratchet = handle.lock().await;

        let mut next = ratchet.clone();
        next.on_received(&mut message)?;
        self.persist_ratchet(&handle, &next).await?;
        *ratchet = next;

        let plaintext = message.plaintext().ok_or_else(|| {
            CryptoError::InternalError("Decrypted message has no plaintext".to_string())
        })?;
        PlainPayload::from_bytes(message.is_binary, plaintext)
    }

    /// Get statistics about all live sessions
    pub async fn session_stats(&self) -> Vec<SessionStats> {
        let ratchets: Vec<_> = self.ratchets.read().await.values().cloned().collect();
        let mut stats = Vec::with_capacity(ratchets.len());
        for ratchet in ratchets {
            stats.push(ratchet.lock().await.stats());
        }
        stats
    }

    /// Delete all sessions (for logout)
    pub async fn delete_all_ratchets(&self) -> CryptoResult<()> {
        let mut ratchets = self.ratchets.write().await;
        self.store.delete_all_ratchets()?;
        ratchets.clear();
        Ok(())
    }

    async fn ratchet(&self, id: &str) -> CryptoResult<Arc<Mutex<Ratchet>>> {
        self.ratchets
            .read()
            .await
            .get(id)
            .cloned()
            .ok_or_else(|| CryptoError::SessionNotEstablished(id.to_string()))
    }

    async fn insert_ratchet(&self, ratchet: Ratchet) -> CryptoResult<()> {
        let mut ratchets = self.ratchets.write().await;
        self.store.save_ratchet(&ratchet)?;

        let id = ratchet.id().to_string();
        if ratchets
            .insert(id.clone(), Arc::new(Mutex::new(ratchet)))
            .is_some()
        {
            tracing::warn!("Replaced live ratchet {}", id);
        }
        Ok(())
    }

    /// Write `next` for a ratchet that is still live under `handle`
    ///
    /// A ratchet removed or replaced while the caller held its lock is not
    /// written back.
    async fn persist_ratchet(
        &self,
        handle: &Arc<Mutex<Ratchet>>,
        next: &Ratchet,
    ) -> CryptoResult<()> {
        let ratchets = self.ratchets.read().await;
        match ratchets.get(next.id()) {
            Some(live) if Arc::ptr_eq(live, handle) => self.store.save_ratchet(next),
            _ => Err(CryptoError::SessionNotEstablished(next.id().to_string())),
        }
    }
}

fn no_bundle() -> CryptoError {
    CryptoError::InvalidState("No internal key bundle loaded".to_string())
}

fn export_root_key(ratchet: &Ratchet) -> CryptoResult<String> {
    ratchet
        .root_key()
        .map(|key| encoding::encode(key))
        .ok_or_else(|| CryptoError::SessionNotEstablished(ratchet.id().to_string()))
}
