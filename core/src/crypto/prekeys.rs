//! Key Bundle Management
//!
//! This module owns the local party's private key material:
//!
//! - **Identity key**: long-lived, signs everything we publish
//! - **Ephemeral key**: regenerated per session initiation
//! - **Prekey**: medium-lived, named, signed, rotated by the caller
//! - **One-time keys**: a named pool, each key handed out and consumed at most once
//!
//! [`InternalKeyBundle::generate_external_key`] produces the publishable
//! [`ExternalKeyBundle`]. [`InternalKeyBundle::save`] produces an
//! [`InternalKeyBundleStore`] with every private key encrypted under the
//! caller's passphrase.

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};

use crate::crypto::errors::{CryptoError, CryptoResult};
use crate::crypto::keys::{EcKeyPair, KeyPairStore};
use crate::crypto::x3dh::{ExternalKeyBundle, SignedOneTimeKey};

/// Current internal bundle store version
pub const STORE_VERSION: u32 = 1;

/// Configuration for prekey management
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PreKeyConfig {
    /// Number of one-time keys generated with a new bundle
    pub initial_one_time_keys: usize,
    /// Number of one-time keys generated when replenishing
    pub replenish_batch_size: usize,
    /// Minimum number of unissued one-time keys before replenishment is due
    pub min_one_time_keys: usize,
    /// Whether external bundles carry a one-time key when one is available
    pub publish_one_time_key: bool,
    /// Maximum age of the prekey in days before rotation is due
    pub pre_key_max_age_days: i64,
}

impl Default for PreKeyConfig {
    fn default() -> Self {
        Self {
            initial_one_time_keys: 1,
            replenish_batch_size: 10,
            min_one_time_keys: 1,
            publish_one_time_key: true,
            pre_key_max_age_days: 7,
        }
    }
}

/// The local party's key material
#[derive(Clone)]
pub struct InternalKeyBundle {
    identity: EcKeyPair,
    ephemeral: EcKeyPair,
    pre_key_id: String,
    pre_key: EcKeyPair,
    /// Unix timestamp when the prekey was created
    pre_key_created: i64,
    one_time_keys: BTreeMap<String, EcKeyPair>,
    /// One-time keys already placed in an external bundle
    issued_one_time_keys: BTreeSet<String>,
    config: PreKeyConfig,
}

impl InternalKeyBundle {
    /// Create a bundle with fresh identity, ephemeral, prekey and one-time keys
    pub fn new() -> Self {
        Self::with_config(PreKeyConfig::default())
    }

    /// Create a new bundle with custom configuration
    pub fn with_config(config: PreKeyConfig) -> Self {
        let mut bundle = Self {
            identity: EcKeyPair::generate(),
            ephemeral: EcKeyPair::generate(),
            pre_key_id: new_key_id(),
            pre_key: EcKeyPair::generate(),
            pre_key_created: chrono::Utc::now().timestamp(),
            one_time_keys: BTreeMap::new(),
            issued_one_time_keys: BTreeSet::new(),
            config,
        };
        bundle.generate_one_time_keys(bundle.config.initial_one_time_keys);
        bundle
    }

    /// Restore from a store produced by [`InternalKeyBundle::save`]
    ///
    /// The ephemeral key is not persisted; a fresh one is generated.
    pub fn load(store: &InternalKeyBundleStore, passphrase: &[u8]) -> CryptoResult<Self> {
        Self::load_with_config(store, passphrase, PreKeyConfig::default())
    }

    pub fn load_with_config(
        store: &InternalKeyBundleStore,
        passphrase: &[u8],
        config: PreKeyConfig,
    ) -> CryptoResult<Self> {
        if store.version != STORE_VERSION {
            return Err(CryptoError::UnsupportedVersion(store.version));
        }

        let identity = EcKeyPair::load(&store.identity_key, passphrase)?;
        let pre_key = EcKeyPair::load(&store.pre_key, passphrase)?;
        let one_time_keys = store
            .one_time_key
            .iter()
            .map(|(id, key)| Ok((id.clone(), EcKeyPair::load(key, passphrase)?)))
            .collect::<CryptoResult<BTreeMap<_, _>>>()?;

        // Issued ids without a key left in the pool carry no information
        let issued_one_time_keys = store
            .issued_one_time_keys
            .iter()
            .filter(|id| one_time_keys.contains_key(*id))
            .cloned()
            .collect();

        tracing::debug!(
            "Loaded internal key bundle with {} one-time keys",
            one_time_keys.len()
        );

        Ok(Self {
            identity,
            ephemeral: EcKeyPair::generate(),
            pre_key_id: store.pre_key_id.clone(),
            pre_key,
            pre_key_created: store.pre_key_created,
            one_time_keys,
            issued_one_time_keys,
            config,
        })
    }

    /// Serialize every private key under `passphrase`
    pub fn save(&self, passphrase: &[u8]) -> CryptoResult<InternalKeyBundleStore> {
        let one_time_key = self
            .one_time_keys
            .iter()
            .map(|(id, key)| Ok((id.clone(), key.save(passphrase)?)))
            .collect::<CryptoResult<BTreeMap<_, _>>>()?;

        Ok(InternalKeyBundleStore {
            version: STORE_VERSION,
            identity_key: self.identity.save(passphrase)?,
            pre_key_id: self.pre_key_id.clone(),
            pre_key_created: self.pre_key_created,
            pre_key: self.pre_key.save(passphrase)?,
            one_time_key,
            issued_one_time_keys: self.issued_one_time_keys.iter().cloned().collect(),
        })
    }

    /// Replace the ephemeral key; callers must republish
    pub fn generate_ephemeral_key(&mut self) -> &EcKeyPair {
        self.ephemeral = EcKeyPair::generate();
        &self.ephemeral
    }

    /// Replace the prekey under a new id; callers must republish
    pub fn generate_pre_key(&mut self) -> &EcKeyPair {
        self.pre_key = EcKeyPair::generate();
        self.pre_key_id = new_key_id();
        self.pre_key_created = chrono::Utc::now().timestamp();
        tracing::info!("Rotated prekey, new id {}", self.pre_key_id);
        &self.pre_key
    }

    /// Sign the current prekey (and an unissued one-time key) for publishing
    ///
    /// The one-time key placed in the bundle is marked issued, so two calls
    /// never hand out the same one-time key.
    pub fn generate_external_key(&mut self) -> CryptoResult<ExternalKeyBundle> {
        let identity = self.identity.private_key()?;
        let pre_key = self.pre_key.public_key().clone();
        let pre_key_signature = identity.sign(&pre_key.serialize()?);

        let one_time_key = if self.config.publish_one_time_key {
            match self.next_unissued_one_time_key() {
                Some((key_id, key)) => {
                    let public_key = key.public_key().clone();
                    let signature = identity.sign(&public_key.serialize()?);
                    Some(SignedOneTimeKey {
                        key_id,
                        public_key,
                        signature,
                    })
                }
                None => {
                    tracing::warn!("No unissued one-time key left, publishing bundle without one");
                    None
                }
            }
        } else {
            None
        };

        if let Some(ref otk) = one_time_key {
            self.issued_one_time_keys.insert(otk.key_id.clone());
        }

        Ok(ExternalKeyBundle::new(
            self.identity.public_key().clone(),
            self.pre_key_id.clone(),
            pre_key,
            pre_key_signature,
            one_time_key,
        ))
    }

    fn next_unissued_one_time_key(&self) -> Option<(String, &EcKeyPair)> {
        self.one_time_keys
            .iter()
            .find(|(id, _)| !self.issued_one_time_keys.contains(*id))
            .map(|(id, key)| (id.clone(), key))
    }

    /// Add `count` one-time keys to the pool, returning their ids
    pub fn generate_one_time_keys(&mut self, count: usize) -> Vec<String> {
        (0..count)
            .map(|_| {
                let id = new_key_id();
                self.one_time_keys.insert(id.clone(), EcKeyPair::generate());
                id
            })
            .collect()
    }

    /// Check if the pool of unissued one-time keys is running low
    pub fn needs_replenishment(&self) -> bool {
        self.unissued_one_time_key_count() < self.config.min_one_time_keys
    }

    /// Generate a configured batch of one-time keys
    pub fn replenish(&mut self) -> Vec<String> {
        let ids = self.generate_one_time_keys(self.config.replenish_batch_size);
        tracing::info!("Replenished {} one-time keys", ids.len());
        ids
    }

    /// Remove a one-time key from the pool for session establishment
    pub fn consume_one_time_key(&mut self, key_id: &str) -> CryptoResult<EcKeyPair> {
        let key = self.one_time_keys.remove(key_id).ok_or_else(|| {
            CryptoError::MissingCounterpartKey(format!("One-time key {} not available", key_id))
        })?;
        self.issued_one_time_keys.remove(key_id);
        tracing::debug!("Consumed one-time key {}", key_id);
        Ok(key)
    }

    /// Look up a one-time key without removing it
    pub fn one_time_key(&self, key_id: &str) -> Option<&EcKeyPair> {
        self.one_time_keys.get(key_id)
    }

    /// Check if the prekey is older than the configured maximum age
    pub fn needs_pre_key_rotation(&self) -> bool {
        let now = chrono::Utc::now().timestamp();
        let age_seconds = now - self.pre_key_created;
        let max_age_seconds = self.config.pre_key_max_age_days * 24 * 60 * 60;
        age_seconds > max_age_seconds
    }

    pub fn identity(&self) -> &EcKeyPair {
        &self.identity
    }

    pub fn ephemeral(&self) -> &EcKeyPair {
        &self.ephemeral
    }

    pub fn pre_key(&self) -> &EcKeyPair {
        &self.pre_key
    }

    pub fn pre_key_id(&self) -> &str {
        &self.pre_key_id
    }

    pub fn pre_key_created(&self) -> i64 {
        self.pre_key_created
    }

    pub fn one_time_key_count(&self) -> usize {
        self.one_time_keys.len()
    }

    pub fn unissued_one_time_key_count(&self) -> usize {
        self.one_time_keys.len() - self.issued_one_time_keys.len()
    }

    pub fn config(&self) -> &PreKeyConfig {
        &self.config
    }

    /// Get the identity key fingerprint for verification
    pub fn fingerprint(&self) -> CryptoResult<String> {
        self.identity.public_key().fingerprint()
    }

    /// Get the current status of prekeys
    pub fn status(&self) -> CryptoResult<PreKeyStatus> {
        let now = chrono::Utc::now().timestamp();

        Ok(PreKeyStatus {
            one_time_key_count: self.one_time_key_count(),
            unissued_one_time_key_count: self.unissued_one_time_key_count(),
            needs_replenishment: self.needs_replenishment(),
            needs_rotation: self.needs_pre_key_rotation(),
            pre_key_age_seconds: now - self.pre_key_created,
            fingerprint: self.fingerprint()?,
        })
    }
}

impl Default for InternalKeyBundle {
    fn default() -> Self {
        Self::new()
    }
}

fn new_key_id() -> String {
    uuid::Uuid::new_v4().to_string()
}

/// Persisted form of an [`InternalKeyBundle`]
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InternalKeyBundleStore {
    pub version: u32,
    pub identity_key: KeyPairStore,
    pub pre_key_id: String,
    pub pre_key_created: i64,
    pub pre_key: KeyPairStore,
    pub one_time_key: BTreeMap<String, KeyPairStore>,
    #[serde(default)]
    pub issued_one_time_keys: Vec<String>,
}

impl InternalKeyBundleStore {
    pub fn to_json(&self) -> CryptoResult<String> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn from_json(json: &str) -> CryptoResult<Self> {
        Ok(serde_json::from_str(json)?)
    }
}

/// Status of prekey availability
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PreKeyStatus {
    /// Number of one-time keys in the pool
    pub one_time_key_count: usize,
    /// Number of one-time keys not yet placed in a bundle
    pub unissued_one_time_key_count: usize,
    /// Whether replenishment is needed
    pub needs_replenishment: bool,
    /// Whether prekey rotation is needed
    pub needs_rotation: bool,
    /// Age of the prekey in seconds
    pub pre_key_age_seconds: i64,
    /// Identity key fingerprint
    pub fingerprint: String,
}
