//! Session Storage
//!
//! The core never persists anything itself. A caller supplies a
//! [`BlobStore`] (opaque ids to JSON blobs) and [`SessionStore`] writes the
//! internal key bundle and every ratchet into it as their encrypted stores.
//! The blob store never sees plaintext key material or the passphrase.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

use zeroize::Zeroizing;

use crate::crypto::errors::{CryptoError, CryptoResult};
use crate::crypto::prekeys::{InternalKeyBundle, InternalKeyBundleStore, PreKeyConfig};
use crate::crypto::ratchet::{Ratchet, RatchetConfig, RatchetStore};

const ACCOUNT_ID: &str = "account";
const RATCHET_PREFIX: &str = "ratchet/";

/// Persistence collaborator: opaque ids to JSON blobs
pub trait BlobStore: Send + Sync {
    /// Insert or replace a blob
    fn put(&self, id: &str, blob: &str) -> CryptoResult<()>;

    fn get(&self, id: &str) -> CryptoResult<Option<String>>;

    /// Remove a blob; removing a missing id is not an error
    fn delete(&self, id: &str) -> CryptoResult<()>;

    /// Ids starting with `prefix`, in ascending order
    fn list(&self, prefix: &str) -> CryptoResult<Vec<String>>;
}

impl<T: BlobStore + ?Sized> BlobStore for &T {
    fn put(&self, id: &str, blob: &str) -> CryptoResult<()> {
        (**self).put(id, blob)
    }

    fn get(&self, id: &str) -> CryptoResult<Option<String>> {
        (**self).get(id)
    }

    fn delete(&self, id: &str) -> CryptoResult<()> {
        (**self).delete(id)
    }

    fn list(&self, prefix: &str) -> CryptoResult<Vec<String>> {
        (**self).list(prefix)
    }
}

impl<T: BlobStore + ?Sized> BlobStore for Arc<T> {
    fn put(&self, id: &str, blob: &str) -> CryptoResult<()> {
        (**self).put(id, blob)
    }

    fn get(&self, id: &str) -> CryptoResult<Option<String>> {
        (**self).get(id)
    }

    fn delete(&self, id: &str) -> CryptoResult<()> {
        (**self).delete(id)
    }

    fn list(&self, prefix: &str) -> CryptoResult<Vec<String>> {
        (**self).list(prefix)
    }
}

/// In-memory [`BlobStore`] for tests and embedders without storage
#[derive(Debug, Default)]
pub struct MemoryBlobStore {
    blobs: Mutex<BTreeMap<String, String>>,
}

impl MemoryBlobStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn blobs(&self) -> CryptoResult<std::sync::MutexGuard<'_, BTreeMap<String, String>>> {
        self.blobs
            .lock()
            .map_err(|_| CryptoError::StorageError("Memory store lock poisoned".to_string()))
    }
}

impl BlobStore for MemoryBlobStore {
    fn put(&self, id: &str, blob: &str) -> CryptoResult<()> {
        self.blobs()?.insert(id.to_string(), blob.to_string());
        Ok(())
    }

    fn get(&self, id: &str) -> CryptoResult<Option<String>> {
        Ok(self.blobs()?.get(id).cloned())
    }

    fn delete(&self, id: &str) -> CryptoResult<()> {
        self.blobs()?.remove(id);
        Ok(())
    }

    fn list(&self, prefix: &str) -> CryptoResult<Vec<String>> {
        Ok(self
            .blobs()?
            .keys()
            .filter(|id| id.starts_with(prefix))
            .cloned()
            .collect())
    }
}

/// Manages storage and retrieval of the key bundle and ratchets
pub struct SessionStore<B: BlobStore> {
    blobs: B,
    /// Passphrase every private key and chain key is encrypted under
    passphrase: Zeroizing<Vec<u8>>,
}

impl<B: BlobStore> SessionStore<B> {
    pub fn new(blobs: B, passphrase: &[u8]) -> Self {
        Self {
            blobs,
            passphrase: Zeroizing::new(passphrase.to_vec()),
        }
    }

    pub fn passphrase(&self) -> &[u8] {
        &self.passphrase
    }

    /// The underlying blob store
    pub fn blobs(&self) -> &B {
        &self.blobs
    }

    /// Save or update the internal key bundle
    pub fn save_account(&self, bundle: &InternalKeyBundle) -> CryptoResult<()> {
        let store = bundle.save(&self.passphrase)?;
        self.blobs.put(ACCOUNT_ID, &store.to_json()?)
    }

    /// Load the internal key bundle
    pub fn load_account(&self, config: PreKeyConfig) -> CryptoResult<Option<InternalKeyBundle>> {
        match self.blobs.get(ACCOUNT_ID)? {
            Some(json) => {
                let store = InternalKeyBundleStore::from_json(&json)?;
                let bundle = InternalKeyBundle::load_with_config(&store, &self.passphrase, config)?;
                Ok(Some(bundle))
            }
            None => Ok(None),
        }
    }

    pub fn has_account(&self) -> CryptoResult<bool> {
        Ok(self.blobs.get(ACCOUNT_ID)?.is_some())
    }

    /// Save or update a ratchet
    pub fn save_ratchet(&self, ratchet: &Ratchet) -> CryptoResult<()> {
        let store = ratchet.save(&self.passphrase)?;
        self.blobs.put(&ratchet_blob_id(ratchet.id()), &store.to_json()?)
    }

    /// Load a ratchet by session id
    pub fn load_ratchet(&self, id: &str, config: RatchetConfig) -> CryptoResult<Option<Ratchet>> {
        match self.blobs.get(&ratchet_blob_id(id))? {
            Some(json) => {
                let store = RatchetStore::from_json(&json)?;
                let ratchet = Ratchet::load_with_config(&store, &self.passphrase, config)?;
                Ok(Some(ratchet))
            }
            None => Ok(None),
        }
    }

    pub fn has_ratchet(&self, id: &str) -> CryptoResult<bool> {
        Ok(self.blobs.get(&ratchet_blob_id(id))?.is_some())
    }

    pub fn delete_ratchet(&self, id: &str) -> CryptoResult<()> {
        self.blobs.delete(&ratchet_blob_id(id))
    }

    /// Session ids of every stored ratchet
    pub fn list_ratchets(&self) -> CryptoResult<Vec<String>> {
        Ok(self
            .blobs
            .list(RATCHET_PREFIX)?
            .into_iter()
            .filter_map(|id| id.strip_prefix(RATCHET_PREFIX).map(str::to_string))
            .collect())
    }

    /// Delete all ratchets (for logout)
    pub fn delete_all_ratchets(&self) -> CryptoResult<()> {
        for id in self.blobs.list(RATCHET_PREFIX)? {
            self.blobs.delete(&id)?;
        }
        Ok(())
    }
}

fn ratchet_blob_id(id: &str) -> String {
    format!("{}{}", RATCHET_PREFIX, id)
}
