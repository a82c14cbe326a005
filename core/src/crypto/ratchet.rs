//! Symmetric Ratchet
//!
//! Each session derives a fresh 16-byte key per message by chaining
//! [`derive_key`] from the X3DH root key:
//!
//! ```text
//! key(1) = DeriveKey(root)
//! key(n) = DeriveKey(key(n - 1))
//! ```
//!
//! Both directions walk the same chain from the same root; the send and
//! receive positions are tracked separately. Message indexes start at 1.
//!
//! ## States
//!
//! `Uninitialized -> RootDerived -> Ratcheting`. The root key is derived
//! exactly once; every later send or receive stays in `Ratcheting`.
//!
//! ## Out-of-order delivery
//!
//! Receiving index `n` past the last received index derives forward and
//! buffers the keys of the skipped indexes, each tagged with its index. A
//! skipped message arriving later is decrypted with its buffered key, which
//! is then dropped. A failed receive never changes the ratchet.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use zeroize::Zeroize;

use crate::crypto::encoding;
use crate::crypto::errors::{CryptoError, CryptoResult};
use crate::crypto::keys::EcPublicKey;
use crate::crypto::message::Message;
use crate::crypto::prekeys::InternalKeyBundle;
use crate::crypto::symmetric::{
    decrypt_hashed_data, derive_key, encrypt_and_hash, SymmetricKey, KEY_LEN,
};
use crate::crypto::x3dh::{x3dh_initiate, x3dh_respond, ExternalKeyBundle, SessionHandshake};

/// Current ratchet store version
pub const STORE_VERSION: u32 = 1;

/// Hard ceiling on [`RatchetConfig::max_skipped_messages`]
pub const MAX_SKIPPED_MESSAGES_CEILING: u64 = 100_000;

/// Configuration for the ratchet engine
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RatchetConfig {
    /// Upper bound on buffered skipped-message keys per session
    pub max_skipped_messages: u64,
}

impl Default for RatchetConfig {
    fn default() -> Self {
        Self {
            max_skipped_messages: 1000,
        }
    }
}

/// Lifecycle of a [`Ratchet`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RatchetState {
    Uninitialized,
    RootDerived,
    Ratcheting,
}

/// One side of an established chat session
#[derive(Clone)]
pub struct Ratchet {
    id: String,
    /// `None` until X3DH has run
    root_key: Option<SymmetricKey>,
    send_chain_key: Option<SymmetricKey>,
    recv_chain_key: Option<SymmetricKey>,
    total_sent: u64,
    /// Highest index received in chain order
    total_received: u64,
    skipped_keys: BTreeMap<u64, SymmetricKey>,
    config: RatchetConfig,
}

impl Ratchet {
    /// Create an uninitialized ratchet with the given session id
    pub fn new(id: impl Into<String>) -> Self {
        Self::with_config(id, RatchetConfig::default())
    }

    pub fn with_config(id: impl Into<String>, config: RatchetConfig) -> Self {
        Self {
            id: id.into(),
            root_key: None,
            send_chain_key: None,
            recv_chain_key: None,
            total_sent: 0,
            total_received: 0,
            skipped_keys: BTreeMap::new(),
            config,
        }
    }

    /// Start a session against a peer's bundle (initiator side)
    ///
    /// Uses the local bundle's current ephemeral key and a fresh session id.
    /// The returned handshake goes to the peer over the transport.
    pub fn from_internal(
        local: &InternalKeyBundle,
        peer: &ExternalKeyBundle,
        config: RatchetConfig,
    ) -> CryptoResult<(Self, SessionHandshake)> {
        let mut ratchet = Self::with_config(uuid::Uuid::new_v4().to_string(), config);
        let one_time_key_id = ratchet.init_new_session(local, peer)?;

        let handshake = SessionHandshake {
            ratchet_id: ratchet.id.clone(),
            ephemeral_key: local.ephemeral().public_key().to_base64()?,
            one_time_key_id,
        };
        Ok((ratchet, handshake))
    }

    /// Accept a session started by a peer (responder side)
    pub fn from_external(
        local: &mut InternalKeyBundle,
        peer: &ExternalKeyBundle,
        handshake: &SessionHandshake,
        config: RatchetConfig,
    ) -> CryptoResult<Self> {
        let peer_ephemeral = EcPublicKey::from_base64(&handshake.ephemeral_key)?;
        let mut ratchet = Self::with_config(handshake.ratchet_id.clone(), config);
        ratchet.init_received_session(
            local,
            peer,
            &peer_ephemeral,
            handshake.one_time_key_id.as_deref(),
        )?;
        Ok(ratchet)
    }

    /// Derive the root key as the initiator
    ///
    /// Returns the id of the peer's one-time key that went into the root
    /// key. A no-op when the root key already exists.
    pub fn init_new_session(
        &mut self,
        local: &InternalKeyBundle,
        peer: &ExternalKeyBundle,
    ) -> CryptoResult<Option<String>> {
        if self.root_key.is_some() {
            tracing::warn!("Ratchet {} already has a root key, not a new session", self.id);
            return Ok(None);
        }

        let result = x3dh_initiate(
            local.identity().private_key()?,
            local.ephemeral().private_key()?,
            peer,
        )
        .map_err(|e| {
            tracing::warn!("Rejected peer bundle for ratchet {}: {}", self.id, e);
            e
        })?;

        self.root_key = Some(result.root_key);
        tracing::info!(
            "Initiated session {} (one-time key used: {})",
            self.id,
            result.one_time_key_id.is_some()
        );
        Ok(result.one_time_key_id)
    }

    /// Derive the root key as the responder
    ///
    /// When `one_time_key_id` is given the named key is consumed from the
    /// local pool, but only once the root key has been derived. A no-op
    /// when the root key already exists.
    pub fn init_received_session(
        &mut self,
        local: &mut InternalKeyBundle,
        peer: &ExternalKeyBundle,
        peer_ephemeral: &EcPublicKey,
        one_time_key_id: Option<&str>,
    ) -> CryptoResult<()> {
        if self.root_key.is_some() {
            tracing::warn!("Ratchet {} already has a root key, not a new session", self.id);
            return Ok(());
        }

        peer.ensure_verified().map_err(|e| {
            tracing::warn!("Rejected peer bundle for ratchet {}: {}", self.id, e);
            e
        })?;

        let one_time_key = match one_time_key_id {
            Some(key_id) => Some(
                local
                    .one_time_key(key_id)
                    .ok_or_else(|| {
                        CryptoError::MissingCounterpartKey(format!(
                            "One-time key {} not available",
                            key_id
                        ))
                    })?
                    .private_key()?,
            ),
            None => None,
        };

        let root_key = x3dh_respond(
            local.identity().private_key()?,
            local.pre_key().private_key()?,
            one_time_key,
            peer.identity_key(),
            peer_ephemeral,
        )?;

        if let Some(key_id) = one_time_key_id {
            local.consume_one_time_key(key_id)?;
        }

        self.root_key = Some(root_key);
        tracing::info!(
            "Accepted session {} (one-time key used: {})",
            self.id,
            one_time_key_id.is_some()
        );
        Ok(())
    }

    /// Wrap content in a message for this session
    pub fn populate_message(&self, content: Vec<u8>, is_binary: bool) -> Message {
        Message::new(self.id.clone(), self.total_sent, content, is_binary)
    }

    /// Encrypt a message with the next send-chain key
    ///
    /// Stamps the session id and the post-increment index on the message.
    pub fn on_send(&mut self, message: &mut Message) -> CryptoResult<()> {
        let root_key = self.require_root_key()?;
        let previous = self.send_chain_key.unwrap_or(root_key);
        let chain_key = derive_key(&previous)?;

        message.encrypt(&chain_key)?;

        self.total_sent += 1;
        self.send_chain_key = Some(chain_key);
        message.session_id = self.id.clone();
        message.index = self.total_sent;
        Ok(())
    }

    /// Decrypt a received message
    pub fn on_received(&mut self, message: &mut Message) -> CryptoResult<()> {
        let root_key = self.require_root_key()?;

        if message.session_id != self.id {
            tracing::warn!(
                "Message for session {} delivered to ratchet {}",
                message.session_id,
                self.id
            );
            return Err(CryptoError::WrongRatchetSession {
                expected: self.id.clone(),
                got: message.session_id.clone(),
            });
        }

        let index = message.index;
        let last = self.total_received;

        if index <= last {
            let key = self.skipped_keys.get(&index).ok_or_else(|| {
                tracing::warn!("Rejected message {} on ratchet {} (last {})", index, self.id, last);
                CryptoError::MessageIndexRejected { index, last }
            })?;
            message.decrypt(key)?;
            if let Some(mut used) = self.skipped_keys.remove(&index) {
                used.zeroize();
            }
            tracing::debug!("Decrypted skipped message {} on ratchet {}", index, self.id);
            return Ok(());
        }

        let skip = index - last - 1;
        let limit = self.skip_limit();
        let buffered = self.skipped_keys.len() as u64;
        if buffered.saturating_add(skip) > limit {
            tracing::warn!(
                "Message {} on ratchet {} would skip {} keys (limit {})",
                index,
                self.id,
                skip,
                limit
            );
            return Err(CryptoError::TooManySkippedMessages {
                requested: skip,
                limit,
            });
        }

        let mut chain_key = if last == 0 {
            root_key
        } else {
            self.recv_chain_key.ok_or_else(|| {
                CryptoError::InvalidState(format!("Ratchet {} lost its receive chain", self.id))
            })?
        };

        let mut pending = Vec::new();
        for skipped_index in last + 1..index {
            chain_key = derive_key(&chain_key)?;
            pending.push((skipped_index, chain_key));
        }
        let message_key = derive_key(&chain_key)?;

        message.decrypt(&message_key)?;

        if !pending.is_empty() {
            tracing::debug!(
                "Buffered {} skipped keys on ratchet {}",
                pending.len(),
                self.id
            );
        }
        self.skipped_keys.extend(pending);
        self.recv_chain_key = Some(message_key);
        self.total_received = index;
        Ok(())
    }

    fn skip_limit(&self) -> u64 {
        self.config
            .max_skipped_messages
            .min(MAX_SKIPPED_MESSAGES_CEILING)
    }

    fn require_root_key(&self) -> CryptoResult<SymmetricKey> {
        self.root_key
            .ok_or_else(|| CryptoError::SessionNotEstablished(self.id.clone()))
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn total_sent(&self) -> u64 {
        self.total_sent
    }

    pub fn total_received(&self) -> u64 {
        self.total_received
    }

    pub fn root_key(&self) -> Option<&SymmetricKey> {
        self.root_key.as_ref()
    }

    /// Indexes that still have a buffered key
    pub fn skipped_indexes(&self) -> Vec<u64> {
        self.skipped_keys.keys().copied().collect()
    }

    pub fn config(&self) -> &RatchetConfig {
        &self.config
    }

    pub fn state(&self) -> RatchetState {
        if self.root_key.is_none() {
            RatchetState::Uninitialized
        } else if self.send_chain_key.is_none()
            && self.recv_chain_key.is_none()
            && self.skipped_keys.is_empty()
        {
            RatchetState::RootDerived
        } else {
            RatchetState::Ratcheting
        }
    }

    pub fn stats(&self) -> SessionStats {
        SessionStats {
            session_id: self.id.clone(),
            state: self.state(),
            messages_sent: self.total_sent,
            messages_received: self.total_received,
            skipped_keys: self.skipped_keys.len(),
        }
    }

    /// Serialize with every key encrypted under `passphrase`
    pub fn save(&self, passphrase: &[u8]) -> CryptoResult<RatchetStore> {
        let root_key = self.require_root_key()?;

        let missing_message_keys = self
            .skipped_keys
            .iter()
            .map(|(index, key)| {
                Ok(MissingMessageKey {
                    index: *index,
                    key: seal_key(Some(key), passphrase)?,
                })
            })
            .collect::<CryptoResult<Vec<_>>>()?;

        Ok(RatchetStore {
            version: STORE_VERSION,
            rachet_id: self.id.clone(),
            root_key: seal_key(Some(&root_key), passphrase)?,
            chain_send_key: seal_key(self.send_chain_key.as_ref(), passphrase)?,
            chain_recv_key: seal_key(self.recv_chain_key.as_ref(), passphrase)?,
            total_message_sent: self.total_sent,
            total_message_recv: self.total_received,
            missing_message_keys,
        })
    }

    /// Restore from a store produced by [`Ratchet::save`]
    pub fn load(store: &RatchetStore, passphrase: &[u8]) -> CryptoResult<Self> {
        Self::load_with_config(store, passphrase, RatchetConfig::default())
    }

    pub fn load_with_config(
        store: &RatchetStore,
        passphrase: &[u8],
        config: RatchetConfig,
    ) -> CryptoResult<Self> {
        if store.version != STORE_VERSION {
            return Err(CryptoError::UnsupportedVersion(store.version));
        }

        let root_key = open_key(&store.root_key, passphrase)?.ok_or_else(|| {
            CryptoError::MalformedSerialization("Ratchet store has no root key".to_string())
        })?;

        let skipped_keys = store
            .missing_message_keys
            .iter()
            .map(|missing| {
                let key = open_key(&missing.key, passphrase)?.ok_or_else(|| {
                    CryptoError::MalformedSerialization(format!(
                        "Empty skipped key for index {}",
                        missing.index
                    ))
                })?;
                Ok((missing.index, key))
            })
            .collect::<CryptoResult<BTreeMap<_, _>>>()?;

        Ok(Self {
            id: store.rachet_id.clone(),
            root_key: Some(root_key),
            send_chain_key: open_key(&store.chain_send_key, passphrase)?,
            recv_chain_key: open_key(&store.chain_recv_key, passphrase)?,
            total_sent: store.total_message_sent,
            total_received: store.total_message_recv,
            skipped_keys,
            config,
        })
    }
}

impl Drop for Ratchet {
    fn drop(&mut self) {
        self.root_key.zeroize();
        self.send_chain_key.zeroize();
        self.recv_chain_key.zeroize();
        for key in self.skipped_keys.values_mut() {
            key.zeroize();
        }
    }
}

/// Absent keys are sealed as an empty plaintext
fn seal_key(key: Option<&SymmetricKey>, passphrase: &[u8]) -> CryptoResult<String> {
    let plaintext: &[u8] = match key {
        Some(k) => k,
        None => &[],
    };
    Ok(encoding::encode(&encrypt_and_hash(plaintext, passphrase)?))
}

fn open_key(sealed: &str, passphrase: &[u8]) -> CryptoResult<Option<SymmetricKey>> {
    let mut bytes = decrypt_hashed_data(&encoding::decode(sealed)?, passphrase)?;
    if bytes.is_empty() {
        return Ok(None);
    }
    let key = SymmetricKey::try_from(bytes.as_slice()).map_err(|_| {
        CryptoError::MalformedSerialization(format!(
            "Ratchet key must be {} bytes, got {}",
            KEY_LEN,
            bytes.len()
        ))
    });
    bytes.zeroize();
    key.map(Some)
}

/// A buffered skipped-message key in a [`RatchetStore`]
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MissingMessageKey {
    pub index: u64,
    /// Encrypted key, base64url
    pub key: String,
}

/// Persisted form of a [`Ratchet`]; counters are stored in clear
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RatchetStore {
    pub version: u32,
    pub rachet_id: String,
    pub root_key: String,
    pub chain_send_key: String,
    pub chain_recv_key: String,
    pub total_message_sent: u64,
    pub total_message_recv: u64,
    #[serde(default)]
    pub missing_message_keys: Vec<MissingMessageKey>,
}

impl RatchetStore {
    pub fn to_json(&self) -> CryptoResult<String> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn from_json(json: &str) -> CryptoResult<Self> {
        Ok(serde_json::from_str(json)?)
    }
}

/// Statistics about a session
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionStats {
    pub session_id: String,
    pub state: RatchetState,
    pub messages_sent: u64,
    pub messages_received: u64,
    pub skipped_keys: usize,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn session_pair() -> (Ratchet, Ratchet) {
        let mut alice = InternalKeyBundle::new();
        let mut bob = InternalKeyBundle::new();
        let alice_external = alice.generate_external_key().unwrap();
        let bob_external = bob.generate_external_key().unwrap();

        let (alice_ratchet, handshake) =
            Ratchet::from_internal(&alice, &bob_external, RatchetConfig::default()).unwrap();
        let bob_ratchet =
            Ratchet::from_external(&mut bob, &alice_external, &handshake, RatchetConfig::default())
                .unwrap();
        (alice_ratchet, bob_ratchet)
    }

    fn send(ratchet: &mut Ratchet, text: &str) -> Message {
        let mut message = ratchet.populate_message(text.as_bytes().to_vec(), false);
        ratchet.on_send(&mut message).unwrap();
        Message::from_json(&message.to_json().unwrap()).unwrap()
    }

    #[test]
    fn test_root_keys_agree() {
        let (alice, bob) = session_pair();
        assert_eq!(alice.id(), bob.id());
        assert_eq!(alice.root_key(), bob.root_key());
        assert_eq!(alice.state(), RatchetState::RootDerived);
        assert_eq!(bob.state(), RatchetState::RootDerived);
    }

    #[test]
    fn test_ordered_messages() {
        let (mut alice, mut bob) = session_pair();

        for i in 0..5 {
            let mut message = send(&mut alice, &format!("msg-{}", i));
            assert_eq!(message.index, i + 1);
            bob.on_received(&mut message).unwrap();
            assert_eq!(message.plaintext(), Some(format!("msg-{}", i).as_bytes()));
        }

        assert_eq!(alice.total_sent(), 5);
        assert_eq!(bob.total_received(), 5);
        assert_eq!(bob.state(), RatchetState::Ratcheting);
        assert!(bob.skipped_indexes().is_empty());
    }

    #[test]
    fn test_both_directions() {
        let (mut alice, mut bob) = session_pair();

        let mut hello = send(&mut alice, "hello bob");
        bob.on_received(&mut hello).unwrap();

        let mut reply = send(&mut bob, "hello alice");
        alice.on_received(&mut reply).unwrap();
        assert_eq!(reply.plaintext(), Some(&b"hello alice"[..]));
    }

    #[test]
    fn test_out_of_order_buffers_skipped_keys() {
        let (mut alice, mut bob) = session_pair();
        let messages: Vec<Message> =
            (1..=3).map(|i| send(&mut alice, &format!("m{}", i))).collect();

        let mut third = messages[2].clone();
        bob.on_received(&mut third).unwrap();
        assert_eq!(third.plaintext(), Some(&b"m3"[..]));
        assert_eq!(bob.skipped_indexes(), vec![1, 2]);
        assert_eq!(bob.total_received(), 3);

        let mut first = messages[0].clone();
        bob.on_received(&mut first).unwrap();
        assert_eq!(first.plaintext(), Some(&b"m1"[..]));
        assert_eq!(bob.skipped_indexes(), vec![2]);

        let mut second = messages[1].clone();
        bob.on_received(&mut second).unwrap();
        assert_eq!(second.plaintext(), Some(&b"m2"[..]));
        assert!(bob.skipped_indexes().is_empty());

        // The chain continues after the gap
        let mut fourth = send(&mut alice, "m4");
        bob.on_received(&mut fourth).unwrap();
        assert_eq!(fourth.plaintext(), Some(&b"m4"[..]));
    }

    #[test]
    fn test_replay_rejected() {
        let (mut alice, mut bob) = session_pair();
        let message = send(&mut alice, "once");

        bob.on_received(&mut message.clone()).unwrap();
        assert!(matches!(
            bob.on_received(&mut message.clone()),
            Err(CryptoError::MessageIndexRejected { index: 1, last: 1 })
        ));
    }

    #[test]
    fn test_wrong_session_rejected() {
        let (mut alice, mut bob) = session_pair();
        let mut message = send(&mut alice, "hi");
        message.session_id = "someone-else".to_string();

        assert!(matches!(
            bob.on_received(&mut message),
            Err(CryptoError::WrongRatchetSession { .. })
        ));
        assert_eq!(bob.total_received(), 0);
    }

    #[test]
    fn test_failed_decrypt_does_not_advance() {
        let (mut alice, mut bob) = session_pair();
        let _ = send(&mut alice, "one");
        let mut corrupted = send(&mut alice, "two");
        let last = corrupted.ciphertext.len() - 1;
        corrupted.ciphertext[last] ^= 0x01;

        assert!(matches!(
            bob.on_received(&mut corrupted),
            Err(CryptoError::DecryptionFailure)
        ));
        assert_eq!(bob.total_received(), 0);
        assert!(bob.skipped_indexes().is_empty());
        assert_eq!(bob.state(), RatchetState::RootDerived);
    }

    #[test]
    fn test_skip_limit() {
        let (mut alice, mut bob) = session_pair();
        bob.config.max_skipped_messages = 2;

        let messages: Vec<Message> = (0..4).map(|i| send(&mut alice, &format!("{}", i))).collect();
        assert!(matches!(
            bob.on_received(&mut messages[3].clone()),
            Err(CryptoError::TooManySkippedMessages { requested: 3, limit: 2 })
        ));
        assert_eq!(bob.total_received(), 0);

        bob.on_received(&mut messages[2].clone()).unwrap();
        assert_eq!(bob.skipped_indexes(), vec![1, 2]);
    }

    #[test]
    fn test_huge_index_hits_skip_ceiling() {
        let (mut alice, mut bob) = session_pair();
        bob.config.max_skipped_messages = u64::MAX;

        let mut message = send(&mut alice, "far ahead");
        message.index = u64::MAX;
        assert!(matches!(
            bob.on_received(&mut message),
            Err(CryptoError::TooManySkippedMessages {
                limit: MAX_SKIPPED_MESSAGES_CEILING,
                ..
            })
        ));
        assert_eq!(bob.total_received(), 0);
        assert!(bob.skipped_indexes().is_empty());
    }

    #[test]
    fn test_uninitialized_ratchet() {
        let mut ratchet = Ratchet::new("lonely");
        assert_eq!(ratchet.state(), RatchetState::Uninitialized);

        let mut message = ratchet.populate_message(b"x".to_vec(), false);
        assert!(matches!(
            ratchet.on_send(&mut message),
            Err(CryptoError::SessionNotEstablished(_))
        ));
        assert!(matches!(
            ratchet.save(b"1234"),
            Err(CryptoError::SessionNotEstablished(_))
        ));
    }

    #[test]
    fn test_init_is_idempotent() {
        let alice = InternalKeyBundle::new();
        let mut bob = InternalKeyBundle::new();
        let bob_external = bob.generate_external_key().unwrap();

        let (mut ratchet, _) =
            Ratchet::from_internal(&alice, &bob_external, RatchetConfig::default()).unwrap();
        let root = *ratchet.root_key().unwrap();

        let other = InternalKeyBundle::new();
        assert_eq!(ratchet.init_new_session(&other, &bob_external).unwrap(), None);
        assert_eq!(ratchet.root_key(), Some(&root));
    }

    #[test]
    fn test_responder_missing_one_time_key() {
        let mut alice = InternalKeyBundle::new();
        let mut bob = InternalKeyBundle::new();
        let alice_external = alice.generate_external_key().unwrap();

        let (_, mut handshake) = Ratchet::from_internal(
            &alice,
            &bob.generate_external_key().unwrap(),
            RatchetConfig::default(),
        )
        .unwrap();
        handshake.one_time_key_id = Some("unknown".to_string());

        assert!(matches!(
            Ratchet::from_external(&mut bob, &alice_external, &handshake, RatchetConfig::default()),
            Err(CryptoError::MissingCounterpartKey(_))
        ));
        assert_eq!(bob.one_time_key_count(), 1);
    }

    #[test]
    fn test_responder_consumes_one_time_key() {
        let mut alice = InternalKeyBundle::new();
        let mut bob = InternalKeyBundle::new();
        let alice_external = alice.generate_external_key().unwrap();

        let (alice_ratchet, handshake) = Ratchet::from_internal(
            &alice,
            &bob.generate_external_key().unwrap(),
            RatchetConfig::default(),
        )
        .unwrap();
        assert!(handshake.one_time_key_id.is_some());

        let bob_ratchet =
            Ratchet::from_external(&mut bob, &alice_external, &handshake, RatchetConfig::default())
                .unwrap();
        assert_eq!(bob_ratchet.root_key(), alice_ratchet.root_key());
        assert_eq!(bob.one_time_key_count(), 0);

        // A replayed handshake cannot reuse the consumed key
        assert!(matches!(
            Ratchet::from_external(&mut bob, &alice_external, &handshake, RatchetConfig::default()),
            Err(CryptoError::MissingCounterpartKey(_))
        ));
    }

    #[test]
    fn test_save_and_load() {
        let (mut alice, mut bob) = session_pair();
        let messages: Vec<Message> =
            (1..=4).map(|i| send(&mut alice, &format!("m{}", i))).collect();
        bob.on_received(&mut messages[2].clone()).unwrap();

        let json = bob.save(b"1234").unwrap().to_json().unwrap();
        let value: serde_json::Value = serde_json::from_str(&json).unwrap();
        assert_eq!(value["rachet_id"], bob.id());
        assert_eq!(value["total_message_recv"], 3);
        assert_eq!(value["missing_message_keys"][0]["index"], 1);

        let mut restored =
            Ratchet::load(&RatchetStore::from_json(&json).unwrap(), b"1234").unwrap();
        assert_eq!(restored.id(), bob.id());
        assert_eq!(restored.root_key(), bob.root_key());
        assert_eq!(restored.skipped_indexes(), vec![1, 2]);
        assert_eq!(restored.total_sent(), 0);

        let mut second = messages[1].clone();
        restored.on_received(&mut second).unwrap();
        assert_eq!(second.plaintext(), Some(&b"m2"[..]));

        let mut fourth = messages[3].clone();
        restored.on_received(&mut fourth).unwrap();
        assert_eq!(fourth.plaintext(), Some(&b"m4"[..]));

        // The restored sender continues its chain too
        let sender_store = alice.save(b"1234").unwrap();
        let mut restored_alice = Ratchet::load(&sender_store, b"1234").unwrap();
        let mut fifth = send(&mut restored_alice, "m5");
        assert_eq!(fifth.index, 5);
        restored.on_received(&mut fifth).unwrap();
        assert_eq!(fifth.plaintext(), Some(&b"m5"[..]));
    }

    #[test]
    fn test_load_wrong_passphrase() {
        let (alice, _) = session_pair();
        let store = alice.save(b"1234").unwrap();
        assert!(matches!(
            Ratchet::load(&store, b"4321"),
            Err(CryptoError::DecryptionFailure)
        ));
    }

    #[test]
    fn test_load_unknown_version() {
        let (alice, _) = session_pair();
        let mut store = alice.save(b"1234").unwrap();
        store.version = 0;
        assert!(matches!(
            Ratchet::load(&store, b"1234"),
            Err(CryptoError::UnsupportedVersion(0))
        ));
    }
}
