//! End-to-end encryption core
//!
//! X3DH-style key agreement over P-384 followed by a symmetric hash ratchet,
//! with every persisted secret encrypted under a caller passphrase.
//!
//! ## Components
//!
//! - **symmetric**: HKDF key derivation and the hash-then-AES-GCM blob format
//! - **keys**: P-384 key pairs, ECDH, ECDSA and the key pair store
//! - **prekeys**: the local key bundle (identity, ephemeral, prekey, one-time keys)
//! - **x3dh**: published bundles, their verification, and root key agreement
//! - **ratchet**: per-session chain keys, out-of-order delivery, persistence
//! - **message**: message encryption and its wire form
//! - **sessions**: storage collaborator interface
//! - **service**: High-level CryptoService facade
//!
//! ## Usage
//!
//! ```rust,ignore
//! use lidx_core::crypto::{InternalKeyBundle, Ratchet, RatchetConfig};
//!
//! let mut bob = InternalKeyBundle::new();
//! let bob_bundle = bob.generate_external_key()?;
//!
//! let alice = InternalKeyBundle::new();
//! let (mut ratchet, handshake) =
//!     Ratchet::from_internal(&alice, &bob_bundle, RatchetConfig::default())?;
//!
//! let mut message = ratchet.populate_message(b"hello".to_vec(), false);
//! ratchet.on_send(&mut message)?;
//! ```

pub mod encoding;
pub mod errors;
pub mod keys;
pub mod message;
pub mod prekeys;
pub mod ratchet;
pub mod service;
pub mod sessions;
pub mod symmetric;
pub mod x3dh;

// Re-export commonly used types
pub use errors::{CryptoError, CryptoResult};
pub use keys::{EcKeyPair, EcPrivateKey, EcPublicKey, KeyPairStore};
pub use message::{Message, MessageDto, PlainPayload};
pub use prekeys::{InternalKeyBundle, InternalKeyBundleStore, PreKeyConfig, PreKeyStatus};
pub use ratchet::{Ratchet, RatchetConfig, RatchetState, RatchetStore, SessionStats};
pub use service::{CryptoService, VoipSession};
pub use sessions::{BlobStore, MemoryBlobStore, SessionStore};
pub use symmetric::{decrypt_hashed_data, derive_key, encrypt_and_hash, random_bytes, SymmetricKey};
pub use x3dh::{
    x3dh_initiate, x3dh_respond, ExternalKeyBundle, ExternalKeyBundleDto, SessionHandshake,
    X3dhResult,
};
