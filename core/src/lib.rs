//! lidx core - end-to-end encryption engine
//!
//! Key agreement, per-message ratcheting and encrypted persistence for a
//! messaging client. Transport, storage and user accounts stay with the
//! caller; storage is reached through [`crypto::BlobStore`].

pub mod config;
pub mod crypto;

pub use config::CryptoConfig;
pub use crypto::{
    BlobStore, CryptoError, CryptoResult, CryptoService, ExternalKeyBundle, InternalKeyBundle,
    MemoryBlobStore, Message, MessageDto, PlainPayload, Ratchet, SessionHandshake,
};

/// Install a `tracing` subscriber filtered by `RUST_LOG`
///
/// Does nothing if a global subscriber is already set.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "lidx_core=info".into()),
        )
        .try_init();
}
