//! Cryptographic error types
//!
//! Every failure in the core surfaces as a [`CryptoError`] returned to the
//! caller. None of them leave key or ratchet state partially updated.
//! Exhaustion of the secure randomness source is not represented here: it
//! aborts the operation (see [`crate::crypto::symmetric::random_bytes`]).

use thiserror::Error;

/// Errors that can occur during cryptographic operations
#[derive(Debug, Error)]
pub enum CryptoError {
    /// A persisted key pair failed its SHA-256 integrity check
    #[error("Key store hash mismatch: {0}")]
    KeyStoreHashMismatch(String),

    /// An external bundle signature did not verify
    #[error("Signature verification failed: {0}")]
    SignatureVerificationFailure(String),

    /// Wrong key or passphrase, corrupt ciphertext, or tag/hash mismatch
    #[error("Decryption failed")]
    DecryptionFailure,

    /// Unparseable bytes, base64 or JSON
    #[error("Malformed serialization: {0}")]
    MalformedSerialization(String),

    /// Message belongs to another ratchet
    #[error("Message for session {got} delivered to ratchet {expected}")]
    WrongRatchetSession { expected: String, got: String },

    /// Operation needs a key that is not available locally
    #[error("Missing counterpart key: {0}")]
    MissingCounterpartKey(String),

    /// Send, receive or save attempted before the root key was derived
    #[error("Session {0} has not been established")]
    SessionNotEstablished(String),

    /// Index already consumed and no buffered key exists for it
    #[error("Message index {index} rejected (last received {last})")]
    MessageIndexRejected { index: u64, last: u64 },

    /// Gap between the last received index and the incoming one is too large
    #[error("Refusing to skip {requested} messages (limit {limit})")]
    TooManySkippedMessages { requested: u64, limit: u64 },

    /// Wire or store version tag not understood
    #[error("Unsupported format version: {0}")]
    UnsupportedVersion(u32),

    /// Facade used in the wrong order (no identity, duplicate ratchet, ...)
    #[error("Invalid state: {0}")]
    InvalidState(String),

    /// The storage collaborator failed
    #[error("Storage error: {0}")]
    StorageError(String),

    /// Internal error
    #[error("Internal crypto error: {0}")]
    InternalError(String),
}

impl From<serde_json::Error> for CryptoError {
    fn from(e: serde_json::Error) -> Self {
        CryptoError::MalformedSerialization(e.to_string())
    }
}

impl From<base64::DecodeError> for CryptoError {
    fn from(e: base64::DecodeError) -> Self {
        CryptoError::MalformedSerialization(format!("Invalid base64: {}", e))
    }
}

impl From<aes_gcm::Error> for CryptoError {
    fn from(_: aes_gcm::Error) -> Self {
        CryptoError::DecryptionFailure
    }
}

// Errors cross the binding boundary as plain strings
impl serde::Serialize for CryptoError {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_str(&self.to_string())
    }
}

/// Result type for cryptographic operations
pub type CryptoResult<T> = Result<T, CryptoError>;
