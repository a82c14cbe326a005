//! Message Codec
//!
//! A [`Message`] carries a session id, a per-direction index and either a
//! plaintext (transient, never persisted) or a ciphertext blob in the
//! [`encrypt_and_hash`] layout. Keys always come from the ratchet; this
//! module never derives or stores one.

use serde::{Deserialize, Serialize};
use zeroize::Zeroizing;

use crate::crypto::encoding;
use crate::crypto::errors::{CryptoError, CryptoResult};
use crate::crypto::symmetric::{decrypt_hashed_data, encrypt_and_hash, SymmetricKey};

/// A chat message bound to one ratchet
#[derive(Debug, Clone)]
pub struct Message {
    pub session_id: String,
    pub index: u64,
    pub plaintext: Option<Zeroizing<Vec<u8>>>,
    pub ciphertext: Vec<u8>,
    pub is_binary: bool,
}

impl Message {
    /// Create an outgoing message; index and session id are stamped on send
    pub fn new(
        session_id: impl Into<String>,
        index: u64,
        plaintext: Vec<u8>,
        is_binary: bool,
    ) -> Self {
        Self {
            session_id: session_id.into(),
            index,
            plaintext: Some(Zeroizing::new(plaintext)),
            ciphertext: Vec::new(),
            is_binary,
        }
    }

    /// Encrypt the plaintext under a chain key
    pub fn encrypt(&mut self, key: &SymmetricKey) -> CryptoResult<()> {
        let plaintext = self
            .plaintext
            .as_ref()
            .ok_or_else(|| CryptoError::InvalidState("Message has no plaintext".to_string()))?;
        self.ciphertext = encrypt_and_hash(plaintext, key)?;
        Ok(())
    }

    /// Decrypt the ciphertext under a chain key
    ///
    /// The message is left untouched on failure.
    pub fn decrypt(&mut self, key: &SymmetricKey) -> CryptoResult<()> {
        let plaintext = decrypt_hashed_data(&self.ciphertext, key)?;
        self.plaintext = Some(Zeroizing::new(plaintext));
        Ok(())
    }

    pub fn plaintext(&self) -> Option<&[u8]> {
        self.plaintext.as_ref().map(|p| p.as_slice())
    }

    pub fn to_dto(&self) -> MessageDto {
        MessageDto {
            chat_session_id: self.session_id.clone(),
            index: self.index,
            cipher_message: encoding::encode(&self.ciphertext),
            is_binary: self.is_binary,
        }
    }

    pub fn from_dto(dto: &MessageDto) -> CryptoResult<Self> {
        Ok(Self {
            session_id: dto.chat_session_id.clone(),
            index: dto.index,
            plaintext: None,
            ciphertext: encoding::decode(&dto.cipher_message)?,
            is_binary: dto.is_binary,
        })
    }

    pub fn to_json(&self) -> CryptoResult<String> {
        Ok(serde_json::to_string(&self.to_dto())?)
    }

    pub fn from_json(json: &str) -> CryptoResult<Self> {
        let dto: MessageDto = serde_json::from_str(json)?;
        Self::from_dto(&dto)
    }
}

/// Wire form of a [`Message`]
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessageDto {
    pub chat_session_id: String,
    pub index: u64,
    /// base64url ciphertext blob
    pub cipher_message: String,
    #[serde(default)]
    pub is_binary: bool,
}

/// Caller-facing message content
///
/// Binary content crosses the text boundary as base64url.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PlainPayload {
    Text(String),
    Binary(Vec<u8>),
}

impl PlainPayload {
    /// Parse caller content; binary content must be base64url
    pub fn from_content(is_binary: bool, content: &str) -> CryptoResult<Self> {
        if is_binary {
            Ok(Self::Binary(encoding::decode(content)?))
        } else {
            Ok(Self::Text(content.to_string()))
        }
    }

    /// Rebuild a payload from decrypted bytes
    pub fn from_bytes(is_binary: bool, bytes: &[u8]) -> CryptoResult<Self> {
        if is_binary {
            Ok(Self::Binary(bytes.to_vec()))
        } else {
            let text = String::from_utf8(bytes.to_vec()).map_err(|e| {
                CryptoError::MalformedSerialization(format!("Text message is not UTF-8: {}", e))
            })?;
            Ok(Self::Text(text))
        }
    }

    pub fn is_binary(&self) -> bool {
        matches!(self, Self::Binary(_))
    }

    pub fn as_bytes(&self) -> &[u8] {
        match self {
            Self::Text(text) => text.as_bytes(),
            Self::Binary(bytes) => bytes,
        }
    }

    /// Render for the caller; binary content is base64url encoded
    pub fn to_content_string(&self) -> String {
        match self {
            Self::Text(text) => text.clone(),
            Self::Binary(bytes) => encoding::encode(bytes),
        }
    }
}
