//! X3DH (Extended Triple Diffie-Hellman) Key Agreement
//!
//! This module holds the publishable [`ExternalKeyBundle`] and the two halves
//! of the key agreement. Two parties that only share a relay derive the same
//! 16-byte root key.
//!
//! ## Protocol Overview
//!
//! 1. Bob publishes his external bundle (identity key, signed prekey, and
//!    optionally a signed one-time key)
//! 2. Alice fetches and verifies Bob's bundle
//! 3. Alice performs the DH calculations:
//!    - DH1 = DH(IK_A, PK_B)
//!    - DH2 = DH(EK_A, IK_B)
//!    - DH3 = DH(EK_A, PK_B)
//!    - DH4 = DH(EK_A, OPK_B) [only if Bob published a one-time key]
//! 4. Root key: RK = DeriveKey(DH1 || DH2 || DH3 [|| DH4])
//! 5. Alice sends a [`SessionHandshake`] (ratchet id, ephemeral key, one-time key id)
//! 6. Bob mirrors the calculations with his private keys and gets the same RK

use serde::{Deserialize, Serialize};
use zeroize::Zeroizing;

use crate::crypto::encoding;
use crate::crypto::errors::{CryptoError, CryptoResult};
use crate::crypto::keys::{EcPrivateKey, EcPublicKey};
use crate::crypto::symmetric::{derive_key, SymmetricKey};

/// Current external bundle wire version
pub const BUNDLE_VERSION: u32 = 1;

/// Result of X3DH key agreement (initiator side)
pub struct X3dhResult {
    /// The derived root key
    pub root_key: SymmetricKey,
    /// The ID of the peer's one-time key that was used (if any)
    pub one_time_key_id: Option<String>,
}

/// A one-time key as published in an external bundle
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SignedOneTimeKey {
    pub key_id: String,
    pub public_key: EcPublicKey,
    /// ECDSA signature of the serialized public key by the identity key
    pub signature: Vec<u8>,
}

/// Public key material published by a peer
///
/// Only public keys, immutable. The initiator's ephemeral key travels in
/// the [`SessionHandshake`] instead. Must pass [`ExternalKeyBundle::verify`]
/// before use.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExternalKeyBundle {
    identity_key: EcPublicKey,
    pre_key_id: String,
    pre_key: EcPublicKey,
    pre_key_signature: Vec<u8>,
    one_time_key: Option<SignedOneTimeKey>,
}

impl ExternalKeyBundle {
    pub fn new(
        identity_key: EcPublicKey,
        pre_key_id: String,
        pre_key: EcPublicKey,
        pre_key_signature: Vec<u8>,
        one_time_key: Option<SignedOneTimeKey>,
    ) -> Self {
        Self {
            identity_key,
            pre_key_id,
            pre_key,
            pre_key_signature,
            one_time_key,
        }
    }

    pub fn identity_key(&self) -> &EcPublicKey {
        &self.identity_key
    }

    pub fn pre_key_id(&self) -> &str {
        &self.pre_key_id
    }

    pub fn pre_key(&self) -> &EcPublicKey {
        &self.pre_key
    }

    pub fn one_time_key(&self) -> Option<&SignedOneTimeKey> {
        self.one_time_key.as_ref()
    }

    /// Check the prekey signature and, if present, the one-time key signature
    pub fn verify(&self) -> bool {
        let Ok(pre_key) = self.pre_key.serialize() else {
            return false;
        };
        if !self.identity_key.verify(&pre_key, &self.pre_key_signature) {
            tracing::warn!("Prekey {} signature does not verify", self.pre_key_id);
            return false;
        }

        if let Some(ref otk) = self.one_time_key {
            let Ok(one_time_key) = otk.public_key.serialize() else {
                return false;
            };
            if !self.identity_key.verify(&one_time_key, &otk.signature) {
                tracing::warn!("One-time key {} signature does not verify", otk.key_id);
                return false;
            }
        }

        true
    }

    /// [`ExternalKeyBundle::verify`] as a result
    pub fn ensure_verified(&self) -> CryptoResult<()> {
        if self.verify() {
            Ok(())
        } else {
            Err(CryptoError::SignatureVerificationFailure(format!(
                "External bundle with prekey {} rejected",
                self.pre_key_id
            )))
        }
    }

    /// Convert to the wire DTO
    pub fn to_dto(&self) -> CryptoResult<ExternalKeyBundleDto> {
        let (one_time_key_id, one_time_key, one_time_key_sig) = match self.one_time_key {
            Some(ref otk) => (
                Some(otk.key_id.clone()),
                Some(otk.public_key.to_base64()?),
                Some(encoding::encode(&otk.signature)),
            ),
            None => (None, None, None),
        };

        Ok(ExternalKeyBundleDto {
            version: BUNDLE_VERSION,
            identity_key: self.identity_key.to_base64()?,
            pre_key_id: self.pre_key_id.clone(),
            pre_key: self.pre_key.to_base64()?,
            pre_key_sig: encoding::encode(&self.pre_key_signature),
            one_time_key_id,
            one_time_key,
            one_time_key_sig,
        })
    }

    /// Parse the wire DTO
    ///
    /// Parsing does not verify signatures; call [`ExternalKeyBundle::verify`].
    pub fn from_dto(dto: &ExternalKeyBundleDto) -> CryptoResult<Self> {
        if dto.version != BUNDLE_VERSION {
            return Err(CryptoError::UnsupportedVersion(dto.version));
        }

        let one_time_key = match (&dto.one_time_key_id, &dto.one_time_key, &dto.one_time_key_sig) {
            (Some(id), Some(key), Some(sig)) => Some(SignedOneTimeKey {
                key_id: id.clone(),
                public_key: EcPublicKey::from_base64(key)?,
                signature: encoding::decode(sig)?,
            }),
            (None, None, None) => None,
            _ => {
                return Err(CryptoError::MalformedSerialization(
                    "One-time key id, key and signature must be given together".to_string(),
                ))
            }
        };

        Ok(Self {
            identity_key: EcPublicKey::from_base64(&dto.identity_key)?,
            pre_key_id: dto.pre_key_id.clone(),
            pre_key: EcPublicKey::from_base64(&dto.pre_key)?,
            pre_key_signature: encoding::decode(&dto.pre_key_sig)?,
            one_time_key,
        })
    }

    pub fn to_json(&self) -> CryptoResult<String> {
        Ok(serde_json::to_string(&self.to_dto()?)?)
    }

    pub fn from_json(json: &str) -> CryptoResult<Self> {
        let dto: ExternalKeyBundleDto = serde_json::from_str(json)?;
        Self::from_dto(&dto)
    }
}

/// External bundle as exchanged through the relay
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExternalKeyBundleDto {
    pub version: u32,
    pub identity_key: String,
    pub pre_key_id: String,
    pub pre_key: String,
    pub pre_key_sig: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub one_time_key_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub one_time_key: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub one_time_key_sig: Option<String>,
}

/// Information sent from initiator to responder to establish the session
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionHandshake {
    /// Agreed ratchet (chat session) id
    pub ratchet_id: String,
    /// Initiator's ephemeral public key, base64url SPKI
    pub ephemeral_key: String,
    /// ID of the responder's one-time key that was used (if any)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub one_time_key_id: Option<String>,
}

/// Perform X3DH key agreement (initiator/Alice side)
///
/// The bundle is verified first; nothing is computed for a bundle that
/// fails verification.
pub fn x3dh_initiate(
    our_identity: &EcPrivateKey,
    our_ephemeral: &EcPrivateKey,
    their_bundle: &ExternalKeyBundle,
) -> CryptoResult<X3dhResult> {
    their_bundle.ensure_verified()?;

    // DH1 = DH(IK_A, PK_B)
    let dh1 = our_identity.compute_shared_secret(their_bundle.pre_key());
    // DH2 = DH(EK_A, IK_B)
    let dh2 = our_ephemeral.compute_shared_secret(their_bundle.identity_key());
    // DH3 = DH(EK_A, PK_B)
    let dh3 = our_ephemeral.compute_shared_secret(their_bundle.pre_key());
    // DH4 = DH(EK_A, OPK_B)
    let (dh4, one_time_key_id) = match their_bundle.one_time_key() {
        Some(otk) => (
            Some(our_ephemeral.compute_shared_secret(&otk.public_key)),
            Some(otk.key_id.clone()),
        ),
        None => (None, None),
    };

    let root_key = kdf_x3dh(&dh1, &dh2, &dh3, dh4.as_deref().map(Vec::as_slice))?;

    Ok(X3dhResult {
        root_key,
        one_time_key_id,
    })
}

/// Perform X3DH key agreement (responder/Bob side)
///
/// `our_one_time_key` must be the key named by the initiator's handshake,
/// or `None` when the initiator did not use one.
pub fn x3dh_respond(
    our_identity: &EcPrivateKey,
    our_pre_key: &EcPrivateKey,
    our_one_time_key: Option<&EcPrivateKey>,
    their_identity: &EcPublicKey,
    their_ephemeral: &EcPublicKey,
) -> CryptoResult<SymmetricKey> {
    // DH1 = DH(PK_B, IK_A)
    let dh1 = our_pre_key.compute_shared_secret(their_identity);
    // DH2 = DH(IK_B, EK_A)
    let dh2 = our_identity.compute_shared_secret(their_ephemeral);
    // DH3 = DH(PK_B, EK_A)
    let dh3 = our_pre_key.compute_shared_secret(their_ephemeral);
    // DH4 = DH(OPK_B, EK_A)
    let dh4 = our_one_time_key.map(|otk| otk.compute_shared_secret(their_ephemeral));

    kdf_x3dh(&dh1, &dh2, &dh3, dh4.as_deref().map(Vec::as_slice))
}

fn kdf_x3dh(dh1: &[u8], dh2: &[u8], dh3: &[u8], dh4: Option<&[u8]>) -> CryptoResult<SymmetricKey> {
    let mut input = Zeroizing::new(Vec::with_capacity(
        dh1.len() + dh2.len() + dh3.len() + dh4.map_or(0, <[u8]>::len),
    ));
    input.extend_from_slice(dh1);
    input.extend_from_slice(dh2);
    input.extend_from_slice(dh3);
    if let Some(dh4_bytes) = dh4 {
        input.extend_from_slice(dh4_bytes);
    }

    derive_key(&input)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::keys::EcKeyPair;

    struct Party {
        identity: EcKeyPair,
        pre_key: EcKeyPair,
        one_time_key: EcKeyPair,
    }

    impl Party {
        fn new() -> Self {
            Self {
                identity: EcKeyPair::generate(),
                pre_key: EcKeyPair::generate(),
                one_time_key: EcKeyPair::generate(),
            }
        }

        fn bundle(&self, with_one_time_key: bool) -> ExternalKeyBundle {
            let identity = self.identity.private_key().unwrap();
            let pre_key = self.pre_key.public_key().clone();
            let pre_key_sig = identity.sign(&pre_key.serialize().unwrap());

            let one_time_key = with_one_time_key.then(|| {
                let public_key = self.one_time_key.public_key().clone();
                SignedOneTimeKey {
                    key_id: "otk-1".to_string(),
                    signature: identity.sign(&public_key.serialize().unwrap()),
                    public_key,
                }
            });

            ExternalKeyBundle::new(
                self.identity.public_key().clone(),
                "pk-1".to_string(),
                pre_key,
                pre_key_sig,
                one_time_key,
            )
        }
    }

    #[test]
    fn test_x3dh_key_agreement() {
        let alice = Party::new();
        let bob = Party::new();
        let alice_ephemeral = EcKeyPair::generate();

        let alice_result = x3dh_initiate(
            alice.identity.private_key().unwrap(),
            alice_ephemeral.private_key().unwrap(),
            &bob.bundle(true),
        )
        .unwrap();

        let bob_root = x3dh_respond(
            bob.identity.private_key().unwrap(),
            bob.pre_key.private_key().unwrap(),
            Some(bob.one_time_key.private_key().unwrap()),
            alice.identity.public_key(),
            alice_ephemeral.public_key(),
        )
        .unwrap();

        assert_eq!(alice_result.root_key, bob_root);
        assert_eq!(alice_result.one_time_key_id.as_deref(), Some("otk-1"));
    }

    #[test]
    fn test_x3dh_without_one_time_key() {
        let alice = Party::new();
        let bob = Party::new();
        let alice_ephemeral = EcKeyPair::generate();

        let alice_result = x3dh_initiate(
            alice.identity.private_key().unwrap(),
            alice_ephemeral.private_key().unwrap(),
            &bob.bundle(false),
        )
        .unwrap();

        let bob_root = x3dh_respond(
            bob.identity.private_key().unwrap(),
            bob.pre_key.private_key().unwrap(),
            None,
            alice.identity.public_key(),
            alice_ephemeral.public_key(),
        )
        .unwrap();

        assert_eq!(alice_result.root_key, bob_root);
        assert_eq!(alice_result.one_time_key_id, None);
    }

    #[test]
    fn test_one_time_key_decision_must_agree() {
        let alice = Party::new();
        let bob = Party::new();
        let alice_ephemeral = EcKeyPair::generate();

        let alice_result = x3dh_initiate(
            alice.identity.private_key().unwrap(),
            alice_ephemeral.private_key().unwrap(),
            &bob.bundle(true),
        )
        .unwrap();

        let bob_root = x3dh_respond(
            bob.identity.private_key().unwrap(),
            bob.pre_key.private_key().unwrap(),
            None,
            alice.identity.public_key(),
            alice_ephemeral.public_key(),
        )
        .unwrap();

        assert_ne!(alice_result.root_key, bob_root);
    }

    #[test]
    fn test_bundle_verification() {
        let bob = Party::new();
        let bundle = bob.bundle(true);
        assert!(bundle.verify());

        let mut bad_bundle = bundle.clone();
        bad_bundle.pre_key_signature = bob.identity.private_key().unwrap().sign(b"other");
        assert!(!bad_bundle.verify());

        let mut bad_otk = bundle.clone();
        if let Some(ref mut otk) = bad_otk.one_time_key {
            otk.public_key = EcKeyPair::generate().public_key().clone();
        }
        assert!(!bad_otk.verify());
    }

    #[test]
    fn test_forged_bundle_rejected_before_agreement() {
        let alice = Party::new();
        let bob = Party::new();
        let mallory = Party::new();
        let mut forged = bob.bundle(false);
        forged.identity_key = mallory.identity.public_key().clone();

        let ephemeral = EcKeyPair::generate();
        let result = x3dh_initiate(
            alice.identity.private_key().unwrap(),
            ephemeral.private_key().unwrap(),
            &forged,
        );
        assert!(matches!(
            result,
            Err(CryptoError::SignatureVerificationFailure(_))
        ));
    }

    #[test]
    fn test_dto_round_trip_preserves_verification() {
        let bob = Party::new();
        let bundle = bob.bundle(true);

        let json = bundle.to_json().unwrap();
        assert!(json.contains("\"identityKey\""));
        assert!(json.contains("\"oneTimeKeySig\""));

        let restored = ExternalKeyBundle::from_json(&json).unwrap();
        assert_eq!(restored, bundle);
        assert!(restored.verify());
    }

    #[test]
    fn test_dto_omits_absent_one_time_key() {
        let bob = Party::new();
        let json = bob.bundle(false).to_json().unwrap();
        assert!(!json.contains("oneTimeKey"));
    }

    #[test]
    fn test_dto_partial_one_time_key_rejected() {
        let bob = Party::new();
        let mut dto = bob.bundle(true).to_dto().unwrap();
        dto.one_time_key_sig = None;
        assert!(matches!(
            ExternalKeyBundle::from_dto(&dto),
            Err(CryptoError::MalformedSerialization(_))
        ));
    }

    #[test]
    fn test_dto_unknown_version_rejected() {
        let bob = Party::new();
        let mut dto = bob.bundle(false).to_dto().unwrap();
        dto.version = 0;
        assert!(matches!(
            ExternalKeyBundle::from_dto(&dto),
            Err(CryptoError::UnsupportedVersion(0))
        ));
    }

    #[test]
    fn test_dto_missing_identity_rejected() {
        let json = r#"{"version":1,"preKeyId":"a","preKey":"b","preKeySig":"c"}"#;
        assert!(matches!(
            ExternalKeyBundle::from_json(json),
            Err(CryptoError::MalformedSerialization(_))
        ));
    }
}
