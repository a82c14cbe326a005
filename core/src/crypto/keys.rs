//! EC key primitives over NIST P-384
//!
//! This module defines the key types used throughout the protocol:
//! - [`EcPublicKey`]: serializable (SPKI DER), ECDSA verification
//! - [`EcPrivateKey`]: ECDH, ECDSA signing, passphrase-encrypted serialization
//! - [`EcKeyPair`]: a public key plus an optional private key (public-only for peers)
//! - [`KeyPairStore`]: the persisted, integrity-checked form of a key pair
//!
//! Raw private key material never leaves this module unencrypted: the only
//! serialization of an [`EcPrivateKey`] is the SEC1 DER passed through
//! [`encrypt_and_hash`].

use p384::ecdsa::signature::{RandomizedSigner, Verifier};
use p384::ecdsa::{Signature, SigningKey, VerifyingKey};
use p384::pkcs8::{DecodePublicKey, EncodePublicKey};
use p384::{PublicKey, SecretKey};
use rand::rngs::OsRng;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use zeroize::Zeroizing;

use crate::crypto::encoding;
use crate::crypto::errors::{CryptoError, CryptoResult};
use crate::crypto::symmetric::{decrypt_hashed_data, encrypt_and_hash};

/// Public half of a P-384 key
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EcPublicKey {
    inner: PublicKey,
}

impl EcPublicKey {
    /// Parse a SubjectPublicKeyInfo DER encoding
    pub fn deserialize(bytes: &[u8]) -> CryptoResult<Self> {
        let inner = PublicKey::from_public_key_der(bytes).map_err(|e| {
            CryptoError::MalformedSerialization(format!("Invalid public key: {}", e))
        })?;
        Ok(Self { inner })
    }

    /// Parse a base64url SubjectPublicKeyInfo encoding
    pub fn from_base64(data: &str) -> CryptoResult<Self> {
        Self::deserialize(&encoding::decode(data)?)
    }

    /// SubjectPublicKeyInfo DER encoding
    pub fn serialize(&self) -> CryptoResult<Vec<u8>> {
        let der = self.inner.to_public_key_der().map_err(|e| {
            CryptoError::InternalError(format!("Cannot encode public key: {}", e))
        })?;
        Ok(der.as_bytes().to_vec())
    }

    /// Base64url SubjectPublicKeyInfo encoding
    pub fn to_base64(&self) -> CryptoResult<String> {
        Ok(encoding::encode(&self.serialize()?))
    }

    /// Verify an ASN.1 DER ECDSA signature over `message`
    ///
    /// Returns `false` for a malformed signature as well as a wrong one.
    pub fn verify(&self, message: &[u8], signature: &[u8]) -> bool {
        let Ok(signature) = Signature::from_der(signature) else {
            return false;
        };
        VerifyingKey::from(&self.inner)
            .verify(message, &signature)
            .is_ok()
    }

    /// Compute a fingerprint for key verification
    pub fn fingerprint(&self) -> CryptoResult<String> {
        let hash = Sha256::digest(self.serialize()?);
        Ok(hex::encode(&hash[..8]))
    }
}

/// Private half of a P-384 key
#[derive(Clone)]
pub struct EcPrivateKey {
    inner: SecretKey,
}

impl EcPrivateKey {
    /// Decrypt and parse bytes produced by [`EcPrivateKey::serialize`]
    pub fn deserialize(bytes: &[u8], passphrase: &[u8]) -> CryptoResult<Self> {
        let der = Zeroizing::new(decrypt_hashed_data(bytes, passphrase)?);
        let inner = SecretKey::from_sec1_der(&der).map_err(|e| {
            CryptoError::MalformedSerialization(format!("Invalid private key: {}", e))
        })?;
        Ok(Self { inner })
    }

    /// SEC1 DER encoding, encrypted under `passphrase`
    pub fn serialize(&self, passphrase: &[u8]) -> CryptoResult<Vec<u8>> {
        let der = self.inner.to_sec1_der().map_err(|e| {
            CryptoError::InternalError(format!("Cannot encode private key: {}", e))
        })?;
        encrypt_and_hash(&der, passphrase)
    }

    /// The matching public key
    pub fn public_key(&self) -> EcPublicKey {
        EcPublicKey {
            inner: self.inner.public_key(),
        }
    }

    /// ECDH with a peer public key
    ///
    /// Returns the 48-byte x-coordinate of the shared point. Commutative:
    /// `a.compute_shared_secret(&b_pub) == b.compute_shared_secret(&a_pub)`.
    pub fn compute_shared_secret(&self, their_public: &EcPublicKey) -> Zeroizing<Vec<u8>> {
        let shared = p384::ecdh::diffie_hellman(
            self.inner.to_nonzero_scalar(),
            their_public.inner.as_affine(),
        );
        Zeroizing::new(shared.raw_secret_bytes().to_vec())
    }

    /// Produce a randomized ASN.1 DER ECDSA signature over `message`
    pub fn sign(&self, message: &[u8]) -> Vec<u8> {
        let signing_key = SigningKey::from(&self.inner);
        let signature: Signature = signing_key.sign_with_rng(&mut OsRng, message);
        signature.to_der().as_bytes().to_vec()
    }
}

impl std::fmt::Debug for EcPrivateKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("EcPrivateKey(..)")
    }
}

/// A public key and, for local keys, its private key
#[derive(Debug, Clone)]
pub struct EcKeyPair {
    public: EcPublicKey,
    private: Option<EcPrivateKey>,
}

impl EcKeyPair {
    /// Generate a new random key pair
    pub fn generate() -> Self {
        let secret = SecretKey::random(&mut OsRng);
        let private = EcPrivateKey { inner: secret };
        Self {
            public: private.public_key(),
            private: Some(private),
        }
    }

    /// Wrap a peer's public key
    pub fn from_public(public: EcPublicKey) -> Self {
        Self {
            public,
            private: None,
        }
    }

    /// The public key
    pub fn public_key(&self) -> &EcPublicKey {
        &self.public
    }

    /// The private key, if this pair holds one
    pub fn private_key(&self) -> CryptoResult<&EcPrivateKey> {
        self.private.as_ref().ok_or_else(|| {
            CryptoError::MissingCounterpartKey("Key pair holds no private key".to_string())
        })
    }

    /// Whether this pair holds a private key
    pub fn has_private_key(&self) -> bool {
        self.private.is_some()
    }

    /// Serialize into an integrity-checked store, encrypting the private key
    pub fn save(&self, passphrase: &[u8]) -> CryptoResult<KeyPairStore> {
        let public_key = self.public.serialize()?;
        let private_key = self.private_key()?.serialize(passphrase)?;

        Ok(KeyPairStore {
            public_hash: encoding::encode(&Sha256::digest(&public_key)),
            private_hash: encoding::encode(&Sha256::digest(&private_key)),
            public_key: encoding::encode(&public_key),
            private_key: encoding::encode(&private_key),
        })
    }

    /// Restore from a store produced by [`EcKeyPair::save`]
    ///
    /// Both hashes are checked before anything is decrypted.
    pub fn load(store: &KeyPairStore, passphrase: &[u8]) -> CryptoResult<Self> {
        let public_key = encoding::decode(&store.public_key)?;
        let private_key = encoding::decode(&store.private_key)?;
        let public_hash = encoding::decode(&store.public_hash)?;
        let private_hash = encoding::decode(&store.private_hash)?;

        if Sha256::digest(&public_key).as_slice() != public_hash.as_slice() {
            return Err(CryptoError::KeyStoreHashMismatch("public key".to_string()));
        }
        if Sha256::digest(&private_key).as_slice() != private_hash.as_slice() {
            return Err(CryptoError::KeyStoreHashMismatch("private key".to_string()));
        }

        let private = EcPrivateKey::deserialize(&private_key, passphrase)?;
        let public = EcPublicKey::deserialize(&public_key)?;
        if private.public_key() != public {
            return Err(CryptoError::KeyStoreHashMismatch(
                "public key does not match private key".to_string(),
            ));
        }

        Ok(Self {
            public,
            private: Some(private),
        })
    }
}

/// Persisted key pair; every field is base64url without padding
///
/// `private_key` is the encrypted blob from [`EcPrivateKey::serialize`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyPairStore {
    pub public_key: String,
    pub private_key: String,
    pub public_hash: String,
    pub private_hash: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_key_generation() {
        let key = EcKeyPair::generate();
        assert!(key.has_private_key());
        // P-384 SPKI DER is 120 bytes
        assert_eq!(key.public_key().serialize().unwrap().len(), 120);
    }

    #[test]
    fn test_public_key_round_trip() {
        let key = EcKeyPair::generate();
        let bytes = key.public_key().serialize().unwrap();
        let restored = EcPublicKey::deserialize(&bytes).unwrap();
        assert_eq!(&restored, key.public_key());
    }

    #[test]
    fn test_malformed_public_key() {
        assert!(matches!(
            EcPublicKey::deserialize(b"not a key"),
            Err(CryptoError::MalformedSerialization(_))
        ));
    }

    #[test]
    fn test_private_key_serialization_is_encrypted() {
        let key = EcKeyPair::generate();
        let private = key.private_key().unwrap();
        let blob = private.serialize(b"1234").unwrap();

        let restored = EcPrivateKey::deserialize(&blob, b"1234").unwrap();
        assert_eq!(&restored.public_key(), key.public_key());

        assert!(matches!(
            EcPrivateKey::deserialize(&blob, b"4321"),
            Err(CryptoError::DecryptionFailure)
        ));
    }

    #[test]
    fn test_diffie_hellman() {
        let alice = EcKeyPair::generate();
        let bob = EcKeyPair::generate();

        let shared_alice = alice
            .private_key()
            .unwrap()
            .compute_shared_secret(bob.public_key());
        let shared_bob = bob
            .private_key()
            .unwrap()
            .compute_shared_secret(alice.public_key());

        assert_eq!(shared_alice.len(), 48);
        assert_eq!(shared_alice, shared_bob);
    }

    #[test]
    fn test_sign_and_verify() {
        let key = EcKeyPair::generate();
        let message = b"TEST STRING";
        let signature = key.private_key().unwrap().sign(message);

        assert!(key.public_key().verify(message, &signature));
        assert!(!key.public_key().verify(b"TEST STRINH", &signature));

        let other = EcKeyPair::generate();
        assert!(!other.public_key().verify(message, &signature));
        assert!(!key.public_key().verify(message, b"garbage"));
    }

    #[test]
    fn test_key_store_round_trip() {
        let key = EcKeyPair::generate();
        let store = key.save(b"1234").unwrap();
        let restored = EcKeyPair::load(&store, b"1234").unwrap();

        assert_eq!(restored.public_key(), key.public_key());
        let first_sig = key.private_key().unwrap().sign(b"m");
        assert!(restored.public_key().verify(b"m", &first_sig));
    }

    #[test]
    fn test_key_store_tampered_hash() {
        let key = EcKeyPair::generate();
        let mut store = key.save(b"1234").unwrap();
        store.public_hash = encoding::encode(&[0u8; 32]);

        assert!(matches!(
            EcKeyPair::load(&store, b"1234"),
            Err(CryptoError::KeyStoreHashMismatch(_))
        ));
    }

    #[test]
    fn test_key_store_single_hash_mismatch_rejected() {
        let key = EcKeyPair::generate();
        let mut store = key.save(b"1234").unwrap();
        store.private_hash = store.public_hash.clone();

        assert!(matches!(
            EcKeyPair::load(&store, b"1234"),
            Err(CryptoError::KeyStoreHashMismatch(_))
        ));
    }

    #[test]
    fn test_key_store_wrong_passphrase() {
        let key = EcKeyPair::generate();
        let store = key.save(b"1234").unwrap();
        assert!(matches!(
            EcKeyPair::load(&store, b"0000"),
            Err(CryptoError::DecryptionFailure)
        ));
    }

    #[test]
    fn test_public_only_pair_cannot_be_saved() {
        let peer = EcKeyPair::from_public(EcKeyPair::generate().public_key().clone());
        assert!(matches!(
            peer.save(b"1234"),
            Err(CryptoError::MissingCounterpartKey(_))
        ));
    }

    #[test]
    fn test_fingerprint() {
        let key = EcKeyPair::generate();
        let fingerprint = key.public_key().fingerprint().unwrap();
        assert_eq!(fingerprint.len(), 16); // 8 bytes as hex = 16 chars
    }
}
