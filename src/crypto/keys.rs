//! Post-quantum key management using SPHINCS+ (stateless hash-based
//! signatures, FIPS 205 family) and CRYSTALS-Kyber (key encapsulation).
//!
//! SPHINCS+-SHAKE-128f-simple is the "fast" 128-bit parameter set: small
//! 32-byte public keys, large (~17 KiB) signatures, no signing state to
//! lose. Kyber1024 provides NIST level 5 key encapsulation for the peer
//! link.

use pqcrypto_kyber::kyber1024;
use pqcrypto_sphincsplus::sphincsshake128fsimple as sphincs;
use pqcrypto_traits::kem::{
    Ciphertext as KemCiphertextTrait, PublicKey as KemPkTrait, SecretKey as KemSkTrait,
    SharedSecret as KemSsTrait,
};
use pqcrypto_traits::sign::{
    DetachedSignature as SigTrait, PublicKey as SignPkTrait, SecretKey as SignSkTrait,
};
use serde::{Deserialize, Serialize};
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::Hash;

// Expected key sizes for validation
pub(crate) const SPHINCS_PK_BYTES: usize = 32;
pub(crate) const SPHINCS_SIG_BYTES: usize = 17088;
const KYBER1024_PK_BYTES: usize = 1568;
const KYBER1024_CT_BYTES: usize = 1568;

// ── Signing (SPHINCS+) ──

/// A SPHINCS+-SHAKE-128f-simple verification key (32 bytes).
///
/// Inner bytes are `pub(crate)` to prevent external construction of
/// unvalidated keys. Use [`SigningKeypair::generate`] or deserialization.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SigningPublicKey(pub(crate) Vec<u8>);

/// A SPHINCS+ signing secret key.
///
/// The inner bytes are `pub(crate)` to prevent external crates from
/// reading or constructing secret keys directly. Use
/// [`SigningKeypair::generate`] or [`SigningKeypair::from_bytes`] instead.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct SigningSecretKey(pub(crate) Vec<u8>);

/// A SPHINCS+ detached signature (17088 bytes).
///
/// Inner bytes are `pub(crate)` to enforce size validation through
/// deserialization.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Signature(pub(crate) Vec<u8>);

impl Signature {
    /// Create an empty signature (used for the genesis block).
    pub fn empty() -> Self {
        Signature(vec![])
    }

    /// Access the raw signature bytes.
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    /// Reconstruct a signature from wire bytes, validating the size.
    /// Empty signatures are allowed (genesis only) — they never verify.
    pub fn from_bytes(bytes: Vec<u8>) -> Option<Self> {
        if !bytes.is_empty() && bytes.len() != SPHINCS_SIG_BYTES {
            return None;
        }
        Some(Signature(bytes))
    }
}

impl Serialize for Signature {
    fn serialize<S: serde::Serializer>(&self, s: S) -> Result<S::Ok, S::Error> {
        serde::Serialize::serialize(&self.0, s)
    }
}

impl<'de> Deserialize<'de> for Signature {
    fn deserialize<D: serde::Deserializer<'de>>(d: D) -> Result<Self, D::Error> {
        let bytes: Vec<u8> = serde::Deserialize::deserialize(d)?;
        // Allow empty signatures (genesis block) and valid SPHINCS+ signatures.
        // Reject anything else to prevent memory exhaustion.
        if !bytes.is_empty() && bytes.len() != SPHINCS_SIG_BYTES {
            return Err(serde::de::Error::custom(format!(
                "invalid SPHINCS+ signature: expected {} bytes, got {}",
                SPHINCS_SIG_BYTES,
                bytes.len()
            )));
        }
        Ok(Signature(bytes))
    }
}

/// A SPHINCS+ signing keypair.
///
/// Implements [`Clone`] because the keypair is shared between the node's
/// block-production and heartbeat subsystems. The secret key is zeroized
/// on drop via [`ZeroizeOnDrop`] on [`SigningSecretKey`].
#[derive(Clone)]
pub struct SigningKeypair {
    pub public: SigningPublicKey,
    pub secret: SigningSecretKey,
}

impl SigningKeypair {
    /// Generate a new random SPHINCS+ keypair.
    pub fn generate() -> Self {
        let (pk, sk) = sphincs::keypair();
        SigningKeypair {
            public: SigningPublicKey(pk.as_bytes().to_vec()),
            secret: SigningSecretKey(sk.as_bytes().to_vec()),
        }
    }

    /// Sign a message, producing a detached signature.
    ///
    /// If the internal secret key is somehow corrupted, logs an error and
    /// returns an empty signature instead of panicking. An empty signature
    /// always fails verification, so no security property is lost.
    pub fn sign(&self, message: &[u8]) -> Signature {
        let sk = match sphincs::SecretKey::from_bytes(&self.secret.0) {
            Ok(sk) => sk,
            Err(_) => {
                tracing::error!("SigningKeypair::sign called with corrupted secret key");
                return Signature::empty();
            }
        };
        let sig = sphincs::detached_sign(message, &sk);
        Signature(sig.as_bytes().to_vec())
    }

    /// Create a keypair from raw bytes, validating key sizes.
    pub fn from_bytes(public: Vec<u8>, secret: Vec<u8>) -> Option<Self> {
        sphincs::PublicKey::from_bytes(&public).ok()?;
        sphincs::SecretKey::from_bytes(&secret).ok()?;
        Some(SigningKeypair {
            public: SigningPublicKey(public),
            secret: SigningSecretKey(secret),
        })
    }

    /// Raw secret key bytes, for persistence to the key file.
    pub fn secret_bytes(&self) -> &[u8] {
        &self.secret.0
    }
}

impl SigningPublicKey {
    /// Access the raw public key bytes.
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    /// Reconstruct a key from wire bytes, validating the size.
    pub fn from_bytes(bytes: Vec<u8>) -> Option<Self> {
        if bytes.len() != SPHINCS_PK_BYTES {
            return None;
        }
        Some(SigningPublicKey(bytes))
    }

    /// Verify a detached signature against this public key.
    pub fn verify(&self, message: &[u8], signature: &Signature) -> bool {
        let pk = match sphincs::PublicKey::from_bytes(&self.0) {
            Ok(pk) => pk,
            Err(_) => return false,
        };
        let sig = match sphincs::DetachedSignature::from_bytes(&signature.0) {
            Ok(s) => s,
            Err(_) => return false,
        };
        sphincs::verify_detached_signature(&sig, message, &pk).is_ok()
    }

    /// Derive the participant identifier: a domain-separated SHA3-256 hash
    /// of the verification key. Stable for the life of the identity.
    pub fn fingerprint(&self) -> Hash {
        crate::hash_domain(b"tempora.participant", &self.0)
    }

    /// Check if this public key has the correct size.
    pub fn is_valid_size(&self) -> bool {
        self.0.len() == SPHINCS_PK_BYTES
    }
}

impl Serialize for SigningPublicKey {
    fn serialize<S: serde::Serializer>(&self, s: S) -> Result<S::Ok, S::Error> {
        serde::Serialize::serialize(&self.0, s)
    }
}

impl<'de> Deserialize<'de> for SigningPublicKey {
    fn deserialize<D: serde::Deserializer<'de>>(d: D) -> Result<Self, D::Error> {
        let bytes: Vec<u8> = serde::Deserialize::deserialize(d)?;
        if bytes.len() != SPHINCS_PK_BYTES {
            return Err(serde::de::Error::custom(format!(
                "invalid SPHINCS+ public key: expected {} bytes, got {}",
                SPHINCS_PK_BYTES,
                bytes.len()
            )));
        }
        Ok(SigningPublicKey(bytes))
    }
}

// ── Key Encapsulation (Kyber1024) ──

/// A CRYSTALS-Kyber1024 encapsulation public key (1568 bytes).
#[derive(Clone, Debug)]
pub struct KemPublicKey(pub(crate) Vec<u8>);

/// A CRYSTALS-Kyber1024 encapsulation secret key. Zeroized on drop.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct KemSecretKey(pub(crate) Vec<u8>);

/// A Kyber1024 ciphertext (encapsulated shared secret).
#[derive(Clone, Debug)]
pub struct KemCiphertext(pub(crate) Vec<u8>);

impl KemCiphertext {
    /// Access the raw ciphertext bytes.
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    /// Reconstruct a ciphertext from wire bytes, validating the size.
    pub fn from_bytes(bytes: Vec<u8>) -> Option<Self> {
        if bytes.len() != KYBER1024_CT_BYTES {
            return None;
        }
        Some(KemCiphertext(bytes))
    }
}

impl Serialize for KemCiphertext {
    fn serialize<S: serde::Serializer>(&self, s: S) -> Result<S::Ok, S::Error> {
        serde::Serialize::serialize(&self.0, s)
    }
}

impl<'de> Deserialize<'de> for KemCiphertext {
    fn deserialize<D: serde::Deserializer<'de>>(d: D) -> Result<Self, D::Error> {
        let bytes: Vec<u8> = serde::Deserialize::deserialize(d)?;
        if bytes.len() != KYBER1024_CT_BYTES {
            return Err(serde::de::Error::custom(format!(
                "invalid Kyber1024 ciphertext: expected {} bytes, got {}",
                KYBER1024_CT_BYTES,
                bytes.len()
            )));
        }
        Ok(KemCiphertext(bytes))
    }
}

/// The shared secret produced by Kyber KEM (32 bytes).
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct SharedSecret(pub(crate) [u8; 32]);

impl SharedSecret {
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }
}

/// A Kyber1024 KEM keypair. The secret key is zeroized on drop.
#[derive(Clone)]
pub struct KemKeypair {
    pub public: KemPublicKey,
    pub secret: KemSecretKey,
}

impl KemKeypair {
    /// Generate a new random Kyber1024 keypair.
    pub fn generate() -> Self {
        let (pk, sk) = kyber1024::keypair();
        KemKeypair {
            public: KemPublicKey(pk.as_bytes().to_vec()),
            secret: KemSecretKey(sk.as_bytes().to_vec()),
        }
    }

    /// Decapsulate a ciphertext to recover the shared secret.
    pub fn decapsulate(&self, ciphertext: &KemCiphertext) -> Option<SharedSecret> {
        let sk = kyber1024::SecretKey::from_bytes(&self.secret.0).ok()?;
        let ct = kyber1024::Ciphertext::from_bytes(&ciphertext.0).ok()?;
        let ss = kyber1024::decapsulate(&ct, &sk);
        let bytes = ss.as_bytes();
        let mut arr = [0u8; 32];
        arr.copy_from_slice(&bytes[..32]);
        Some(SharedSecret(arr))
    }

    /// Create a keypair from raw bytes, validating key sizes.
    pub fn from_bytes(public: Vec<u8>, secret: Vec<u8>) -> Option<Self> {
        kyber1024::PublicKey::from_bytes(&public).ok()?;
        kyber1024::SecretKey::from_bytes(&secret).ok()?;
        Some(KemKeypair {
            public: KemPublicKey(public),
            secret: KemSecretKey(secret),
        })
    }

    /// Raw secret key bytes, for persistence to the key file.
    pub fn secret_bytes(&self) -> &[u8] {
        &self.secret.0
    }
}

impl KemPublicKey {
    /// Access the raw public key bytes.
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    /// Reconstruct a key from wire bytes, validating the size.
    pub fn from_bytes(bytes: Vec<u8>) -> Option<Self> {
        if bytes.len() != KYBER1024_PK_BYTES {
            return None;
        }
        Some(KemPublicKey(bytes))
    }

    /// Encapsulate: generate a shared secret and its ciphertext.
    /// Only the holder of the corresponding secret key can decapsulate.
    pub fn encapsulate(&self) -> Option<(SharedSecret, KemCiphertext)> {
        let pk = kyber1024::PublicKey::from_bytes(&self.0).ok()?;
        let (ss, ct) = kyber1024::encapsulate(&pk);
        let bytes = ss.as_bytes();
        let mut arr = [0u8; 32];
        arr.copy_from_slice(&bytes[..32]);
        Some((SharedSecret(arr), KemCiphertext(ct.as_bytes().to_vec())))
    }

    /// Derive a compact fingerprint of the KEM key.
    pub fn fingerprint(&self) -> Hash {
        crate::hash_domain(b"tempora.kem", &self.0)
    }
}

impl Serialize for KemPublicKey {
    fn serialize<S: serde::Serializer>(&self, s: S) -> Result<S::Ok, S::Error> {
        serde::Serialize::serialize(&self.0, s)
    }
}

impl<'de> Deserialize<'de> for KemPublicKey {
    fn deserialize<D: serde::Deserializer<'de>>(d: D) -> Result<Self, D::Error> {
        let bytes: Vec<u8> = serde::Deserialize::deserialize(d)?;
        if bytes.len() != KYBER1024_PK_BYTES {
            return Err(serde::de::Error::custom(format!(
                "invalid Kyber1024 public key: expected {} bytes, got {}",
                KYBER1024_PK_BYTES,
                bytes.len()
            )));
        }
        Ok(KemPublicKey(bytes))
    }
}
