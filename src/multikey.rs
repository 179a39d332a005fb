//! C2: key and signature primitive.
//!
//! `did:webvh` verification methods and witness identifiers are expressed as
//! `did:key:z6Mk...` multikeys: a multicodec-tagged Ed25519 public key,
//! multibase-encoded. This module owns the encode/decode of that format and
//! the raw sign/verify operation; `src/proof.rs` (C3) builds
//! `DataIntegrityProof` semantics on top of it.

use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};

use crate::canon::{multibase_b58_decode, multibase_b58_encode};
use crate::error::{CoreError, CoreResult};

/// Multicodec code for an Ed25519 public key, as a two-byte varint prefix.
const ED25519_PUB_MULTICODEC: [u8; 2] = [0xed, 0x01];

/// An Ed25519 public key extracted from a multikey string.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublicKey(VerifyingKey);

impl PublicKey {
    /// Parses a `did:key:z6Mk...` identifier or a bare `z6Mk...` multikey,
    /// returning the Ed25519 public key it encodes.
    pub fn from_multikey(s: &str) -> CoreResult<Self> {
        let multikey = s
            .rsplit_once("did:key:")
            .map(|(_, tail)| tail)
            .unwrap_or(s);
        // A verification method may carry a `#fragment`; did:key fragments
        // echo the same multikey, so stripping it is lossless.
        let multikey = multikey.split('#').next().unwrap_or(multikey);

        let bytes = multibase_b58_decode(multikey)?;
        if bytes.len() != 34 || bytes[0..2] != ED25519_PUB_MULTICODEC {
            return Err(CoreError::MultikeyInvalid(format!(
                "not an Ed25519 multikey: {multikey}"
            )));
        }
        let raw: [u8; 32] = bytes[2..34]
            .try_into()
            .map_err(|_| CoreError::MultikeyInvalid("truncated multikey".into()))?;
        let key = VerifyingKey::from_bytes(&raw)
            .map_err(|e| CoreError::MultikeyInvalid(format!("invalid Ed25519 key: {e}")))?;
        Ok(PublicKey(key))
    }

    /// Encodes this public key as a `z6Mk...` multikey string.
    pub fn to_multikey(&self) -> String {
        let mut bytes = Vec::with_capacity(34);
        bytes.extend_from_slice(&ED25519_PUB_MULTICODEC);
        bytes.extend_from_slice(self.0.as_bytes());
        multibase_b58_encode(&bytes)
    }

    /// Encodes this public key as a `did:key:z6Mk...` identifier.
    pub fn to_did_key(&self) -> String {
        format!("did:key:{}", self.to_multikey())
    }

    /// Verifies `signature` (raw 64 bytes) over `message`.
    pub fn verify(&self, message: &[u8], signature: &[u8]) -> CoreResult<()> {
        let sig_bytes: [u8; 64] = signature
            .try_into()
            .map_err(|_| CoreError::SignatureInvalid)?;
        let sig = Signature::from_bytes(&sig_bytes);
        self.0
            .verify(message, &sig)
            .map_err(|_| CoreError::SignatureInvalid)
    }
}

/// An Ed25519 signing key, used only by test fixtures and by the witness
/// reference implementation under `tests/`; the hosting service itself never
/// holds a controller's private key.
#[derive(Debug)]
pub struct KeyPair(SigningKey);

impl KeyPair {
    pub fn generate<R: rand::RngCore + rand::CryptoRng>(rng: &mut R) -> Self {
        KeyPair(SigningKey::generate(rng))
    }

    pub fn public(&self) -> PublicKey {
        PublicKey(self.0.verifying_key())
    }

    pub fn sign(&self, message: &[u8]) -> Vec<u8> {
        self.0.sign(message).to_bytes().to_vec()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::OsRng;

    #[test]
    fn multikey_roundtrip() {
        let kp = KeyPair::generate(&mut OsRng);
        let pk = kp.public();
        let encoded = pk.to_multikey();
        assert!(encoded.starts_with("z6Mk"));
        let decoded = PublicKey::from_multikey(&encoded).unwrap();
        assert_eq!(pk, decoded);
    }

    #[test]
    fn did_key_roundtrip_with_fragment() {
        let kp = KeyPair::generate(&mut OsRng);
        let pk = kp.public();
        let did_key = pk.to_did_key();
        let vm = format!("{did_key}#{}", &did_key["did:key:".len()..]);
        let decoded = PublicKey::from_multikey(&vm).unwrap();
        assert_eq!(pk, decoded);
    }

    #[test]
    fn sign_and_verify() {
        let kp = KeyPair::generate(&mut OsRng);
        let msg = b"hello webvh";
        let sig = kp.sign(msg);
        kp.public().verify(msg, &sig).unwrap();
    }

    #[test]
    fn verify_rejects_tampered_message() {
        let kp = KeyPair::generate(&mut OsRng);
        let sig = kp.sign(b"hello webvh");
        assert!(kp.public().verify(b"goodbye webvh", &sig).is_err());
    }

    #[test]
    fn rejects_non_ed25519_multicodec() {
        let bytes = [0x00u8, 0x01].iter().chain([0u8; 32].iter()).copied().collect::<Vec<_>>();
        let encoded = crate::canon::multibase_b58_encode(&bytes);
        assert!(PublicKey::from_multikey(&encoded).is_err());
    }
}
