//! C3: data-integrity proof verifier.
//!
//! Verifies `DataIntegrityProof` objects of cryptosuite `eddsa-jcs-2022`:
//! the signed message is
//! `sha256(canonicalize(proofOptions)) ‖ sha256(canonicalize(document))`,
//! where `proofOptions` is the proof with `proofValue` removed and
//! `document` is the target object with `proof` removed. Grounded in the
//! `eddsa-jcs-2022` cryptosuite implementation in the reference pack.

use chrono::Utc;
use serde::Serialize;

use crate::canon::{canonicalize, multibase_b58_decode, sha256};
use crate::error::{CoreError, CoreResult};
use crate::multikey::PublicKey;
use crate::types::DataIntegrityProof;

/// Resolves the Ed25519 public key a `verificationMethod` string names.
/// `did:key:` verifiers carry their own key in the fragment; any other
/// verification method must be looked up by the caller (typically in the
/// subject's current DID document) and passed in as `known_key`.
pub trait VerificationMethodResolver {
    fn resolve(&self, verification_method: &str) -> CoreResult<PublicKey>;
}

/// Resolves only `did:key:` verification methods, failing on anything else.
/// Used for witness proofs, whose `verificationMethod` is always a bare
/// `did:key:MK#MK`.
pub struct DidKeyResolver;

impl VerificationMethodResolver for DidKeyResolver {
    fn resolve(&self, verification_method: &str) -> CoreResult<PublicKey> {
        if !verification_method.starts_with("did:key:") {
            return Err(CoreError::KeyUnresolved(format!(
                "not a did:key verification method: {verification_method}"
            )));
        }
        PublicKey::from_multikey(verification_method)
    }
}

/// Resolves a verification method against a single already-known DID
/// document, the way C3 resolves a controller proof against the subject's
/// most recent state.
pub struct DocumentResolver<'a> {
    pub document: &'a crate::types::DidDocument,
}

impl<'a> VerificationMethodResolver for DocumentResolver<'a> {
    fn resolve(&self, verification_method: &str) -> CoreResult<PublicKey> {
        if verification_method.starts_with("did:key:") {
            return PublicKey::from_multikey(verification_method);
        }
        let vm = self
            .document
            .find_verification_method(verification_method)
            .ok_or_else(|| {
                CoreError::KeyUnresolved(format!(
                    "verification method not found in document: {verification_method}"
                ))
            })?;
        let multibase = vm.public_key_multibase.as_deref().ok_or_else(|| {
            CoreError::KeyUnresolved(format!(
                "verification method has no publicKeyMultibase: {verification_method}"
            ))
        })?;
        PublicKey::from_multikey(multibase)
    }
}

/// Verifies `proof` over `document` (the proof's own container, with `proof`
/// removed before canonicalization). `document` must already have its
/// `proof` field stripped; callers pass the bare subject object.
pub fn verify_proof<T: Serialize>(
    proof: &DataIntegrityProof,
    document: &T,
    resolver: &dyn VerificationMethodResolver,
    expected_purpose: &str,
) -> CoreResult<()> {
    if proof.proof_type != DataIntegrityProof::TYPE {
        return Err(CoreError::ProofInvalid(format!(
            "unsupported proof type: {}",
            proof.proof_type
        )));
    }
    if proof.cryptosuite != DataIntegrityProof::CRYPTOSUITE {
        return Err(CoreError::ProofInvalid(format!(
            "unsupported cryptosuite: {}",
            proof.cryptosuite
        )));
    }
    if proof.proof_purpose != expected_purpose {
        return Err(CoreError::ProofInvalid(format!(
            "expected proofPurpose {expected_purpose}, got {}",
            proof.proof_purpose
        )));
    }
    if let Some(expires) = proof.expires {
        if expires < Utc::now() {
            return Err(CoreError::ProofExpired);
        }
    }

    let proof_options = proof.without_value();
    let canon_options = canonicalize(&proof_options)?;
    let canon_document = canonicalize(document)?;

    let mut message = Vec::with_capacity(64);
    message.extend_from_slice(&sha256(canon_options.as_bytes()));
    message.extend_from_slice(&sha256(canon_document.as_bytes()));

    let signature = multibase_b58_decode(&proof.proof_value)
        .map_err(|_| CoreError::ProofInvalid("proofValue is not valid multibase".into()))?;

    let public_key = resolver.resolve(&proof.verification_method)?;
    public_key.verify(&message, &signature)
}

/// Verifies that at least one of `proofs` verifies over `document` with the
/// expected purpose, returning the first proof that does.
pub fn verify_any_proof<'p, T: Serialize>(
    proofs: &'p [DataIntegrityProof],
    document: &T,
    resolver: &dyn VerificationMethodResolver,
    expected_purpose: &str,
) -> CoreResult<&'p DataIntegrityProof> {
    if proofs.is_empty() {
        return Err(CoreError::ProofInvalid("no proof present".into()));
    }
    let mut last_err = None;
    for proof in proofs {
        match verify_proof(proof, document, resolver, expected_purpose) {
            Ok(()) => return Ok(proof),
            Err(e) => last_err = Some(e),
        }
    }
    Err(last_err.unwrap_or(CoreError::ProofInvalid("no proof present".into())))
}
