//! C6: witness registry & validator.
//!
//! Verifies a `WitnessSignature` against the *prior* state's effective
//! `witness` rule: each proof is checked with
//! [`crate::proof::DidKeyResolver`] since a witness's `verificationMethod`
//! is always a bare `did:key:MK#MK`, proofs from witnesses outside the
//! known-witness registry are dropped, and the surviving proofs' weights
//! must sum to at least the threshold.

use std::collections::BTreeSet;

use crate::error::{CoreError, CoreResult};
use crate::policy::KnownWitnessRegistry;
use crate::proof::{verify_proof, DidKeyResolver};
use crate::types::{WitnessParam, WitnessSignature};

/// Extracts the bare `did:key:...` witness id a proof's `verificationMethod`
/// names (dropping the `#fragment`, which just echoes the multikey).
fn witness_id_of(verification_method: &str) -> Option<&str> {
    verification_method.split('#').next()
}

/// Verifies `witness_signature` against `rule` (the prior state's
/// `witness` parameter) and `registry`.
///
/// `expected_version_id` is the post-state's `versionId`; the witness
/// signature must endorse exactly that version.
pub fn verify_witness_signature(
    witness_signature: &WitnessSignature,
    expected_version_id: &str,
    rule: &WitnessParam,
    registry: &KnownWitnessRegistry,
    strict: bool,
) -> CoreResult<()> {
    if witness_signature.version_id != expected_version_id {
        return Err(CoreError::WitnessSignatureInvalid(format!(
            "witnessSignature.versionId {} does not match {}",
            witness_signature.version_id, expected_version_id
        )));
    }

    let declared: BTreeSet<&str> = rule.witnesses.iter().map(|w| w.id.as_str()).collect();
    let mut verified_ids = BTreeSet::new();

    for proof in &witness_signature.proof.0 {
        let witness_id = witness_id_of(&proof.verification_method).ok_or_else(|| {
            CoreError::WitnessSignatureInvalid(format!(
                "malformed verificationMethod: {}",
                proof.verification_method
            ))
        })?;

        if strict && !registry.contains(witness_id) {
            // Unknown witnesses are silently dropped under strict policy
            // rather than failing the whole batch: a DID may declare more
            // witnesses than the server happens to know about, and other
            // witnesses' valid proofs should still count.
            continue;
        }

        if !declared.contains(witness_id) {
            continue;
        }

        // eddsa-jcs-2022 over the versionId string itself: the signed
        // "document" for a witness proof is the bare versionId, there being
        // no larger structure to canonicalize over.
        verify_proof(
            proof,
            &witness_signature.version_id,
            &DidKeyResolver,
            "authentication",
        )
        .map_err(|e| CoreError::WitnessSignatureInvalid(e.to_string()))?;

        verified_ids.insert(witness_id);
    }

    let sum: u32 = rule
        .witnesses
        .iter()
        .filter(|w| verified_ids.contains(w.id.as_str()))
        .map(|w| w.weight())
        .sum();

    if sum < rule.threshold {
        return Err(CoreError::WitnessThresholdNotMet {
            needed: rule.threshold,
            got: sum,
        });
    }

    Ok(())
}
