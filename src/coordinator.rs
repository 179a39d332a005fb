//! C9: mutation coordinator.
//!
//! The only component allowed to turn a submitted log entry into a durable
//! state change. Composes, in order, C4 (structural fold), the entry's own
//! authorization proof, C5 (policy admission), C6 (witness threshold), and
//! C8 (persistence). Holds a per-identifier advisory lock so two concurrent
//! mutations against the same `(namespace, alias)` are serialized while
//! unrelated identifiers proceed in parallel.
//!
//! Pulled into one reusable orchestrator so the HTTP layer stays a thin
//! dispatcher with no verification logic of its own.

use std::sync::Arc;

use tokio::sync::Mutex;

use crate::document_state::{self, PostState};
use crate::error::{CoreError, CoreResult};
use crate::policy::PolicyStore;
use crate::proof::{verify_any_proof, verify_proof, DidKeyResolver, DocumentResolver};
use crate::repository::{split_webvh_did, ControllerRecord, Repository as _, ResourceRecord, SharedRepository};
use crate::resource;
use crate::types::{AttestedResource, LogEntry, VerifiablePresentation, WitnessSignature};
use crate::witness;
use dashmap::DashMap;

/// Extracts the raw multikey an entry or witness proof's `verificationMethod`
/// names, accepting both `did:key:MK` and `did:key:MK#MK` forms.
fn multikey_from_did_key(verification_method: &str) -> Option<&str> {
    let rest = verification_method.strip_prefix("did:key:")?;
    Some(rest.split('#').next().unwrap_or(rest))
}

/// Verifies that `entry` carries at least one valid `assertionMethod` proof
/// from a key in `authorized_keys`.
fn verify_entry_proofs(entry: &LogEntry, authorized_keys: &[String]) -> CoreResult<()> {
    let target = entry.without_proof();
    let proof = verify_any_proof(&entry.proof.0, &target, &DidKeyResolver, "assertionMethod")?;
    let signer = multikey_from_did_key(&proof.verification_method)
        .ok_or_else(|| CoreError::ProofInvalid(format!("not a did:key verificationMethod: {}", proof.verification_method)))?;
    if !authorized_keys.iter().any(|k| k == signer) {
        return Err(CoreError::KeyUnresolved(format!(
            "signing key {signer} is not an authorized update key"
        )));
    }
    Ok(())
}

/// Returns a JSON view of `vp` with `proof` removed.
fn vp_without_proof(vp: &VerifiablePresentation) -> serde_json::Value {
    let mut v = serde_json::to_value(vp).expect("VerifiablePresentation always serializes");
    if let Some(obj) = v.as_object_mut() {
        obj.remove("proof");
    }
    v
}

/// Orchestrates create/update/deactivate mutations and resource/WHOIS
/// submissions against one [`SharedRepository`], consulting one
/// [`PolicyStore`] snapshot per call.
pub struct MutationCoordinator {
    repository: SharedRepository,
    policy_store: Arc<PolicyStore>,
    locks: DashMap<(String, String), Arc<Mutex<()>>>,
    domain: String,
}

impl MutationCoordinator {
    pub fn new(repository: SharedRepository, policy_store: Arc<PolicyStore>, domain: String) -> Self {
        MutationCoordinator {
            repository,
            policy_store,
            locks: DashMap::new(),
            domain,
        }
    }

    fn lock_for(&self, namespace: &str, alias: &str) -> Arc<Mutex<()>> {
        self.locks
            .entry((namespace.to_string(), alias.to_string()))
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    /// Checks that `did` actually names `(namespace, alias)` on this
    /// service's own domain, so a client cannot register content under a
    /// path other than the one it posted to.
    fn check_identifier_path(&self, did: &str, namespace: &str, alias: &str) -> CoreResult<()> {
        let (domain, doc_namespace, doc_alias) = split_webvh_did(did)?;
        if domain != self.domain {
            return Err(CoreError::SchemaInvalid(format!(
                "document id domain {domain} does not match hosting domain {}",
                self.domain
            )));
        }
        if doc_namespace != namespace || doc_alias != alias {
            return Err(CoreError::SchemaInvalid(format!(
                "document id path {doc_namespace}/{doc_alias} does not match request path {namespace}/{alias}"
            )));
        }
        Ok(())
    }

    /// Verifies the identifier's own `witness` parameter, if any, regardless
    /// of whether the active policy currently mandates witnessing (spec
    /// section 4.6: once a DID declares a witness rule, every mutation must
    /// satisfy it).
    fn check_witness_param(
        &self,
        post: &PostState,
        witness_signature: Option<&WitnessSignature>,
        registry: &crate::policy::KnownWitnessRegistry,
    ) -> CoreResult<()> {
        if let Some(witness_param) = &post.effective_params.witness {
            let ws = witness_signature.ok_or_else(|| {
                CoreError::WitnessSignatureInvalid(
                    "witness signature required by the identifier's own witness parameter".into(),
                )
            })?;
            witness::verify_witness_signature(ws, &post.version_id, witness_param, registry, true)?;
        }
        Ok(())
    }

    /// Registers a brand-new identifier from its first log entry (spec
    /// section 4.9 `createIdentifier`).
    pub async fn create_identifier(
        &self,
        namespace: &str,
        alias: &str,
        entry: LogEntry,
        witness_signature: Option<WitnessSignature>,
    ) -> CoreResult<ControllerRecord> {
        let lock = self.lock_for(namespace, alias);
        let _guard = lock.lock().await;

        let snapshot = self.policy_store.snapshot();
        let (policy, registry) = (&snapshot.0, &snapshot.1);
        policy.check_namespace_available(namespace)?;

        if self.repository.get_by_alias(namespace, alias).await?.is_some() {
            return Err(CoreError::AliasExists(namespace.to_string(), alias.to_string()));
        }

        let states = document_state::fold(std::slice::from_ref(&entry))?;
        let post = states.last().expect("fold returns at least one state on success");
        self.check_identifier_path(&post.document.id, namespace, alias)?;

        verify_entry_proofs(&entry, post.update_keys())?;
        policy.admit_create(post, witness_signature.as_ref(), registry)?;
        self.check_witness_param(post, witness_signature.as_ref(), registry)?;

        let witness_file = witness_signature.into_iter().collect();
        self.repository.create_controller(vec![entry], witness_file, None).await
    }

    /// Folds one more entry onto an existing identifier's log, covering both
    /// ordinary updates and deactivation.
    pub async fn update_identifier(
        &self,
        namespace: &str,
        alias: &str,
        entry: LogEntry,
        witness_signature: Option<WitnessSignature>,
    ) -> CoreResult<ControllerRecord> {
        let lock = self.lock_for(namespace, alias);
        let _guard = lock.lock().await;

        let existing = self
            .repository
            .get_by_alias(namespace, alias)
            .await?
            .ok_or_else(|| CoreError::NotFound(format!("{namespace}/{alias}")))?;

        let snapshot = self.policy_store.snapshot();
        let (policy, registry) = (&snapshot.0, &snapshot.1);

        let prev_states = document_state::fold(&existing.logs)?;
        let prev = prev_states.last().expect("non-empty by construction");

        let mut new_logs = existing.logs.clone();
        new_logs.push(entry.clone());
        let states = document_state::fold(&new_logs)?;
        let post = states.last().expect("non-empty by construction");

        let (_, new_namespace, new_alias) = split_webvh_did(&post.document.id)?;
        if new_namespace != existing.namespace || new_alias != existing.alias {
            policy.check_alias_change_allowed(&post.effective_params)?;
        } else {
            self.check_identifier_path(&post.document.id, namespace, alias)?;
        }

        verify_entry_proofs(&entry, prev.update_keys())?;

        if post.deactivated() {
            policy.admit_deactivate(post, witness_signature.as_ref(), registry)?;
        } else {
            policy.admit_update(prev, post, witness_signature.as_ref(), registry)?;
        }
        self.check_witness_param(post, witness_signature.as_ref(), registry)?;

        let mut witness_file = existing.witness_file.clone();
        witness_file.extend(witness_signature);
        self.repository.update_controller(&existing.scid, new_logs, witness_file).await
    }

    /// Convenience wrapper that rejects an entry not actually marked
    /// `deactivated`, so the HTTP deactivate route can't be used to sneak in
    /// an ordinary update.
    pub async fn deactivate_identifier(
        &self,
        namespace: &str,
        alias: &str,
        entry: LogEntry,
        witness_signature: Option<WitnessSignature>,
    ) -> CoreResult<ControllerRecord> {
        if entry.parameters.deactivated != Some(true) {
            return Err(CoreError::SchemaInvalid(
                "deactivation entry must set parameters.deactivated = true".into(),
            ));
        }
        self.update_identifier(namespace, alias, entry, witness_signature).await
    }

    /// Admits a new or updated attested resource against the identifier's
    /// current document.
    pub async fn submit_resource(&self, namespace: &str, alias: &str, resource: AttestedResource) -> CoreResult<ResourceRecord> {
        let existing = self
            .repository
            .get_by_alias(namespace, alias)
            .await?
            .ok_or_else(|| CoreError::NotFound(format!("{namespace}/{alias}")))?;
        if existing.deactivated {
            return Err(CoreError::AlreadyDeactivated);
        }

        let (_, digest) = AttestedResource::parse_id(&resource.id)
            .ok_or_else(|| CoreError::SchemaInvalid(format!("malformed resource id: {}", resource.id)))?;
        if let Some(stored) = self.repository.get_resource(&existing.scid, digest).await? {
            resource::admit_resource_update(&stored.attested_resource, &resource, &existing.document)?;
        } else {
            resource::admit_resource(&resource, &existing.document)?;
        }

        self.repository.upsert_resource(resource, &existing.scid, &existing.document.id).await
    }

    /// Verifies and stores a WHOIS presentation.
    pub async fn submit_whois(&self, namespace: &str, alias: &str, presentation: VerifiablePresentation) -> CoreResult<()> {
        let existing = self
            .repository
            .get_by_alias(namespace, alias)
            .await?
            .ok_or_else(|| CoreError::NotFound(format!("{namespace}/{alias}")))?;

        let resolver = DocumentResolver { document: &existing.document };
        let target = vp_without_proof(&presentation);
        let proof = verify_any_proof(&presentation.proof.0, &target, &resolver, "authentication")?;
        if !existing.document.authentication_ids().contains(&proof.verification_method.as_str()) {
            return Err(CoreError::AuthorMismatch(format!(
                "verification method {} is not in the DID's authentication set",
                proof.verification_method
            )));
        }

        self.repository.put_whois(&existing.scid, presentation).await
    }

    /// Resolves the identifier's current document, the shared read path used
    /// by both `GET did.json` and `GET did.jsonl`.
    pub async fn resolve(&self, namespace: &str, alias: &str) -> CoreResult<ControllerRecord> {
        self.repository
            .get_by_alias(namespace, alias)
            .await?
            .ok_or_else(|| CoreError::NotFound(format!("{namespace}/{alias}")))
    }
}

/// Double-checks a freshly-verified proof with an explicit resolver, kept
/// available for callers (e.g. admin tooling) that already hold a resolved
/// key rather than a document. Thin wrapper so `crate::proof::verify_proof`
/// need not be re-exported from two modules.
pub fn verify_with_resolver(
    proof: &crate::types::DataIntegrityProof,
    document: &serde_json::Value,
    resolver: &dyn crate::proof::VerificationMethodResolver,
    expected_purpose: &str,
) -> CoreResult<()> {
    verify_proof(proof, document, resolver, expected_purpose)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::canon::{multihash_b58, SCID_PLACEHOLDER};
    use crate::multikey::KeyPair;
    use crate::policy::{KnownWitnessRegistry, Policy};
    use crate::repository::InMemoryRepository;
    use crate::types::{DataIntegrityProof, OneOrMany, ParametersDiff};
    use chrono::{Duration, Utc};
    use rand::rngs::OsRng;
    use serde_json::json;

    fn sign_entry(kp: &KeyPair, entry: &mut LogEntry) {
        let target = entry.without_proof();
        let mut proof = DataIntegrityProof {
            proof_type: DataIntegrityProof::TYPE.to_string(),
            cryptosuite: DataIntegrityProof::CRYPTOSUITE.to_string(),
            created: Utc::now(),
            verification_method: kp.public().to_did_key(),
            proof_purpose: "assertionMethod".to_string(),
            proof_value: String::new(),
            challenge: None,
            domain: None,
            expires: None,
        };
        let canon_options = crate::canon::canonicalize(&proof.without_value()).unwrap();
        let canon_document = crate::canon::canonicalize(&target).unwrap();
        let mut message = Vec::with_capacity(64);
        message.extend_from_slice(&crate::canon::sha256(canon_options.as_bytes()));
        message.extend_from_slice(&crate::canon::sha256(canon_document.as_bytes()));
        let sig = kp.sign(&message);
        proof.proof_value = crate::canon::multibase_b58_encode(&sig);
        entry.proof = OneOrMany(vec![proof]);
    }

    fn build_signed_entry1(domain: &str, namespace: &str, alias: &str) -> (LogEntry, KeyPair) {
        let kp = KeyPair::generate(&mut OsRng);
        let update_key = kp.public().to_multikey();
        let probe = json!({
            "versionId": SCID_PLACEHOLDER,
            "parameters": {"method": "did:webvh:1.0", "scid": SCID_PLACEHOLDER, "updateKeys": [update_key]},
            "state": {"id": format!("did:webvh:{SCID_PLACEHOLDER}:{domain}:{namespace}:{alias}")},
        });
        let jcs = serde_json_canonicalizer::to_string(&probe).unwrap();
        let scid = multihash_b58(jcs.as_bytes()).unwrap();

        let state = json!({
            "@context": ["https://www.w3.org/ns/did/v1"],
            "id": format!("did:webvh:{scid}:{domain}:{namespace}:{alias}"),
        });
        let parameters = ParametersDiff {
            method: Some("did:webvh:1.0".into()),
            scid: Some(scid.clone()),
            update_keys: Some(vec![update_key]),
            ..Default::default()
        };
        let mut entry = LogEntry {
            version_id: "pending".into(),
            version_time: Utc::now(),
            parameters,
            state,
            proof: Default::default(),
        };
        let draft_jcs = serde_json_canonicalizer::to_string(&entry.without_proof().with_version_id(&scid)).unwrap();
        let entry_hash = multihash_b58(draft_jcs.as_bytes()).unwrap();
        entry.version_id = format!("1-{entry_hash}");
        sign_entry(&kp, &mut entry);
        (entry, kp)
    }

    fn coordinator() -> MutationCoordinator {
        let repo: SharedRepository = Arc::new(InMemoryRepository::new());
        let policy = Policy {
            witness_required: false,
            ..Policy::default()
        };
        let store = Arc::new(PolicyStore::new(policy, KnownWitnessRegistry::default()));
        MutationCoordinator::new(repo, store, "example.com".into())
    }

    #[tokio::test]
    async fn create_then_update_round_trips() {
        let coord = coordinator();
        let (entry1, kp) = build_signed_entry1("example.com", "ns1", "a1");
        let record = coord.create_identifier("ns1", "a1", entry1.clone(), None).await.unwrap();
        assert_eq!(record.namespace, "ns1");
        assert_eq!(record.alias, "a1");

        let mut entry2 = LogEntry {
            version_id: "pending".into(),
            version_time: entry1.version_time + Duration::seconds(1),
            parameters: ParametersDiff::default(),
            state: entry1.state.clone(),
            proof: Default::default(),
        };
        let hash2 = {
            let draft = entry2.without_proof().with_version_id(&entry1.version_id);
            let jcs = serde_json_canonicalizer::to_string(&draft).unwrap();
            multihash_b58(jcs.as_bytes()).unwrap()
        };
        entry2.version_id = format!("2-{hash2}");
        sign_entry(&kp, &mut entry2);

        let updated = coord.update_identifier("ns1", "a1", entry2, None).await.unwrap();
        assert_eq!(updated.logs.len(), 2);
    }

    #[tokio::test]
    async fn create_rejects_mismatched_path() {
        let coord = coordinator();
        let (entry1, _kp) = build_signed_entry1("example.com", "ns1", "a1");
        let err = coord.create_identifier("ns1", "wrong-alias", entry1, None).await.unwrap_err();
        assert!(matches!(err, CoreError::SchemaInvalid(_)));
    }

    #[tokio::test]
    async fn create_rejects_unauthorized_signer() {
        let coord = coordinator();
        let (mut entry1, _kp) = build_signed_entry1("example.com", "ns1", "a1");
        let impostor = KeyPair::generate(&mut OsRng);
        sign_entry(&impostor, &mut entry1);
        let err = coord.create_identifier("ns1", "a1", entry1, None).await.unwrap_err();
        assert!(matches!(err, CoreError::KeyUnresolved(_)));
    }

    #[tokio::test]
    async fn create_rejects_reserved_namespace() {
        let coord = coordinator();
        let (entry1, _kp) = build_signed_entry1("example.com", "admin", "a1");
        let err = coord.create_identifier("admin", "a1", entry1, None).await.unwrap_err();
        assert!(matches!(err, CoreError::AliasReserved(_)));
    }

    #[tokio::test]
    async fn update_on_unknown_identifier_is_not_found() {
        let coord = coordinator();
        let (entry, _kp) = build_signed_entry1("example.com", "ns1", "a1");
        let err = coord.update_identifier("ns1", "a1", entry, None).await.unwrap_err();
        assert!(matches!(err, CoreError::NotFound(_)));
    }
}
