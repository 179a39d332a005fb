//! End-to-end coverage of the create -> update -> deactivate chain, resource
//! admission, and witness thresholds, driven through the public
//! [`MutationCoordinator`] API against an [`InMemoryRepository`].

use std::sync::Arc;

use chrono::{Duration, Utc};
use didwebvh_registrar::canon::{canonicalize, multihash_b58, multihash_multibase_b58, sha256, SCID_PLACEHOLDER};
use didwebvh_registrar::multikey::KeyPair;
use didwebvh_registrar::policy::{KnownWitnessRegistry, Policy, PolicyStore, WitnessRegistryEntry};
use didwebvh_registrar::repository::InMemoryRepository;
use didwebvh_registrar::types::{
    AttestedResource, DataIntegrityProof, OneOrMany, ParametersDiff, ResourceMetadata, WitnessEntry, WitnessParam,
    WitnessSignature,
};
use didwebvh_registrar::{CoreError, MutationCoordinator, Repository, SharedRepository};
use rand::rngs::OsRng;
use serde_json::json;

const DOMAIN: &str = "example.com";

fn sign_target_with_vm<T: serde::Serialize>(
    kp: &KeyPair,
    target: &T,
    proof_purpose: &str,
    verification_method: String,
) -> DataIntegrityProof {
    let mut proof = DataIntegrityProof {
        proof_type: DataIntegrityProof::TYPE.to_string(),
        cryptosuite: DataIntegrityProof::CRYPTOSUITE.to_string(),
        created: Utc::now(),
        verification_method,
        proof_purpose: proof_purpose.to_string(),
        proof_value: String::new(),
        challenge: None,
        domain: None,
        expires: None,
    };
    let canon_options = canonicalize(&proof.without_value()).unwrap();
    let canon_document = canonicalize(target).unwrap();
    let mut message = Vec::with_capacity(64);
    message.extend_from_slice(&sha256(canon_options.as_bytes()));
    message.extend_from_slice(&sha256(canon_document.as_bytes()));
    proof.proof_value = didwebvh_registrar::canon::multibase_b58_encode(&kp.sign(&message));
    proof
}

fn sign_target<T: serde::Serialize>(kp: &KeyPair, target: &T, proof_purpose: &str) -> DataIntegrityProof {
    sign_target_with_vm(kp, target, proof_purpose, kp.public().to_did_key())
}

fn sign_witness_version_id(kp: &KeyPair, version_id: &str) -> DataIntegrityProof {
    let mut proof = sign_target(kp, &json!(version_id), "authentication");
    proof.verification_method = format!("{}#{}", kp.public().to_did_key(), kp.public().to_multikey());
    proof
}

fn entry1(namespace: &str, alias: &str, update_key: &str) -> didwebvh_registrar::types::LogEntry {
    let probe = json!({
        "versionId": SCID_PLACEHOLDER,
        "parameters": {"method": "did:webvh:1.0", "scid": SCID_PLACEHOLDER, "updateKeys": [update_key]},
        "state": {"id": format!("did:webvh:{SCID_PLACEHOLDER}:{DOMAIN}:{namespace}:{alias}")},
    });
    let jcs = serde_json_canonicalizer::to_string(&probe).unwrap();
    let scid = multihash_b58(jcs.as_bytes()).unwrap();

    let state = json!({
        "@context": ["https://www.w3.org/ns/did/v1"],
        "id": format!("did:webvh:{scid}:{DOMAIN}:{namespace}:{alias}"),
        "assertionMethod": [format!("did:webvh:{scid}:{DOMAIN}:{namespace}:{alias}#key-1")],
        "verificationMethod": [{
            "id": format!("did:webvh:{scid}:{DOMAIN}:{namespace}:{alias}#key-1"),
            "type": "Multikey",
            "controller": format!("did:webvh:{scid}:{DOMAIN}:{namespace}:{alias}"),
            "publicKeyMultibase": update_key,
        }],
    });
    let parameters = ParametersDiff {
        method: Some("did:webvh:1.0".into()),
        scid: Some(scid.clone()),
        update_keys: Some(vec![update_key.to_string()]),
        ..Default::default()
    };
    let mut entry = didwebvh_registrar::types::LogEntry {
        version_id: "pending".into(),
        version_time: Utc::now(),
        parameters,
        state,
        proof: Default::default(),
    };
    let draft_jcs = serde_json_canonicalizer::to_string(&entry.without_proof().with_version_id(&scid)).unwrap();
    let entry_hash = multihash_b58(draft_jcs.as_bytes()).unwrap();
    entry.version_id = format!("1-{entry_hash}");
    entry
}

fn sign_entry(kp: &KeyPair, entry: &mut didwebvh_registrar::types::LogEntry) {
    let target = entry.without_proof();
    let proof = sign_target(kp, &target, "assertionMethod");
    entry.proof = OneOrMany(vec![proof]);
}

fn coordinator_with_policy(policy: Policy, registry: KnownWitnessRegistry) -> (MutationCoordinator, SharedRepository) {
    let repo: SharedRepository = Arc::new(InMemoryRepository::new());
    let store = Arc::new(PolicyStore::new(policy, registry));
    (MutationCoordinator::new(repo.clone(), store, DOMAIN.to_string()), repo)
}

#[tokio::test]
async fn full_create_update_deactivate_chain() {
    let (coordinator, _repo) = coordinator_with_policy(Policy { witness_required: false, ..Policy::default() }, KnownWitnessRegistry::default());

    let kp = KeyPair::generate(&mut OsRng);
    let update_key = kp.public().to_multikey();
    let mut entry1 = entry1("ns1", "lifecycle", &update_key);
    sign_entry(&kp, &mut entry1);

    let created = coordinator.create_identifier("ns1", "lifecycle", entry1.clone(), None).await.unwrap();
    assert_eq!(created.logs.len(), 1);
    assert!(!created.deactivated);

    let mut entry2 = didwebvh_registrar::types::LogEntry {
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

    let updated = coordinator.update_identifier("ns1", "lifecycle", entry2.clone(), None).await.unwrap();
    assert_eq!(updated.logs.len(), 2);
    assert!(!updated.deactivated);

    let mut entry3 = didwebvh_registrar::types::LogEntry {
        version_id: "pending".into(),
        version_time: entry2.version_time + Duration::seconds(1),
        parameters: ParametersDiff { deactivated: Some(true), ..Default::default() },
        state: entry2.state.clone(),
        proof: Default::default(),
    };
    let hash3 = {
        let draft = entry3.without_proof().with_version_id(&entry2.version_id);
        let jcs = serde_json_canonicalizer::to_string(&draft).unwrap();
        multihash_b58(jcs.as_bytes()).unwrap()
    };
    entry3.version_id = format!("3-{hash3}");
    sign_entry(&kp, &mut entry3);

    let deactivated = coordinator.deactivate_identifier("ns1", "lifecycle", entry3, None).await.unwrap();
    assert!(deactivated.deactivated);

    let resolved = coordinator.resolve("ns1", "lifecycle").await.unwrap();
    assert!(resolved.deactivated);
    assert_eq!(resolved.logs.len(), 3);
}

#[tokio::test]
async fn deactivated_identifier_rejects_further_updates() {
    let (coordinator, _repo) = coordinator_with_policy(Policy { witness_required: false, ..Policy::default() }, KnownWitnessRegistry::default());
    let kp = KeyPair::generate(&mut OsRng);
    let update_key = kp.public().to_multikey();
    let mut entry1 = entry1("ns1", "terminal", &update_key);
    sign_entry(&kp, &mut entry1);
    coordinator.create_identifier("ns1", "terminal", entry1.clone(), None).await.unwrap();

    let mut entry2 = didwebvh_registrar::types::LogEntry {
        version_id: "pending".into(),
        version_time: entry1.version_time + Duration::seconds(1),
        parameters: ParametersDiff { deactivated: Some(true), ..Default::default() },
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
    coordinator.deactivate_identifier("ns1", "terminal", entry2.clone(), None).await.unwrap();

    let mut entry3 = didwebvh_registrar::types::LogEntry {
        version_id: "pending".into(),
        version_time: entry2.version_time + Duration::seconds(1),
        parameters: ParametersDiff::default(),
        state: entry2.state.clone(),
        proof: Default::default(),
    };
    let hash3 = {
        let draft = entry3.without_proof().with_version_id(&entry2.version_id);
        let jcs = serde_json_canonicalizer::to_string(&draft).unwrap();
        multihash_b58(jcs.as_bytes()).unwrap()
    };
    entry3.version_id = format!("3-{hash3}");
    sign_entry(&kp, &mut entry3);

    let err = coordinator.update_identifier("ns1", "terminal", entry3, None).await.unwrap_err();
    assert_eq!(err, CoreError::AlreadyDeactivated);
}

#[tokio::test]
async fn witness_threshold_required_to_create() {
    let witness_kp = KeyPair::generate(&mut OsRng);
    let witness_id = witness_kp.public().to_did_key();
    let mut registry = KnownWitnessRegistry::default();
    registry.insert(witness_id.clone(), WitnessRegistryEntry::default());

    let (coordinator, _repo) =
        coordinator_with_policy(Policy { witness_required: true, ..Policy::default() }, registry);

    let kp = KeyPair::generate(&mut OsRng);
    let update_key = kp.public().to_multikey();
    let mut entry = entry1("ns1", "witnessed", &update_key);
    entry.parameters.witness = Some(Some(WitnessParam {
        threshold: 1,
        witnesses: vec![WitnessEntry { id: witness_id.clone(), weight: None }],
    }));
    // re-derive scid/entryHash since we changed the parameters after drafting
    let probe_scid = entry.parameters.scid.clone().unwrap();
    let draft_jcs = serde_json_canonicalizer::to_string(&entry.without_proof().with_version_id(&probe_scid)).unwrap();
    let entry_hash = multihash_b58(draft_jcs.as_bytes()).unwrap();
    entry.version_id = format!("1-{entry_hash}");
    sign_entry(&kp, &mut entry);

    let err = coordinator
        .create_identifier("ns1", "witnessed", entry.clone(), None)
        .await
        .unwrap_err();
    assert!(matches!(err, CoreError::PolicyForbidden(_) | CoreError::WitnessSignatureInvalid(_)));

    let witness_proof = sign_witness_version_id(&witness_kp, &entry.version_id);
    let witness_signature = WitnessSignature {
        version_id: entry.version_id.clone(),
        proof: OneOrMany(vec![witness_proof]),
    };
    let created = coordinator
        .create_identifier("ns1", "witnessed", entry, Some(witness_signature))
        .await
        .unwrap();
    assert_eq!(created.namespace, "ns1");
}

#[tokio::test]
async fn resource_admission_and_whois_round_trip() {
    let (coordinator, repo) = coordinator_with_policy(Policy { witness_required: false, ..Policy::default() }, KnownWitnessRegistry::default());
    let kp = KeyPair::generate(&mut OsRng);
    let update_key = kp.public().to_multikey();
    let mut entry = entry1("ns1", "resourced", &update_key);
    sign_entry(&kp, &mut entry);
    let record = coordinator.create_identifier("ns1", "resourced", entry, None).await.unwrap();

    let content = json!({"name": "degree", "version": "1.0"});
    let digest = multihash_multibase_b58(canonicalize(&content).unwrap().as_bytes()).unwrap();
    let resource_id = format!("{}/resources/{digest}", record.did);
    let mut resource = AttestedResource {
        id: resource_id,
        content,
        metadata: ResourceMetadata {
            resource_id: digest,
            resource_type: "anonCredsSchema".into(),
            resource_name: None,
        },
        proof: OneOrMany::default(),
    };
    let mut target = serde_json::to_value(&resource).unwrap();
    target.as_object_mut().unwrap().remove("proof");
    let vm_id = format!("{}#key-1", record.did);
    let proof = sign_target_with_vm(&kp, &target, "assertionMethod", vm_id);
    resource.proof = OneOrMany(vec![proof]);

    let stored = coordinator.submit_resource("ns1", "resourced", resource).await.unwrap();
    assert_eq!(stored.resource_type, "anonCredsSchema");

    let fetched = repo.get_resource(&record.scid, &stored.resource_id).await.unwrap();
    assert!(fetched.is_some());
}
