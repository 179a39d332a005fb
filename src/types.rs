//! Wire types shared across the core: log entries, parameters, proofs, DID
//! documents, attested resources, and the WHOIS presentation.
//!
//! Sum types that the source data model left as runtime-typed dictionaries
//! are modeled explicitly here rather than as `serde_json::Value` wherever
//! the shape is actually fixed.

use std::collections::BTreeSet;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};

/// Normalizes "one object or an array of objects" fields, a pattern the
/// source data uses for `proof` throughout. The normalized internal form is
/// always a `Vec`.
#[derive(Debug, Clone, Default, Serialize, PartialEq)]
#[serde(transparent)]
pub struct OneOrMany<T>(pub Vec<T>);

impl<'de, T: Deserialize<'de>> Deserialize<'de> for OneOrMany<T> {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Repr<T> {
            One(T),
            Many(Vec<T>),
        }
        Ok(match Repr::deserialize(deserializer)? {
            Repr::One(v) => OneOrMany(vec![v]),
            Repr::Many(v) => OneOrMany(v),
        })
    }
}

impl<T> OneOrMany<T> {
    pub fn into_vec(self) -> Vec<T> {
        self.0
    }
}

/// A `DataIntegrityProof`, cryptosuite `eddsa-jcs-2022`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DataIntegrityProof {
    #[serde(rename = "type")]
    pub proof_type: String,
    pub cryptosuite: String,
    pub created: DateTime<Utc>,
    #[serde(rename = "verificationMethod")]
    pub verification_method: String,
    #[serde(rename = "proofPurpose")]
    pub proof_purpose: String,
    #[serde(rename = "proofValue")]
    pub proof_value: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub challenge: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub domain: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expires: Option<DateTime<Utc>>,
}

impl DataIntegrityProof {
    pub const TYPE: &'static str = "DataIntegrityProof";
    pub const CRYPTOSUITE: &'static str = "eddsa-jcs-2022";

    /// A copy of this proof with `proofValue` removed, as required for
    /// `proofOptions` in the eddsa-jcs-2022 signing/verification input.
    pub fn without_value(&self) -> serde_json::Value {
        let mut v = serde_json::to_value(self).expect("DataIntegrityProof always serializes");
        if let Some(obj) = v.as_object_mut() {
            obj.remove("proofValue");
        }
        v
    }
}

/// A single witness endorsement, `{id, weight?}` in a DID's `witness.witnesses`
/// list. `weight` defaults to `1`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct WitnessEntry {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub weight: Option<u32>,
}

impl WitnessEntry {
    pub fn weight(&self) -> u32 {
        self.weight.unwrap_or(1)
    }
}

/// The `witness` parameter: `{threshold, witnesses}`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct WitnessParam {
    pub threshold: u32,
    pub witnesses: Vec<WitnessEntry>,
}

/// A witness's endorsement of one log entry's `versionId`, submitted
/// alongside the log entry on the mutation path.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct WitnessSignature {
    #[serde(rename = "versionId")]
    pub version_id: String,
    pub proof: OneOrMany<DataIntegrityProof>,
}

/// A log entry's `parameters` field: a diff against the previous entry's
/// effective parameters. Every field is optional except on entry 1, where
/// the diff is the full initial parameter set; absent fields inherit from
/// the prior effective parameters.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct ParametersDiff {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub method: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scid: Option<String>,
    #[serde(rename = "updateKeys", default, skip_serializing_if = "Option::is_none")]
    pub update_keys: Option<Vec<String>>,
    #[serde(rename = "nextKeyHashes", default, skip_serializing_if = "Option::is_none")]
    pub next_key_hashes: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub witness: Option<Option<WitnessParam>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub watchers: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub portable: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prerotation: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deactivated: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ttl: Option<u64>,
}

/// The fully resolved parameter set after left-folding every entry's diff.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct EffectiveParameters {
    pub method: String,
    pub scid: String,
    #[serde(rename = "updateKeys")]
    pub update_keys: Vec<String>,
    #[serde(rename = "nextKeyHashes", default, skip_serializing_if = "Option::is_none")]
    pub next_key_hashes: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub witness: Option<WitnessParam>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub watchers: Vec<String>,
    #[serde(default)]
    pub portable: bool,
    #[serde(default)]
    pub prerotation: bool,
    #[serde(default)]
    pub deactivated: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ttl: Option<u64>,
}

impl EffectiveParameters {
    /// Applies `diff` on top of `self`, returning the new effective set.
    /// `scid`/`method` are caller-checked for immutability before this is
    /// invoked; here we simply carry the prior value forward if absent.
    pub fn merged_with(&self, diff: &ParametersDiff) -> EffectiveParameters {
        EffectiveParameters {
            method: diff.method.clone().unwrap_or_else(|| self.method.clone()),
            scid: diff.scid.clone().unwrap_or_else(|| self.scid.clone()),
            update_keys: diff
                .update_keys
                .clone()
                .unwrap_or_else(|| self.update_keys.clone()),
            next_key_hashes: diff
                .next_key_hashes
                .clone()
                .or_else(|| self.next_key_hashes.clone()),
            witness: diff
                .witness
                .clone()
                .unwrap_or_else(|| self.witness.clone()),
            watchers: diff.watchers.clone().unwrap_or_else(|| self.watchers.clone()),
            portable: diff.portable.unwrap_or(self.portable),
            prerotation: diff.prerotation.unwrap_or(self.prerotation),
            deactivated: diff.deactivated.unwrap_or(self.deactivated),
            ttl: diff.ttl.or(self.ttl),
        }
    }

    /// The set of `updateKeys`-hash commitments implied by `nextKeyHashes`,
    /// as a lookup set for the pre-rotation rule.
    pub fn next_key_hash_set(&self) -> Option<BTreeSet<&str>> {
        self.next_key_hashes
            .as_ref()
            .map(|hashes| hashes.iter().map(String::as_str).collect())
    }
}

/// A log entry as it appears in `did.jsonl`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LogEntry {
    #[serde(rename = "versionId")]
    pub version_id: String,
    #[serde(rename = "versionTime")]
    pub version_time: DateTime<Utc>,
    pub parameters: ParametersDiff,
    pub state: serde_json::Value,
    #[serde(default)]
    pub proof: OneOrMany<DataIntegrityProof>,
}

impl LogEntry {
    /// `"<n>-<hash>"` split into its numeric and hash parts.
    pub fn parse_version_id(version_id: &str) -> Option<(u64, &str)> {
        let (n, hash) = version_id.split_once('-')?;
        let n: u64 = n.parse().ok()?;
        Some((n, hash))
    }

    /// Returns a copy of this entry with `versionId` replaced, used to
    /// recompute `entryHash` with the previous entry's `versionId` (or the
    /// SCID, for entry 1) substituted in.
    pub fn with_version_id(&self, version_id: impl Into<String>) -> LogEntry {
        LogEntry {
            version_id: version_id.into(),
            ..self.clone()
        }
    }

    /// Returns a copy of this entry with `proof` cleared, used when the
    /// proof set itself must not contribute to the entry's own hash.
    pub fn without_proof(&self) -> LogEntry {
        LogEntry {
            proof: OneOrMany::default(),
            ..self.clone()
        }
    }
}

/// A verification method, embedded or referenced by id.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(untagged)]
pub enum VerificationMethodRef {
    Reference(String),
    Embedded(VerificationMethod),
}

impl VerificationMethodRef {
    pub fn id(&self) -> &str {
        match self {
            VerificationMethodRef::Reference(id) => id,
            VerificationMethodRef::Embedded(vm) => &vm.id,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct VerificationMethod {
    pub id: String,
    #[serde(rename = "type")]
    pub method_type: String,
    pub controller: String,
    #[serde(rename = "publicKeyMultibase", default, skip_serializing_if = "Option::is_none")]
    pub public_key_multibase: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Service {
    pub id: String,
    #[serde(rename = "type")]
    pub service_type: String,
    #[serde(rename = "serviceEndpoint")]
    pub service_endpoint: String,
}

/// The `state` snapshot of a log entry: a DID document.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DidDocument {
    #[serde(rename = "@context")]
    pub context: Vec<String>,
    pub id: String,
    #[serde(rename = "alsoKnownAs", default, skip_serializing_if = "Vec::is_empty")]
    pub also_known_as: Vec<String>,
    #[serde(rename = "verificationMethod", default, skip_serializing_if = "Vec::is_empty")]
    pub verification_method: Vec<VerificationMethod>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub authentication: Vec<VerificationMethodRef>,
    #[serde(rename = "assertionMethod", default, skip_serializing_if = "Vec::is_empty")]
    pub assertion_method: Vec<VerificationMethodRef>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub service: Vec<Service>,
    #[serde(default)]
    pub deactivated: bool,
}

impl DidDocument {
    /// Resolves `fragment_or_id` (e.g. `did:webvh:...#key-1`) against this
    /// document's `verificationMethod` list.
    pub fn find_verification_method(&self, id: &str) -> Option<&VerificationMethod> {
        self.verification_method.iter().find(|vm| vm.id == id)
    }

    pub fn assertion_method_ids(&self) -> Vec<&str> {
        self.assertion_method.iter().map(|r| r.id()).collect()
    }

    pub fn authentication_ids(&self) -> Vec<&str> {
        self.authentication.iter().map(|r| r.id()).collect()
    }

    /// Rewrites this document's `id` and every self-referential id to the
    /// `did:web:` form, for consumers that only understand that method.
    /// Pure, total: does not consult any repository state.
    pub fn to_web_view(&self, web_did: &str) -> DidDocument {
        let webvh_did = self.id.clone();
        let rewrite = |s: &str| -> String {
            if let Some(fragment) = s.strip_prefix(&webvh_did) {
                format!("{web_did}{fragment}")
            } else {
                s.to_string()
            }
        };
        let rewrite_vm = |vm: &VerificationMethod| VerificationMethod {
            id: rewrite(&vm.id),
            method_type: vm.method_type.clone(),
            controller: rewrite(&vm.controller),
            public_key_multibase: vm.public_key_multibase.clone(),
        };
        let rewrite_ref = |r: &VerificationMethodRef| match r {
            VerificationMethodRef::Reference(id) => VerificationMethodRef::Reference(rewrite(id)),
            VerificationMethodRef::Embedded(vm) => VerificationMethodRef::Embedded(rewrite_vm(vm)),
        };
        DidDocument {
            context: self.context.clone(),
            id: web_did.to_string(),
            also_known_as: self.also_known_as.clone(),
            verification_method: self.verification_method.iter().map(rewrite_vm).collect(),
            authentication: self.authentication.iter().map(rewrite_ref).collect(),
            assertion_method: self.assertion_method.iter().map(rewrite_ref).collect(),
            service: self.service.clone(),
            deactivated: self.deactivated,
        }
    }
}

/// Resource metadata accompanying an attested resource.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ResourceMetadata {
    #[serde(rename = "resourceId")]
    pub resource_id: String,
    #[serde(rename = "resourceType")]
    pub resource_type: String,
    #[serde(rename = "resourceName", default, skip_serializing_if = "Option::is_none")]
    pub resource_name: Option<String>,
}

/// An attested resource: `id = <did>/resources/<digest>`, content-addressed
/// and controller-signed.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AttestedResource {
    pub id: String,
    pub content: serde_json::Value,
    pub metadata: ResourceMetadata,
    #[serde(default)]
    pub proof: OneOrMany<DataIntegrityProof>,
}

impl AttestedResource {
    /// Splits `id` into its `(did, digest)` parts.
    pub fn parse_id(id: &str) -> Option<(&str, &str)> {
        id.rsplit_once("/resources/")
    }
}

/// A WHOIS verifiable presentation.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct VerifiablePresentation {
    #[serde(rename = "@context")]
    pub context: Vec<String>,
    #[serde(rename = "type")]
    pub presentation_type: Vec<String>,
    pub holder: String,
    #[serde(rename = "verifiableCredential", default, skip_serializing_if = "Vec::is_empty")]
    pub verifiable_credential: Vec<serde_json::Value>,
    pub proof: OneOrMany<DataIntegrityProof>,
}
