//! C5: policy engine.
//!
//! A process-wide, read-mostly record of the rules a mutation must satisfy.
//! The active policy and the known-witness registry are held as an
//! immutable snapshot: readers clone an `Arc` and never take a lock, writers
//! publish a new snapshot after a repository write.
//!
//! Witness-threshold enforcement is delegated to [`crate::witness`] (C6)
//! rather than inlined here.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use dashmap::DashMap;
use serde::{Deserialize, Serialize};

use crate::document_state::PostState;
use crate::error::{CoreError, CoreResult};
use crate::types::{EffectiveParameters, ParametersDiff, WitnessEntry, WitnessParam};

/// Namespaces the controller-facing paths may never inhabit.
pub const RESERVED_NAMESPACES: &[&str] = &["api", ".well-known", "admin"];

/// A known witness's registry entry: a mapping from `did:key:<multikey>` to optional metadata.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct WitnessRegistryEntry {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(rename = "serviceEndpoint", default, skip_serializing_if = "Option::is_none")]
    pub service_endpoint: Option<String>,
}

/// The process-wide known-witness registry: `did:key:...` -> metadata.
/// `#[serde(transparent)]` so the repository stores and loads it as a bare
/// JSON object (`registries.registry_data`) in the repository's JSON-column
/// registry rows.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct KnownWitnessRegistry {
    entries: BTreeMap<String, WitnessRegistryEntry>,
}

impl KnownWitnessRegistry {
    pub fn new(entries: BTreeMap<String, WitnessRegistryEntry>) -> Self {
        KnownWitnessRegistry { entries }
    }

    pub fn contains(&self, witness_id: &str) -> bool {
        self.entries.contains_key(witness_id)
    }

    pub fn get(&self, witness_id: &str) -> Option<&WitnessRegistryEntry> {
        self.entries.get(witness_id)
    }

    pub fn ids(&self) -> impl Iterator<Item = &str> {
        self.entries.keys().map(String::as_str)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &WitnessRegistryEntry)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v))
    }

    pub fn insert(&mut self, witness_id: String, entry: WitnessRegistryEntry) {
        self.entries.insert(witness_id, entry);
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// The active policy record, a process-wide singleton
/// reloaded from the repository on startup and after administrative
/// mutation.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Policy {
    pub version: String,
    #[serde(rename = "witnessRequired")]
    pub witness_required: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub watcher: Option<String>,
    pub portability: bool,
    pub prerotation: bool,
    pub endorsement: bool,
    /// Validity period in seconds; `0` means no expiry is enforced.
    pub validity: u64,
    #[serde(rename = "witnessRegistryUrl", default, skip_serializing_if = "Option::is_none")]
    pub witness_registry_url: Option<String>,
}

impl Default for Policy {
    fn default() -> Self {
        Policy {
            version: "1.0".into(),
            witness_required: true,
            watcher: None,
            portability: false,
            prerotation: true,
            endorsement: true,
            validity: 0,
            witness_registry_url: None,
        }
    }
}

/// A witness endorsement submitted alongside a mutation. The coordinator
/// hands this directly to [`crate::witness::verify_witness_signature`]; the
/// policy engine only decides whether one is *required*.
pub type WitnessSignature = crate::types::WitnessSignature;

impl Policy {
    /// The initial parameter skeleton offered to a prospective controller
    ///, mirroring
    /// `PolicyModule.parameters`.
    pub fn parameters_skeleton(&self, scid_placeholder: &str, registry: &KnownWitnessRegistry) -> ParametersDiff {
        let mut diff = ParametersDiff {
            method: Some(format!("did:webvh:{}", self.version)),
            scid: Some(scid_placeholder.to_string()),
            update_keys: Some(Vec::new()),
            portable: Some(self.portability),
            ..Default::default()
        };
        if self.prerotation {
            diff.next_key_hashes = Some(Vec::new());
        }
        if self.witness_required {
            diff.witness = Some(Some(WitnessParam {
                threshold: 1,
                witnesses: registry
                    .ids()
                    .map(|id| WitnessEntry {
                        id: id.to_string(),
                        weight: None,
                    })
                    .collect(),
            }));
        }
        if let Some(watcher) = &self.watcher {
            diff.watchers = Some(vec![watcher.clone()]);
        }
        diff
    }

    /// Checks that `namespace` is not one of [`RESERVED_NAMESPACES`].
    pub fn check_namespace_available(&self, namespace: &str) -> CoreResult<()> {
        if RESERVED_NAMESPACES.contains(&namespace) {
            return Err(CoreError::AliasReserved(namespace.to_string()));
        }
        Ok(())
    }

    /// Admits a create mutation. Witness
    /// threshold checking is C6's job; here we only enforce that a
    /// witness proof was supplied when the policy demands one, and that
    /// every witness the DID declares is present in the registry.
    pub fn admit_create(
        &self,
        post_state: &PostState,
        witness_signature: Option<&WitnessSignature>,
        registry: &KnownWitnessRegistry,
    ) -> CoreResult<()> {
        self.check_witness_requirement(&post_state.effective_params, witness_signature, registry)
    }

    /// Admits an update mutation.
    pub fn admit_update(
        &self,
        prev_state: &PostState,
        post_state: &PostState,
        witness_signature: Option<&WitnessSignature>,
        registry: &KnownWitnessRegistry,
    ) -> CoreResult<()> {
        self.check_witness_requirement(&post_state.effective_params, witness_signature, registry)?;

        // Open question resolution: portability on
        // alias change defaults to forbidden unless explicitly allowed.
        // Alias/namespace identity is the repository's concern (the
        // (namespace, alias) key never appears in `EffectiveParameters`),
        // so the coordinator passes the before/after pair in and we only
        // gate on the `portable` flag itself here; the actual identity
        // comparison happens in `crate::coordinator`.
        if !self.portability && post_state.effective_params.portable {
            return Err(CoreError::PolicyForbidden(
                "portability is forbidden by active policy".into(),
            ));
        }
        if !self.prerotation {
            if let Some(hashes) = &post_state.effective_params.next_key_hashes {
                if !hashes.is_empty() {
                    return Err(CoreError::PolicyForbidden(
                        "prerotation is forbidden by active policy".into(),
                    ));
                }
            }
        }
        let _ = prev_state;
        Ok(())
    }

    /// Admits a deactivation mutation.
    pub fn admit_deactivate(
        &self,
        post_state: &PostState,
        witness_signature: Option<&WitnessSignature>,
        registry: &KnownWitnessRegistry,
    ) -> CoreResult<()> {
        self.check_witness_requirement(&post_state.effective_params, witness_signature, registry)
    }

    fn check_witness_requirement(
        &self,
        params: &EffectiveParameters,
        witness_signature: Option<&WitnessSignature>,
        registry: &KnownWitnessRegistry,
    ) -> CoreResult<()> {
        if !self.witness_required {
            return Ok(());
        }
        let witness_param = params
            .witness
            .as_ref()
            .ok_or_else(|| CoreError::PolicyForbidden("witness is required by active policy".into()))?;
        if witness_signature.is_none() {
            return Err(CoreError::PolicyForbidden(
                "witness signature is required by active policy".into(),
            ));
        }
        for entry in &witness_param.witnesses {
            if !registry.contains(&entry.id) {
                return Err(CoreError::UnknownWitness(entry.id.clone()));
            }
        }
        Ok(())
    }

    /// Checks an alias-change mutation against the portability rule: the
    /// `(namespace, alias)` pair may change only when this policy allows
    /// portability AND the DID's own `portable` parameter is set.
    pub fn check_alias_change_allowed(&self, effective_params: &EffectiveParameters) -> CoreResult<()> {
        if !self.portability || !effective_params.portable {
            return Err(CoreError::PolicyForbidden(
                "alias/namespace may not change: portability is forbidden".into(),
            ));
        }
        Ok(())
    }
}

/// An atomically-swappable snapshot of the active policy and known-witness
/// registry. A single-entry `dashmap` table gives a lock-free read path:
/// readers clone an `Arc` without blocking a concurrent publish.
#[derive(Debug)]
pub struct PolicyStore {
    slot: DashMap<(), Arc<(Policy, KnownWitnessRegistry)>>,
    generation: AtomicUsize,
}

impl Default for PolicyStore {
    fn default() -> Self {
        PolicyStore::new(Policy::default(), KnownWitnessRegistry::default())
    }
}

impl PolicyStore {
    pub fn new(policy: Policy, registry: KnownWitnessRegistry) -> Self {
        let store = PolicyStore {
            slot: DashMap::new(),
            generation: AtomicUsize::new(0),
        };
        store.slot.insert((), Arc::new((policy, registry)));
        store
    }

    /// Returns the current snapshot without taking a lock on the hot path
    /// (readers hold only the `dashmap` shard guard for the instant of the
    /// clone).
    pub fn snapshot(&self) -> Arc<(Policy, KnownWitnessRegistry)> {
        self.slot
            .get(&())
            .map(|entry| entry.value().clone())
            .unwrap_or_else(|| Arc::new((Policy::default(), KnownWitnessRegistry::default())))
    }

    pub fn policy(&self) -> Policy {
        self.snapshot().0.clone()
    }

    pub fn registry(&self) -> KnownWitnessRegistry {
        self.snapshot().1.clone()
    }

    /// Publishes a new snapshot, replacing both policy and registry
    /// atomically so a reader never observes one updated without the other.
    pub fn publish(&self, policy: Policy, registry: KnownWitnessRegistry) {
        self.slot.insert((), Arc::new((policy, registry)));
        self.generation.fetch_add(1, Ordering::Release);
    }

    /// Publishes a new witness registry, keeping the current policy.
    pub fn publish_registry(&self, registry: KnownWitnessRegistry) {
        let policy = self.policy();
        self.publish(policy, registry);
    }

    /// Monotonic counter bumped on every publish; useful for tests asserting
    /// a refresh actually happened.
    pub fn generation(&self) -> usize {
        self.generation.load(Ordering::Acquire)
    }
}
