//! Background task bookkeeping.
//!
//! Records the progress of startup/admin jobs — applying policy from
//! configuration, bootstrapping the known-witness registry — in the
//! repository so an admin can poll status. There is no invitation/DIDComm
//! handshake here; the initial witness is registered directly from
//! configuration instead.

use serde_json::json;
use uuid::Uuid;

use crate::config::Settings;
use crate::error::{CoreError, CoreResult};
use crate::policy::{KnownWitnessRegistry, Policy, PolicyStore, WitnessRegistryEntry};
use crate::repository::{RegistryRecord, Repository as _, SharedRepository, TaskStatus};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskType {
    SetPolicy,
    RegisterWitness,
    SyncRecords,
}

impl TaskType {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskType::SetPolicy => "set_policy",
            TaskType::RegisterWitness => "register_witness",
            TaskType::SyncRecords => "sync_records",
        }
    }
}

fn registry_from_record(record: &RegistryRecord) -> CoreResult<KnownWitnessRegistry> {
    serde_json::from_value(record.registry_data.clone())
        .map_err(|e| CoreError::Repository(format!("malformed known-witness registry: {e}")))
}

/// The shape a remote witness registry endpoint is expected to answer with:
/// `{"registry": {"did:key:...": {"name"?, "serviceEndpoint"?}, ...}}`
/// (`server/app/plugins/policy.py::cache_known_witness_registry`,
/// `original_source`).
#[derive(Debug, serde::Deserialize)]
struct RemoteWitnessRegistryResponse {
    registry: std::collections::BTreeMap<String, WitnessRegistryEntry>,
}

/// Fetches and validates a remote known-witness registry. Called only from
/// the one-shot startup task, never on the mutation path (spec section 5:
/// the remote fetch is a suspension point allowed "lazily at policy refresh
/// time").
async fn fetch_remote_witness_registry(registry_url: &str) -> CoreResult<KnownWitnessRegistry> {
    let url = url::Url::parse(registry_url)
        .map_err(|e| CoreError::SchemaInvalid(format!("invalid witness registry url: {e}")))?;
    let body = reqwest::get(url)
        .await
        .map_err(|e| CoreError::Repository(format!("witness registry fetch failed: {e}")))?
        .json::<RemoteWitnessRegistryResponse>()
        .await
        .map_err(|e| CoreError::Repository(format!("witness registry response invalid: {e}")))?;
    for witness_id in body.registry.keys() {
        if !witness_id.starts_with("did:key:") {
            return Err(CoreError::SchemaInvalid(format!(
                "invalid witness registry entry: {witness_id}"
            )));
        }
    }
    Ok(KnownWitnessRegistry::new(body.registry))
}

/// Tracks one background job's lifecycle: started -> (progress)* -> finished
/// or abandoned. Each `TaskManager` owns exactly one task id, matching
/// `TaskManager(task_id=None)` being re-instantiated per job in the Python.
pub struct TaskManager {
    repository: SharedRepository,
    task_id: String,
}

impl TaskManager {
    pub fn new(repository: SharedRepository) -> Self {
        TaskManager {
            repository,
            task_id: Uuid::new_v4().to_string(),
        }
    }

    pub fn task_id(&self) -> &str {
        &self.task_id
    }

    async fn start(&self, task_type: TaskType) -> CoreResult<()> {
        tracing::info!(task_id = %self.task_id, task_type = task_type.as_str(), "task started");
        self.repository.create_task(&self.task_id, task_type.as_str()).await?;
        Ok(())
    }

    async fn progress(&self, progress: serde_json::Value) -> CoreResult<()> {
        tracing::debug!(task_id = %self.task_id, %progress, "task progress");
        self.repository.update_task(&self.task_id, None, Some(progress), None).await
    }

    async fn finish(&self) -> CoreResult<()> {
        tracing::info!(task_id = %self.task_id, "task finished");
        self.repository.update_task(&self.task_id, Some(TaskStatus::Finished), None, None).await
    }

    async fn abandon(&self, message: String) -> CoreResult<()> {
        tracing::error!(task_id = %self.task_id, %message, "task abandoned");
        self.repository
            .update_task(&self.task_id, Some(TaskStatus::Abandoned), None, Some(message))
            .await
    }

    /// Applies the active policy from `settings` and ensures a known-witness
    /// registry row exists, publishing both into `policy_store`
    /// (`app/tasks.py::set_policies`).
    pub async fn set_policies(&self, settings: &Settings, policy_store: &PolicyStore) -> CoreResult<()> {
        self.start(TaskType::SetPolicy).await?;

        let outcome = self.run_set_policies(settings, policy_store).await;
        match outcome {
            Ok(()) => self.finish().await,
            Err(e) => {
                self.abandon(e.to_string()).await?;
                Err(e)
            }
        }
    }

    async fn run_set_policies(&self, settings: &Settings, policy_store: &PolicyStore) -> CoreResult<()> {
        tracing::info!("applying policy from configuration");
        let policy = Policy {
            version: settings.webvh_version.clone(),
            witness_required: settings.webvh_witness,
            watcher: settings.webvh_watcher.clone(),
            portability: settings.webvh_portability,
            prerotation: settings.webvh_prerotation,
            endorsement: settings.webvh_endorsement,
            validity: settings.webvh_validity,
            witness_registry_url: settings.webvh_witness_registry_url.clone(),
        };
        self.repository.upsert_policy("active", policy.clone()).await?;
        self.progress(json!({"policy": format!("policy {} active", policy.version)})).await?;

        let mut registry = match self.repository.get_registry("knownWitnesses").await? {
            Some(record) => {
                tracing::info!("known-witness registry already present, skipping creation");
                registry_from_record(&record)?
            }
            None => {
                tracing::info!("creating empty known-witness registry");
                self.repository
                    .upsert_registry("knownWitnesses", "witnesses", json!({}), json!({}))
                    .await?;
                KnownWitnessRegistry::default()
            }
        };

        if let Some(registry_url) = &policy.witness_registry_url {
            tracing::info!(url = %registry_url, "refreshing known-witness registry from remote");
            let remote = fetch_remote_witness_registry(registry_url).await?;
            for (id, entry) in remote.iter() {
                registry.insert(id.to_string(), entry.clone());
            }
            let registry_data = serde_json::to_value(&registry).map_err(|e| CoreError::Repository(e.to_string()))?;
            self.repository
                .upsert_registry("knownWitnesses", "witnesses", registry_data, json!({}))
                .await?;
        }

        self.progress(json!({"knownWitnessRegistry": format!("{} witnesses registered", registry.len())}))
            .await?;
        policy_store.publish(policy, registry);
        Ok(())
    }

    /// Registers the service's own initial witness directly from
    /// configuration (`WEBVH_WITNESS_ID` plus optional name/endpoint).
    pub async fn register_initial_witness(&self, settings: &Settings, policy_store: &PolicyStore) -> CoreResult<()> {
        self.start(TaskType::RegisterWitness).await?;

        let outcome = self.run_register_initial_witness(settings, policy_store).await;
        match outcome {
            Ok(()) => self.finish().await,
            Err(e) => {
                self.abandon(e.to_string()).await?;
                Err(e)
            }
        }
    }

    async fn run_register_initial_witness(&self, settings: &Settings, policy_store: &PolicyStore) -> CoreResult<()> {
        let Some(witness_id) = settings.webvh_witness_id.clone() else {
            tracing::info!("no initial witness configured, skipping registration");
            return Ok(());
        };

        let record = self.repository.get_registry("knownWitnesses").await?;
        let mut registry = record
            .as_ref()
            .map(registry_from_record)
            .transpose()?
            .unwrap_or_default();

        registry.insert(
            witness_id.clone(),
            WitnessRegistryEntry {
                name: settings.webvh_witness_name.clone(),
                service_endpoint: settings.webvh_witness_service_endpoint.clone(),
            },
        );

        let registry_data = serde_json::to_value(&registry).map_err(|e| CoreError::Repository(e.to_string()))?;
        self.repository
            .upsert_registry("knownWitnesses", "witnesses", registry_data, json!({}))
            .await?;
        self.progress(json!({"witness": format!("witness {witness_id} registered successfully")}))
            .await?;
        tracing::info!(%witness_id, "initial witness registered");
        policy_store.publish_registry(registry);
        Ok(())
    }
}
