//! C8: identifier repository.
//!
//! The durable store of every identifier's log, witness file, WHOIS
//! presentation, current parameters/document, attested resources, policy,
//! known-witness registry, background tasks, and tails files. This module
//! owns all persistent state; no other component retains durable state
//! between requests.
//!
//! Two implementations share the [`Repository`] trait: [`InMemoryRepository`]
//! (used by tests and as the default when no database is configured) and
//! [`SqlxRepository`] (an `sqlx::Any`-driven store that picks sqlite or
//! postgres from `DATABASE_URL`).

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde_json::Value;
use sqlx::any::AnyPoolOptions;
use sqlx::{AnyPool, Row};

use crate::document_state::{self, PostState};
use crate::error::{CoreError, CoreResult};
use crate::policy::Policy;
use crate::resource::resource_details;
use crate::types::{AttestedResource, DidDocument, EffectiveParameters, LogEntry, VerifiablePresentation, WitnessSignature};

/// A single entry of a `did.jsonl` witness file: its `{versionId, proof}`
/// shape is identical to a mutation's own witness signature, so we reuse the
/// wire type.
pub type WitnessFileEntry = WitnessSignature;

/// All durable state for one hosted identifier.
#[derive(Debug, Clone)]
pub struct ControllerRecord {
    pub scid: String,
    pub did: String,
    pub domain: String,
    pub namespace: String,
    pub alias: String,
    pub deactivated: bool,
    pub logs: Vec<LogEntry>,
    pub witness_file: Vec<WitnessFileEntry>,
    pub whois: Option<VerifiablePresentation>,
    pub parameters: EffectiveParameters,
    pub document: DidDocument,
    pub created: DateTime<Utc>,
    pub updated: DateTime<Utc>,
}

impl ControllerRecord {
    fn from_logs(
        logs: Vec<LogEntry>,
        witness_file: Vec<WitnessFileEntry>,
        whois: Option<VerifiablePresentation>,
        now: DateTime<Utc>,
    ) -> CoreResult<ControllerRecord> {
        let states = document_state::fold(&logs)?;
        let post = states.last().expect("fold never returns an empty Vec on success");
        let (domain, namespace, alias) = split_webvh_did(&post.document.id)?;
        Ok(ControllerRecord {
            scid: post.scid.clone(),
            did: post.document.id.clone(),
            domain,
            namespace,
            alias,
            deactivated: post.deactivated(),
            logs,
            witness_file,
            whois,
            parameters: post.effective_params.clone(),
            document: post.document.clone(),
            created: now,
            updated: now,
        })
    }

    pub fn latest_post_state(&self) -> CoreResult<PostState> {
        let states = document_state::fold(&self.logs)?;
        Ok(states.into_iter().last().expect("non-empty by construction"))
    }
}

/// Splits a `did:webvh:{scid}:{domain}:{namespace}:{alias}` id into its
/// `(domain, namespace, alias)` parts, mirroring
/// `DidControllerRecord.__init__`'s `did_parts` extraction. Shared with
/// `crate::coordinator`, which uses it to check a submitted entry's document
/// id actually names the `(namespace, alias)` path it was posted to.
pub(crate) fn split_webvh_did(did: &str) -> CoreResult<(String, String, String)> {
    let parts: Vec<&str> = did.split(':').collect();
    if parts.len() < 6 || parts[0] != "did" || parts[1] != "webvh" {
        return Err(CoreError::SchemaInvalid(format!("not a did:webvh id: {did}")));
    }
    Ok((parts[3].to_string(), parts[4].to_string(), parts[5].to_string()))
}

/// Filter used by `countControllers`/`getControllers`.
#[derive(Debug, Clone, Default)]
pub struct ControllerFilter {
    pub namespace: Option<String>,
    pub deactivated: Option<bool>,
}

impl ControllerFilter {
    fn matches(&self, record: &ControllerRecord) -> bool {
        if let Some(namespace) = &self.namespace {
            if &record.namespace != namespace {
                return false;
            }
        }
        if let Some(deactivated) = self.deactivated {
            if record.deactivated != deactivated {
                return false;
            }
        }
        true
    }
}

/// An attested resource row.
#[derive(Debug, Clone)]
pub struct ResourceRecord {
    pub resource_id: String,
    pub scid: String,
    pub did: String,
    pub resource_type: String,
    pub resource_name: Option<String>,
    pub attested_resource: AttestedResource,
    pub media_type: String,
}

/// A background task's bookkeeping row.
#[derive(Debug, Clone)]
pub struct TaskRecord {
    pub id: String,
    pub task_type: String,
    pub status: TaskStatus,
    pub progress: Value,
    pub message: Option<String>,
    pub created: DateTime<Utc>,
    pub updated: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskStatus {
    Started,
    Finished,
    Abandoned,
}

impl TaskStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::Started => "started",
            TaskStatus::Finished => "finished",
            TaskStatus::Abandoned => "abandoned",
        }
    }
}

/// A registry row — generic storage
/// for the known-witness registry and any future named registry.
#[derive(Debug, Clone)]
pub struct RegistryRecord {
    pub registry_id: String,
    pub registry_type: String,
    pub registry_data: Value,
    pub meta: Value,
}

/// The persistent store every mutation ultimately lands in. All writes are
/// single-row transactions.
#[async_trait]
pub trait Repository: Send + Sync {
    async fn create_controller(
        &self,
        logs: Vec<LogEntry>,
        witness_file: Vec<WitnessFileEntry>,
        whois: Option<VerifiablePresentation>,
    ) -> CoreResult<ControllerRecord>;

    async fn update_controller(
        &self,
        scid: &str,
        logs: Vec<LogEntry>,
        witness_file: Vec<WitnessFileEntry>,
    ) -> CoreResult<ControllerRecord>;

    async fn get_by_alias(&self, namespace: &str, alias: &str) -> CoreResult<Option<ControllerRecord>>;
    async fn get_by_scid(&self, scid: &str) -> CoreResult<Option<ControllerRecord>>;
    async fn count_controllers(&self, filter: &ControllerFilter) -> CoreResult<u64>;
    async fn get_controllers(&self, filter: &ControllerFilter, limit: u64, offset: u64) -> CoreResult<Vec<ControllerRecord>>;

    async fn put_whois(&self, scid: &str, vp: VerifiablePresentation) -> CoreResult<()>;

    async fn upsert_resource(&self, resource: AttestedResource, scid: &str, did: &str) -> CoreResult<ResourceRecord>;
    async fn get_resource(&self, scid: &str, digest: &str) -> CoreResult<Option<ResourceRecord>>;
    async fn list_resources(&self, scid: &str, resource_type: Option<&str>) -> CoreResult<Vec<ResourceRecord>>;

    async fn get_policy(&self, policy_id: &str) -> CoreResult<Option<Policy>>;
    async fn upsert_policy(&self, policy_id: &str, policy: Policy) -> CoreResult<()>;

    async fn get_registry(&self, registry_id: &str) -> CoreResult<Option<RegistryRecord>>;
    async fn upsert_registry(&self, registry_id: &str, registry_type: &str, data: Value, meta: Value) -> CoreResult<()>;

    async fn create_task(&self, id: &str, task_type: &str) -> CoreResult<TaskRecord>;
    async fn update_task(&self, id: &str, status: Option<TaskStatus>, progress: Option<Value>, message: Option<String>) -> CoreResult<()>;
    async fn get_task(&self, id: &str) -> CoreResult<Option<TaskRecord>>;

    async fn get_tails(&self, hash: &str) -> CoreResult<Option<Vec<u8>>>;
    async fn put_tails(&self, hash: &str, bytes: Vec<u8>) -> CoreResult<()>;
}

/// An in-memory [`Repository`], used by tests and as the default backing
/// when no `DATABASE_URL` is configured. `dashmap` gives per-row locking
/// without a single global mutex, so mutations against distinct identifiers
/// proceed in parallel.
#[derive(Debug, Default)]
pub struct InMemoryRepository {
    controllers: DashMap<String, ControllerRecord>,
    alias_index: DashMap<(String, String), String>,
    resources: DashMap<(String, String), ResourceRecord>,
    policies: DashMap<String, Policy>,
    registries: DashMap<String, RegistryRecord>,
    tasks: DashMap<String, TaskRecord>,
    tails: DashMap<String, Vec<u8>>,
    resource_seq: AtomicU64,
}

impl InMemoryRepository {
    pub fn new() -> Self {
        InMemoryRepository::default()
    }
}

#[async_trait]
impl Repository for InMemoryRepository {
    async fn create_controller(
        &self,
        logs: Vec<LogEntry>,
        witness_file: Vec<WitnessFileEntry>,
        whois: Option<VerifiablePresentation>,
    ) -> CoreResult<ControllerRecord> {
        let record = ControllerRecord::from_logs(logs, witness_file, whois, Utc::now())?;
        let key = (record.namespace.clone(), record.alias.clone());
        if self.alias_index.contains_key(&key) {
            return Err(CoreError::AliasExists(record.namespace, record.alias));
        }
        self.alias_index.insert(key, record.scid.clone());
        self.controllers.insert(record.scid.clone(), record.clone());
        Ok(record)
    }

    async fn update_controller(
        &self,
        scid: &str,
        logs: Vec<LogEntry>,
        witness_file: Vec<WitnessFileEntry>,
    ) -> CoreResult<ControllerRecord> {
        let mut entry = self
            .controllers
            .get_mut(scid)
            .ok_or_else(|| CoreError::NotFound(format!("controller {scid}")))?;
        let whois = entry.whois.clone();
        let created = entry.created;
        let mut updated = ControllerRecord::from_logs(logs, witness_file, whois, Utc::now())?;
        updated.created = created;
        *entry = updated.clone();
        Ok(updated)
    }

    async fn get_by_alias(&self, namespace: &str, alias: &str) -> CoreResult<Option<ControllerRecord>> {
        let key = (namespace.to_string(), alias.to_string());
        match self.alias_index.get(&key) {
            Some(scid) => Ok(self.controllers.get(scid.value()).map(|e| e.clone())),
            None => Ok(None),
        }
    }

    async fn get_by_scid(&self, scid: &str) -> CoreResult<Option<ControllerRecord>> {
        Ok(self.controllers.get(scid).map(|e| e.clone()))
    }

    async fn count_controllers(&self, filter: &ControllerFilter) -> CoreResult<u64> {
        Ok(self.controllers.iter().filter(|e| filter.matches(e.value())).count() as u64)
    }

    async fn get_controllers(&self, filter: &ControllerFilter, limit: u64, offset: u64) -> CoreResult<Vec<ControllerRecord>> {
        let mut matching: Vec<ControllerRecord> = self
            .controllers
            .iter()
            .filter(|e| filter.matches(e.value()))
            .map(|e| e.value().clone())
            .collect();
        matching.sort_by(|a, b| a.created.cmp(&b.created));
        Ok(matching.into_iter().skip(offset as usize).take(limit as usize).collect())
    }

    async fn put_whois(&self, scid: &str, vp: VerifiablePresentation) -> CoreResult<()> {
        let mut entry = self
            .controllers
            .get_mut(scid)
            .ok_or_else(|| CoreError::NotFound(format!("controller {scid}")))?;
        entry.whois = Some(vp);
        entry.updated = Utc::now();
        Ok(())
    }

    async fn upsert_resource(&self, resource: AttestedResource, scid: &str, did: &str) -> CoreResult<ResourceRecord> {
        let (_, digest) = AttestedResource::parse_id(&resource.id)
            .ok_or_else(|| CoreError::SchemaInvalid(format!("malformed resource id: {}", resource.id)))?;
        let record = ResourceRecord {
            resource_id: digest.to_string(),
            scid: scid.to_string(),
            did: did.to_string(),
            resource_type: resource.metadata.resource_type.clone(),
            resource_name: resource.metadata.resource_name.clone(),
            attested_resource: resource,
            media_type: "application/jsonld".to_string(),
        };
        self.resource_seq.fetch_add(1, Ordering::Relaxed);
        self.resources.insert((scid.to_string(), digest.to_string()), record.clone());
        Ok(record)
    }

    async fn get_resource(&self, scid: &str, digest: &str) -> CoreResult<Option<ResourceRecord>> {
        Ok(self.resources.get(&(scid.to_string(), digest.to_string())).map(|e| e.clone()))
    }

    async fn list_resources(&self, scid: &str, resource_type: Option<&str>) -> CoreResult<Vec<ResourceRecord>> {
        Ok(self
            .resources
            .iter()
            .filter(|e| e.key().0 == scid)
            .filter(|e| resource_type.map(|t| e.value().resource_type == t).unwrap_or(true))
            .map(|e| e.value().clone())
            .collect())
    }

    async fn get_policy(&self, policy_id: &str) -> CoreResult<Option<Policy>> {
        Ok(self.policies.get(policy_id).map(|e| e.clone()))
    }

    async fn upsert_policy(&self, policy_id: &str, policy: Policy) -> CoreResult<()> {
        self.policies.insert(policy_id.to_string(), policy);
        Ok(())
    }

    async fn get_registry(&self, registry_id: &str) -> CoreResult<Option<RegistryRecord>> {
        Ok(self.registries.get(registry_id).map(|e| e.clone()))
    }

    async fn upsert_registry(&self, registry_id: &str, registry_type: &str, data: Value, meta: Value) -> CoreResult<()> {
        self.registries.insert(
            registry_id.to_string(),
            RegistryRecord {
                registry_id: registry_id.to_string(),
                registry_type: registry_type.to_string(),
                registry_data: data,
                meta,
            },
        );
        Ok(())
    }

    async fn create_task(&self, id: &str, task_type: &str) -> CoreResult<TaskRecord> {
        let now = Utc::now();
        let record = TaskRecord {
            id: id.to_string(),
            task_type: task_type.to_string(),
            status: TaskStatus::Started,
            progress: Value::Object(Default::default()),
            message: None,
            created: now,
            updated: now,
        };
        self.tasks.insert(id.to_string(), record.clone());
        Ok(record)
    }

    async fn update_task(&self, id: &str, status: Option<TaskStatus>, progress: Option<Value>, message: Option<String>) -> CoreResult<()> {
        let mut entry = self.tasks.get_mut(id).ok_or_else(|| CoreError::NotFound(format!("task {id}")))?;
        if let Some(status) = status {
            entry.status = status;
        }
        if let Some(progress) = progress {
            if let (Value::Object(existing), Value::Object(incoming)) = (&mut entry.progress, progress) {
                existing.extend(incoming);
            }
        }
        if let Some(message) = message {
            entry.message = Some(message);
        }
        entry.updated = Utc::now();
        Ok(())
    }

    async fn get_task(&self, id: &str) -> CoreResult<Option<TaskRecord>> {
        Ok(self.tasks.get(id).map(|e| e.clone()))
    }

    async fn get_tails(&self, hash: &str) -> CoreResult<Option<Vec<u8>>> {
        Ok(self.tails.get(hash).map(|e| e.clone()))
    }

    async fn put_tails(&self, hash: &str, bytes: Vec<u8>) -> CoreResult<()> {
        self.tails.insert(hash.to_string(), bytes);
        Ok(())
    }
}

/// An `sqlx::Any`-driven [`Repository`], good for either `sqlite://` or
/// `postgres://` URLs (mirroring `StorageManager.db_type` picking the
/// backend from `DATABASE_URL`). JSON-shaped columns (`logs`,
/// `witness_file`, `whois_presentation`, `parameters`, `document`,
/// `attested_resource`, `progress`, `registry_data`) are stored as
/// canonicalized-JSON text, since `sqlx::Any` has no portable native JSON
/// type across sqlite/postgres.
pub struct SqlxRepository {
    pool: AnyPool,
}

impl SqlxRepository {
    pub async fn connect(database_url: &str) -> CoreResult<Self> {
        sqlx::any::install_default_drivers();
        let pool = AnyPoolOptions::new()
            .max_connections(10)
            .connect(database_url)
            .await
            .map_err(|e| CoreError::Repository(format!("connect failed: {e}")))?;
        let repo = SqlxRepository { pool };
        repo.migrate().await?;
        Ok(repo)
    }

    async fn migrate(&self) -> CoreResult<()> {
        let statements = [
            "CREATE TABLE IF NOT EXISTS did_controllers (
                scid TEXT PRIMARY KEY,
                did TEXT NOT NULL,
                domain TEXT NOT NULL,
                namespace TEXT NOT NULL,
                alias TEXT NOT NULL,
                deactivated INTEGER NOT NULL,
                logs TEXT NOT NULL,
                witness_file TEXT NOT NULL,
                whois_presentation TEXT,
                parameters TEXT NOT NULL,
                document TEXT NOT NULL,
                created TEXT NOT NULL,
                updated TEXT NOT NULL
            )",
            "CREATE UNIQUE INDEX IF NOT EXISTS idx_controller_namespace_alias ON did_controllers (namespace, alias)",
            "CREATE TABLE IF NOT EXISTS attested_resources (
                resource_id TEXT NOT NULL,
                scid TEXT NOT NULL,
                did TEXT NOT NULL,
                resource_type TEXT NOT NULL,
                resource_name TEXT,
                attested_resource TEXT NOT NULL,
                media_type TEXT NOT NULL,
                PRIMARY KEY (scid, resource_id)
            )",
            "CREATE TABLE IF NOT EXISTS policies (
                policy_id TEXT PRIMARY KEY,
                policy TEXT NOT NULL
            )",
            "CREATE TABLE IF NOT EXISTS registries (
                registry_id TEXT PRIMARY KEY,
                registry_type TEXT NOT NULL,
                registry_data TEXT NOT NULL,
                meta TEXT NOT NULL
            )",
            "CREATE TABLE IF NOT EXISTS tasks (
                id TEXT PRIMARY KEY,
                task_type TEXT NOT NULL,
                status TEXT NOT NULL,
                progress TEXT NOT NULL,
                message TEXT,
                created TEXT NOT NULL,
                updated TEXT NOT NULL
            )",
            "CREATE TABLE IF NOT EXISTS tails_files (
                hash TEXT PRIMARY KEY,
                bytes BLOB NOT NULL,
                size INTEGER NOT NULL
            )",
        ];
        for stmt in statements {
            sqlx::query(stmt)
                .execute(&self.pool)
                .await
                .map_err(|e| CoreError::Repository(format!("migration failed: {e}")))?;
        }
        Ok(())
    }

    fn to_json(value: &impl serde::Serialize) -> CoreResult<String> {
        serde_json::to_string(value).map_err(|e| CoreError::Repository(format!("serialize failed: {e}")))
    }

    fn from_json<T: serde::de::DeserializeOwned>(raw: &str) -> CoreResult<T> {
        serde_json::from_str(raw).map_err(|e| CoreError::Repository(format!("deserialize failed: {e}")))
    }

    fn row_to_controller(row: &sqlx::any::AnyRow) -> CoreResult<ControllerRecord> {
        let whois_raw: Option<String> = row
            .try_get("whois_presentation")
            .map_err(|e| CoreError::Repository(e.to_string()))?;
        Ok(ControllerRecord {
            scid: row.try_get("scid").map_err(|e| CoreError::Repository(e.to_string()))?,
            did: row.try_get("did").map_err(|e| CoreError::Repository(e.to_string()))?,
            domain: row.try_get("domain").map_err(|e| CoreError::Repository(e.to_string()))?,
            namespace: row.try_get("namespace").map_err(|e| CoreError::Repository(e.to_string()))?,
            alias: row.try_get("alias").map_err(|e| CoreError::Repository(e.to_string()))?,
            deactivated: row.try_get::<i64, _>("deactivated").map_err(|e| CoreError::Repository(e.to_string()))? != 0,
            logs: Self::from_json(&row.try_get::<String, _>("logs").map_err(|e| CoreError::Repository(e.to_string()))?)?,
            witness_file: Self::from_json(&row.try_get::<String, _>("witness_file").map_err(|e| CoreError::Repository(e.to_string()))?)?,
            whois: whois_raw.map(|raw| Self::from_json(&raw)).transpose()?,
            parameters: Self::from_json(&row.try_get::<String, _>("parameters").map_err(|e| CoreError::Repository(e.to_string()))?)?,
            document: Self::from_json(&row.try_get::<String, _>("document").map_err(|e| CoreError::Repository(e.to_string()))?)?,
            created: row.try_get("created").map_err(|e| CoreError::Repository(e.to_string()))?,
            updated: row.try_get("updated").map_err(|e| CoreError::Repository(e.to_string()))?,
        })
    }

    async fn upsert_controller_row(&self, record: &ControllerRecord, insert: bool) -> CoreResult<()> {
        let logs = Self::to_json(&record.logs)?;
        let witness_file = Self::to_json(&record.witness_file)?;
        let whois = record.whois.as_ref().map(Self::to_json).transpose()?;
        let parameters = Self::to_json(&record.parameters)?;
        let document = Self::to_json(&record.document)?;

        if insert {
            sqlx::query(
                "INSERT INTO did_controllers
                 (scid, did, domain, namespace, alias, deactivated, logs, witness_file, whois_presentation, parameters, document, created, updated)
                 VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
            )
            .bind(&record.scid)
            .bind(&record.did)
            .bind(&record.domain)
            .bind(&record.namespace)
            .bind(&record.alias)
            .bind(record.deactivated as i64)
            .bind(logs)
            .bind(witness_file)
            .bind(whois)
            .bind(parameters)
            .bind(document)
            .bind(record.created)
            .bind(record.updated)
            .execute(&self.pool)
            .await
            .map_err(|e| CoreError::RepositoryConflict(e.to_string()))?;
        } else {
            sqlx::query(
                "UPDATE did_controllers SET
                 did = ?, domain = ?, namespace = ?, alias = ?, deactivated = ?,
                 logs = ?, witness_file = ?, whois_presentation = ?, parameters = ?, document = ?, updated = ?
                 WHERE scid = ?",
            )
            .bind(&record.did)
            .bind(&record.domain)
            .bind(&record.namespace)
            .bind(&record.alias)
            .bind(record.deactivated as i64)
            .bind(logs)
            .bind(witness_file)
            .bind(whois)
            .bind(parameters)
            .bind(document)
            .bind(record.updated)
            .bind(&record.scid)
            .execute(&self.pool)
            .await
            .map_err(|e| CoreError::Repository(e.to_string()))?;
        }
        Ok(())
    }
}

#[async_trait]
impl Repository for SqlxRepository {
    async fn create_controller(
        &self,
        logs: Vec<LogEntry>,
        witness_file: Vec<WitnessFileEntry>,
        whois: Option<VerifiablePresentation>,
    ) -> CoreResult<ControllerRecord> {
        let record = ControllerRecord::from_logs(logs, witness_file, whois, Utc::now())?;
        let existing: Option<i64> = sqlx::query_scalar("SELECT 1 FROM did_controllers WHERE namespace = ? AND alias = ?")
            .bind(&record.namespace)
            .bind(&record.alias)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| CoreError::Repository(e.to_string()))?;
        if existing.is_some() {
            return Err(CoreError::AliasExists(record.namespace, record.alias));
        }
        self.upsert_controller_row(&record, true).await?;
        Ok(record)
    }

    async fn update_controller(
        &self,
        scid: &str,
        logs: Vec<LogEntry>,
        witness_file: Vec<WitnessFileEntry>,
    ) -> CoreResult<ControllerRecord> {
        let existing = self
            .get_by_scid(scid)
            .await?
            .ok_or_else(|| CoreError::NotFound(format!("controller {scid}")))?;
        let mut record = ControllerRecord::from_logs(logs, witness_file, existing.whois.clone(), Utc::now())?;
        record.created = existing.created;
        self.upsert_controller_row(&record, false).await?;
        Ok(record)
    }

    async fn get_by_alias(&self, namespace: &str, alias: &str) -> CoreResult<Option<ControllerRecord>> {
        let row = sqlx::query("SELECT * FROM did_controllers WHERE namespace = ? AND alias = ?")
            .bind(namespace)
            .bind(alias)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| CoreError::Repository(e.to_string()))?;
        row.as_ref().map(Self::row_to_controller).transpose()
    }

    async fn get_by_scid(&self, scid: &str) -> CoreResult<Option<ControllerRecord>> {
        let row = sqlx::query("SELECT * FROM did_controllers WHERE scid = ?")
            .bind(scid)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| CoreError::Repository(e.to_string()))?;
        row.as_ref().map(Self::row_to_controller).transpose()
    }

    async fn count_controllers(&self, filter: &ControllerFilter) -> CoreResult<u64> {
        let mut query = "SELECT COUNT(*) FROM did_controllers WHERE 1 = 1".to_string();
        if filter.namespace.is_some() {
            query.push_str(" AND namespace = ?");
        }
        if filter.deactivated.is_some() {
            query.push_str(" AND deactivated = ?");
        }
        let mut q = sqlx::query_scalar::<_, i64>(&query);
        if let Some(ns) = &filter.namespace {
            q = q.bind(ns.clone());
        }
        if let Some(d) = filter.deactivated {
            q = q.bind(d as i64);
        }
        let count: i64 = q.fetch_one(&self.pool).await.map_err(|e| CoreError::Repository(e.to_string()))?;
        Ok(count as u64)
    }

    async fn get_controllers(&self, filter: &ControllerFilter, limit: u64, offset: u64) -> CoreResult<Vec<ControllerRecord>> {
        let mut query = "SELECT * FROM did_controllers WHERE 1 = 1".to_string();
        if filter.namespace.is_some() {
            query.push_str(" AND namespace = ?");
        }
        if filter.deactivated.is_some() {
            query.push_str(" AND deactivated = ?");
        }
        query.push_str(" ORDER BY created ASC LIMIT ? OFFSET ?");
        let mut q = sqlx::query(&query);
        if let Some(ns) = &filter.namespace {
            q = q.bind(ns.clone());
        }
        if let Some(d) = filter.deactivated {
            q = q.bind(d as i64);
        }
        q = q.bind(limit as i64).bind(offset as i64);
        let rows = q.fetch_all(&self.pool).await.map_err(|e| CoreError::Repository(e.to_string()))?;
        rows.iter().map(Self::row_to_controller).collect()
    }

    async fn put_whois(&self, scid: &str, vp: VerifiablePresentation) -> CoreResult<()> {
        let raw = Self::to_json(&vp)?;
        sqlx::query("UPDATE did_controllers SET whois_presentation = ?, updated = ? WHERE scid = ?")
            .bind(raw)
            .bind(Utc::now())
            .bind(scid)
            .execute(&self.pool)
            .await
            .map_err(|e| CoreError::Repository(e.to_string()))?;
        Ok(())
    }

    async fn upsert_resource(&self, resource: AttestedResource, scid: &str, did: &str) -> CoreResult<ResourceRecord> {
        let (_, digest) = AttestedResource::parse_id(&resource.id)
            .ok_or_else(|| CoreError::SchemaInvalid(format!("malformed resource id: {}", resource.id)))?;
        let record = ResourceRecord {
            resource_id: digest.to_string(),
            scid: scid.to_string(),
            did: did.to_string(),
            resource_type: resource.metadata.resource_type.clone(),
            resource_name: resource.metadata.resource_name.clone(),
            attested_resource: resource,
            media_type: "application/jsonld".to_string(),
        };
        let raw = Self::to_json(&record.attested_resource)?;
        sqlx::query(
            "INSERT INTO attested_resources (resource_id, scid, did, resource_type, resource_name, attested_resource, media_type)
             VALUES (?, ?, ?, ?, ?, ?, ?)
             ON CONFLICT (scid, resource_id) DO UPDATE SET
               resource_type = excluded.resource_type,
               resource_name = excluded.resource_name,
               attested_resource = excluded.attested_resource",
        )
        .bind(&record.resource_id)
        .bind(&record.scid)
        .bind(&record.did)
        .bind(&record.resource_type)
        .bind(&record.resource_name)
        .bind(raw)
        .bind(&record.media_type)
        .execute(&self.pool)
        .await
        .map_err(|e| CoreError::Repository(e.to_string()))?;
        Ok(record)
    }

    async fn get_resource(&self, scid: &str, digest: &str) -> CoreResult<Option<ResourceRecord>> {
        let row = sqlx::query("SELECT * FROM attested_resources WHERE scid = ? AND resource_id = ?")
            .bind(scid)
            .bind(digest)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| CoreError::Repository(e.to_string()))?;
        match row {
            None => Ok(None),
            Some(row) => Ok(Some(ResourceRecord {
                resource_id: row.try_get("resource_id").map_err(|e| CoreError::Repository(e.to_string()))?,
                scid: row.try_get("scid").map_err(|e| CoreError::Repository(e.to_string()))?,
                did: row.try_get("did").map_err(|e| CoreError::Repository(e.to_string()))?,
                resource_type: row.try_get("resource_type").map_err(|e| CoreError::Repository(e.to_string()))?,
                resource_name: row.try_get("resource_name").map_err(|e| CoreError::Repository(e.to_string()))?,
                attested_resource: Self::from_json(&row.try_get::<String, _>("attested_resource").map_err(|e| CoreError::Repository(e.to_string()))?)?,
                media_type: row.try_get("media_type").map_err(|e| CoreError::Repository(e.to_string()))?,
            })),
        }
    }

    async fn list_resources(&self, scid: &str, resource_type: Option<&str>) -> CoreResult<Vec<ResourceRecord>> {
        let (query, bind_type) = match resource_type {
            Some(_) => ("SELECT * FROM attested_resources WHERE scid = ? AND resource_type = ?", true),
            None => ("SELECT * FROM attested_resources WHERE scid = ?", false),
        };
        let mut q = sqlx::query(query).bind(scid);
        if bind_type {
            q = q.bind(resource_type.unwrap());
        }
        let rows = q.fetch_all(&self.pool).await.map_err(|e| CoreError::Repository(e.to_string()))?;
        rows.into_iter()
            .map(|row| {
                Ok(ResourceRecord {
                    resource_id: row.try_get("resource_id").map_err(|e| CoreError::Repository(e.to_string()))?,
                    scid: row.try_get("scid").map_err(|e| CoreError::Repository(e.to_string()))?,
                    did: row.try_get("did").map_err(|e| CoreError::Repository(e.to_string()))?,
                    resource_type: row.try_get("resource_type").map_err(|e| CoreError::Repository(e.to_string()))?,
                    resource_name: row.try_get("resource_name").map_err(|e| CoreError::Repository(e.to_string()))?,
                    attested_resource: Self::from_json(&row.try_get::<String, _>("attested_resource").map_err(|e| CoreError::Repository(e.to_string()))?)?,
                    media_type: row.try_get("media_type").map_err(|e| CoreError::Repository(e.to_string()))?,
                })
            })
            .collect()
    }

    async fn get_policy(&self, policy_id: &str) -> CoreResult<Option<Policy>> {
        let row: Option<(String,)> = sqlx::query_as("SELECT policy FROM policies WHERE policy_id = ?")
            .bind(policy_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| CoreError::Repository(e.to_string()))?;
        row.map(|(raw,)| Self::from_json(&raw)).transpose()
    }

    async fn upsert_policy(&self, policy_id: &str, policy: Policy) -> CoreResult<()> {
        let raw = Self::to_json(&policy)?;
        sqlx::query(
            "INSERT INTO policies (policy_id, policy) VALUES (?, ?)
             ON CONFLICT (policy_id) DO UPDATE SET policy = excluded.policy",
        )
        .bind(policy_id)
        .bind(raw)
        .execute(&self.pool)
        .await
        .map_err(|e| CoreError::Repository(e.to_string()))?;
        Ok(())
    }

    async fn get_registry(&self, registry_id: &str) -> CoreResult<Option<RegistryRecord>> {
        let row = sqlx::query("SELECT * FROM registries WHERE registry_id = ?")
            .bind(registry_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| CoreError::Repository(e.to_string()))?;
        match row {
            None => Ok(None),
            Some(row) => Ok(Some(RegistryRecord {
                registry_id: row.try_get("registry_id").map_err(|e| CoreError::Repository(e.to_string()))?,
                registry_type: row.try_get("registry_type").map_err(|e| CoreError::Repository(e.to_string()))?,
                registry_data: Self::from_json(&row.try_get::<String, _>("registry_data").map_err(|e| CoreError::Repository(e.to_string()))?)?,
                meta: Self::from_json(&row.try_get::<String, _>("meta").map_err(|e| CoreError::Repository(e.to_string()))?)?,
            })),
        }
    }

    async fn upsert_registry(&self, registry_id: &str, registry_type: &str, data: Value, meta: Value) -> CoreResult<()> {
        let data_raw = Self::to_json(&data)?;
        let meta_raw = Self::to_json(&meta)?;
        sqlx::query(
            "INSERT INTO registries (registry_id, registry_type, registry_data, meta) VALUES (?, ?, ?, ?)
             ON CONFLICT (registry_id) DO UPDATE SET registry_type = excluded.registry_type, registry_data = excluded.registry_data, meta = excluded.meta",
        )
        .bind(registry_id)
        .bind(registry_type)
        .bind(data_raw)
        .bind(meta_raw)
        .execute(&self.pool)
        .await
        .map_err(|e| CoreError::Repository(e.to_string()))?;
        Ok(())
    }

    async fn create_task(&self, id: &str, task_type: &str) -> CoreResult<TaskRecord> {
        let now = Utc::now();
        sqlx::query(
            "INSERT INTO tasks (id, task_type, status, progress, message, created, updated) VALUES (?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(id)
        .bind(task_type)
        .bind(TaskStatus::Started.as_str())
        .bind("{}")
        .bind(Option::<String>::None)
        .bind(now)
        .bind(now)
        .execute(&self.pool)
        .await
        .map_err(|e| CoreError::Repository(e.to_string()))?;
        Ok(TaskRecord {
            id: id.to_string(),
            task_type: task_type.to_string(),
            status: TaskStatus::Started,
            progress: Value::Object(Default::default()),
            message: None,
            created: now,
            updated: now,
        })
    }

    async fn update_task(&self, id: &str, status: Option<TaskStatus>, progress: Option<Value>, message: Option<String>) -> CoreResult<()> {
        let mut existing = self.get_task(id).await?.ok_or_else(|| CoreError::NotFound(format!("task {id}")))?;
        if let Some(status) = status {
            existing.status = status;
        }
        if let Some(progress) = progress {
            if let (Value::Object(current), Value::Object(incoming)) = (&mut existing.progress, progress) {
                current.extend(incoming);
            }
        }
        if message.is_some() {
            existing.message = message;
        }
        existing.updated = Utc::now();
        sqlx::query("UPDATE tasks SET status = ?, progress = ?, message = ?, updated = ? WHERE id = ?")
            .bind(existing.status.as_str())
            .bind(Self::to_json(&existing.progress)?)
            .bind(&existing.message)
            .bind(existing.updated)
            .bind(id)
            .execute(&self.pool)
            .await
            .map_err(|e| CoreError::Repository(e.to_string()))?;
        Ok(())
    }

    async fn get_task(&self, id: &str) -> CoreResult<Option<TaskRecord>> {
        let row = sqlx::query("SELECT * FROM tasks WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| CoreError::Repository(e.to_string()))?;
        match row {
            None => Ok(None),
            Some(row) => {
                let status: String = row.try_get("status").map_err(|e| CoreError::Repository(e.to_string()))?;
                let status = match status.as_str() {
                    "started" => TaskStatus::Started,
                    "finished" => TaskStatus::Finished,
                    _ => TaskStatus::Abandoned,
                };
                Ok(Some(TaskRecord {
                    id: row.try_get("id").map_err(|e| CoreError::Repository(e.to_string()))?,
                    task_type: row.try_get("task_type").map_err(|e| CoreError::Repository(e.to_string()))?,
                    status,
                    progress: Self::from_json(&row.try_get::<String, _>("progress").map_err(|e| CoreError::Repository(e.to_string()))?)?,
                    message: row.try_get("message").map_err(|e| CoreError::Repository(e.to_string()))?,
                    created: row.try_get("created").map_err(|e| CoreError::Repository(e.to_string()))?,
                    updated: row.try_get("updated").map_err(|e| CoreError::Repository(e.to_string()))?,
                }))
            }
        }
    }

    async fn get_tails(&self, hash: &str) -> CoreResult<Option<Vec<u8>>> {
        let row: Option<(Vec<u8>,)> = sqlx::query_as("SELECT bytes FROM tails_files WHERE hash = ?")
            .bind(hash)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| CoreError::Repository(e.to_string()))?;
        Ok(row.map(|(bytes,)| bytes))
    }

    async fn put_tails(&self, hash: &str, bytes: Vec<u8>) -> CoreResult<()> {
        let size = bytes.len() as i64;
        sqlx::query(
            "INSERT INTO tails_files (hash, bytes, size) VALUES (?, ?, ?)
             ON CONFLICT (hash) DO NOTHING",
        )
        .bind(hash)
        .bind(bytes)
        .bind(size)
        .execute(&self.pool)
        .await
        .map_err(|e| CoreError::Repository(e.to_string()))?;
        Ok(())
    }
}

/// Convenience alias for a shared, dynamically-dispatched repository handle,
/// the shape [`crate::coordinator::MutationCoordinator`] and the HTTP layer
/// both hold.
pub type SharedRepository = Arc<dyn Repository>;

/// Used by the repository's resource listing to attach the resource-type
/// detail summary without re-parsing `content`.
pub fn resource_summary(record: &ResourceRecord) -> Value {
    resource_details(&record.attested_resource)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::multikey::KeyPair;
    use crate::types::ParametersDiff;
    use rand::rngs::OsRng;
    use serde_json::json;

    fn build_entry1() -> LogEntry {
        let kp = KeyPair::generate(&mut OsRng);
        let update_key = kp.public().to_multikey();
        let probe = json!({
            "versionId": crate::canon::SCID_PLACEHOLDER,
            "parameters": {"method": "did:webvh:1.0", "scid": crate::canon::SCID_PLACEHOLDER, "updateKeys": [update_key]},
            "state": {"id": format!("did:webvh:{}:example.com:ns1:a1", crate::canon::SCID_PLACEHOLDER)},
        });
        let jcs = serde_json_canonicalizer::to_string(&probe).unwrap();
        let scid = crate::canon::multihash_b58(jcs.as_bytes()).unwrap();

        let state = json!({
            "@context": ["https://www.w3.org/ns/did/v1"],
            "id": format!("did:webvh:{scid}:example.com:ns1:a1"),
        });
        let parameters = ParametersDiff {
            method: Some("did:webvh:1.0".into()),
            scid: Some(scid.clone()),
            update_keys: Some(vec![update_key]),
            ..Default::default()
        };
        let mut entry = LogEntry {
            version_id: "pending".into(),
            version_time: chrono::Utc::now(),
            parameters,
            state,
            proof: Default::default(),
        };
        let draft = entry.without_proof().with_version_id(&scid);
        let draft_jcs = serde_json_canonicalizer::to_string(&draft).unwrap();
        let entry_hash = crate::canon::multihash_b58(draft_jcs.as_bytes()).unwrap();
        entry.version_id = format!("1-{entry_hash}");
        entry
    }

    #[tokio::test]
    async fn create_and_fetch_by_alias() {
        let repo = InMemoryRepository::new();
        let entry = build_entry1();
        let record = repo.create_controller(vec![entry], vec![], None).await.unwrap();
        let fetched = repo.get_by_alias("ns1", "a1").await.unwrap().unwrap();
        assert_eq!(fetched.scid, record.scid);
    }

    #[tokio::test]
    async fn create_rejects_duplicate_alias() {
        let repo = InMemoryRepository::new();
        let entry = build_entry1();
        repo.create_controller(vec![entry.clone()], vec![], None).await.unwrap();
        let err = repo.create_controller(vec![entry], vec![], None).await.unwrap_err();
        assert!(matches!(err, CoreError::AliasExists(_, _)));
    }

    #[tokio::test]
    async fn count_and_list_respect_filter() {
        let repo = InMemoryRepository::new();
        let entry = build_entry1();
        repo.create_controller(vec![entry], vec![], None).await.unwrap();
        let count = repo.count_controllers(&ControllerFilter { namespace: Some("ns1".into()), deactivated: None }).await.unwrap();
        assert_eq!(count, 1);
        let count_other = repo.count_controllers(&ControllerFilter { namespace: Some("ns2".into()), deactivated: None }).await.unwrap();
        assert_eq!(count_other, 0);
    }

    #[tokio::test]
    async fn tails_round_trip() {
        let repo = InMemoryRepository::new();
        repo.put_tails("hash1", vec![1, 2, 3]).await.unwrap();
        assert_eq!(repo.get_tails("hash1").await.unwrap(), Some(vec![1, 2, 3]));
        assert_eq!(repo.get_tails("missing").await.unwrap(), None);
    }
}
