//! Handlers for the identifier-lifecycle routes: the creation template,
//! create/append, and the two read views of a log (`did.jsonl`, `did.json`).
//!
//! Verification is delegated entirely to
//! [`crate::coordinator::MutationCoordinator`]; these handlers only parse
//! requests and map results to responses.

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use chrono::Utc;
use serde::Deserialize;

use crate::canon::SCID_PLACEHOLDER;
use crate::error::CoreError;
use crate::repository::Repository as _;
use crate::types::{LogEntry, WitnessSignature};

use super::AppState;

#[derive(Debug, Deserialize)]
pub struct TemplateQuery {
    pub namespace: String,
    pub alias: String,
}

/// `GET /?namespace=&alias=`: offers the initial parameter/state skeleton a
/// prospective controller fills in and signs as entry 1.
pub async fn creation_template(
    State(state): State<AppState>,
    Query(query): Query<TemplateQuery>,
) -> Result<impl IntoResponse, CoreError> {
    let (policy, registry) = {
        let snapshot = state.policy_store.snapshot();
        (snapshot.0.clone(), snapshot.1.clone())
    };
    policy.check_namespace_available(&query.namespace)?;

    if state
        .repository
        .get_by_alias(&query.namespace, &query.alias)
        .await?
        .is_some()
    {
        return Err(CoreError::AliasExists(query.namespace, query.alias));
    }

    let parameters = policy.parameters_skeleton(SCID_PLACEHOLDER, &registry);
    let state_doc = serde_json::json!({
        "@context": ["https://www.w3.org/ns/did/v1"],
        "id": format!(
            "did:webvh:{SCID_PLACEHOLDER}:{}:{}:{}",
            state.settings.domain, query.namespace, query.alias
        ),
    });

    let template = LogEntry {
        version_id: SCID_PLACEHOLDER.to_string(),
        version_time: Utc::now(),
        parameters,
        state: state_doc,
        proof: Default::default(),
    };
    Ok(Json(template))
}

#[derive(Debug, Deserialize)]
pub struct MutationRequest {
    #[serde(rename = "logEntry")]
    pub log_entry: LogEntry,
    #[serde(rename = "witnessSignature", default)]
    pub witness_signature: Option<WitnessSignature>,
}

/// `POST /{ns}/{alias}`: creates the identifier (if `logEntry.versionId`
/// begins `1-`) or appends an update/deactivation entry otherwise (spec
/// section 6).
pub async fn submit_log_entry(
    State(state): State<AppState>,
    Path((namespace, alias)): Path<(String, String)>,
    Json(request): Json<MutationRequest>,
) -> Result<Response, CoreError> {
    let (n, _) = LogEntry::parse_version_id(&request.log_entry.version_id)
        .ok_or_else(|| CoreError::VersionIdMismatch(request.log_entry.version_id.clone()))?;

    if n == 1 {
        let record = state
            .coordinator
            .create_identifier(&namespace, &alias, request.log_entry, request.witness_signature)
            .await?;
        let entry = record.logs.last().cloned().expect("just created, non-empty");
        Ok((StatusCode::CREATED, Json(entry)).into_response())
    } else {
        let record = state
            .coordinator
            .update_identifier(&namespace, &alias, request.log_entry, request.witness_signature)
            .await?;
        let entry = record.logs.last().cloned().expect("just updated, non-empty");
        Ok((StatusCode::OK, Json(entry)).into_response())
    }
}

/// `GET /{ns}/{alias}/did.jsonl`: the full log, newline-delimited JSON (spec
/// section 6, "Canonical encodings").
pub async fn did_jsonl(
    State(state): State<AppState>,
    Path((namespace, alias)): Path<(String, String)>,
) -> Result<impl IntoResponse, CoreError> {
    let record = state.coordinator.resolve(&namespace, &alias).await?;
    let mut body = String::new();
    for entry in &record.logs {
        let line = serde_json::to_string(entry).map_err(|e| CoreError::SchemaInvalid(e.to_string()))?;
        body.push_str(&line);
        body.push('\n');
    }
    Ok(([(axum::http::header::CONTENT_TYPE, "application/jsonl")], body))
}

/// `GET /{ns}/{alias}/did.json`: the `did:web` degraded view of the latest
/// DID document, `alsoKnownAs` pointing back to the `did:webvh:` id, matching
/// `read_did` in the original (`original_source`, `server/app/routers/identifiers.py`) —
/// callers that only resolve `did:web` still get a usable document.
pub async fn did_json(
    State(state): State<AppState>,
    Path((namespace, alias)): Path<(String, String)>,
) -> Result<impl IntoResponse, CoreError> {
    let record = state.coordinator.resolve(&namespace, &alias).await?;
    let web_did = format!("{}:{}:{}", state.settings.did_web_prefix(), namespace, alias);
    let mut web_doc = record.document.to_web_view(&web_did);
    if !web_doc.also_known_as.iter().any(|id| id == &record.document.id) {
        web_doc.also_known_as.push(record.document.id.clone());
    }
    Ok(Json(web_doc))
}
