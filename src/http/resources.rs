//! Handlers for attested-resource routes.
//!
//! Verification itself lives in [`crate::resource`] and is reached only
//! through [`crate::coordinator::MutationCoordinator::submit_resource`].

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::Json;
use serde::Deserialize;

use crate::error::CoreError;
use crate::repository::Repository as _;
use crate::types::AttestedResource;

use super::AppState;

#[derive(Debug, Deserialize)]
pub struct ResourceRequest {
    #[serde(rename = "attestedResource")]
    pub attested_resource: AttestedResource,
}

/// `POST /{ns}/{alias}/resources`: admits a new or replacement resource.
pub async fn submit_resource(
    State(state): State<AppState>,
    Path((namespace, alias)): Path<(String, String)>,
    Json(request): Json<ResourceRequest>,
) -> Result<impl IntoResponse, CoreError> {
    let record = state
        .coordinator
        .submit_resource(&namespace, &alias, request.attested_resource)
        .await?;
    Ok((StatusCode::CREATED, Json(record.attested_resource)))
}

/// `GET /{ns}/{alias}/resources/{digest}`: fetches a stored resource by its
/// content digest.
pub async fn get_resource(
    State(state): State<AppState>,
    Path((namespace, alias, digest)): Path<(String, String, String)>,
) -> Result<impl IntoResponse, CoreError> {
    let existing = state
        .coordinator
        .resolve(&namespace, &alias)
        .await?;
    let record = state
        .repository
        .get_resource(&existing.scid, &digest)
        .await?
        .ok_or_else(|| CoreError::NotFound(format!("resource {digest}")))?;
    Ok(Json(record.attested_resource))
}

/// `PUT /{ns}/{alias}/resources/{digest}`: replaces a stored resource,
/// enforcing the path digest matches the body's own id.
pub async fn replace_resource(
    State(state): State<AppState>,
    Path((namespace, alias, digest)): Path<(String, String, String)>,
    Json(request): Json<ResourceRequest>,
) -> Result<impl IntoResponse, CoreError> {
    let (_, body_digest) = AttestedResource::parse_id(&request.attested_resource.id)
        .ok_or_else(|| CoreError::SchemaInvalid(format!("malformed resource id: {}", request.attested_resource.id)))?;
    if body_digest != digest {
        return Err(CoreError::SchemaInvalid(format!(
            "resource digest {body_digest} does not match path {digest}"
        )));
    }
    let record = state
        .coordinator
        .submit_resource(&namespace, &alias, request.attested_resource)
        .await?;
    Ok(Json(record.attested_resource))
}
