//! Admin-gated routes, protected by a shared-secret header check rather than
//! any session or OAuth flow.

use axum::extract::{Path, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::IntoResponse;
use axum::Json;
use serde::Deserialize;

use crate::error::CoreError;
use crate::policy::Policy;
use crate::repository::Repository as _;

use super::AppState;

const API_KEY_HEADER: &str = "x-api-key";

fn require_admin(state: &AppState, headers: &HeaderMap) -> Result<(), CoreError> {
    let provided = headers
        .get(API_KEY_HEADER)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("");
    if provided != state.settings.admin_api_key {
        return Err(CoreError::AuthorMismatch("missing or invalid admin API key".into()));
    }
    Ok(())
}

/// `GET /admin/policy`: the active policy snapshot.
pub async fn get_policy(State(state): State<AppState>, headers: HeaderMap) -> Result<impl IntoResponse, CoreError> {
    require_admin(&state, &headers)?;
    Ok(Json(state.policy_store.policy()))
}

#[derive(Debug, Deserialize)]
pub struct SetPolicyRequest {
    pub policy: Policy,
}

/// `POST /admin/policy`: replaces the active policy, publishing a new
/// snapshot immediately.
pub async fn set_policy(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(request): Json<SetPolicyRequest>,
) -> Result<impl IntoResponse, CoreError> {
    require_admin(&state, &headers)?;
    state.repository.upsert_policy("active", request.policy.clone()).await?;
    let registry = state.policy_store.registry();
    state.policy_store.publish(request.policy, registry);
    Ok(StatusCode::NO_CONTENT)
}

/// `GET /admin/tasks/{id}`: a background job's current status.
pub async fn get_task(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, CoreError> {
    require_admin(&state, &headers)?;
    let task = state
        .repository
        .get_task(&id)
        .await?
        .ok_or_else(|| CoreError::NotFound(format!("task {id}")))?;
    Ok(Json(serde_json::json!({
        "id": task.id,
        "taskType": task.task_type,
        "status": task.status.as_str(),
        "progress": task.progress,
        "message": task.message,
    })))
}
