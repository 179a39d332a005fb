//! Handlers for the WHOIS presentation routes.

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::Json;
use serde::Deserialize;

use crate::error::CoreError;
use crate::types::VerifiablePresentation;

use super::AppState;

#[derive(Debug, Deserialize)]
pub struct WhoisRequest {
    #[serde(rename = "verifiablePresentation")]
    pub verifiable_presentation: VerifiablePresentation,
}

/// `POST /{ns}/{alias}/whois`: verifies and stores a WHOIS presentation.
pub async fn submit_whois(
    State(state): State<AppState>,
    Path((namespace, alias)): Path<(String, String)>,
    Json(request): Json<WhoisRequest>,
) -> Result<impl IntoResponse, CoreError> {
    state
        .coordinator
        .submit_whois(&namespace, &alias, request.verifiable_presentation)
        .await?;
    Ok(StatusCode::NO_CONTENT)
}

/// `GET /{ns}/{alias}/whois.vp`: the latest stored WHOIS presentation.
pub async fn get_whois(
    State(state): State<AppState>,
    Path((namespace, alias)): Path<(String, String)>,
) -> Result<impl IntoResponse, CoreError> {
    let record = state.coordinator.resolve(&namespace, &alias).await?;
    let vp = record
        .whois
        .ok_or_else(|| CoreError::NotFound(format!("whois for {namespace}/{alias}")))?;
    Ok(Json(vp))
}
