//! Thin external collaborator: parses requests, calls into
//! the core through [`MutationCoordinator`], and maps [`CoreError`]s to HTTP
//! responses. No verification logic lives here.
//!
//! Grounded in
//! `affinidi-did-resolver-cache-server/src/server.rs`'s router/middleware
//! assembly (CORS, tracing span layer, `State` sharing) and
//! `handlers/mod.rs`'s `application_routes` nesting — generalized from a
//! single resolver endpoint to the full identifier/resource/whois/tails/admin
//! surface this service exposes.

pub mod admin;
pub mod error;
pub mod identifiers;
pub mod resources;
pub mod tails;
pub mod whois;

use std::sync::Arc;

use axum::http::Method;
use axum::routing::{get, post};
use axum::Router;
use tower_http::cors::CorsLayer;
use tower_http::trace::{self, TraceLayer};
use tracing::Level;

use crate::config::Settings;
use crate::coordinator::MutationCoordinator;
use crate::policy::PolicyStore;
use crate::repository::SharedRepository;

/// Everything a request handler needs, cloned cheaply (every field is an
/// `Arc` or a `Clone`-cheap handle) into each axum extractor.
#[derive(Clone)]
pub struct AppState {
    pub coordinator: Arc<MutationCoordinator>,
    pub repository: SharedRepository,
    pub policy_store: Arc<PolicyStore>,
    pub settings: Arc<Settings>,
}

async fn health() -> &'static str {
    "ok"
}

/// Assembles the full router: the identifier lifecycle, resources, whois,
/// tails, and admin routes, plus the CORS/tracing middleware every route
/// shares.
pub fn router(state: AppState) -> Router {
    let app = Router::new()
        .route("/", get(identifiers::creation_template))
        .route("/health", get(health))
        .route("/{namespace}/{alias}", post(identifiers::submit_log_entry))
        .route("/{namespace}/{alias}/did.jsonl", get(identifiers::did_jsonl))
        .route("/{namespace}/{alias}/did.json", get(identifiers::did_json))
        .route("/{namespace}/{alias}/whois", post(whois::submit_whois))
        .route("/{namespace}/{alias}/whois.vp", get(whois::get_whois))
        .route(
            "/{namespace}/{alias}/resources",
            post(resources::submit_resource),
        )
        .route(
            "/{namespace}/{alias}/resources/{digest}",
            get(resources::get_resource).put(resources::replace_resource),
        )
        .route("/tails/hash/{hash}", get(tails::get_tails).put(tails::put_tails))
        .route("/admin/policy", get(admin::get_policy).post(admin::set_policy))
        .route("/admin/tasks/{id}", get(admin::get_task))
        .with_state(state);

    app.layer(
        CorsLayer::new()
            .allow_origin(tower_http::cors::Any)
            .allow_headers([axum::http::header::CONTENT_TYPE, axum::http::header::HeaderName::from_static("x-api-key")])
            .allow_methods([Method::GET, Method::POST, Method::PUT, Method::DELETE]),
    )
    .layer(
        TraceLayer::new_for_http()
            .make_span_with(trace::DefaultMakeSpan::new().level(Level::INFO))
            .on_response(trace::DefaultOnResponse::new().level(Level::INFO)),
    )
}
