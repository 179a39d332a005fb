//! Maps [`CoreError`] onto HTTP status codes and JSON error bodies (spec
//! section 7, "Propagation"). This is the only place in the crate that does
//! status-code reasoning; every other module returns a typed `CoreError` and
//! never touches `axum`.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;

use crate::error::CoreError;

/// The status a given `CoreError` maps to. Most of the taxonomy's buckets
/// map uniformly; a few variants within the Admission and
/// Policy buckets need the finer-grained mapping spelled out there.
fn status_for(err: &CoreError) -> StatusCode {
    use CoreError::*;
    match err {
        AliasExists(_, _) => StatusCode::CONFLICT,
        NotFound(_) => StatusCode::NOT_FOUND,
        PayloadTooLarge => StatusCode::PAYLOAD_TOO_LARGE,
        PolicyForbidden(_) => StatusCode::FORBIDDEN,
        RepositoryConflict(_) | Repository(_) => StatusCode::INTERNAL_SERVER_ERROR,
        _ => StatusCode::BAD_REQUEST,
    }
}

/// A stable machine-readable name for the error variant, independent of its
/// `Display` message (which may embed request-specific detail).
fn variant_name(err: &CoreError) -> &'static str {
    use CoreError::*;
    match err {
        SchemaInvalid(_) => "SchemaInvalid",
        HashMismatch(_) => "HashMismatch",
        VersionIdMismatch(_) => "VersionIdMismatch",
        TimestampNonMonotonic => "TimestampNonMonotonic",
        TimestampInFuture => "TimestampInFuture",
        DigestMismatch { .. } => "DigestMismatch",
        ProofInvalid(_) => "ProofInvalid",
        ProofExpired => "ProofExpired",
        SignatureInvalid => "SignatureInvalid",
        KeyUnresolved(_) => "KeyUnresolved",
        MultikeyInvalid(_) => "MultikeyInvalid",
        KeyRotationInvalid => "KeyRotationInvalid",
        AlreadyDeactivated => "AlreadyDeactivated",
        ParameterImmutable(_) => "ParameterImmutable",
        MethodUnsupported(_) => "MethodUnsupported",
        UnknownWitness(_) => "UnknownWitness",
        WitnessThresholdNotMet { .. } => "WitnessThresholdNotMet",
        WitnessSignatureInvalid(_) => "WitnessSignatureInvalid",
        PolicyForbidden(_) => "PolicyForbidden",
        AliasExists(_, _) => "AliasExists",
        AliasReserved(_) => "AliasReserved",
        NotFound(_) => "NotFound",
        AuthorMismatch(_) => "AuthorMismatch",
        RepositoryConflict(_) => "RepositoryConflict",
        PayloadTooLarge => "PayloadTooLarge",
        Repository(_) => "Repository",
    }
}

impl IntoResponse for CoreError {
    fn into_response(self) -> Response {
        let status = status_for(&self);
        if status == StatusCode::INTERNAL_SERVER_ERROR {
            tracing::error!(error = %self, "infrastructure error");
        } else {
            tracing::debug!(error = %self, %status, "request rejected");
        }
        let body = Json(json!({
            "error": variant_name(&self),
            "message": self.to_string(),
        }));
        (status, body).into_response()
    }
}
