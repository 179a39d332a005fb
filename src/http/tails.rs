//! Handlers for tails-file storage: opaque revocation-registry blobs, content-addressed by
//! `base58btc(sha256(bytes))`, gated by `enable_tails`.
//!
//! Structural checks (`00 02` prefix, `(len - 2) % 128 == 0`, digest match,
//! size cap) happen before anything touches storage.

use axum::extract::{Multipart, Path, State};
use axum::http::{header, StatusCode};
use axum::response::IntoResponse;

use base58::ToBase58;

use crate::canon::{base58_decode, sha256};
use crate::error::CoreError;
use crate::repository::Repository as _;

use super::AppState;

fn validate_tails_bytes(bytes: &[u8], max_len: u64) -> Result<(), CoreError> {
    if bytes.len() as u64 > max_len {
        return Err(CoreError::PayloadTooLarge);
    }
    if bytes.len() < 2 || bytes[0] != 0x00 || bytes[1] != 0x02 {
        return Err(CoreError::SchemaInvalid(
            "tails file must begin with the 0x00 0x02 header".into(),
        ));
    }
    let remainder = bytes.len() - 2;
    if remainder == 0 || remainder % 128 != 0 {
        return Err(CoreError::SchemaInvalid(
            "tails file length minus header must be a positive multiple of 128".into(),
        ));
    }
    Ok(())
}

/// `PUT /tails/hash/{hash}`: stores a tails file after checking its
/// structure and that `hash` is its own content digest. The upload arrives
/// as `multipart/form-data` (the first part carrying content is taken as the
/// file, matching how the original's `multipart_reader` scans the body
/// without caring about the part's field name).
pub async fn put_tails(
    State(state): State<AppState>,
    Path(hash): Path<String>,
    mut multipart: Multipart,
) -> Result<impl IntoResponse, CoreError> {
    if !state.settings.enable_tails {
        return Err(CoreError::PolicyForbidden("tails-file storage is disabled".into()));
    }

    let field = multipart
        .next_field()
        .await
        .map_err(|e| CoreError::SchemaInvalid(format!("malformed multipart body: {e}")))?
        .ok_or_else(|| CoreError::SchemaInvalid("no file content found".into()))?;
    let bytes = field
        .bytes()
        .await
        .map_err(|e| CoreError::SchemaInvalid(format!("malformed multipart body: {e}")))?
        .to_vec();

    validate_tails_bytes(&bytes, state.settings.max_tails_file_bytes)?;

    base58_decode(&hash).map_err(|_| CoreError::SchemaInvalid(format!("malformed tails hash: {hash}")))?;
    let digest = sha256(&bytes).to_base58();
    if digest != hash {
        return Err(CoreError::DigestMismatch {
            expected: hash,
            computed: digest,
        });
    }

    state.repository.put_tails(&hash, bytes).await?;
    Ok((StatusCode::CREATED, hash))
}

/// `GET /tails/hash/{hash}`: returns the stored bytes verbatim.
pub async fn get_tails(
    State(state): State<AppState>,
    Path(hash): Path<String>,
) -> Result<impl IntoResponse, CoreError> {
    let bytes = state
        .repository
        .get_tails(&hash)
        .await?
        .ok_or_else(|| CoreError::NotFound(format!("tails file {hash}")))?;
    Ok(([(header::CONTENT_TYPE, "application/octet-stream")], bytes))
}
