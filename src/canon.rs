//! C1: canonicalization and content-addressing primitives.
//!
//! Every hash in this crate is computed the same way: JSON Canonicalization
//! Scheme (RFC 8785) serialization, SHA-256, then a multihash wrapper. The
//! teacher's `verification` module inlined this sequence at each call site;
//! here it is centralized so the state machine, the resource admission path,
//! and the proof verifier all hash things identically.

use base58::{FromBase58, ToBase58};
use multihash::Multihash;
use serde::Serialize;
use sha2::{Digest, Sha256};

use crate::error::{CoreError, CoreResult};

/// Multicodec code for sha2-256, per the multihash table.
const SHA2_256: u64 = 0x12;

/// `did:webvh`'s SCID placeholder, substituted into entry 1 before hashing.
pub const SCID_PLACEHOLDER: &str = "{SCID}";

/// Serializes `value` using JSON Canonicalization Scheme (RFC 8785).
pub fn canonicalize<T: Serialize>(value: &T) -> CoreResult<String> {
    serde_json_canonicalizer::to_string(value)
        .map_err(|e| CoreError::SchemaInvalid(format!("canonicalization failed: {e}")))
}

/// SHA-256 digest of raw bytes.
pub fn sha256(bytes: &[u8]) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hasher.finalize().into()
}

/// Wraps a SHA-256 digest in a multihash and renders it as raw base58 (no
/// multibase prefix byte). This is the encoding `did:webvh` uses for SCIDs
/// and `entryHash`es: stripping multibase's leading `z` is equivalent to
/// never adding it, since base58btc is multibase's own alphabet.
pub fn multihash_b58(bytes: &[u8]) -> CoreResult<String> {
    let digest = sha256(bytes);
    let wrapped = Multihash::<32>::wrap(SHA2_256, &digest)
        .map_err(|e| CoreError::SchemaInvalid(format!("multihash wrap failed: {e}")))?;
    Ok(wrapped.to_bytes().to_base58())
}

/// Canonicalizes `value`, then returns its multihash-base58 digest.
pub fn hash_of<T: Serialize>(value: &T) -> CoreResult<String> {
    let jcs = canonicalize(value)?;
    multihash_b58(jcs.as_bytes())
}

/// Wraps a SHA-256 digest in a multihash and renders it as full multibase
/// (base58btc, `z`-prefixed). Unlike [`multihash_b58`], the prefix is kept:
/// this is the encoding for values that travel in URIs outside a webvh log
/// (resource digests), where the leading `z` is not stripped.
pub fn multihash_multibase_b58(bytes: &[u8]) -> CoreResult<String> {
    let digest = sha256(bytes);
    let wrapped = Multihash::<32>::wrap(SHA2_256, &digest)
        .map_err(|e| CoreError::SchemaInvalid(format!("multihash wrap failed: {e}")))?;
    Ok(multibase_b58_encode(&wrapped.to_bytes()))
}

/// Full multibase (base58btc, `z`-prefixed) encoding, used for multikeys and
/// as the building block [`multihash_multibase_b58`] wraps around a multihash.
pub fn multibase_b58_encode(bytes: &[u8]) -> String {
    multibase::encode(multibase::Base::Base58Btc, bytes)
}

/// Decodes a multibase (base58btc) string, verifying the `z` prefix.
pub fn multibase_b58_decode(s: &str) -> CoreResult<Vec<u8>> {
    let (base, bytes) = multibase::decode(s)
        .map_err(|e| CoreError::MultikeyInvalid(format!("multibase decode failed: {e}")))?;
    if base != multibase::Base::Base58Btc {
        return Err(CoreError::MultikeyInvalid(
            "expected base58btc multibase encoding".into(),
        ));
    }
    Ok(bytes)
}

/// Decodes a raw (unprefixed) base58 string, as used for SCIDs and
/// `entryHash`es.
pub fn base58_decode(s: &str) -> CoreResult<Vec<u8>> {
    s.from_base58()
        .map_err(|_| CoreError::SchemaInvalid(format!("invalid base58: {s}")))
}
