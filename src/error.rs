//! Error taxonomy for the webvh hosting core.
//!
//! Every component raises one of these variants directly; nothing is wrapped
//! in a generic "internal error". The HTTP boundary (`src/http`) maps each
//! variant to a status code; nothing else in the core does status-code
//! reasoning.

use thiserror::Error;

/// Errors raised while validating or admitting a mutation to an identifier's
/// history, a witness proof, or an attested resource.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CoreError {
    // --- Validation ---
    /// A document failed to parse into the expected schema.
    #[error("schema invalid: {0}")]
    SchemaInvalid(String),

    /// A computed hash did not match the hash embedded in the input.
    #[error("hash mismatch: {0}")]
    HashMismatch(String),

    /// A `versionId` did not match the expected `<n>-<entryHash>` form or
    /// value.
    #[error("versionId mismatch: {0}")]
    VersionIdMismatch(String),

    /// `versionTime` regressed relative to the previous entry.
    #[error("versionTime is not monotonically non-decreasing")]
    TimestampNonMonotonic,

    /// `versionTime` is further in the future than the allowed clock skew.
    #[error("versionTime is too far in the future")]
    TimestampInFuture,

    /// A resource's `digest` did not equal the multihash of its canonicalized
    /// content.
    #[error("digest mismatch: expected {expected}, computed {computed}")]
    DigestMismatch { expected: String, computed: String },

    // --- Crypto ---
    /// A `DataIntegrityProof` had the wrong type, cryptosuite, or purpose.
    #[error("proof invalid: {0}")]
    ProofInvalid(String),

    /// A proof's `expires` timestamp is in the past.
    #[error("proof expired")]
    ProofExpired,

    /// A signature did not verify against the resolved public key.
    #[error("signature invalid")]
    SignatureInvalid,

    /// The verification method referenced by a proof could not be resolved.
    #[error("verification method could not be resolved: {0}")]
    KeyUnresolved(String),

    /// A multikey string was malformed (wrong prefix, wrong length, or wrong
    /// multicodec tag).
    #[error("multikey invalid: {0}")]
    MultikeyInvalid(String),

    // --- State machine ---
    /// A new `updateKeys` entry's hash was not present in the prior state's
    /// `nextKeyHashes` commitment.
    #[error("key rotation invalid: new update key not committed by prior nextKeyHashes")]
    KeyRotationInvalid,

    /// A mutation was submitted against an identifier whose log already ends
    /// in a `deactivated: true` entry.
    #[error("identifier is already deactivated")]
    AlreadyDeactivated,

    /// `method` or `scid` changed after entry 1.
    #[error("parameter is immutable after entry 1: {0}")]
    ParameterImmutable(&'static str),

    /// `parameters.method` named an unsupported webvh method version.
    #[error("method version unsupported: {0}")]
    MethodUnsupported(String),

    // --- Policy ---
    /// A witness identified in the DID's parameters is not present in the
    /// known-witness registry.
    #[error("unknown witness: {0}")]
    UnknownWitness(String),

    /// The sum of surviving witness-proof weights did not reach the
    /// configured threshold.
    #[error("witness threshold not met: needed {needed}, got {got}")]
    WitnessThresholdNotMet { needed: u32, got: u32 },

    /// A witness signature's proof(s) failed to verify.
    #[error("witness signature invalid: {0}")]
    WitnessSignatureInvalid(String),

    /// A mutation violated an active policy rule (e.g. portability when
    /// forbidden, prerotation when forbidden).
    #[error("forbidden by policy: {0}")]
    PolicyForbidden(String),

    // --- Admission ---
    /// A `(namespace, alias)` pair is already registered.
    #[error("alias already exists: {0}/{1}")]
    AliasExists(String, String),

    /// A `(namespace, alias)` pair names a namespace reserved for internal
    /// routes.
    #[error("namespace is reserved: {0}")]
    AliasReserved(String),

    /// The requested identifier, resource, or presentation does not exist.
    #[error("not found: {0}")]
    NotFound(String),

    /// A proof's author did not match the expected controller or resource
    /// author.
    #[error("author mismatch: {0}")]
    AuthorMismatch(String),

    // --- Infrastructure ---
    /// The repository detected a conflicting concurrent write.
    #[error("repository conflict: {0}")]
    RepositoryConflict(String),

    /// An uploaded payload exceeded the configured size limit.
    #[error("payload too large")]
    PayloadTooLarge,

    /// The repository's underlying store failed.
    #[error("repository error: {0}")]
    Repository(String),
}

impl CoreError {
    /// Coarse class used by the HTTP boundary and by tests that only care
    /// about the taxonomy bucket, not the exact variant.
    pub fn class(&self) -> ErrorClass {
        use CoreError::*;
        match self {
            SchemaInvalid(_)
            | HashMismatch(_)
            | VersionIdMismatch(_)
            | TimestampNonMonotonic
            | TimestampInFuture
            | DigestMismatch { .. } => ErrorClass::Validation,

            ProofInvalid(_) | ProofExpired | SignatureInvalid | KeyUnresolved(_)
            | MultikeyInvalid(_) => ErrorClass::Crypto,

            KeyRotationInvalid | AlreadyDeactivated | ParameterImmutable(_)
            | MethodUnsupported(_) => ErrorClass::StateMachine,

            UnknownWitness(_) | WitnessThresholdNotMet { .. } | WitnessSignatureInvalid(_)
            | PolicyForbidden(_) => ErrorClass::Policy,

            AliasExists(_, _) | AliasReserved(_) | NotFound(_) | AuthorMismatch(_) => {
                ErrorClass::Admission
            }

            RepositoryConflict(_) | PayloadTooLarge | Repository(_) => ErrorClass::Infrastructure,
        }
    }
}

/// Coarse error bucket used only for classification (e.g. HTTP status
/// mapping); never constructed independently of a `CoreError`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    Validation,
    Crypto,
    StateMachine,
    Policy,
    Admission,
    Infrastructure,
}

pub type CoreResult<T> = Result<T, CoreError>;