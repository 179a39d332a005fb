//! A hosting service for `did:webvh` identifiers.
//!
//! The crate's core is the verification-and-admission pipeline that governs
//! every mutation of an identifier's state: the canonicalizer and hasher
//! (C1), the key and signature primitive (C2), the data-integrity proof
//! verifier (C3), the document-state engine (C4), the policy engine (C5),
//! the witness registry and validator (C6), and attested-resource admission
//! (C7). The mutation coordinator (C9) composes all of these into atomic
//! transitions against the identifier repository (C8), the only component
//! that retains durable state between requests.
//!
//! `src/http` is a thin external collaborator: it parses requests, calls
//! into the core through [`coordinator::MutationCoordinator`], and maps
//! typed [`error::CoreError`]s to status codes. It holds no verification
//! logic of its own.

pub mod canon;
pub mod config;
pub mod coordinator;
pub mod document_state;
pub mod error;
pub mod http;
pub mod multikey;
pub mod policy;
pub mod proof;
pub mod repository;
pub mod resource;
pub mod tasks;
pub mod types;
pub mod witness;

pub use coordinator::MutationCoordinator;
pub use error::{CoreError, CoreResult, ErrorClass};
pub use policy::{KnownWitnessRegistry, Policy, PolicyStore};
pub use repository::{InMemoryRepository, Repository, SharedRepository, SqlxRepository};
