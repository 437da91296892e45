//! Canonical domain model, fingerprinting, and error taxonomy shared by
//! every crate in the book metadata service.

pub mod error;
pub mod fingerprint;
pub mod model;

pub use error::{BookError, ErrorCatalog, ErrorCategory, ErrorKind};
pub use fingerprint::{fingerprint, CacheKind, FingerprintKind, Param, ParamKind};
pub use model::{
    Author, CacheEntry, CacheSource, Edition, EditionFormat, Gender, ItemOutcome, ItemResult,
    JobState, JobStatus, ProviderName, ReviewStatus, TokenEnvelope, Work,
};
