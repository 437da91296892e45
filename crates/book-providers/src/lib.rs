//! Provider Clients (C5): wrappers for the primary/secondary/cover/AI
//! vision providers with timeouts, auth, and retry classification.

pub mod client;
pub mod failure;
pub mod secret;

pub use client::{HttpProviderClient, MockProviderClient, ProviderClient, RawRecord, DEFAULT_TIMEOUT};
pub use failure::ProviderFailure;
pub use secret::{EnvSecretResolver, SecretResolver, SecretSource};
