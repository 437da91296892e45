//! Credential resolution: a provider's API key is either a direct value or
//! an indirection through a named secret store.

/// Where a provider's credential comes from.
#[derive(Debug, Clone)]
pub enum SecretSource {
    Direct(String),
    Indirect { store: String, key: String },
}

/// Resolves named secrets from a store. `book-daemon` wires an
/// environment-backed resolver; tests substitute an in-memory one.
pub trait SecretResolver: Send + Sync {
    fn resolve(&self, store: &str, key: &str) -> Option<String>;
}

/// Resolves `{store}_{key}` (uppercased) as an environment variable.
pub struct EnvSecretResolver;

impl SecretResolver for EnvSecretResolver {
    fn resolve(&self, store: &str, key: &str) -> Option<String> {
        let var = format!("{store}_{key}").to_uppercase();
        std::env::var(var).ok()
    }
}

impl SecretSource {
    pub fn resolve(&self, resolver: &dyn SecretResolver) -> Option<String> {
        match self {
            SecretSource::Direct(value) => Some(value.clone()),
            SecretSource::Indirect { store, key } => resolver.resolve(store, key),
        }
    }
}
