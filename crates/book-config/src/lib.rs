//! Configuration loading: an optional TOML file layered with `BOOK_*`
//! environment overrides, producing the settings enumerated in the
//! external-interface configuration table.

use std::collections::BTreeMap;
use std::fmt;
use std::path::Path;
use std::time::Duration;

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub const MAX_CSV_IMPORT_BYTES: u64 = 10 * 1024 * 1024;
const VALID_LOG_LEVELS: &[&str] = &["trace", "debug", "info", "warn", "error"];

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("config file not found: {0}")]
    FileNotFound(String),
    #[error("failed to parse config: {0}")]
    ParseError(#[from] toml::de::Error),
    #[error("invalid config: {0}")]
    ValidationError(String),
}

/// A non-fatal issue noticed while loading configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfigWarning {
    DeprecatedField(String),
    MissingOptionalField(String),
    LargeTimeout(String),
}

impl fmt::Display for ConfigWarning {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConfigWarning::DeprecatedField(f0) => write!(f, "deprecated field: {f0}"),
            ConfigWarning::MissingOptionalField(f0) => write!(f, "missing optional field: {f0}"),
            ConfigWarning::LargeTimeout(f0) => write!(f, "unusually large timeout: {f0}"),
        }
    }
}

/// TTL policy by cache kind, per the configuration table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct CacheTtlTable {
    pub isbn_enrich_days: u64,
    pub isbn_search_days: u64,
    pub title_author_search_hours: u64,
    pub cover_days: u64,
    pub ai_parse_hours: u64,
}

impl Default for CacheTtlTable {
    fn default() -> Self {
        Self {
            isbn_enrich_days: 365,
            isbn_search_days: 7,
            title_author_search_hours: 6,
            cover_days: 30,
            ai_parse_hours: 24,
        }
    }
}

impl CacheTtlTable {
    pub fn ttl_for(&self, kind: book_core::CacheKind) -> Duration {
        use book_core::CacheKind::*;
        match kind {
            IsbnEnrich => Duration::from_secs(self.isbn_enrich_days * 86_400),
            IsbnSearch => Duration::from_secs(self.isbn_search_days * 86_400),
            TitleAuthorSearch => Duration::from_secs(self.title_author_search_hours * 3_600),
            Cover => Duration::from_secs(self.cover_days * 86_400),
            AiParse => Duration::from_secs(self.ai_parse_hours * 3_600),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ProviderConfig {
    pub timeout_secs: u64,
    pub retry_classify_only: bool,
}

impl Default for ProviderConfig {
    fn default() -> Self {
        Self {
            timeout_secs: 5,
            retry_classify_only: true,
        }
    }
}

impl ProviderConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct RateLimitConfig {
    pub default_per_minute: u32,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            default_per_minute: 100,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct BatchConfig {
    pub token_lifetime_secs: u64,
    pub refresh_window_secs: u64,
    pub cleanup_secs: u64,
    pub persist_update_count: u32,
    pub persist_time_ms: u64,
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            token_lifetime_secs: 2 * 3_600,
            refresh_window_secs: 30 * 60,
            cleanup_secs: 24 * 3_600,
            persist_update_count: 10,
            persist_time_ms: 5_000,
        }
    }
}

impl BatchConfig {
    pub fn token_lifetime(&self) -> Duration {
        Duration::from_secs(self.token_lifetime_secs)
    }
    pub fn refresh_window(&self) -> Duration {
        Duration::from_secs(self.refresh_window_secs)
    }
    pub fn cleanup(&self) -> Duration {
        Duration::from_secs(self.cleanup_secs)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct FeatureFlags {
    pub unified_envelope: bool,
}

impl Default for FeatureFlags {
    fn default() -> Self {
        Self {
            unified_envelope: true,
        }
    }
}

/// Aggregate configuration for the service.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase", default)]
pub struct BookConfig {
    pub log_level: String,
    pub bind_addr: String,
    pub cache: CacheTtlTable,
    pub provider: ProviderConfig,
    pub rate_limit: RateLimitConfig,
    pub batch: BatchConfig,
    pub feature: FeatureFlags,
}

impl Default for BookConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            bind_addr: "127.0.0.1:8080".to_string(),
            cache: CacheTtlTable::default(),
            provider: ProviderConfig::default(),
            rate_limit: RateLimitConfig::default(),
            batch: BatchConfig::default(),
            feature: FeatureFlags::default(),
        }
    }
}

/// Parse a `BookConfig` from TOML source, collecting non-fatal warnings.
pub fn parse_toml(source: &str) -> Result<(BookConfig, Vec<ConfigWarning>), ConfigError> {
    let config: BookConfig = toml::from_str(source)?;
    let warnings = validate(&config);
    Ok((config, warnings))
}

fn validate(config: &BookConfig) -> Vec<ConfigWarning> {
    let mut warnings = Vec::new();
    if !VALID_LOG_LEVELS.contains(&config.log_level.as_str()) {
        warnings.push(ConfigWarning::DeprecatedField(format!(
            "log_level={} is not one of {VALID_LOG_LEVELS:?}, defaulting behavior to info",
            config.log_level
        )));
    }
    if config.batch.cleanup_secs > 7 * 24 * 3_600 {
        warnings.push(ConfigWarning::LargeTimeout(format!(
            "batch.cleanup_secs={} exceeds 7 days",
            config.batch.cleanup_secs
        )));
    }
    warnings
}

/// Load configuration from an optional TOML file, then apply `BOOK_*`
/// environment variable overrides on top. A missing `path` is not an
/// error — the defaults apply.
pub fn load_config(
    path: Option<&Path>,
    env: &BTreeMap<String, String>,
) -> Result<(BookConfig, Vec<ConfigWarning>), ConfigError> {
    let (mut config, mut warnings) = match path {
        Some(p) => {
            let source = std::fs::read_to_string(p)
                .map_err(|_| ConfigError::FileNotFound(p.display().to_string()))?;
            parse_toml(&source)?
        }
        None => (BookConfig::default(), Vec::new()),
    };

    apply_env_overrides(&mut config, env);
    warnings.extend(validate(&config));
    Ok((config, warnings))
}

/// Apply `BOOK_*` environment variable overrides onto an existing config.
pub fn apply_env_overrides(config: &mut BookConfig, env: &BTreeMap<String, String>) {
    if let Some(v) = env.get("BOOK_LOG_LEVEL") {
        config.log_level = v.clone();
    }
    if let Some(v) = env.get("BOOK_BIND_ADDR") {
        config.bind_addr = v.clone();
    }
    if let Some(v) = env.get("BOOK_PROVIDER_TIMEOUT_SECS").and_then(|v| v.parse().ok()) {
        config.provider.timeout_secs = v;
    }
    if let Some(v) = env
        .get("BOOK_RATE_LIMIT_DEFAULT_PER_MINUTE")
        .and_then(|v| v.parse().ok())
    {
        config.rate_limit.default_per_minute = v;
    }
    if let Some(v) = env.get("BOOK_BATCH_CLEANUP_SECS").and_then(|v| v.parse().ok()) {
        config.batch.cleanup_secs = v;
    }
    if let Some(v) = env
        .get("BOOK_FEATURE_UNIFIED_ENVELOPE")
        .and_then(|v| v.parse().ok())
    {
        config.feature.unified_envelope = v;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_configuration_table() {
        let c = BookConfig::default();
        assert_eq!(c.cache.isbn_enrich_days, 365);
        assert_eq!(c.cache.isbn_search_days, 7);
        assert_eq!(c.cache.title_author_search_hours, 6);
        assert_eq!(c.cache.cover_days, 30);
        assert_eq!(c.cache.ai_parse_hours, 24);
        assert_eq!(c.provider.timeout(), Duration::from_secs(5));
        assert_eq!(c.rate_limit.default_per_minute, 100);
        assert_eq!(c.batch.token_lifetime(), Duration::from_secs(2 * 3600));
        assert_eq!(c.batch.refresh_window(), Duration::from_secs(30 * 60));
        assert_eq!(c.batch.cleanup(), Duration::from_secs(24 * 3600));
        assert_eq!(c.batch.persist_update_count, 10);
        assert_eq!(c.batch.persist_time_ms, 5000);
    }

    #[test]
    fn env_overrides_apply_on_top_of_file() {
        let mut env = BTreeMap::new();
        env.insert("BOOK_PROVIDER_TIMEOUT_SECS".to_string(), "9".to_string());
        let mut config = BookConfig::default();
        apply_env_overrides(&mut config, &env);
        assert_eq!(config.provider.timeout_secs, 9);
    }

    #[test]
    fn unparseable_toml_is_an_error() {
        let result = parse_toml("not valid = = toml");
        assert!(result.is_err());
    }

    #[test]
    fn bad_log_level_warns_but_does_not_fail() {
        let (_, warnings) = parse_toml("log_level = \"verbose\"\n").unwrap();
        assert!(!warnings.is_empty());
    }
}
