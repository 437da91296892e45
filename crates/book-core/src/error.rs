//! Stable error taxonomy and HTTP status mapping.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Error category, prefixing every stable code.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum ErrorCategory {
    /// Caller input rejected before any provider/storage work happened.
    Validation,
    /// Authentication/authorization/token lifecycle failures.
    Auth,
    /// Conflicts with current resource state.
    Conflict,
    /// Upstream provider failures.
    Provider,
    /// Storage, rate-limit, or other internal-system failures.
    System,
}

impl ErrorCategory {
    fn prefix(self) -> &'static str {
        match self {
            ErrorCategory::Validation => "BOOK-V",
            ErrorCategory::Auth => "BOOK-A",
            ErrorCategory::Conflict => "BOOK-C",
            ErrorCategory::Provider => "BOOK-P",
            ErrorCategory::System => "BOOK-S",
        }
    }
}

/// One entry in the stable error taxonomy from the external-interface
/// contract: a `kind`, its HTTP status, and a machine-stable code.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ErrorKind {
    #[error("validation error")]
    ValidationError,
    #[error("unauthenticated")]
    Unauthenticated,
    #[error("invalid token")]
    InvalidToken,
    #[error("expired token")]
    ExpiredToken,
    #[error("forbidden")]
    Forbidden,
    #[error("not found")]
    NotFound,
    #[error("conflict")]
    Conflict,
    #[error("refresh conflict")]
    RefreshConflict,
    #[error("payload too large")]
    PayloadTooLarge,
    #[error("unsupported media type")]
    UnsupportedMediaType,
    #[error("rate limited")]
    RateLimited,
    #[error("upgrade required")]
    UpgradeRequired,
    #[error("provider timeout")]
    ProviderTimeout,
    #[error("deadline exceeded")]
    DeadlineExceeded,
    #[error("provider returned malformed payload")]
    ProviderMalformed,
    #[error("provider rejected credentials")]
    ProviderUnauthorized,
    #[error("provider transient failure")]
    ProviderTransient,
    #[error("storage unavailable")]
    StorageUnavailable,
    #[error("cancelled")]
    Cancelled,
}

impl ErrorKind {
    pub const ALL: &'static [ErrorKind] = &[
        ErrorKind::ValidationError,
        ErrorKind::Unauthenticated,
        ErrorKind::InvalidToken,
        ErrorKind::ExpiredToken,
        ErrorKind::Forbidden,
        ErrorKind::NotFound,
        ErrorKind::Conflict,
        ErrorKind::RefreshConflict,
        ErrorKind::PayloadTooLarge,
        ErrorKind::UnsupportedMediaType,
        ErrorKind::RateLimited,
        ErrorKind::UpgradeRequired,
        ErrorKind::ProviderTimeout,
        ErrorKind::DeadlineExceeded,
        ErrorKind::ProviderMalformed,
        ErrorKind::ProviderUnauthorized,
        ErrorKind::ProviderTransient,
        ErrorKind::StorageUnavailable,
        ErrorKind::Cancelled,
    ];

    pub fn category(self) -> ErrorCategory {
        use ErrorKind::*;
        match self {
            ValidationError | PayloadTooLarge | UnsupportedMediaType => ErrorCategory::Validation,
            Unauthenticated | InvalidToken | ExpiredToken | Forbidden | UpgradeRequired => {
                ErrorCategory::Auth
            }
            Conflict | RefreshConflict => ErrorCategory::Conflict,
            ProviderTimeout | DeadlineExceeded | ProviderMalformed | ProviderUnauthorized
            | ProviderTransient => ErrorCategory::Provider,
            NotFound | RateLimited | StorageUnavailable | Cancelled => ErrorCategory::System,
        }
    }

    /// Stable machine-readable code, e.g. `BOOK-V001`.
    pub fn code(self) -> String {
        let ordinal = Self::ALL.iter().position(|k| *k == self).unwrap_or(0) + 1;
        format!("{}{:03}", self.category().prefix(), ordinal)
    }

    /// The HTTP status this kind maps to per the error handling design.
    /// `Cancelled` has no HTTP mapping (terminal stream message only) and
    /// returns `None`.
    pub fn http_status(self) -> Option<u16> {
        use ErrorKind::*;
        Some(match self {
            ValidationError => 400,
            Unauthenticated | InvalidToken | ExpiredToken => 401,
            Forbidden => 403,
            NotFound => 404,
            Conflict | RefreshConflict => 409,
            PayloadTooLarge => 413,
            UnsupportedMediaType => 415,
            RateLimited => 429,
            UpgradeRequired => 426,
            ProviderTimeout | DeadlineExceeded => 504,
            ProviderMalformed | ProviderUnauthorized | ProviderTransient | StorageUnavailable => {
                500
            }
            Cancelled => return None,
        })
    }
}

/// A realized error: kind, human message, and optional structured context
/// (e.g. `retry_after_secs` for `RateLimited`).
#[derive(Debug, Clone, Error, Serialize, Deserialize)]
#[error("{kind}: {message}")]
pub struct BookError {
    pub kind: ErrorKind,
    pub message: String,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub context: BTreeMap<String, String>,
}

impl BookError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            context: BTreeMap::new(),
        }
    }

    pub fn with_context(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.context.insert(key.into(), value.into());
        self
    }

    pub fn code(&self) -> String {
        self.kind.code()
    }

    pub fn http_status(&self) -> Option<u16> {
        self.kind.http_status()
    }

    pub fn rate_limited(retry_after_secs: u64) -> Self {
        Self::new(ErrorKind::RateLimited, "rate limit exceeded")
            .with_context("retryAfterSecs", retry_after_secs.to_string())
    }
}

/// Lookup table over the full taxonomy, mirroring the teacher's
/// `ErrorCatalog` pattern.
pub struct ErrorCatalog;

impl ErrorCatalog {
    pub fn lookup(code: &str) -> Option<ErrorKind> {
        ErrorKind::ALL.iter().copied().find(|k| k.code() == code)
    }

    pub fn all() -> &'static [ErrorKind] {
        ErrorKind::ALL
    }

    pub fn by_category(category: ErrorCategory) -> Vec<ErrorKind> {
        ErrorKind::ALL
            .iter()
            .copied()
            .filter(|k| k.category() == category)
            .collect()
    }
}
