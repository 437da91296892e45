//! Provider failure taxonomy (C5) and retry classification.

/// Failure classification every provider client maps its errors into.
/// Providers never throw into the orchestrator — every call returns a
/// `Result<_, ProviderFailure>`.
#[derive(Debug, Clone, PartialEq)]
pub enum ProviderFailure {
    Timeout,
    RateLimited { retry_after_secs: u64 },
    Unauthenticated,
    BadRequest(String),
    NotFound,
    Transient5xx(u16),
    MalformedPayload(String),
    Network(String),
}

impl ProviderFailure {
    /// Classify an HTTP status code into the taxonomy. Call sites that
    /// already have a reqwest error use [`from_reqwest_error`] instead.
    pub fn from_status(status: u16, retry_after_secs: Option<u64>) -> Self {
        match status {
            401 | 403 => ProviderFailure::Unauthenticated,
            404 => ProviderFailure::NotFound,
            429 => ProviderFailure::RateLimited {
                retry_after_secs: retry_after_secs.unwrap_or(60),
            },
            400..=499 => ProviderFailure::BadRequest(format!("status {status}")),
            500..=599 => ProviderFailure::Transient5xx(status),
            _ => ProviderFailure::Network(format!("unexpected status {status}")),
        }
    }

    pub fn from_reqwest_error(err: &reqwest::Error) -> Self {
        if err.is_timeout() {
            ProviderFailure::Timeout
        } else if let Some(status) = err.status() {
            ProviderFailure::from_status(status.as_u16(), None)
        } else {
            ProviderFailure::Network(err.to_string())
        }
    }

    /// Whether the orchestrator may retry this call (e.g. against the same
    /// provider, distinct from falling back to another provider).
    /// `provider.retry.classifyOnly` means this classification is advisory
    /// only — the client itself never auto-retries.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ProviderFailure::Timeout
                | ProviderFailure::Transient5xx(_)
                | ProviderFailure::Network(_)
                | ProviderFailure::RateLimited { .. }
        )
    }
}
