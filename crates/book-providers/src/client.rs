//! `ProviderClient` trait plus an HTTP-backed implementation and an
//! in-memory mock used by tests and the orchestrator's own test suite.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use book_core::{CacheKind, ProviderName};

use crate::failure::ProviderFailure;
use crate::secret::{SecretResolver, SecretSource};

/// A provider's raw, not-yet-normalized payload for one candidate record.
#[derive(Debug, Clone)]
pub struct RawRecord {
    pub provider: ProviderName,
    pub payload: serde_json::Value,
}

/// Default hard per-request timeout, per the provider configuration table.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(5);

#[async_trait]
pub trait ProviderClient: Send + Sync {
    fn name(&self) -> ProviderName;
    async fn search(
        &self,
        query: &str,
        kind: CacheKind,
        limit: usize,
    ) -> Result<Vec<RawRecord>, ProviderFailure>;
    async fn lookup_by_id(&self, id: &str) -> Result<RawRecord, ProviderFailure>;
}

/// HTTP-backed provider client. Applies the hard per-request timeout and
/// classifies every failure into [`ProviderFailure`] — it never panics or
/// propagates a raw `reqwest::Error`.
pub struct HttpProviderClient {
    name: ProviderName,
    base_url: String,
    http: reqwest::Client,
    timeout: Duration,
    secret: SecretSource,
    resolver: Arc<dyn SecretResolver>,
}

impl HttpProviderClient {
    pub fn new(
        name: ProviderName,
        base_url: impl Into<String>,
        timeout: Duration,
        secret: SecretSource,
        resolver: Arc<dyn SecretResolver>,
    ) -> Self {
        Self {
            name,
            base_url: base_url.into(),
            http: reqwest::Client::new(),
            timeout,
            secret,
            resolver,
        }
    }

    fn auth_header(&self) -> Result<String, ProviderFailure> {
        self.secret
            .resolve(self.resolver.as_ref())
            .map(|token| format!("Bearer {token}"))
            .ok_or(ProviderFailure::Unauthenticated)
    }

    async fn get_json(&self, path: &str, query: &[(&str, &str)]) -> Result<serde_json::Value, ProviderFailure> {
        let auth = self.auth_header()?;
        let url = format!("{}{}", self.base_url, path);
        let request = self.http.get(&url).query(query).header("authorization", auth);

        let response = tokio::time::timeout(self.timeout, request.send())
            .await
            .map_err(|_| ProviderFailure::Timeout)?
            .map_err(|e| ProviderFailure::from_reqwest_error(&e))?;

        if !response.status().is_success() {
            let retry_after = response
                .headers()
                .get("retry-after")
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.parse().ok());
            return Err(ProviderFailure::from_status(response.status().as_u16(), retry_after));
        }

        response
            .json::<serde_json::Value>()
            .await
            .map_err(|e| ProviderFailure::MalformedPayload(e.to_string()))
    }
}

#[async_trait]
impl ProviderClient for HttpProviderClient {
    fn name(&self) -> ProviderName {
        self.name
    }

    async fn search(
        &self,
        query: &str,
        kind: CacheKind,
        limit: usize,
    ) -> Result<Vec<RawRecord>, ProviderFailure> {
        let limit_str = limit.to_string();
        let kind_str = format!("{kind:?}");
        let body = self
            .get_json("/search", &[("q", query), ("kind", &kind_str), ("limit", &limit_str)])
            .await?;
        let items = body
            .get("items")
            .and_then(|v| v.as_array())
            .cloned()
            .ok_or_else(|| ProviderFailure::MalformedPayload("missing items array".to_string()))?;
        Ok(items
            .into_iter()
            .map(|payload| RawRecord {
                provider: self.name,
                payload,
            })
            .collect())
    }

    async fn lookup_by_id(&self, id: &str) -> Result<RawRecord, ProviderFailure> {
        let payload = self.get_json(&format!("/id/{id}"), &[]).await?;
        Ok(RawRecord {
            provider: self.name,
            payload,
        })
    }
}

/// Canned in-memory provider client used by orchestrator tests.
pub struct MockProviderClient {
    pub name: ProviderName,
    pub search_result: Result<Vec<RawRecord>, ProviderFailure>,
    pub lookup_result: Result<RawRecord, ProviderFailure>,
}

#[async_trait]
impl ProviderClient for MockProviderClient {
    fn name(&self) -> ProviderName {
        self.name
    }

    async fn search(
        &self,
        _query: &str,
        _kind: CacheKind,
        _limit: usize,
    ) -> Result<Vec<RawRecord>, ProviderFailure> {
        self.search_result.clone()
    }

    async fn lookup_by_id(&self, _id: &str) -> Result<RawRecord, ProviderFailure> {
        self.lookup_result.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn mock_client_returns_canned_results() {
        let client = MockProviderClient {
            name: ProviderName::Primary,
            search_result: Ok(vec![RawRecord {
                provider: ProviderName::Primary,
                payload: serde_json::json!({"title": "X"}),
            }]),
            lookup_result: Err(ProviderFailure::NotFound),
        };
        let results = client.search("hobbit", CacheKind::TitleAuthorSearch, 10).await.unwrap();
        assert_eq!(results.len(), 1);
        assert!(client.lookup_by_id("x").await.is_err());
    }
}
