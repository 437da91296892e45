//! Orchestrator (C7): parallel fan-out to the providers declared for a
//! query kind, merge, dedupe, rank, select.

use std::sync::Arc;
use std::time::Duration;

use book_core::{Author, CacheKind, Edition, ProviderName, Work};
use book_normalize::normalize;
use book_providers::{ProviderClient, ProviderFailure, RawRecord};

/// Default overall orchestration budget (provider fan-out deadline).
pub const DEFAULT_BUDGET: Duration = Duration::from_secs(5);

#[derive(Debug, Clone)]
pub struct OrchestratedResult {
    pub works: Vec<Work>,
    pub editions: Vec<Edition>,
    pub authors: Vec<Author>,
    /// `"orchestrated"` when more than one provider contributed, otherwise
    /// that single provider's name.
    pub provider_label: String,
    pub failures: Vec<(ProviderName, ProviderFailure)>,
}

impl OrchestratedResult {
    pub fn is_total_failure(&self) -> bool {
        self.works.is_empty() && !self.failures.is_empty()
    }
}

#[derive(Clone)]
struct Candidate {
    work: Work,
    edition: Edition,
    authors: Vec<Author>,
}

fn dedupe_key(edition: &Edition, authors: &[Author]) -> String {
    match &edition.isbn {
        Some(isbn) => format!("isbn:{isbn}"),
        None => {
            let primary_author = authors.first().map(Author::dedupe_key).unwrap_or_default();
            format!("ta:{}:{}", edition.title.to_lowercase(), primary_author)
        }
    }
}

fn merge_candidates(a: Candidate, b: Candidate) -> Candidate {
    let (winner, loser) = if a.work.quality_score >= b.work.quality_score {
        (a, b)
    } else {
        (b, a)
    };

    let mut edition = winner.edition;
    let loser_edition = loser.edition;
    if edition.edition_title.is_none() {
        edition.edition_title = loser_edition.edition_title;
    }
    if edition.publisher.is_none() {
        edition.publisher = loser_edition.publisher;
    }
    if edition.publication_date.is_none() {
        edition.publication_date = loser_edition.publication_date;
    }
    if edition.cover_image_url.is_none() {
        edition.cover_image_url = loser_edition.cover_image_url;
    }
    if edition.edition_description.is_none() {
        edition.edition_description = loser_edition.edition_description;
    }
    if edition.language.is_none() {
        edition.language = loser_edition.language;
    }
    if edition.page_count.is_none() {
        edition.page_count = loser_edition.page_count;
    }
    for isbn in loser_edition.isbns {
        if !edition.isbns.contains(&isbn) {
            edition.isbns.push(isbn);
        }
    }
    if edition.isbn.is_none() {
        edition.isbn = loser_edition.isbn;
    }

    let mut work = winner.work;
    for contributor in loser.work.contributors {
        work.add_contributor(contributor);
    }
    work.provider_ids.extend(loser.work.provider_ids);
    if work.description.is_none() {
        work.description = loser.work.description;
    }
    if work.original_language.is_none() {
        work.original_language = loser.work.original_language;
    }
    if work.first_publication_year.is_none() {
        work.first_publication_year = loser.work.first_publication_year;
    }
    work.subject_tags.extend(loser.work.subject_tags);

    let mut authors = winner.authors;
    for author in loser.authors {
        if !authors.iter().any(|a| a.dedupe_key() == author.dedupe_key()) {
            authors.push(author);
        }
    }

    Candidate { work, edition, authors }
}

#[derive(Clone, Copy)]
pub struct Orchestrator {
    budget: Duration,
}

impl Default for Orchestrator {
    fn default() -> Self {
        Self::new(DEFAULT_BUDGET)
    }
}

impl Orchestrator {
    pub fn new(budget: Duration) -> Self {
        Self { budget }
    }

    /// Fan out to every provider in parallel, await under the wall-clock
    /// budget (partial results acceptable), normalize, and merge.
    pub async fn search(
        &self,
        providers: Vec<Arc<dyn ProviderClient>>,
        query: &str,
        kind: CacheKind,
        limit: usize,
    ) -> OrchestratedResult {
        let expected = providers.len();
        let (tx, mut rx) = tokio::sync::mpsc::channel(expected.max(1));

        for provider in providers {
            let tx = tx.clone();
            let query = query.to_string();
            tokio::spawn(async move {
                let result = provider.search(&query, kind, limit).await;
                let _ = tx.send((provider.name(), result)).await;
            });
        }
        drop(tx);

        let mut raw: Vec<(ProviderName, Result<Vec<RawRecord>, ProviderFailure>)> = Vec::new();
        let deadline = tokio::time::sleep(self.budget);
        tokio::pin!(deadline);
        loop {
            if raw.len() >= expected {
                break;
            }
            tokio::select! {
                _ = &mut deadline => {
                    tracing::warn!(budget_ms = self.budget.as_millis() as u64, "orchestration deadline exceeded, returning partial results");
                    break;
                }
                item = rx.recv() => {
                    match item {
                        Some(entry) => raw.push(entry),
                        None => break,
                    }
                }
            }
        }

        self.merge(raw)
    }

    fn merge(&self, raw: Vec<(ProviderName, Result<Vec<RawRecord>, ProviderFailure>)>) -> OrchestratedResult {
        let mut failures = Vec::new();
        let mut candidates: Vec<Candidate> = Vec::new();
        let mut keys: Vec<String> = Vec::new();
        let mut contributing_providers: Vec<ProviderName> = Vec::new();

        for (provider, result) in raw {
            match result {
                Ok(records) => {
                    if !contributing_providers.contains(&provider) {
                        contributing_providers.push(provider);
                    }
                    for record in records {
                        let (work, edition, authors) = normalize(&record);
                        let key = dedupe_key(&edition, &authors);
                        let candidate = Candidate { work, edition, authors };
                        if let Some(pos) = keys.iter().position(|k| k == &key) {
                            candidates[pos] = merge_candidates(candidates[pos].clone(), candidate);
                        } else {
                            keys.push(key);
                            candidates.push(candidate);
                        }
                    }
                }
                Err(failure) => failures.push((provider, failure)),
            }
        }

        let provider_label = match contributing_providers.as_slice() {
            [] => "none".to_string(),
            [single] => format!("{single:?}"),
            _ => "orchestrated".to_string(),
        };

        let mut works = Vec::with_capacity(candidates.len());
        let mut editions = Vec::with_capacity(candidates.len());
        let mut authors: Vec<Author> = Vec::new();
        for candidate in candidates {
            works.push(candidate.work);
            editions.push(candidate.edition);
            for author in candidate.authors {
                if !authors.iter().any(|a| a.dedupe_key() == author.dedupe_key()) {
                    authors.push(author);
                }
            }
        }

        OrchestratedResult {
            works,
            editions,
            authors,
            provider_label,
            failures,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use book_providers::MockProviderClient;

    fn provider(name: ProviderName, result: Result<Vec<RawRecord>, ProviderFailure>) -> Arc<dyn ProviderClient> {
        Arc::new(MockProviderClient {
            name,
            search_result: result,
            lookup_result: Err(ProviderFailure::NotFound),
        })
    }

    fn record(provider: ProviderName, payload: serde_json::Value) -> RawRecord {
        RawRecord { provider, payload }
    }

    #[tokio::test]
    async fn dedupes_editions_with_same_isbn() {
        let providers = vec![provider(
            ProviderName::Primary,
            Ok(vec![
                record(ProviderName::Primary, serde_json::json!({"title": "A", "isbn": "9783333333333"})),
                record(ProviderName::Primary, serde_json::json!({"title": "A", "isbn": "9783333333333"})),
            ]),
        )];
        let orchestrator = Orchestrator::new(Duration::from_secs(1));
        let result = orchestrator
            .search(providers, "anything", CacheKind::IsbnSearch, 10)
            .await;
        assert_eq!(result.editions.len(), 1);
    }

    #[tokio::test]
    async fn falls_back_to_secondary_on_primary_failure() {
        let providers = vec![
            provider(ProviderName::Primary, Err(ProviderFailure::Transient5xx(500))),
            provider(
                ProviderName::Secondary,
                Ok(vec![record(
                    ProviderName::Secondary,
                    serde_json::json!({"title": "The Google story"}),
                )]),
            ),
        ];
        let orchestrator = Orchestrator::new(Duration::from_secs(1));
        let result = orchestrator
            .search(providers, "google", CacheKind::TitleAuthorSearch, 10)
            .await;
        assert_eq!(result.works.len(), 1);
        assert_eq!(result.works[0].title, "The Google story");
        assert_eq!(result.provider_label, "Secondary");
        assert_eq!(result.failures.len(), 1);
    }

    #[tokio::test]
    async fn all_providers_failing_returns_empty_list_and_aggregated_failure() {
        let providers = vec![
            provider(ProviderName::Primary, Err(ProviderFailure::Timeout)),
            provider(ProviderName::Secondary, Err(ProviderFailure::NotFound)),
        ];
        let orchestrator = Orchestrator::new(Duration::from_secs(1));
        let result = orchestrator
            .search(providers, "x", CacheKind::TitleAuthorSearch, 10)
            .await;
        assert!(result.works.is_empty());
        assert!(result.is_total_failure());
        assert_eq!(result.failures.len(), 2);
    }

    #[tokio::test]
    async fn merges_missing_fields_from_lower_quality_provider() {
        let providers = vec![
            provider(
                ProviderName::Primary,
                Ok(vec![record(
                    ProviderName::Primary,
                    serde_json::json!({"title": "X", "isbn": "111", "coverImageURL": "https://x/y.jpg"}),
                )]),
            ),
            provider(
                ProviderName::Secondary,
                Ok(vec![record(
                    ProviderName::Secondary,
                    serde_json::json!({"title": "X", "isbn": "111", "publisher": "Acme"}),
                )]),
            ),
        ];
        let orchestrator = Orchestrator::new(Duration::from_secs(1));
        let result = orchestrator
            .search(providers, "x", CacheKind::IsbnSearch, 10)
            .await;
        assert_eq!(result.editions.len(), 1);
        assert_eq!(result.editions[0].publisher.as_deref(), Some("Acme"));
        assert!(result.editions[0].cover_image_url.is_some());
        assert_eq!(result.provider_label, "orchestrated");
    }
}
