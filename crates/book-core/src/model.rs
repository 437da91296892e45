//! Canonical domain DTOs shared by every layer of the service.

use std::collections::{BTreeMap, BTreeSet};

use chrono::{DateTime, Utc};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// The four upstream providers the orchestrator knows how to talk to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub enum ProviderName {
    Primary,
    Secondary,
    Cover,
    AiVision,
}

/// Review status of a canonical [`Work`] record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "lowercase")]
pub enum ReviewStatus {
    #[default]
    Unverified,
    Verified,
}

/// Self-reported gender of an [`Author`], defaulting to `Unknown`.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub enum Gender {
    #[default]
    Unknown,
    Male,
    Female,
    NonBinary,
    Other(String),
}

/// Physical or digital binding of an [`Edition`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub enum EditionFormat {
    Hardcover,
    #[default]
    Paperback,
    Ebook,
    Audiobook,
}

const SENTINEL_TITLE: &str = "Unknown";

/// Canonical book-level record, merged from one or more providers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct Work {
    pub title: String,
    pub original_language: Option<String>,
    pub first_publication_year: Option<i32>,
    pub description: Option<String>,
    pub subject_tags: BTreeSet<String>,
    /// Ordered, de-duplicated providers that contributed to this record.
    pub contributors: Vec<ProviderName>,
    pub primary_provider: ProviderName,
    pub provider_ids: BTreeMap<ProviderName, String>,
    pub quality_score: u8,
    pub review_status: ReviewStatus,
}

impl Work {
    /// A new, empty `Work` with the title sentinel applied and everything
    /// else left at its default.
    pub fn new(primary_provider: ProviderName) -> Self {
        Self {
            title: SENTINEL_TITLE.to_string(),
            original_language: None,
            first_publication_year: None,
            description: None,
            subject_tags: BTreeSet::new(),
            contributors: vec![primary_provider],
            primary_provider,
            provider_ids: BTreeMap::new(),
            quality_score: 0,
            review_status: ReviewStatus::default(),
        }
    }

    /// Add `provider` to `contributors` if it is not already present.
    pub fn add_contributor(&mut self, provider: ProviderName) {
        if !self.contributors.contains(&provider) {
            self.contributors.push(provider);
        }
    }

    /// Clamp and assign the quality score, enforcing the `[0, 100]` invariant.
    pub fn set_quality_score(&mut self, score: i32) {
        self.quality_score = score.clamp(0, 100) as u8;
    }
}

/// A specific printing/format of a [`Work`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct Edition {
    pub isbn: Option<String>,
    /// Ordered, de-duplicated, falsy-filtered set of all known ISBNs.
    pub isbns: Vec<String>,
    pub title: String,
    pub edition_title: Option<String>,
    pub publisher: Option<String>,
    pub publication_date: Option<String>,
    pub page_count: Option<i64>,
    pub format: EditionFormat,
    pub language: Option<String>,
    pub cover_image_url: Option<String>,
    pub edition_description: Option<String>,
}

impl Edition {
    /// Build an `Edition`, deriving `isbn`/`isbns` from a raw candidate list.
    ///
    /// Prefers a 13-digit ISBN as the primary identifier, falling back to a
    /// 10-digit one; falsy or duplicate candidates are dropped from `isbns`.
    pub fn with_isbns(title: String, raw_isbns: impl IntoIterator<Item = String>) -> Self {
        let mut isbns: Vec<String> = Vec::new();
        for candidate in raw_isbns {
            let trimmed = candidate.trim();
            if trimmed.is_empty() {
                continue;
            }
            let normalized = trimmed.to_string();
            if !isbns.contains(&normalized) {
                isbns.push(normalized);
            }
        }

        let isbn = isbns
            .iter()
            .find(|s| digits_only(s).len() == 13)
            .or_else(|| isbns.iter().find(|s| digits_only(s).len() == 10))
            .or_else(|| isbns.first())
            .cloned();

        Self {
            isbn,
            isbns,
            title,
            edition_title: None,
            publisher: None,
            publication_date: None,
            page_count: None,
            format: EditionFormat::default(),
            language: None,
            cover_image_url: None,
            edition_description: None,
        }
    }
}

fn digits_only(s: &str) -> String {
    s.chars().filter(|c| c.is_ascii_digit()).collect()
}

/// A contributor to a [`Work`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct Author {
    pub name: String,
    #[serde(default)]
    pub gender: Gender,
}

impl Author {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            gender: Gender::default(),
        }
    }

    /// Case-folded dedupe key, per the Author deduplication invariant.
    pub fn dedupe_key(&self) -> String {
        self.name.to_lowercase()
    }
}

/// Which cache tier served (or would serve) a value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "UPPERCASE")]
pub enum CacheSource {
    Edge,
    Kv,
}

/// A value stored in the cache, content-addressed by a fingerprint key.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct CacheEntry {
    pub value: serde_json::Value,
    pub source: CacheSource,
    pub inserted_at: DateTime<Utc>,
    pub ttl_secs: u64,
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
}

impl CacheEntry {
    pub fn age(&self, now: DateTime<Utc>) -> chrono::Duration {
        now - self.inserted_at
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.age(now).num_seconds() >= self.ttl_secs as i64
    }
}

/// Lifecycle state of a [`JobState`]. Transitions follow
/// `Pending -> Running -> (Partial | Completed | Failed | Cancelled) -> Expired`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Pending,
    Running,
    Partial,
    Completed,
    Failed,
    Cancelled,
    Expired,
}

impl JobStatus {
    /// Whether this status is a terminal outcome (not counting `Expired`,
    /// which is reachable from any terminal state via the cleanup alarm).
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            JobStatus::Partial
                | JobStatus::Completed
                | JobStatus::Failed
                | JobStatus::Cancelled
                | JobStatus::Expired
        )
    }

    /// The statuses reachable directly from this one.
    pub fn valid_transitions(self) -> &'static [JobStatus] {
        use JobStatus::*;
        match self {
            Pending => &[Running, Cancelled],
            Running => &[Partial, Completed, Failed, Cancelled],
            Partial | Completed | Failed | Cancelled => &[Expired],
            Expired => &[],
        }
    }

    pub fn can_transition_to(self, next: JobStatus) -> bool {
        self.valid_transitions().contains(&next)
    }

    /// Resolve the terminal status from item outcome counts, per the
    /// `Partial`/`Completed`/`Failed` failure semantics.
    pub fn from_item_counts(total: usize, failed: usize) -> JobStatus {
        if failed == 0 {
            JobStatus::Completed
        } else if failed == total {
            JobStatus::Failed
        } else {
            JobStatus::Partial
        }
    }
}

/// Outcome of a single batch item once processed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "lowercase")]
pub enum ItemOutcome {
    Pending,
    Success,
    Failure,
}

/// Result record for a single item in a batch job.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ItemResult {
    pub index: usize,
    pub input: serde_json::Value,
    pub outcome: ItemOutcome,
    pub book_id: Option<String>,
    pub error_kind: Option<String>,
}

impl ItemResult {
    pub fn pending(index: usize, input: serde_json::Value) -> Self {
        Self {
            index,
            input,
            outcome: ItemOutcome::Pending,
            book_id: None,
            error_kind: None,
        }
    }
}

/// Capability token pair granting access to a job's progress stream.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct TokenEnvelope {
    pub auth_token: String,
    pub auth_token_expires_at: DateTime<Utc>,
}

impl TokenEnvelope {
    pub fn is_valid(&self, now: DateTime<Utc>) -> bool {
        now < self.auth_token_expires_at
    }

    /// Refresh is permitted only in the final `refresh_window` of the
    /// token's lifetime, and only while it is still valid.
    pub fn refresh_permitted(&self, now: DateTime<Utc>, refresh_window: chrono::Duration) -> bool {
        let remaining = self.auth_token_expires_at - now;
        remaining > chrono::Duration::zero() && remaining <= refresh_window
    }
}

/// Per-job state, mutated only by that job's actor.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct JobState {
    pub job_id: String,
    pub owner_principal: String,
    pub status: JobStatus,
    pub total_items: usize,
    pub completed_items: usize,
    pub failed_items: usize,
    pub per_item_results: Vec<ItemResult>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub version: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub auth_token: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub auth_token_expires_at: Option<DateTime<Utc>>,
    pub refresh_in_progress: bool,
    pub updates_since_last_persist: u32,
    pub last_persisted_at: DateTime<Utc>,
}

impl JobState {
    /// A freshly-launched job: `Running`, version 1, zero progress.
    pub fn launch(
        job_id: String,
        owner_principal: String,
        items: &[serde_json::Value],
        now: DateTime<Utc>,
        token: TokenEnvelope,
    ) -> Self {
        let per_item_results = items
            .iter()
            .enumerate()
            .map(|(i, v)| ItemResult::pending(i, v.clone()))
            .collect();
        Self {
            job_id,
            owner_principal,
            status: JobStatus::Running,
            total_items: items.len(),
            completed_items: 0,
            failed_items: 0,
            per_item_results,
            created_at: now,
            updated_at: now,
            version: 1,
            auth_token: Some(token.auth_token),
            auth_token_expires_at: Some(token.auth_token_expires_at),
            refresh_in_progress: false,
            updates_since_last_persist: 0,
            last_persisted_at: now,
        }
    }

    pub fn token(&self) -> Option<TokenEnvelope> {
        Some(TokenEnvelope {
            auth_token: self.auth_token.clone()?,
            auth_token_expires_at: self.auth_token_expires_at?,
        })
    }
}
