//! Normalizers (C6): pure functions mapping a provider's raw payload into
//! the canonical `Work`/`Edition`/`Author` DTOs, plus quality scoring.
//!
//! Every function here is referentially transparent: equal inputs always
//! produce equal outputs, and nothing here performs I/O.

use book_core::{Author, Edition, EditionFormat, Work};
use book_providers::RawRecord;
use serde_json::Value;

const SENTINEL_TITLE: &str = "Unknown";

/// Normalize one provider record into its canonical pieces.
pub fn normalize(record: &RawRecord) -> (Work, Edition, Vec<Author>) {
    let payload = &record.payload;

    let title = string_field(payload, "title").unwrap_or_else(|| SENTINEL_TITLE.to_string());

    let mut work = Work::new(record.provider);
    work.title = title.clone();
    work.original_language = string_field(payload, "originalLanguage");
    work.first_publication_year = payload
        .get("firstPublicationYear")
        .and_then(|v| v.as_i64())
        .map(|v| v as i32)
        .or_else(|| string_field(payload, "publicationDate").as_deref().and_then(extract_year));
    work.description = string_field(payload, "description");
    work.subject_tags = array_of_strings(payload, "subjects").into_iter().collect();
    if let Some(id) = string_field(payload, "id") {
        work.provider_ids.insert(record.provider, id);
    }

    let mut raw_isbns = array_of_strings(payload, "isbns");
    if raw_isbns.is_empty() {
        if let Some(isbn) = string_field(payload, "isbn") {
            raw_isbns.push(isbn);
        }
    }
    let mut edition = Edition::with_isbns(title.clone(), raw_isbns);
    edition.edition_title = string_field(payload, "editionTitle").filter(|t| t != &title);
    edition.publisher = string_field(payload, "publisher");
    edition.publication_date = string_field(payload, "publicationDate");
    edition.page_count = payload.get("pageCount").and_then(|v| v.as_i64());
    edition.format = string_field(payload, "binding")
        .map(|b| map_binding_to_format(&b))
        .unwrap_or_default();
    edition.language = string_field(payload, "language");
    edition.cover_image_url = string_field(payload, "coverImageURL");
    edition.edition_description = string_field(payload, "editionDescription");

    let authors = normalize_authors(payload);

    let score = compute_quality_score(&edition, &work, &authors);
    work.set_quality_score(score);

    (work, edition, authors)
}

fn normalize_authors(payload: &Value) -> Vec<Author> {
    payload
        .get("authors")
        .and_then(|v| v.as_array())
        .map(|arr| {
            arr.iter()
                .filter_map(|a| {
                    let name = a
                        .as_str()
                        .map(|s| s.to_string())
                        .or_else(|| a.get("name").and_then(|n| n.as_str()).map(|s| s.to_string()))?;
                    let trimmed = name.trim();
                    if trimmed.is_empty() {
                        None
                    } else {
                        Some(Author::new(trimmed.to_string()))
                    }
                })
                .collect()
        })
        .unwrap_or_default()
}

/// Base 50; +20 cover URL; +10 synopsis >=50 chars; +5 each for
/// pages>0/publisher/non-empty subjects/non-empty authors; clamped.
pub fn compute_quality_score(edition: &Edition, work: &Work, authors: &[Author]) -> i32 {
    let mut score = 50;
    if edition.cover_image_url.as_deref().is_some_and(|s| !s.is_empty()) {
        score += 20;
    }
    let synopsis_len = work.description.as_deref().map(|s| s.len()).unwrap_or(0);
    if synopsis_len >= 50 {
        score += 10;
    }
    if edition.page_count.is_some_and(|p| p > 0) {
        score += 5;
    }
    if edition.publisher.is_some() {
        score += 5;
    }
    if !work.subject_tags.is_empty() {
        score += 5;
    }
    if !authors.is_empty() {
        score += 5;
    }
    score.clamp(0, 100)
}

/// Binding-to-format mapping: case-insensitive substring match.
pub fn map_binding_to_format(binding: &str) -> EditionFormat {
    let lower = binding.to_lowercase();
    const HARDCOVER: &[&str] = &["hardcover", "hardback", "library binding"];
    const PAPERBACK: &[&str] = &["paperback", "mass market", "trade paper"];
    const EBOOK: &[&str] = &["ebook", "kindle", "digital"];
    const AUDIOBOOK: &[&str] = &["audiobook", "audio cd"];

    if HARDCOVER.iter().any(|k| lower.contains(k)) {
        EditionFormat::Hardcover
    } else if PAPERBACK.iter().any(|k| lower.contains(k)) {
        EditionFormat::Paperback
    } else if EBOOK.iter().any(|k| lower.contains(k)) {
        EditionFormat::Ebook
    } else if AUDIOBOOK.iter().any(|k| lower.contains(k)) {
        EditionFormat::Audiobook
    } else {
        EditionFormat::Paperback
    }
}

/// Accepts `YYYY`, `YYYY-MM`, `YYYY-MM-DD`; anything else is undefined.
pub fn extract_year(s: &str) -> Option<i32> {
    let s = s.trim();
    if s.len() < 4 {
        return None;
    }
    let (year, rest) = s.split_at(4);
    if !year.chars().all(|c| c.is_ascii_digit()) {
        return None;
    }
    let valid_rest = match rest {
        "" => true,
        r if r.starts_with('-') => {
            let parts: Vec<&str> = r[1..].split('-').collect();
            parts.len() <= 2 && parts.iter().all(|p| p.len() == 2 && p.chars().all(|c| c.is_ascii_digit()))
        }
        _ => false,
    };
    valid_rest.then(|| year.parse().ok()).flatten()
}

/// A string field that collapses null/missing/empty/whitespace-only to
/// `None` rather than an empty string.
fn string_field(payload: &Value, key: &str) -> Option<String> {
    payload
        .get(key)
        .and_then(|v| v.as_str())
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
}

fn array_of_strings(payload: &Value, key: &str) -> Vec<String> {
    payload
        .get(key)
        .and_then(|v| v.as_array())
        .map(|arr| {
            arr.iter()
                .filter_map(|v| v.as_str())
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(str::to_string)
                .collect()
        })
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use book_core::ProviderName;
    use proptest::prelude::*;

    fn record(payload: Value) -> RawRecord {
        RawRecord {
            provider: ProviderName::Primary,
            payload,
        }
    }

    #[test]
    fn missing_title_defaults_to_sentinel() {
        let (work, edition, _) = normalize(&record(serde_json::json!({})));
        assert_eq!(work.title, "Unknown");
        assert_eq!(edition.title, "Unknown");
    }

    #[test]
    fn binding_normalization_matches_contract_examples() {
        assert_eq!(map_binding_to_format("Mass Market Paperback"), EditionFormat::Paperback);
        assert_eq!(map_binding_to_format("Kindle Edition"), EditionFormat::Ebook);
        assert_eq!(map_binding_to_format("Unknown Format"), EditionFormat::Paperback);
        assert_eq!(map_binding_to_format("Library Binding"), EditionFormat::Hardcover);
        assert_eq!(map_binding_to_format("Audio CD"), EditionFormat::Audiobook);
    }

    #[test]
    fn year_extraction_accepts_three_formats() {
        assert_eq!(extract_year("1954"), Some(1954));
        assert_eq!(extract_year("1954-07"), Some(1954));
        assert_eq!(extract_year("1954-07-29"), Some(1954));
        assert_eq!(extract_year("not a date"), None);
        assert_eq!(extract_year("195"), None);
    }

    #[test]
    fn null_and_empty_fields_collapse_to_none() {
        let (work, edition, _) = normalize(&record(serde_json::json!({
            "title": "  ",
            "description": "",
            "publisher": null,
        })));
        assert_eq!(work.title, "Unknown");
        assert_eq!(work.description, None);
        assert_eq!(edition.publisher, None);
    }

    #[test]
    fn authors_default_gender_to_unknown() {
        let (_, _, authors) = normalize(&record(serde_json::json!({
            "authors": [{"name": "Ursula K. Le Guin"}],
        })));
        assert_eq!(authors.len(), 1);
        assert_eq!(authors[0].gender, book_core::Gender::Unknown);
    }

    #[test]
    fn dedupes_authors_by_case_folded_name() {
        let (_, _, authors) = normalize(&record(serde_json::json!({
            "authors": ["Jane Doe", "jane doe"],
        })));
        let mut keys: Vec<String> = authors.iter().map(|a| a.dedupe_key()).collect();
        keys.sort();
        keys.dedup();
        assert_eq!(keys.len(), 1);
    }

    proptest! {
        #[test]
        fn quality_score_is_always_in_bounds(
            has_cover in any::<bool>(),
            synopsis_len in 0usize..200,
            pages in -5i64..2000,
            has_publisher in any::<bool>(),
            subject_count in 0usize..5,
            author_count in 0usize..5,
        ) {
            let mut payload = serde_json::json!({"title": "T"});
            if has_cover {
                payload["coverImageURL"] = serde_json::json!("https://example.test/cover.jpg");
            }
            payload["description"] = serde_json::json!("x".repeat(synopsis_len));
            payload["pageCount"] = serde_json::json!(pages);
            if has_publisher {
                payload["publisher"] = serde_json::json!("Acme Books");
            }
            payload["subjects"] = serde_json::json!((0..subject_count).map(|i| format!("s{i}")).collect::<Vec<_>>());
            payload["authors"] = serde_json::json!((0..author_count).map(|i| format!("a{i}")).collect::<Vec<_>>());

            let (work, _, _) = normalize(&record(payload));
            prop_assert!(work.quality_score <= 100);
        }

        #[test]
        fn normalize_is_referentially_transparent(title in ".*", isbn in "[0-9]{0,13}") {
            let payload = serde_json::json!({"title": title, "isbn": isbn});
            let a = normalize(&record(payload.clone()));
            let b = normalize(&record(payload));
            prop_assert_eq!(a.0.title, b.0.title);
            prop_assert_eq!(a.1.isbn, b.1.isbn);
        }

        #[test]
        fn isbn_set_has_no_duplicates_or_falsy_entries(
            isbns in proptest::collection::vec("[0-9 ]{0,15}", 0..6)
        ) {
            let payload = serde_json::json!({"title": "T", "isbns": isbns});
            let (_, edition, _) = normalize(&record(payload));
            let mut seen = std::collections::HashSet::new();
            for isbn in &edition.isbns {
                prop_assert!(!isbn.trim().is_empty());
                prop_assert!(seen.insert(isbn.clone()));
            }
            if let Some(primary) = &edition.isbn {
                prop_assert!(edition.isbns.contains(primary));
            }
        }
    }
}
